//! Server configuration from flags and environment

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "ladder")]
#[command(about = "Approval workflow server", long_about = None)]
pub struct Config {
    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:ladder.db?mode=rwc")]
    pub database_url: String,

    /// Address to listen on
    #[arg(long, env = "LADDER_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// Lifetime of cached descendant sets, in seconds (0 disables the cache)
    #[arg(long, env = "LADDER_CACHE_TTL_SECS", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Interval between delegation expiry sweeps, in seconds
    #[arg(long, env = "LADDER_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Maximum database connections
    #[arg(long, env = "LADDER_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,
}

impl Config {
    /// `None` when caching is disabled
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["ladder"]);
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.cache_ttl(), Some(Duration::from_secs(300)));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let config = Config::parse_from(["ladder", "--cache-ttl-secs", "0", "--sweep-interval-secs", "0"]);
        assert_eq!(config.cache_ttl(), None);
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
