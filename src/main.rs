//! Ladder server - multi-step approval workflows with delegated authority

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use ladder::config::Config;
use ladder::hierarchy::{DescendantCache, NoCache, TtlCache};
use ladder::AppState;
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ladder=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;

    ladder::store::run_migrations(&pool).await?;

    let cache: Arc<dyn DescendantCache> = match config.cache_ttl() {
        Some(ttl) => Arc::new(TtlCache::new(ttl)),
        None => Arc::new(NoCache),
    };
    let state = AppState::new(pool, cache);

    spawn_expiry_sweep(state.clone(), config.sweep_interval());

    let app = ladder::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically move lapsed delegations to expired
fn spawn_expiry_sweep(state: Arc<AppState>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = state.authority.expire_delegations(Utc::now()).await {
                tracing::error!("Delegation expiry sweep failed: {}", e);
            }
        }
    });
}
