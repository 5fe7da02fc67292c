//! Descendant-set cache for the location hierarchy
//!
//! Entries are advisory: a stale set within the TTL is acceptable for scope
//! expansion, and nothing that grants a permission reads from here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::models::LocationId;

pub type DescendantSet = Arc<HashSet<LocationId>>;

/// Storage for each ancestor's descendant-id set
pub trait DescendantCache: Send + Sync {
    fn get(&self, ancestor: LocationId) -> Option<DescendantSet>;
    fn set(&self, ancestor: LocationId, descendants: DescendantSet);
    fn invalidate(&self, ancestor: LocationId);
    fn invalidate_all(&self);
}

/// In-process cache whose entries expire `ttl` after insertion
pub struct TtlCache {
    ttl: Duration,
    entries: Mutex<HashMap<LocationId, (Instant, DescendantSet)>>,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<LocationId, (Instant, DescendantSet)>> {
        // A poisoned map only holds cached data; keep serving it.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DescendantCache for TtlCache {
    fn get(&self, ancestor: LocationId) -> Option<DescendantSet> {
        let mut entries = self.lock();
        match entries.get(&ancestor) {
            Some((inserted, set)) if inserted.elapsed() < self.ttl => Some(set.clone()),
            Some(_) => {
                entries.remove(&ancestor);
                None
            }
            None => None,
        }
    }

    fn set(&self, ancestor: LocationId, descendants: DescendantSet) {
        self.lock().insert(ancestor, (Instant::now(), descendants));
    }

    fn invalidate(&self, ancestor: LocationId) {
        self.lock().remove(&ancestor);
    }

    fn invalidate_all(&self) {
        self.lock().clear();
    }
}

/// Cache that never retains anything; every lookup reads the store
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl DescendantCache for NoCache {
    fn get(&self, _ancestor: LocationId) -> Option<DescendantSet> {
        None
    }

    fn set(&self, _ancestor: LocationId, _descendants: DescendantSet) {}

    fn invalidate(&self, _ancestor: LocationId) {}

    fn invalidate_all(&self) {}
}
