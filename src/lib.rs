//! Ladder server - multi-step approval workflows with delegated authority

pub mod approvers;
pub mod authority;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod models;
pub mod store;
pub mod websocket;
pub mod workflow;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::authority::DelegationAuthority;
use crate::hierarchy::{DescendantCache, LocationHierarchy};
use crate::store::Store;
use crate::workflow::WorkflowEngine;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub hierarchy: LocationHierarchy,
    pub authority: DelegationAuthority,
    pub engine: WorkflowEngine,
}

impl AppState {
    pub fn new(pool: SqlitePool, cache: Arc<dyn DescendantCache>) -> Arc<Self> {
        let store = Store::new(pool);
        let hierarchy = LocationHierarchy::new(store.clone(), cache);
        let authority = DelegationAuthority::new(store.clone(), hierarchy.clone());
        let engine = WorkflowEngine::new(store.clone(), hierarchy.clone(), authority.clone());

        Arc::new(Self {
            store,
            hierarchy,
            authority,
            engine,
        })
    }
}

/// Routes served by the application, without middleware
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket::handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
