//! API integration tests

use std::sync::Arc;

use axum::Router;
use ladder::error::AppError;
use ladder::hierarchy::{NoCache, TtlCache};
use ladder::store::run_migrations;
use ladder::AppState;
use sqlx::sqlite::SqlitePoolOptions;
use tower::ServiceExt;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    run_migrations(&pool).await.expect("Failed to run migrations");
    pool
}

async fn setup_app() -> (Router, Arc<AppState>) {
    let state = AppState::new(setup_pool().await, Arc::new(NoCache));
    (ladder::router(state.clone()), state)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state) = setup_app().await;

    let response = app
        .oneshot(
            hyper::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), hyper::StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_route() {
    let (app, _state) = setup_app().await;

    let response = app
        .oneshot(
            hyper::Request::builder()
                .uri("/templates")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), hyper::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_app_state_new() {
    let state = AppState::new(
        setup_pool().await,
        Arc::new(TtlCache::new(std::time::Duration::from_secs(60))),
    );
    assert_eq!(Arc::strong_count(&state), 1);

    // Components share one database
    let hq = state.hierarchy.create_location("HQ", None).await.unwrap();
    let found = state.store.get_location(hq.id).await.unwrap();
    assert_eq!(found.path, hq.path);
}

#[tokio::test]
async fn test_missing_template_is_configuration_error() {
    let (_app, state) = setup_app().await;
    let hq = state.hierarchy.create_location("HQ", None).await.unwrap();

    let result = state.engine.select_template("leave", hq.id).await;
    assert!(matches!(result, Err(AppError::Configuration(_))));
}
