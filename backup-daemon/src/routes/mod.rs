pub mod backups;
pub mod health;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/status", get(health::status))
        .nest("/api/backups", backups::router())
        .route("/api/cleanup", post(backups::cleanup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
