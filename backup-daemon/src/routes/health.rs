use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use backup_engine::BackupStatus;
use serde_json::{json, Value};
use std::sync::Arc;

/// GET /health - liveness
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_jobs": state.orchestrator.jobs().active().len(),
    }))
}

/// GET /api/status - aggregate backup health
pub async fn status(State(state): State<Arc<AppState>>) -> Json<BackupStatus> {
    Json(state.orchestrator.get_backup_status().await)
}
