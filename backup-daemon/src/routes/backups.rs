use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::jobs::capture_key;
use backup_engine::BackupMetadata;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups))
        .route("/full", post(trigger_full))
        .route("/incremental", post(trigger_incremental))
        .route("/{id}", get(get_backup))
        .route("/{id}/verify", post(verify_backup))
}

type Accepted = (StatusCode, Json<Value>);

fn accepted(job: &str) -> Accepted {
    (StatusCode::ACCEPTED, Json(json!({ "accepted": true, "job": job })))
}

/// Refuse a capture trigger up front while another capture holds the database.
fn ensure_capture_idle(state: &AppState) -> Result<(), AppError> {
    let database = &state.orchestrator.config().datastore.database;
    if state.orchestrator.jobs().is_held(&capture_key(database)) {
        return Err(AppError::Conflict(format!(
            "a capture of {database} is already running"
        )));
    }
    Ok(())
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupMetadata>>, AppError> {
    Ok(Json(state.orchestrator.list_backups().await?))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupMetadata>, AppError> {
    match state.orchestrator.get_backup(&id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound(format!("Backup not found: {id}"))),
    }
}

async fn trigger_full(State(state): State<Arc<AppState>>) -> Result<Accepted, AppError> {
    ensure_capture_idle(&state)?;
    let orchestrator = state.orchestrator.clone();
    state.spawn_job("full_backup", async move { orchestrator.create_full_backup().await });
    Ok(accepted("full_backup"))
}

async fn trigger_incremental(State(state): State<Arc<AppState>>) -> Result<Accepted, AppError> {
    ensure_capture_idle(&state)?;
    let orchestrator = state.orchestrator.clone();
    state.spawn_job("incremental_backup", async move {
        orchestrator.create_incremental_backup().await
    });
    Ok(accepted("incremental_backup"))
}

async fn verify_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Accepted, AppError> {
    if state.orchestrator.get_backup(&id).await?.is_none() {
        return Err(AppError::NotFound(format!("Backup not found: {id}")));
    }
    let orchestrator = state.orchestrator.clone();
    state.spawn_job("integrity_test", async move {
        match orchestrator.test_backup_integrity(&id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!("integrity test of {id} failed")),
            Err(e) => Err(e.to_string()),
        }
    });
    Ok(accepted("integrity_test"))
}

pub async fn cleanup(State(state): State<Arc<AppState>>) -> Accepted {
    let orchestrator = state.orchestrator.clone();
    state.spawn_job("cleanup", async move { orchestrator.cleanup_old_backups().await });
    accepted("cleanup")
}
