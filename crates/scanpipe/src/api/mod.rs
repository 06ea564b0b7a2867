use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::{
    error::PipelineError,
    jobs::{progress, QueuedScan},
    security::{in_scope, validate_module, validate_target},
    AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/scans", get(list_scans).post(create_scan))
        .route("/api/scans/:id", get(get_scan))
        .route("/api/scans/:id/progress", get(scan_progress))
        .route("/api/scans/:id/findings", get(scan_findings))
        .with_state(state)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "service": "scanpipe"}))
}

#[derive(Debug, Deserialize)]
pub struct CreateScanRequest {
    target: String,
    #[serde(default)]
    modules: Vec<String>,
}

pub async fn list_scans(State(state): State<AppState>) -> Response {
    match state.lifecycle.store().list_jobs(100).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn create_scan(
    State(state): State<AppState>,
    Json(payload): Json<CreateScanRequest>,
) -> Response {
    let target = payload.target.trim().to_string();
    if let Err(msg) = validate_target(&target) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let modules = if payload.modules.is_empty() {
        state.config.worker.default_modules.clone()
    } else {
        payload.modules
    };
    if let Some(msg) = modules.iter().find_map(|m| validate_module(m).err()) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    if !in_scope(&target, &state.config.scope_allowlist) {
        return (StatusCode::FORBIDDEN, "target out of scope").into_response();
    }

    {
        let mut limiter = state.rate_limiter.lock().await;
        if !limiter.allow() {
            return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
        }
    }

    let job = match state.lifecycle.create(&target, &modules).await {
        Ok(job) => job,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    if let Err(e) = state
        .lifecycle
        .store()
        .record_audit(
            "create_scan",
            "api",
            &format!("scan_id={} target={} modules={}", job.id, target, modules.join(",")),
        )
        .await
    {
        warn!(error = %e, scan_id = %job.id, "audit log write failed");
    }

    let queued = QueuedScan {
        id: job.id.clone(),
        target,
        modules,
    };
    if state.queue.send(queued).await.is_err() {
        error!(scan_id = %job.id, "scan queue closed; failing job");
        if let Err(e) = state
            .lifecycle
            .fail(&job.id, &PipelineError::QueueClosed, None)
            .await
        {
            error!(scan_id = %job.id, error = %e, "could not record scan failure");
        }
        return (StatusCode::SERVICE_UNAVAILABLE, "scan queue unavailable").into_response();
    }

    (StatusCode::CREATED, Json(serde_json::json!({"id": job.id}))).into_response()
}

pub async fn get_scan(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.lifecycle.store().get_job(&id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "scan not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn scan_progress(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match progress(state.lifecycle.store().as_ref(), &id).await {
        Ok(p) => Json(p).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn scan_findings(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let store = state.lifecycle.store();
    match store.get_job(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "scan not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
    match store.list_findings(&id).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
