use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use chrono::Utc;
use loom_protocol::pipeline;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::models::*;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/run-job", post(run_job))
        .route("/health", get(health))
        .route("/api/status", get(status))
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)) // 10MB
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn job_error(msg: impl Into<String>) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg.into() })))
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunJobRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut record = JobRecord {
        id: uuid::Uuid::new_v4().to_string(),
        operation: req.payload.get("operation").and_then(Value::as_str).map(str::to_string),
        num_peers: req.num_peers,
        status: JobStatus::Running,
        started_at: Utc::now(),
        completed_at: None,
        error: None,
    };
    tracing::info!(job_id = %record.id, operation = ?record.operation, num_peers = req.num_peers, "📋 Job received");
    state.record(record.clone()).await;

    let work = pipeline::run_job(
        state.provider.as_ref(),
        &req.payload,
        req.num_peers,
        state.config.provider_timeout,
    );
    let outcome = match tokio::time::timeout(state.config.job_timeout, work).await {
        Err(_) => {
            tracing::warn!(job_id = %record.id, "Job timed out after {:?}", state.config.job_timeout);
            record.status = JobStatus::TimedOut;
            Err("Job timed out".to_string())
        }
        Ok(Err(e)) => {
            record.status = JobStatus::Failed;
            Err(e.to_string())
        }
        Ok(Ok(Value::Null)) => {
            record.status = JobStatus::Failed;
            Err("Job failed - no result returned".to_string())
        }
        Ok(Ok(result)) => {
            record.status = JobStatus::Completed;
            Ok(result)
        }
    };

    record.completed_at = Some(Utc::now());
    record.error = outcome.as_ref().err().cloned();
    tracing::info!(job_id = %record.id, status = ?record.status, "Job finished");
    state.record(record).await;

    match outcome {
        Ok(result) => Ok(Json(json!({ "result": result }))),
        Err(msg) => Err(job_error(msg)),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "provider": state.provider.name(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let jobs = state.jobs.read().await;
    let count = |s: JobStatus| jobs.iter().filter(|j| j.status == s).count();
    Json(json!({
        "uptime_secs": (Utc::now() - state.start_time).num_seconds(),
        "running": count(JobStatus::Running),
        "completed": count(JobStatus::Completed),
        "failed": count(JobStatus::Failed),
        "timed_out": count(JobStatus::TimedOut),
        "jobs": jobs.iter().rev().collect::<Vec<_>>(),
    }))
}
