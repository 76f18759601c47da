use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use loom_protocol::{Error, Node, Task};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

pub struct ApiState {
    pub node: Node,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/tasks", post(submit_task_handler))
        .route("/api/peers", post(connect_peer_handler))
        .route("/api/peers/{peer_id}", delete(disconnect_peer_handler))
        .route("/api/ping", post(ping_handler))
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)) // 10MB
        .with_state(state)
}

fn error_response(e: &Error) -> (StatusCode, Json<Value>) {
    let status = match e {
        Error::NoPeersAvailable | Error::PeerNotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::InvalidTask(_) => StatusCode::BAD_REQUEST,
        Error::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

async fn status_handler(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let node = &state.node;
    let uptime = chrono::Utc::now() - state.started_at;
    let peers: Vec<Value> = node
        .peers
        .snapshot()
        .await
        .into_iter()
        .map(|p| {
            json!({
                "peerId": p.peer_id,
                "score": p.score(),
                "averageLatency": p.average_latency,
                "reliabilityScore": p.reliability_score,
                "currentLoad": p.current_load,
                "capabilityScore": p.capability_score,
                "lastActive": p.last_active,
            })
        })
        .collect();

    Json(json!({
        "nodeId": node.config.node_id,
        "uptimeSecs": uptime.num_seconds(),
        "connections": node.registry.connections().await,
        "peers": peers,
        "pendingSubTasks": node.aggregator.pending_count().await,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitQuery {
    #[serde(default)]
    local_fallback: bool,
}

async fn submit_task_handler(
    State(state): State<Arc<ApiState>>,
    axum::extract::Query(query): axum::extract::Query<SubmitQuery>,
    Json(task): Json<Task>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    tracing::info!(task_id = %task.id, kind = ?task.kind(), "Task submitted over API");
    let scheduler = &state.node.scheduler;
    let result = if query.local_fallback {
        scheduler.submit_or_run_locally(task).await
    } else {
        scheduler.submit(task).await
    };
    match result {
        Ok(result) => Ok(Json(json!(result))),
        Err(e) => Err(error_response(&e)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    peer_id: String,
}

async fn connect_peer_handler(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .node
        .registry
        .connect(&req.peer_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({ "status": "connected", "peerId": req.peer_id })))
}

async fn disconnect_peer_handler(
    State(state): State<Arc<ApiState>>,
    Path(peer_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if state.node.registry.disconnect(&peer_id).await {
        Ok(Json(json!({ "status": "disconnected", "peerId": peer_id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn ping_handler(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node": state.node.config.node_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
