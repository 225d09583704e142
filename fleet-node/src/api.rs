use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use fleet_core::node::{NodeStatus, SubmitError};
use fleet_core::transport::{Envelope, HttpTransport};
use fleet_core::FleetNode;
use serde::{Deserialize, Serialize};
use shared::messages::FleetMessage;
use shared::types::{NodeId, Task, TaskStatus, TaskType, Urgency};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<FleetNode<HttpTransport>>,
    /// Feed into the node's transport; `/internal/messages` lands here.
    pub inbound: mpsc::Sender<(NodeId, FleetMessage)>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/sensors", post(ingest_reading))
        .route("/api/status", get(get_status))
        .route("/api/logs", get(get_logs))
        .route("/api/metrics", get(get_metrics))
        .route("/health", get(health_check))
        .route("/internal/messages", post(deliver_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Serialize)]
struct SubmitTaskResponse {
    task_id: String,
    status: TaskStatus,
}

#[derive(Serialize)]
struct TaskResponse {
    id: String,
    task_type: TaskType,
    status: TaskStatus,
    urgency: Urgency,
    location: Option<String>,
    assigned_to: Option<NodeId>,
    created_at: String,
    completed_at: Option<String>,
    output: Option<String>,
    failure: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id.to_string(),
            task_type: task.task_type,
            status: task.status,
            urgency: task.urgency,
            location: task.location,
            assigned_to: task.assigned_to,
            created_at: task.created_at.to_rfc3339(),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
            output: task.output,
            failure: task.failure,
        }
    }
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn submit_error_response(err: SubmitError) -> ApiError {
    match err {
        SubmitError::NotCoordinator {
            coordinator: Some(coordinator),
        } => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "this node is not the coordinator",
                "coordinator": coordinator,
            })),
        ),
        // Mid-election: nobody to redirect to, ask the caller to retry.
        SubmitError::NotCoordinator { coordinator: None } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no coordinator known" })),
        ),
        SubmitError::QueueFull => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "task queue is full" })),
        ),
        SubmitError::Internal(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": reason })),
        ),
    }
}

async fn submit_task(
    State(state): State<ApiState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let task = Task::new(req.task_type, req.payload, req.urgency, req.location);
    match state.node.submit(task).await {
        Ok(task_id) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitTaskResponse {
                task_id: task_id.to_string(),
                status: TaskStatus::Pending,
            }),
        )),
        Err(err) => Err(submit_error_response(err)),
    }
}

async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, StatusCode> {
    let task_id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let task = state
        .node
        .queue()
        .get(task_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(task.into()))
}

async fn list_tasks(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<TaskResponse>> {
    let status_filter = params.get("status").and_then(|s| match s.as_str() {
        "pending" => Some(TaskStatus::Pending),
        "assigned" => Some(TaskStatus::Assigned),
        "completed" => Some(TaskStatus::Completed),
        "failed" => Some(TaskStatus::Failed),
        _ => None,
    });

    let tasks = state.node.queue().list(status_filter).await;
    Json(tasks.into_iter().map(TaskResponse::from).collect())
}

#[derive(Deserialize)]
pub struct SensorIngestRequest {
    pub node_id: NodeId,
    pub temperature: f64,
    pub humidity: f64,
    pub air_quality: i32,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Plausibility gate for remote readings. A sensor feeding values
/// outside physical ranges is broken hardware, not data.
fn validate_reading(req: &SensorIngestRequest) -> Result<(), String> {
    if !(-40.0..=85.0).contains(&req.temperature) {
        return Err(format!(
            "temperature {} outside plausible range -40..=85",
            req.temperature
        ));
    }
    if !(0.0..=100.0).contains(&req.humidity) {
        return Err(format!(
            "humidity {} outside plausible range 0..=100",
            req.humidity
        ));
    }
    if !(0..=500).contains(&req.air_quality) {
        return Err(format!(
            "air quality {} outside plausible range 0..=500",
            req.air_quality
        ));
    }
    Ok(())
}

async fn ingest_reading(
    State(state): State<ApiState>,
    Json(req): Json<SensorIngestRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    if let Err(reason) = validate_reading(&req) {
        debug!(reason, "rejected sensor reading");
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": reason })),
        ));
    }

    let payload = serde_json::json!({
        "node_id": req.node_id,
        "temperature": req.temperature,
        "humidity": req.humidity,
        "air_quality": req.air_quality,
        "timestamp": req.timestamp,
    });
    // Readings stay affine to the reporting node's location so the
    // dispatch policy routes them back toward that room's agent.
    let location = state.node.location_of(&req.node_id);
    let task = Task::new(TaskType::SensorManagement, payload, Urgency::Normal, location);
    match state.node.submit(task).await {
        Ok(task_id) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitTaskResponse {
                task_id: task_id.to_string(),
                status: TaskStatus::Pending,
            }),
        )),
        Err(err) => Err(submit_error_response(err)),
    }
}

async fn get_status(State(state): State<ApiState>) -> Json<NodeStatus> {
    Json(state.node.status().await)
}

async fn get_logs(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let logs = state.node.diagnostics().recent_events().await;
    Json(serde_json::json!({ "logs": logs }))
}

async fn get_metrics(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let diagnostics = state.node.diagnostics();
    Json(serde_json::json!({
        "counters": diagnostics.snapshot(),
        "latency": diagnostics.latency().await,
        "queue": state.node.queue().stats().await,
    }))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Peer-to-peer ingress: unwrap the envelope and hand it to the node's
/// receive loop. Backpressure shows up to the sender as a 503.
async fn deliver_message(
    State(state): State<ApiState>,
    Json(envelope): Json<Envelope>,
) -> StatusCode {
    match state.inbound.send((envelope.from, envelope.message)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
