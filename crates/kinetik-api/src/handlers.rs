//! REST API handlers.
//!
//! Mutating handlers run the orchestrator call on its own task so a
//! client hanging up cannot cancel a placement half way.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kinetik_core::{HealthState, MetricValue, NodeReport};
use kinetik_scheduler::{DeploymentRequest, Orchestrator, OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for an orchestrator failure.
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::AlreadyExists(_) => StatusCode::CONFLICT,
        OrchestratorError::CircularDependency { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::NoEligibleNode { .. } => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Runtime { .. } | OrchestratorError::NodeUnreachable { .. } => {
            StatusCode::BAD_GATEWAY
        }
        OrchestratorError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::State(_) | OrchestratorError::Ledger(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn orchestrator_error(err: OrchestratorError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, %status, "request failed");
    }
    (
        status,
        Json(ApiResponse {
            success: false,
            data: err.report(),
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(result: OrchestratorResult<T>, status: StatusCode) -> Response {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// Run an orchestrator call detached from the request.
async fn detached<T, F, Fut>(state: &ApiState, op: F) -> Result<OrchestratorResult<T>, Response>
where
    F: FnOnce(Arc<Orchestrator>) -> Fut,
    Fut: Future<Output = OrchestratorResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(op(state.orchestrator.clone()))
        .await
        .map_err(|e| {
            error!(error = %e, "orchestrator task failed");
            error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR)
        })
}

async fn run_detached<T, F, Fut>(state: &ApiState, status: StatusCode, op: F) -> Response
where
    F: FnOnce(Arc<Orchestrator>) -> Fut,
    Fut: Future<Output = OrchestratorResult<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    match detached(state, op).await {
        Ok(result) => respond(result, status),
        Err(response) => response,
    }
}

// ── Services ───────────────────────────────────────────────────

/// Deploy request body.
#[derive(Debug, Deserialize)]
pub struct DeployBody {
    pub stack: String,
    /// YAML stack definition.
    pub definition: String,
    #[serde(default)]
    pub rollback_on_failure: Option<bool>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> Response {
    respond(state.orchestrator.services(), StatusCode::OK)
}

/// POST /api/v1/services
pub async fn deploy(State(state): State<ApiState>, Json(body): Json<DeployBody>) -> Response {
    let request = DeploymentRequest {
        stack: body.stack,
        definition: body.definition,
        rollback_on_failure: body.rollback_on_failure,
        deadline: body.deadline_secs.map(Duration::from_secs),
    };
    run_detached(&state, StatusCode::CREATED, move |o| async move {
        o.deploy(request).await
    })
    .await
}

/// GET /api/v1/services/:stack/:service
pub async fn get_service(
    State(state): State<ApiState>,
    Path((stack, service)): Path<(String, String)>,
) -> Response {
    respond(state.orchestrator.service(&stack, &service), StatusCode::OK)
}

/// DELETE /api/v1/services/:stack/:service
pub async fn delete_service(
    State(state): State<ApiState>,
    Path((stack, service)): Path<(String, String)>,
) -> Response {
    run_detached(&state, StatusCode::OK, move |o| async move {
        o.delete_service(&stack, &service).await
    })
    .await
}

/// POST /api/v1/services/:stack/:service/scale/up
pub async fn scale_up(
    State(state): State<ApiState>,
    Path((stack, service)): Path<(String, String)>,
) -> Response {
    run_detached(&state, StatusCode::OK, move |o| async move {
        o.scale_up(&stack, &service).await
    })
    .await
}

/// POST /api/v1/services/:stack/:service/scale/down
pub async fn scale_down(
    State(state): State<ApiState>,
    Path((stack, service)): Path<(String, String)>,
) -> Response {
    run_detached(&state, StatusCode::OK, move |o| async move {
        o.scale_down(&stack, &service).await
    })
    .await
}

/// POST /api/v1/services/:stack/:service/reconcile
pub async fn reconcile(
    State(state): State<ApiState>,
    Path((stack, service)): Path<(String, String)>,
) -> Response {
    run_detached(&state, StatusCode::OK, move |o| async move {
        o.reconcile(&stack, &service).await
    })
    .await
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.orchestrator.nodes().await).into_response()
}

/// GET /api/v1/nodes/:id
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.node(&id).await, StatusCode::OK)
}

/// POST /api/v1/nodes/:id
pub async fn report_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(report): Json<NodeReport>,
) -> Response {
    respond(state.orchestrator.report_node(&id, &report).await, StatusCode::OK)
}

/// DELETE /api/v1/nodes/:id
pub async fn delete_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.delete_node(&id).await, StatusCode::OK)
}

/// POST /api/v1/nodes/:id/attach
pub async fn attach_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    run_detached(&state, StatusCode::OK, move |o| async move {
        o.attach_node(&id).await
    })
    .await
}

// ── Instances ──────────────────────────────────────────────────

/// Health push body.
#[derive(Debug, Deserialize)]
pub struct InstanceUpdate {
    pub state: HealthState,
    #[serde(default)]
    pub metrics: Vec<MetricValue>,
}

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> Response {
    respond(state.orchestrator.instances(), StatusCode::OK)
}

/// PUT /api/v1/instances/:id
pub async fn update_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(update): Json<InstanceUpdate>,
) -> Response {
    respond(
        state
            .orchestrator
            .update_instance(&id, update.state, update.metrics)
            .await,
        StatusCode::OK,
    )
}

/// DELETE /api/v1/instances/:id
pub async fn remove_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    run_detached(&state, StatusCode::OK, move |o| async move {
        o.remove_instance(&id).await
    })
    .await
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
