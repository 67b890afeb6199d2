//! REST API handlers.
//!
//! Requests are validated and queued synchronously by the orchestrator;
//! `deploy` and `rollback` answer 202 with the deployment id and clients
//! poll the record for the outcome.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use shipway_rollout::OrchestratorError;
use shipway_state::{DeploymentId, DeploymentRecord};

use crate::ApiState;

const DEFAULT_ACTOR: &str = "api";

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

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn orchestrator_error(err: OrchestratorError) -> Response {
    let status = match &err {
        OrchestratorError::InvalidSource(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::UnknownDeployment(_) => StatusCode::NOT_FOUND,
        OrchestratorError::NotRollbackTarget(_)
        | OrchestratorError::CancelNotPermitted(_)
        | OrchestratorError::NothingInFlight => StatusCode::CONFLICT,
        OrchestratorError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::IllegalTransition { .. } | OrchestratorError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&err.to_string(), status).into_response()
}

fn actor_or_default(actor: Option<String>) -> String {
    actor
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
}

// ── Requests / responses ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub source: String,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub deployment_id: DeploymentId,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployAccepted {
    pub deployment_id: DeploymentId,
}

/// A deployment record with its control-surface exit code (absent while
/// in flight).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub record: DeploymentRecord,
    pub exit_code: Option<i32>,
}

impl From<DeploymentRecord> for DeploymentView {
    fn from(record: DeploymentRecord) -> Self {
        let exit_code = record.exit_code();
        Self { record, exit_code }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: u64,
}

// ── Control ────────────────────────────────────────────────────

/// POST /api/v1/deploy
pub async fn deploy(State(state): State<ApiState>, Json(req): Json<DeployRequest>) -> Response {
    let actor = actor_or_default(req.actor);
    match state.orchestrator.deploy(&req.source, &actor) {
        Ok(deployment_id) => {
            info!(deployment = %deployment_id, source = %req.source, %actor, "deploy accepted");
            (StatusCode::ACCEPTED, ApiResponse::ok(DeployAccepted { deployment_id })).into_response()
        }
        Err(e) => orchestrator_error(e),
    }
}

/// POST /api/v1/rollback
pub async fn rollback(State(state): State<ApiState>, Json(req): Json<RollbackRequest>) -> Response {
    let actor = actor_or_default(req.actor);
    match state.orchestrator.rollback(&req.deployment_id, &actor) {
        Ok(deployment_id) => {
            info!(deployment = %deployment_id, target = %req.deployment_id, %actor, "rollback accepted");
            (StatusCode::ACCEPTED, ApiResponse::ok(DeployAccepted { deployment_id })).into_response()
        }
        Err(e) => orchestrator_error(e),
    }
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.status())
}

/// POST /api/v1/cancel
pub async fn cancel(State(state): State<ApiState>, Json(req): Json<CancelRequest>) -> Response {
    let actor = actor_or_default(req.actor);
    match state.orchestrator.cancel(&actor) {
        Ok(deployment_id) => ApiResponse::ok(DeployAccepted { deployment_id }).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> Response {
    match state.orchestrator.history() {
        Ok(records) => {
            let views: Vec<DeploymentView> = records.into_iter().map(DeploymentView::from).collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => orchestrator_error(e),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.deployment(&id) {
        Ok(record) => ApiResponse::ok(DeploymentView::from(record)).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// GET /api/v1/deployments/{id}/events
pub async fn deployment_events(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.events_for(&id) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

// ── Events ─────────────────────────────────────────────────────

/// GET /api/v1/events?since=N
pub async fn list_events(State(state): State<ApiState>, Query(q): Query<EventsQuery>) -> Response {
    match state.orchestrator.events_since(q.since) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_actor_falls_back() {
        assert_eq!(actor_or_default(None), "api");
        assert_eq!(actor_or_default(Some("  ".to_string())), "api");
        assert_eq!(actor_or_default(Some("alice".to_string())), "alice");
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (OrchestratorError::NothingInFlight, StatusCode::CONFLICT),
            (OrchestratorError::QueueFull(4), StatusCode::TOO_MANY_REQUESTS),
            (OrchestratorError::UnknownDeployment("dep-000009".into()), StatusCode::NOT_FOUND),
            (OrchestratorError::NotRollbackTarget("dep-000002".into()), StatusCode::CONFLICT),
            (OrchestratorError::Shutdown, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, expected) in cases {
            assert_eq!(orchestrator_error(err).status(), expected);
        }
    }
}
