//! shipway-api: REST control surface for shipway.
//!
//! Thin axum handlers over an [`Orchestrator`]. Every response uses the
//! `{success, data?, error?}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/deploy` | Queue a deployment of a source reference |
//! | POST | `/api/v1/rollback` | Queue a rollback to a prior successful deployment |
//! | GET | `/api/v1/status` | Current state, live instance, queue |
//! | POST | `/api/v1/cancel` | Cancel the in-flight deployment |
//! | GET | `/api/v1/deployments` | List all deployments |
//! | GET | `/api/v1/deployments/{id}` | Deployment record with exit code |
//! | GET | `/api/v1/deployments/{id}/events` | Event log of one deployment |
//! | GET | `/api/v1/events?since=N` | Event feed after sequence `N` |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use shipway_rollout::Orchestrator;

pub use handlers::{CancelRequest, DeployAccepted, DeployRequest, DeploymentView, RollbackRequest};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

/// Build the API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let api_state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/deploy", post(handlers::deploy))
        .route("/rollback", post(handlers::rollback))
        .route("/status", get(handlers::status))
        .route("/cancel", post(handlers::cancel))
        .route("/deployments", get(handlers::list_deployments))
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/events", get(handlers::deployment_events))
        .route("/events", get(handlers::list_events))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
