//! The status snapshot published after every committed transition.

use serde::{Deserialize, Serialize};

use shipway_state::{DeploymentId, DeploymentOutcome, DeploymentRecord, DeploymentState, HealthStatus, Instance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    /// State of the in-flight deployment, `idle` when there is none.
    pub state: DeploymentState,
    pub in_flight: Option<DeploymentId>,
    pub live: Option<LiveView>,
    /// Waiting deployments, in the order they will run.
    pub queued: Vec<DeploymentId>,
    pub last_completed: Option<CompletedView>,
}

impl ServiceStatus {
    pub(crate) fn idle(service: &str) -> Self {
        Self {
            service: service.to_string(),
            state: DeploymentState::Idle,
            in_flight: None,
            live: None,
            queued: Vec::new(),
            last_completed: None,
        }
    }
}

/// The instance serving traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveView {
    pub instance: Instance,
    /// The deployment whose artifact is live, when known.
    pub deployment_id: Option<DeploymentId>,
    pub health: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedView {
    pub deployment_id: DeploymentId,
    pub state: DeploymentState,
    pub outcome: DeploymentOutcome,
    pub exit_code: i32,
}

impl CompletedView {
    pub(crate) fn from_record(record: &DeploymentRecord) -> Option<Self> {
        Some(Self {
            deployment_id: record.id.clone(),
            state: record.state,
            outcome: record.outcome?,
            exit_code: record.exit_code()?,
        })
    }
}
