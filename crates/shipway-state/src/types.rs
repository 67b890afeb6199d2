//! Domain types for the shipway state store.
//!
//! Artifacts, instances, deployment records, and deployment events. All
//! types serialize to JSON for storage in redb tables and for the REST API.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deployment identifier, `dep-` followed by a zero-padded sequence number.
pub type DeploymentId = String;

/// Instance identifier assigned by the instance manager.
pub type InstanceId = String;

/// Content hash of a build output.
pub type ArtifactId = String;

// ── Artifact ──────────────────────────────────────────────────────

/// An immutable, runnable unit produced from source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub id: ArtifactId,
    /// The source reference this artifact was built from.
    pub source: String,
    /// What the run command is given to start it (image tag, binary path, …).
    pub reference: String,
    /// Unix timestamp (milliseconds) of the build.
    pub created_at: u64,
}

// ── Instance ──────────────────────────────────────────────────────

/// A running process bound to an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub artifact_id: ArtifactId,
    /// Address the instance listens on (ip:port).
    pub address: String,
    /// Unix timestamp (milliseconds) when the instance was started.
    pub started_at: u64,
}

/// Lifecycle status of an instance, as tracked by the instance manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Process launched, not yet accepting connections.
    Starting,
    /// Accepting connections (not the same as healthy).
    Ready,
    /// No longer receiving new traffic, finishing in-flight requests.
    Draining,
    Stopped,
    /// Exited without being asked to.
    Crashed,
}

impl InstanceStatus {
    /// Whether the process is still alive.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Draining)
    }
}

/// Health status as determined by health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

// ── Deployment ────────────────────────────────────────────────────

/// States of the deployment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Idle,
    Building,
    Gating,
    Starting,
    AwaitingHealth,
    CuttingOver,
    Draining,
    Succeeded,
    GateFailed,
    HealthTimeout,
    RolledBack,
}

impl DeploymentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Gating => "gating",
            Self::Starting => "starting",
            Self::AwaitingHealth => "awaiting_health",
            Self::CuttingOver => "cutting_over",
            Self::Draining => "draining",
            Self::Succeeded => "succeeded",
            Self::GateFailed => "gate_failed",
            Self::HealthTimeout => "health_timeout",
            Self::RolledBack => "rolled_back",
        }
    }

    /// States an operator may cancel from.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Building | Self::Gating | Self::Starting | Self::AwaitingHealth
        )
    }

    /// Whether the state machine may move from `self` to `next`.
    ///
    /// `Idle` doubles as the terminal state for deployments that never
    /// got an instance started (build failure, runner crash, start
    /// failure, early abort).
    pub fn can_transition_to(self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, next),
            (Idle, Building)
                | (Idle, Starting)
                | (Building, Gating)
                | (Building, Idle)
                | (Gating, Starting)
                | (Gating, GateFailed)
                | (Gating, Idle)
                | (Starting, AwaitingHealth)
                | (Starting, HealthTimeout)
                | (Starting, Idle)
                | (AwaitingHealth, CuttingOver)
                | (AwaitingHealth, HealthTimeout)
                | (HealthTimeout, RolledBack)
                | (CuttingOver, Draining)
                | (CuttingOver, RolledBack)
                | (CuttingOver, Starting)
                | (Draining, Succeeded)
                | (Draining, RolledBack)
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a deployment was asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentKind {
    /// Build and verify a new artifact from source.
    Deploy { source: String },
    /// Redeploy the artifact of a prior successful deployment.
    Rollback { target: DeploymentId },
}

/// Terminal outcome of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    Succeeded,
    RolledBack,
    Aborted,
    /// The new instance failed after cutover and no healthy instance could
    /// be restored.
    Failed,
}

/// Why a gate did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateFailureReason {
    /// The gate ran and reported failure.
    Failed { exit_code: Option<i32> },
    /// The gate exceeded its timeout.
    TimedOut { after_ms: u64 },
    /// The gate could not be started at all (missing binary, bad command).
    CouldNotStart { error: String },
}

/// Why the new instance never became healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTimeoutCause {
    DeadlineExceeded,
    Crashed,
}

/// The failure taxonomy recorded on a deployment that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureKind {
    BuildFailure {
        message: String,
    },
    GateFailure {
        gate: String,
        reason: GateFailureReason,
        output: String,
    },
    /// The gate runner itself crashed mid-gate.
    GateRunnerCrash {
        message: String,
    },
    /// The instance manager could not start the new instance.
    StartFailure {
        message: String,
    },
    HealthTimeout {
        cause: HealthTimeoutCause,
    },
    CrashDuringCutover {
        /// The old instance was already gone and the previous artifact had
        /// to be redeployed.
        degraded: bool,
        message: String,
    },
    OperatorAbort {
        state: DeploymentState,
    },
}

impl FailureKind {
    /// Control-surface exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::GateFailure { .. } => 1,
            Self::HealthTimeout { .. } => 2,
            Self::OperatorAbort { .. } => 3,
            Self::BuildFailure { .. } | Self::GateRunnerCrash { .. } | Self::StartFailure { .. } => 4,
            Self::CrashDuringCutover { .. } => 5,
        }
    }
}

/// One attempt to replace the live instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub service: String,
    pub kind: DeploymentKind,
    pub state: DeploymentState,
    pub artifact: Option<Artifact>,
    /// The instance that was live when this deployment started.
    pub previous_instance: Option<Instance>,
    pub new_instance: Option<Instance>,
    /// Started from the last good artifact when the new instance failed
    /// after cutover with the old one already gone.
    #[serde(default)]
    pub recovery_instance: Option<Instance>,
    pub outcome: Option<DeploymentOutcome>,
    pub failure: Option<FailureKind>,
    /// Non-fatal problems (e.g. drain timeout).
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Who requested the deployment.
    pub actor: String,
    /// Unix timestamp (milliseconds) of the request.
    pub requested_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl DeploymentRecord {
    /// A freshly queued deployment.
    pub fn queued(id: DeploymentId, service: &str, kind: DeploymentKind, actor: &str) -> Self {
        Self {
            id,
            service: service.to_string(),
            kind,
            state: DeploymentState::Idle,
            artifact: None,
            previous_instance: None,
            new_instance: None,
            recovery_instance: None,
            outcome: None,
            failure: None,
            warnings: Vec::new(),
            actor: actor.to_string(),
            requested_at: epoch_millis(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Exit code for the control surface; `None` while still in flight.
    pub fn exit_code(&self) -> Option<i32> {
        match (&self.outcome, &self.failure) {
            (None, _) => None,
            (Some(DeploymentOutcome::Succeeded), _) => Some(0),
            (Some(_), Some(failure)) => Some(failure.exit_code()),
            (Some(_), None) => Some(4),
        }
    }

    pub fn table_key(&self) -> &str {
        &self.id
    }
}

/// Format the deployment id for a sequence number.
pub fn deployment_id(seq: u64) -> DeploymentId {
    format!("dep-{seq:06}")
}

// ── Events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A state machine transition.
    Transition,
    /// A gate started, passed, or failed (state stays `gating`).
    Gate,
    /// A note attached to the current state (warnings, alerts).
    Note,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    /// High severity, surfaced to operators.
    Alert,
}

/// An event as it is handed to the log, before sequencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub deployment_id: DeploymentId,
    pub from_state: DeploymentState,
    pub to_state: DeploymentState,
    pub reason: String,
    pub actor: String,
    pub kind: EventKind,
    pub severity: Severity,
}

impl NewEvent {
    pub fn transition(
        deployment_id: &str,
        from_state: DeploymentState,
        to_state: DeploymentState,
        reason: impl Into<String>,
        actor: &str,
    ) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            from_state,
            to_state,
            reason: reason.into(),
            actor: actor.to_string(),
            kind: EventKind::Transition,
            severity: Severity::Info,
        }
    }

    /// An event that leaves the state unchanged.
    pub fn note(
        deployment_id: &str,
        state: DeploymentState,
        kind: EventKind,
        reason: impl Into<String>,
        actor: &str,
    ) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            from_state: state,
            to_state: state,
            reason: reason.into(),
            actor: actor.to_string(),
            kind,
            severity: Severity::Info,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// An append-only log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentEvent {
    pub seq: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub deployment_id: DeploymentId,
    pub from_state: DeploymentState,
    pub to_state: DeploymentState,
    pub reason: String,
    pub actor: String,
    pub kind: EventKind,
    pub severity: Severity,
}

impl DeploymentEvent {
    pub fn from_new(seq: u64, timestamp: u64, event: NewEvent) -> Self {
        Self {
            seq,
            timestamp,
            deployment_id: event.deployment_id,
            from_state: event.from_state,
            to_state: event.to_state,
            reason: event.reason,
            actor: event.actor,
            kind: event.kind,
            severity: event.severity,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
