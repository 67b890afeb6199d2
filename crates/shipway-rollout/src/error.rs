use std::time::Duration;

use shipway_core::SourceError;
use shipway_state::{DeploymentState, StateError};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid source: {0}")]
    Source(#[from] SourceError),

    #[error("no build command configured (only image: sources can be deployed)")]
    NoBuildCommand,

    #[error("build could not start: {0}")]
    Spawn(String),

    #[error("build failed (exit code {exit_code:?}): {output}")]
    Failed { exit_code: Option<i32>, output: String },

    #[error("build timed out after {0:?}")]
    TimedOut(Duration),

    #[error("build printed no artifact reference")]
    NoArtifact,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("deployment queue is full ({0} waiting)")]
    QueueFull(usize),

    #[error("invalid source: {0}")]
    InvalidSource(#[from] SourceError),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("deployment {0} did not succeed and cannot be rolled back to")]
    NotRollbackTarget(String),

    #[error("cancel not permitted while {0}")]
    CancelNotPermitted(DeploymentState),

    #[error("no deployment in flight")]
    NothingInFlight,

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: DeploymentState,
        to: DeploymentState,
    },

    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("orchestrator is shut down")]
    Shutdown,
}
