//! The instance manager seam.

use std::time::Duration;

use async_trait::async_trait;

use shipway_state::{Artifact, HealthStatus, Instance, InstanceStatus};

use crate::error::InstanceResult;

/// How a stopped instance went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the drain timeout (or was already gone).
    Graceful,
    /// Still running at the drain timeout and was killed.
    Forced,
}

/// Lifecycle of the instances of one service.
///
/// Implementations own instance status. Only the orchestrator calls the
/// mutating methods, and only from its single worker.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// Launch an instance for `artifact`. Returns as soon as the process
    /// exists; the instance is `Starting` until it accepts connections.
    async fn start(&self, artifact: &Artifact) -> InstanceResult<Instance>;

    fn status(&self, instance: &Instance) -> InstanceStatus;

    /// Point traffic at `new` and mark `old` draining.
    ///
    /// Rejected unless `new_health` is `Healthy`, and rejected while
    /// another cutover is in progress.
    async fn cut_over(
        &self,
        new: &Instance,
        new_health: HealthStatus,
        old: Option<&Instance>,
    ) -> InstanceResult<()>;

    /// Re-promote `to` (the previous live instance, still running) and
    /// take traffic away from `from`.
    async fn revert(&self, to: &Instance, from: &Instance) -> InstanceResult<()>;

    /// Ask `instance` to exit, force it after `drain_timeout`.
    async fn stop(&self, instance: &Instance, drain_timeout: Duration) -> InstanceResult<StopOutcome>;

    /// The instance currently receiving traffic.
    fn live(&self) -> Option<Instance>;
}
