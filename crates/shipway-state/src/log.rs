//! The deployment log sink.
//!
//! Everything that happens to a deployment is appended here: state
//! transitions, gate progress, warnings and alerts. The log is also the
//! input for picking a rollback target.

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::{DeploymentEvent, NewEvent};

/// Append-only record of deployment events.
pub trait DeploymentLog: Send + Sync {
    /// Append an event; the sink assigns sequence number and timestamp.
    fn append(&self, event: NewEvent) -> StateResult<DeploymentEvent>;

    /// All events of one deployment, in commit order.
    fn events_for(&self, deployment_id: &str) -> StateResult<Vec<DeploymentEvent>>;

    /// Events after `seq`, for tailing consumers.
    fn events_since(&self, seq: u64) -> StateResult<Vec<DeploymentEvent>>;
}

impl DeploymentLog for StateStore {
    fn append(&self, event: NewEvent) -> StateResult<DeploymentEvent> {
        self.append_event(event)
    }

    fn events_for(&self, deployment_id: &str) -> StateResult<Vec<DeploymentEvent>> {
        self.list_events_for(deployment_id)
    }

    fn events_since(&self, seq: u64) -> StateResult<Vec<DeploymentEvent>> {
        self.list_events_since(seq)
    }
}
