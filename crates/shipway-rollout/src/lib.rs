//! shipway-rollout: the deployment orchestrator.
//!
//! One [`Orchestrator`] per service. Deploy and rollback requests are
//! queued FIFO and executed one at a time by a single worker task, each
//! driving a deployment through the state machine:
//!
//! ```text
//! Idle → Building → Gating → Starting → AwaitingHealth → CuttingOver → Draining → Succeeded
//!                     │                       │               │
//!                 GateFailed            HealthTimeout → RolledBack
//! ```
//!
//! The previously live instance is never stopped before the new one has
//! been proven healthy and traffic has been switched to it.
//!
//! # Components
//!
//! - **`builder`**: turns a source reference into an `Artifact`
//! - **`controller`**: executes one deployment through the state machine
//! - **`service`**: the `Orchestrator` handle: queue, worker, cancel, status
//! - **`status`**: the published status snapshot

pub mod builder;
mod controller;
pub mod error;
pub mod service;
pub mod status;

pub use builder::{ArtifactBuilder, CommandBuilder, artifact_id};
pub use error::{BuildError, OrchestratorError};
pub use service::{Collaborators, Orchestrator};
pub use status::{CompletedView, LiveView, ServiceStatus};
