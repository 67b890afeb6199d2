//! shipway-instance: starting, stopping and switching traffic between
//! instances of one service.
//!
//! Exactly one instance is live at a time. The live pointer only moves in
//! `cut_over` / `revert`, both of which swap the [`TrafficSwitch`] backend
//! in one step: new connections go to the new instance, connections already
//! open on the old one finish there while it drains.
//!
//! # Components
//!
//! - **`manager`**: the `InstanceManager` trait the orchestrator drives
//! - **`process`**: `ProcessManager`, instances as local child processes
//! - **`traffic`**: `TrafficSwitch` and the public TCP forwarder

pub mod error;
pub mod manager;
pub mod process;
pub mod traffic;

pub use error::{InstanceError, InstanceResult};
pub use manager::{InstanceManager, StopOutcome};
pub use process::ProcessManager;
pub use traffic::{TrafficSwitch, serve_forwarder};
