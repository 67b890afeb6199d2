//! shipway-state: deployment records and the deployment event log.
//!
//! Backed by [redb](https://docs.rs/redb). Deployment records are keyed by
//! their id (`dep-000042`, so lexical order is request order); events are
//! keyed by a monotonic `u64` sequence number so the log replays in the
//! order transitions were committed.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and implements [`DeploymentLog`], the sink the orchestrator and the gate
//! runner write their events to.

pub mod error;
pub mod log;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use log::DeploymentLog;
pub use store::StateStore;
pub use types::*;
