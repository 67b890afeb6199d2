//! shipway-gate: verification gates a candidate artifact must pass.
//!
//! Gates (test, lint, security scan, …) run strictly in declared order.
//! Each has its own timeout; the first gate that fails, times out, or
//! cannot start ends the run and the remaining gates are skipped.
//!
//! # Components
//!
//! - **`gate`**: run results (`GateRun`, `GateReport`, `GateVerdict`)
//! - **`executor`**: how a single gate is executed (`GateExecutor`, `CommandExecutor`)
//! - **`runner`**: the fail-fast sequencer that logs every gate transition

pub mod executor;
pub mod gate;
pub mod runner;

pub use executor::{CommandExecutor, GateExecution, GateExecutor};
pub use gate::{GateOutcome, GateReport, GateRun, GateVerdict};
pub use runner::{GateRunner, GateRunnerError};
pub use shipway_core::GateSpec;
