//! shipway-health: health checking for deployed instances.
//!
//! Provides the HTTP readiness probe, the consecutive-threshold tracker
//! that debounces probe results, and two ways of driving them: a
//! poll-on-demand [`HealthMonitor`] used while a new instance is being
//! verified, and a background [`LiveWatch`] that keeps the live
//! instance's status fresh.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (orchestrator-driven, one per candidate instance)
//!   ├── Probe::check() → ProbeResult
//!   └── HealthTracker (start-period grace, healthy/unhealthy thresholds)
//!
//! LiveWatch (background task, one per live instance)
//!   ├── HealthMonitor::poll() every interval
//!   └── watch::Sender<HealthStatus> + optional HealthCallback on change
//! ```
//!
//! # Hysteresis
//!
//! A single probe never flips the status. `healthy_threshold` consecutive
//! successes are needed to enter `Healthy`, `unhealthy_threshold`
//! consecutive failures to enter `Unhealthy`. Failures inside the start
//! period are ignored entirely.

pub mod checker;
pub mod monitor;
pub mod probe;

pub use checker::{HealthTracker, ProbeResult};
pub use monitor::{HealthCallback, HealthMonitor, LiveWatch, RunningCheck};
pub use probe::{HttpProbe, Probe, http_probe};
