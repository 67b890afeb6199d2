//! shipway-core: configuration and shared primitives.
//!
//! `ship.toml` is parsed into [`ShipConfig`] (string durations, optional
//! sections) and then resolved into the typed [`OrchestratorConfig`] that
//! the orchestrator receives at construction. Nothing downstream reads
//! the environment or re-parses strings.

pub mod config;
pub mod duration;
pub mod source;

pub use config::{
    BuildConfig, BuildPlan, ConfigError, GateConfig, GateSpec, HealthPolicy, HealthSection,
    OrchestratorConfig, ResolvedConfig, RolloutSection, RunConfig, RunPlan, ServiceConfig,
    ShipConfig,
};
pub use duration::{format_duration, parse_duration};
pub use source::{SourceError, SourceRef};
