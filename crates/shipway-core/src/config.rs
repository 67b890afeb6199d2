//! ship.toml configuration parser.
//!
//! The file form keeps durations as strings and most sections optional;
//! [`ShipConfig::resolve`] validates it and produces typed settings for
//! each subsystem.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::duration::parse_duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid ship.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: String, value: String },
    #[error("invalid listen address {0:?}")]
    InvalidListen(String),
    #[error("`{0}` must not be empty")]
    EmptyCommand(String),
    #[error("`{field}` must be at least {min}")]
    TooSmall { field: String, min: u64 },
    #[error("duplicate gate name `{0}`")]
    DuplicateGate(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipConfig {
    pub service: ServiceConfig,
    pub build: Option<BuildConfig>,
    pub run: RunConfig,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub rollout: RolloutSection,
    #[serde(default)]
    pub gates: Vec<GateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Public address whose connections are forwarded to the live instance.
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub command: Vec<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub endpoint: String,
    pub interval: String,
    pub timeout: String,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub start_period: String,
    pub deadline: String,
    pub post_cutover_checks: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            endpoint: "/healthz".to_string(),
            interval: "30s".to_string(),
            timeout: "10s".to_string(),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            start_period: "10s".to_string(),
            deadline: "120s".to_string(),
            post_cutover_checks: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutSection {
    pub drain_timeout: String,
    pub gate_timeout: String,
    pub queue_capacity: usize,
    pub restore_on_start: bool,
}

impl Default for RolloutSection {
    fn default() -> Self {
        Self {
            drain_timeout: "30s".to_string(),
            gate_timeout: "10m".to_string(),
            queue_capacity: 16,
            restore_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub command: Vec<String>,
    pub timeout: Option<String>,
}

// ── Resolved settings ─────────────────────────────────────────────

/// Health probing and health-wait parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    pub endpoint: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive successes required to enter Healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures required to enter Unhealthy.
    pub unhealthy_threshold: u32,
    /// Grace window after instance start during which failures are not counted.
    pub start_period: Duration,
    /// Maximum time from Starting until Healthy before a forced rollback.
    pub deadline: Duration,
    /// Raw probes taken after cutover, each of which must succeed.
    pub post_cutover_checks: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            endpoint: "/healthz".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            start_period: Duration::from_secs(10),
            deadline: Duration::from_secs(120),
            post_cutover_checks: 1,
        }
    }
}

/// Everything the orchestrator state machine needs, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub service: String,
    pub health: HealthPolicy,
    pub drain_timeout: Duration,
    pub gate_timeout: Duration,
    pub queue_capacity: usize,
}

impl OrchestratorConfig {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            health: HealthPolicy::default(),
            drain_timeout: Duration::from_secs(30),
            gate_timeout: Duration::from_secs(600),
            queue_capacity: 16,
        }
    }
}

/// A verification gate with its effective timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub command: Vec<String>,
    pub timeout: Duration,
}

impl GateSpec {
    pub fn new(name: &str, command: &[&str], timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub command: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// The validated form of a `ship.toml`.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub listen: SocketAddr,
    pub orchestrator: OrchestratorConfig,
    pub gates: Vec<GateSpec>,
    /// `None` when only prebuilt `image:` sources are deployed.
    pub build: Option<BuildPlan>,
    pub run: RunPlan,
    pub restore_on_start: bool,
}

impl ShipConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the file form and convert it into typed settings.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let listen: SocketAddr = self
            .service
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.service.listen.clone()))?;

        let h = &self.health;
        let health = HealthPolicy {
            endpoint: h.endpoint.clone(),
            interval: duration_field("health.interval", &h.interval)?,
            timeout: duration_field("health.timeout", &h.timeout)?,
            healthy_threshold: at_least("health.healthy_threshold", h.healthy_threshold, 1)?,
            unhealthy_threshold: at_least("health.unhealthy_threshold", h.unhealthy_threshold, 1)?,
            start_period: duration_field("health.start_period", &h.start_period)?,
            deadline: duration_field("health.deadline", &h.deadline)?,
            post_cutover_checks: h.post_cutover_checks,
        };
        if health.interval.is_zero() {
            return Err(ConfigError::TooSmall {
                field: "health.interval".to_string(),
                min: 1,
            });
        }
        if health.timeout > health.interval {
            warn!(
                timeout = %h.timeout,
                interval = %h.interval,
                "health timeout exceeds interval; probes will run back to back"
            );
        }

        let r = &self.rollout;
        if r.queue_capacity == 0 {
            return Err(ConfigError::TooSmall {
                field: "rollout.queue_capacity".to_string(),
                min: 1,
            });
        }
        let gate_timeout = duration_field("rollout.gate_timeout", &r.gate_timeout)?;
        let orchestrator = OrchestratorConfig {
            service: self.service.name.clone(),
            health,
            drain_timeout: duration_field("rollout.drain_timeout", &r.drain_timeout)?,
            gate_timeout,
            queue_capacity: r.queue_capacity,
        };

        let mut seen = HashSet::new();
        let mut gates = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            if !seen.insert(gate.name.as_str()) {
                return Err(ConfigError::DuplicateGate(gate.name.clone()));
            }
            if gate.command.is_empty() {
                return Err(ConfigError::EmptyCommand(format!("gates.{}.command", gate.name)));
            }
            let timeout = match &gate.timeout {
                Some(raw) => duration_field(&format!("gates.{}.timeout", gate.name), raw)?,
                None => gate_timeout,
            };
            gates.push(GateSpec {
                name: gate.name.clone(),
                command: gate.command.clone(),
                timeout,
            });
        }

        let build = match &self.build {
            Some(b) => {
                if b.command.is_empty() {
                    return Err(ConfigError::EmptyCommand("build.command".to_string()));
                }
                let timeout = match &b.timeout {
                    Some(raw) => duration_field("build.timeout", raw)?,
                    None => Duration::from_secs(900),
                };
                Some(BuildPlan {
                    command: b.command.clone(),
                    timeout,
                })
            }
            None => None,
        };

        if self.run.command.is_empty() {
            return Err(ConfigError::EmptyCommand("run.command".to_string()));
        }

        Ok(ResolvedConfig {
            listen,
            orchestrator,
            gates,
            build,
            run: RunPlan {
                command: self.run.command.clone(),
                env: self.run.env.clone(),
            },
            restore_on_start: r.restore_on_start,
        })
    }

    /// Scaffold a ship.toml for a service with the usual test/lint gates.
    pub fn scaffold(name: &str) -> Self {
        ShipConfig {
            service: ServiceConfig {
                name: name.to_string(),
                listen: "0.0.0.0:8080".to_string(),
            },
            build: Some(BuildConfig {
                command: vec!["sh".into(), "-c".into(), "docker build -q .".into()],
                timeout: Some("15m".to_string()),
            }),
            run: RunConfig {
                command: ["docker", "run", "--rm", "-p", "{port}:8080", "{artifact}"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                env: BTreeMap::new(),
            },
            health: HealthSection::default(),
            rollout: RolloutSection::default(),
            gates: vec![
                GateConfig {
                    name: "test".to_string(),
                    command: vec!["make".into(), "test".into()],
                    timeout: None,
                },
                GateConfig {
                    name: "lint".to_string(),
                    command: vec!["make".into(), "lint".into()],
                    timeout: Some("5m".to_string()),
                },
            ],
        }
    }
}

fn duration_field(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn at_least(field: &str, value: u32, min: u32) -> Result<u32, ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall {
            field: field.to_string(),
            min: min as u64,
        });
    }
    Ok(value)
}
