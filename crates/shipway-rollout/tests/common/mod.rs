//! Scripted collaborators for orchestrator scenario tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use shipway_core::{GateSpec, HealthPolicy, OrchestratorConfig};
use shipway_gate::{GateExecution, GateExecutor, GateRunner};
use shipway_health::{Probe, ProbeResult};
use shipway_instance::{InstanceError, InstanceManager, InstanceResult, StopOutcome};
use shipway_rollout::{ArtifactBuilder, BuildError, Collaborators, Orchestrator, artifact_id};
use shipway_state::{
    Artifact, ArtifactId, DeploymentEvent, DeploymentId, DeploymentRecord, DeploymentState,
    EventKind, HealthStatus, Instance, InstanceId, InstanceStatus, StateStore,
};

pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        service: "web".to_string(),
        health: HealthPolicy {
            endpoint: "/healthz".to_string(),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            start_period: Duration::ZERO,
            deadline: Duration::from_secs(60),
            post_cutover_checks: 1,
        },
        drain_timeout: Duration::from_secs(5),
        gate_timeout: Duration::from_secs(60),
        queue_capacity: 16,
    }
}

/// Artifact id the fake builder assigns to `source`.
pub fn id_of(source: &str) -> ArtifactId {
    artifact_id(source)
}

// ── Builder ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBuilder {
    broken: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
}

impl FakeBuilder {
    pub fn break_source(&self, source: &str) {
        self.broken.lock().unwrap().insert(source.to_string());
    }

    pub fn hang_source(&self, source: &str) {
        self.hanging.lock().unwrap().insert(source.to_string());
    }
}

#[async_trait]
impl ArtifactBuilder for FakeBuilder {
    async fn build(&self, source: &str) -> Result<Artifact, BuildError> {
        if self.hanging.lock().unwrap().contains(source) {
            std::future::pending::<()>().await;
        }
        if self.broken.lock().unwrap().contains(source) {
            return Err(BuildError::Failed {
                exit_code: Some(101),
                output: "error[E0425]: cannot find value `x`".to_string(),
            });
        }
        Ok(Artifact {
            id: id_of(source),
            source: source.to_string(),
            reference: source.trim_start_matches("image:").to_string(),
            created_at: 0,
        })
    }
}

// ── Gates ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeGates {
    /// gate name failing for an artifact id
    failing: Mutex<HashMap<ArtifactId, String>>,
    hanging: Mutex<HashSet<String>>,
    runs: Mutex<Vec<(String, ArtifactId)>>,
}

impl FakeGates {
    pub fn fail(&self, source: &str, gate: &str) {
        self.failing.lock().unwrap().insert(id_of(source), gate.to_string());
    }

    pub fn hang(&self, gate: &str) {
        self.hanging.lock().unwrap().insert(gate.to_string());
    }

    /// Gate executions so far, as (gate, artifact id).
    pub fn runs(&self) -> Vec<(String, ArtifactId)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl GateExecutor for FakeGates {
    async fn execute(&self, gate: &GateSpec, artifact: &Artifact) -> Result<GateExecution, String> {
        self.runs.lock().unwrap().push((gate.name.clone(), artifact.id.clone()));
        if self.hanging.lock().unwrap().contains(&gate.name) {
            std::future::pending::<()>().await;
        }
        let fails = self.failing.lock().unwrap().get(&artifact.id) == Some(&gate.name);
        Ok(GateExecution {
            success: !fails,
            exit_code: Some(if fails { 1 } else { 0 }),
            output: if fails { format!("{}: 3 problems", gate.name) } else { String::new() },
        })
    }
}

// ── Probe ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum Behavior {
    Healthy,
    Never,
    /// Scripted results, Healthy once exhausted.
    Sequence(Vec<ProbeResult>),
    /// Healthy until it receives traffic, failing afterwards.
    FailAfterCutover,
}

pub struct ScriptedProbe {
    instances: Arc<FakeInstances>,
    behaviors: Mutex<HashMap<ArtifactId, Behavior>>,
    /// Polls of instances not yet receiving traffic, per instance.
    pre_cutover: Mutex<HashMap<InstanceId, u32>>,
    /// Every poll, per instance.
    total: Mutex<HashMap<InstanceId, u32>>,
}

impl ScriptedProbe {
    pub fn new(instances: Arc<FakeInstances>) -> Self {
        Self {
            instances,
            behaviors: Mutex::new(HashMap::new()),
            pre_cutover: Mutex::new(HashMap::new()),
            total: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, source: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(id_of(source), behavior);
    }

    pub fn pre_cutover_polls(&self, instance: &Instance) -> u32 {
        self.pre_cutover.lock().unwrap().get(&instance.id).copied().unwrap_or(0)
    }

    /// All polls of `instance`, before and after cutover.
    pub fn polls_of(&self, instance: &Instance) -> u32 {
        self.total.lock().unwrap().get(&instance.id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn check(&self, instance: &Instance) -> ProbeResult {
        *self.total.lock().unwrap().entry(instance.id.clone()).or_default() += 1;
        let live = self.instances.live().is_some_and(|l| l.id == instance.id);
        let poll = if live {
            0
        } else {
            let mut polls = self.pre_cutover.lock().unwrap();
            let n = polls.entry(instance.id.clone()).or_default();
            *n += 1;
            *n
        };

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&instance.artifact_id)
            .cloned()
            .unwrap_or(Behavior::Healthy);
        match behavior {
            Behavior::Healthy => ProbeResult::Healthy,
            Behavior::Never => ProbeResult::Unhealthy,
            Behavior::Sequence(results) if !live => results
                .get(poll as usize - 1)
                .copied()
                .unwrap_or(ProbeResult::Healthy),
            Behavior::Sequence(_) => ProbeResult::Healthy,
            Behavior::FailAfterCutover if live => ProbeResult::Failed,
            Behavior::FailAfterCutover => ProbeResult::Healthy,
        }
    }
}

// ── Instances ─────────────────────────────────────────────────────

struct Tracked {
    instance: Instance,
    /// `Starting` until `ready_at`, then `boots_to` unless changed since.
    status: InstanceStatus,
    ready_at: Instant,
    boots_to: InstanceStatus,
}

impl Tracked {
    fn current(&self) -> InstanceStatus {
        if self.status == InstanceStatus::Starting && Instant::now() >= self.ready_at {
            self.boots_to
        } else {
            self.status
        }
    }
}

/// Mirrors the cutover rules of the process manager without processes.
#[derive(Default)]
pub struct FakeInstances {
    seq: AtomicU32,
    instances: Mutex<HashMap<InstanceId, Tracked>>,
    live: Mutex<Option<Instance>>,
    started: Mutex<Vec<Instance>>,
    start_fails: Mutex<HashSet<ArtifactId>>,
    slow_start: Mutex<HashSet<ArtifactId>>,
    crash_on_start: Mutex<HashSet<ArtifactId>>,
    crash_during_boot: Mutex<HashSet<ArtifactId>>,
    stuck_drain: Mutex<HashSet<ArtifactId>>,
    kills_previous: Mutex<HashSet<ArtifactId>>,
    /// Instance ids that received traffic, in order.
    traffic: Mutex<Vec<InstanceId>>,
}

impl FakeInstances {
    pub fn fail_start(&self, source: &str) {
        self.start_fails.lock().unwrap().insert(id_of(source));
    }

    /// Instances of `source` take five seconds to become Ready.
    pub fn slow_start(&self, source: &str) {
        self.slow_start.lock().unwrap().insert(id_of(source));
    }

    /// Instances of `source` are already dead when the launch returns.
    pub fn crash_on_start(&self, source: &str) {
        self.crash_on_start.lock().unwrap().insert(id_of(source));
    }

    /// Instances of `source` die at the end of their boot instead of
    /// becoming Ready.
    pub fn crash_during_boot(&self, source: &str) {
        self.crash_during_boot.lock().unwrap().insert(id_of(source));
    }

    /// The process of `instance` exits on its own.
    pub fn crash(&self, instance: &Instance) {
        self.set_status(&instance.id, InstanceStatus::Crashed);
    }

    /// Instances of `source` ignore SIGTERM.
    pub fn stuck_drain(&self, source: &str) {
        self.stuck_drain.lock().unwrap().insert(id_of(source));
    }

    /// Cutting over to `source` kills the instance it replaces.
    pub fn kills_previous(&self, source: &str) {
        self.kills_previous.lock().unwrap().insert(id_of(source));
    }

    pub fn started(&self) -> Vec<Instance> {
        self.started.lock().unwrap().clone()
    }

    pub fn traffic(&self) -> Vec<InstanceId> {
        self.traffic.lock().unwrap().clone()
    }

    pub fn status_of(&self, instance: &Instance) -> InstanceStatus {
        self.status(instance)
    }

    fn set_status(&self, id: &str, status: InstanceStatus) {
        if let Some(t) = self.instances.lock().unwrap().get_mut(id) {
            t.status = status;
        }
    }
}

#[async_trait]
impl InstanceManager for FakeInstances {
    async fn start(&self, artifact: &Artifact) -> InstanceResult<Instance> {
        if self.start_fails.lock().unwrap().contains(&artifact.id) {
            return Err(InstanceError::Start("exec format error".to_string()));
        }
        let boot = if self.slow_start.lock().unwrap().contains(&artifact.id) {
            Duration::from_secs(5)
        } else {
            Duration::ZERO
        };

        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = Instance {
            id: format!("inst-{n}"),
            artifact_id: artifact.id.clone(),
            address: format!("127.0.0.1:{}", 9000 + n),
            started_at: 0,
        };
        let status = if self.crash_on_start.lock().unwrap().contains(&artifact.id) {
            InstanceStatus::Crashed
        } else {
            InstanceStatus::Starting
        };
        let boots_to = if self.crash_during_boot.lock().unwrap().contains(&artifact.id) {
            InstanceStatus::Crashed
        } else {
            InstanceStatus::Ready
        };
        self.instances.lock().unwrap().insert(
            instance.id.clone(),
            Tracked {
                instance: instance.clone(),
                status,
                ready_at: Instant::now() + boot,
                boots_to,
            },
        );
        self.started.lock().unwrap().push(instance.clone());
        Ok(instance)
    }

    fn status(&self, instance: &Instance) -> InstanceStatus {
        self.instances
            .lock()
            .unwrap()
            .get(&instance.id)
            .map(Tracked::current)
            .unwrap_or(InstanceStatus::Stopped)
    }

    async fn cut_over(&self, new: &Instance, new_health: HealthStatus, old: Option<&Instance>) -> InstanceResult<()> {
        if new_health != HealthStatus::Healthy {
            return Err(InstanceError::NotHealthy {
                instance: new.id.clone(),
                health: new_health,
            });
        }
        if !self.status(new).is_running() {
            return Err(InstanceError::NotRunning(new.id.clone()));
        }
        *self.live.lock().unwrap() = Some(new.clone());
        self.traffic.lock().unwrap().push(new.id.clone());
        if let Some(old) = old {
            if self.kills_previous.lock().unwrap().contains(&new.artifact_id) {
                self.set_status(&old.id, InstanceStatus::Crashed);
            } else if self.status(old).is_running() {
                self.set_status(&old.id, InstanceStatus::Draining);
            }
        }
        Ok(())
    }

    async fn revert(&self, to: &Instance, from: &Instance) -> InstanceResult<()> {
        if !self.status(to).is_running() {
            return Err(InstanceError::NotRunning(to.id.clone()));
        }
        *self.live.lock().unwrap() = Some(to.clone());
        self.traffic.lock().unwrap().push(to.id.clone());
        self.set_status(&to.id, InstanceStatus::Ready);
        if self.status(from).is_running() {
            self.set_status(&from.id, InstanceStatus::Draining);
        }
        Ok(())
    }

    async fn stop(&self, instance: &Instance, _drain_timeout: Duration) -> InstanceResult<StopOutcome> {
        let status = {
            let instances = self.instances.lock().unwrap();
            instances
                .get(&instance.id)
                .map(Tracked::current)
                .ok_or_else(|| InstanceError::Unknown(instance.id.clone()))?
        };
        {
            let mut live = self.live.lock().unwrap();
            if live.as_ref().is_some_and(|l| l.id == instance.id) {
                *live = None;
            }
        }
        if !status.is_running() {
            return Ok(StopOutcome::Graceful);
        }
        self.set_status(&instance.id, InstanceStatus::Stopped);
        if self.stuck_drain.lock().unwrap().contains(&instance.artifact_id) {
            Ok(StopOutcome::Forced)
        } else {
            Ok(StopOutcome::Graceful)
        }
    }

    fn live(&self) -> Option<Instance> {
        self.live.lock().unwrap().clone()
    }
}

// ── Harness ───────────────────────────────────────────────────────

pub struct Harness {
    pub orch: Orchestrator,
    pub builder: Arc<FakeBuilder>,
    pub gates: Arc<FakeGates>,
    pub instances: Arc<FakeInstances>,
    pub probe: Arc<ScriptedProbe>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let builder = Arc::new(FakeBuilder::default());
        let gates = Arc::new(FakeGates::default());
        let instances = Arc::new(FakeInstances::default());
        let probe = Arc::new(ScriptedProbe::new(instances.clone()));

        let specs = vec![
            GateSpec::new("lint", &["make", "lint"], config.gate_timeout),
            GateSpec::new("test", &["make", "test"], config.gate_timeout),
        ];
        let orch = Orchestrator::start(
            config,
            Collaborators {
                builder: builder.clone(),
                gates: GateRunner::new(specs, gates.clone()),
                instances: instances.clone(),
                probe: probe.clone(),
                store: StateStore::open_in_memory().unwrap(),
            },
        );
        Self {
            orch,
            builder,
            gates,
            instances,
            probe,
        }
    }

    /// Deploy `source` and wait for the deployment to finish.
    pub async fn deploy(&self, source: &str) -> DeploymentRecord {
        let id = self.orch.deploy(source, "alice").unwrap();
        self.orch.wait_for(&id).await.unwrap()
    }

    pub async fn rollback(&self, target: &DeploymentId) -> DeploymentRecord {
        let id = self.orch.rollback(target, "alice").unwrap();
        self.orch.wait_for(&id).await.unwrap()
    }

    pub async fn reach(&self, state: DeploymentState) {
        let mut rx = self.orch.subscribe();
        rx.wait_for(|s| s.state == state).await.unwrap();
    }

    /// Transitions recorded for `id`, as (from, to).
    pub fn transitions(&self, id: &str) -> Vec<(DeploymentState, DeploymentState)> {
        self.orch
            .events_for(id)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EventKind::Transition)
            .map(|e| (e.from_state, e.to_state))
            .collect()
    }

    pub fn events(&self, id: &str) -> Vec<DeploymentEvent> {
        self.orch.events_for(id).unwrap()
    }
}
