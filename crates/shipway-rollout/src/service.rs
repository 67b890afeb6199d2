//! The orchestrator handle.
//!
//! `Orchestrator` is `Clone` and cheap to share (API handlers, the daemon,
//! tests). Requests are validated and queued synchronously; a single
//! worker task pops the queue and runs one deployment at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use shipway_core::{OrchestratorConfig, SourceRef};
use shipway_gate::GateRunner;
use shipway_health::{HealthCallback, LiveWatch, Probe, RunningCheck};
use shipway_instance::InstanceManager;
use shipway_state::{
    DeploymentEvent, DeploymentId, DeploymentKind, DeploymentOutcome, DeploymentRecord,
    DeploymentState, EventKind, HealthStatus, Instance, NewEvent, Severity, StateError, StateStore,
    epoch_millis,
};

use crate::builder::ArtifactBuilder;
use crate::error::OrchestratorError;
use crate::status::{CompletedView, LiveView, ServiceStatus};

/// Cancel latch of the in-flight deployment; holds the requesting actor.
pub(crate) type CancelSignal = watch::Receiver<Option<String>>;

/// Everything the orchestrator drives.
pub struct Collaborators {
    pub builder: Arc<dyn ArtifactBuilder>,
    pub gates: GateRunner,
    pub instances: Arc<dyn InstanceManager>,
    pub probe: Arc<dyn Probe>,
    pub store: StateStore,
}

/// Bookkeeping for the in-flight deployment, shared with `cancel()`.
pub(crate) struct Control {
    pub(crate) in_flight: Option<DeploymentId>,
    pub(crate) state: DeploymentState,
    /// Set during degraded recovery, when cancel is refused.
    pub(crate) recovering: bool,
    /// Whether the in-flight deployment has made its first transition.
    pub(crate) begun: bool,
    pub(crate) cancel: Option<watch::Sender<Option<String>>>,
}

impl Control {
    fn idle() -> Self {
        Self {
            in_flight: None,
            state: DeploymentState::Idle,
            recovering: false,
            begun: false,
            cancel: None,
        }
    }

    /// Whether a cancel may be latched now. A deployment that was picked
    /// up but has not transitioned yet is still cancellable.
    fn check_cancel(&self) -> Result<DeploymentId, OrchestratorError> {
        let id = self.in_flight.clone().ok_or(OrchestratorError::NothingInFlight)?;
        let open = !self.begun || self.state.is_cancellable();
        if self.recovering || !open {
            return Err(OrchestratorError::CancelNotPermitted(self.state));
        }
        Ok(id)
    }
}

pub(crate) struct Shared {
    pub(crate) config: OrchestratorConfig,
    pub(crate) builder: Arc<dyn ArtifactBuilder>,
    pub(crate) gates: GateRunner,
    pub(crate) instances: Arc<dyn InstanceManager>,
    pub(crate) probe: Arc<dyn Probe>,
    pub(crate) store: StateStore,
    pub(crate) control: Mutex<Control>,
    queue: Mutex<VecDeque<DeploymentId>>,
    wake: Notify,
    status: watch::Sender<ServiceStatus>,
    waiters: Mutex<HashMap<DeploymentId, Vec<oneshot::Sender<DeploymentRecord>>>>,
    live_watch: Mutex<Option<LiveWatch>>,
    /// Deployment whose artifact the live instance runs.
    live_deployment: Mutex<Option<DeploymentId>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Shared>,
}

/// Handle to the deployment orchestrator of one service.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Build the orchestrator and spawn its worker. Must be called inside
    /// a tokio runtime.
    pub fn start(config: OrchestratorConfig, parts: Collaborators) -> Self {
        let (status, _) = watch::channel(ServiceStatus::idle(&config.service));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new_cyclic(|this| Shared {
            config,
            builder: parts.builder,
            gates: parts.gates,
            instances: parts.instances,
            probe: parts.probe,
            store: parts.store,
            control: Mutex::new(Control::idle()),
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            status,
            waiters: Mutex::new(HashMap::new()),
            live_watch: Mutex::new(None),
            live_deployment: Mutex::new(None),
            shutdown,
            worker: Mutex::new(None),
            this: this.clone(),
        });

        let handle = tokio::spawn(run_worker(shared.clone(), shutdown_rx));
        *shared.worker.lock().expect("worker lock") = Some(handle);
        info!(service = %shared.config.service, "orchestrator started");

        Self { shared }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &StateStore {
        &self.shared.store
    }

    /// Queue a deployment of `source`.
    pub fn deploy(&self, source: &str, actor: &str) -> Result<DeploymentId, OrchestratorError> {
        SourceRef::parse(source)?;
        self.shared.enqueue(
            DeploymentKind::Deploy {
                source: source.trim().to_string(),
            },
            actor,
        )
    }

    /// Queue a rollback to the artifact of a previously succeeded deployment.
    pub fn rollback(&self, target: &str, actor: &str) -> Result<DeploymentId, OrchestratorError> {
        let record = self
            .shared
            .store
            .get_deployment(target)?
            .ok_or_else(|| OrchestratorError::UnknownDeployment(target.to_string()))?;
        if record.outcome != Some(DeploymentOutcome::Succeeded) || record.artifact.is_none() {
            return Err(OrchestratorError::NotRollbackTarget(target.to_string()));
        }
        self.shared.enqueue(
            DeploymentKind::Rollback {
                target: target.to_string(),
            },
            actor,
        )
    }

    /// Cancel the in-flight deployment.
    ///
    /// Permitted in Building, Gating, Starting and AwaitingHealth, and for
    /// a deployment picked up but not yet transitioned. While the instance
    /// launch is in progress the request is latched and honoured as soon
    /// as the launch returns.
    pub fn cancel(&self, actor: &str) -> Result<DeploymentId, OrchestratorError> {
        let control = self.shared.control.lock().expect("control lock");
        let id = control.check_cancel()?;
        if let Some(latch) = &control.cancel {
            latch.send_replace(Some(actor.to_string()));
        }
        self.shared.store.append_event(
            NewEvent::note(
                &id,
                control.state,
                EventKind::Note,
                format!("cancel requested by {actor}"),
                actor,
            )
            .with_severity(Severity::Warning),
        )?;
        info!(deployment = %id, state = %control.state, %actor, "cancel requested");
        Ok(id)
    }

    /// Snapshot as of the last committed transition.
    pub fn status(&self) -> ServiceStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.shared.status.subscribe()
    }

    pub fn deployment(&self, id: &str) -> Result<DeploymentRecord, OrchestratorError> {
        self.shared
            .store
            .get_deployment(id)?
            .ok_or_else(|| OrchestratorError::UnknownDeployment(id.to_string()))
    }

    /// All deployments, oldest first.
    pub fn history(&self) -> Result<Vec<DeploymentRecord>, OrchestratorError> {
        Ok(self.shared.store.list_deployments()?)
    }

    pub fn events_for(&self, id: &str) -> Result<Vec<DeploymentEvent>, OrchestratorError> {
        self.deployment(id)?;
        Ok(self.shared.store.list_events_for(id)?)
    }

    pub fn events_since(&self, seq: u64) -> Result<Vec<DeploymentEvent>, OrchestratorError> {
        Ok(self.shared.store.list_events_since(seq)?)
    }

    /// Wait until deployment `id` reaches a terminal state.
    ///
    /// Fails with `Shutdown` once the orchestrator is stopped.
    pub async fn wait_for(&self, id: &str) -> Result<DeploymentRecord, OrchestratorError> {
        let rx = {
            let mut waiters = self.shared.waiters.lock().expect("waiters lock");
            let record = self.deployment(id)?;
            if record.is_terminal() {
                return Ok(record);
            }
            if *self.shared.shutdown.borrow() {
                return Err(OrchestratorError::Shutdown);
            }
            let (tx, rx) = oneshot::channel();
            waiters.entry(id.to_string()).or_default().push(tx);
            rx
        };
        rx.await.map_err(|_| OrchestratorError::Shutdown)
    }

    /// Bring the last good artifact back up when nothing is live, e.g.
    /// after a daemon restart.
    pub fn restore(&self, actor: &str) -> Result<Option<DeploymentId>, OrchestratorError> {
        if self.shared.instances.live().is_some() {
            return Ok(None);
        }
        match self.shared.store.latest_succeeded(None)? {
            Some(last) => {
                info!(target = %last.id, "restoring last successful deployment");
                self.rollback(&last.id, actor).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Stop the worker. A deployment still in flight is abandoned and will
    /// be closed as stale on the next start; its waiters get `Shutdown`.
    pub async fn shutdown(&self) {
        {
            let _waiters = self.shared.waiters.lock().expect("waiters lock");
            self.shared.shutdown.send_replace(true);
        }
        let handle = self.shared.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let abandoned = std::mem::take(&mut *self.shared.waiters.lock().expect("waiters lock"));
        if !abandoned.is_empty() {
            warn!(deployments = abandoned.len(), "releasing waiters of unfinished deployments");
        }
        drop(abandoned);
        if let Some(watch) = self.shared.live_watch.lock().expect("live watch lock").take() {
            watch.stop();
        }
        info!(service = %self.shared.config.service, "orchestrator stopped");
    }
}

impl Shared {
    fn enqueue(&self, kind: DeploymentKind, actor: &str) -> Result<DeploymentId, OrchestratorError> {
        let id = {
            let mut queue = self.queue.lock().expect("queue lock");
            if queue.len() >= self.config.queue_capacity {
                warn!(service = %self.config.service, waiting = queue.len(), "deployment queue full");
                return Err(OrchestratorError::QueueFull(queue.len()));
            }
            let id = self.store.next_deployment_id()?;
            let record = DeploymentRecord::queued(id.clone(), &self.config.service, kind, actor);
            self.store.put_deployment(&record)?;
            self.store.append_event(NewEvent::note(
                &id,
                DeploymentState::Idle,
                EventKind::Note,
                format!("{} queued by {actor}", describe(&record.kind)),
                actor,
            ))?;
            queue.push_back(id.clone());
            id
        };
        info!(deployment = %id, %actor, "deployment queued");
        self.wake.notify_one();
        self.refresh_status(None);
        Ok(id)
    }

    /// Record the state of the in-flight deployment after a committed
    /// transition and republish the status.
    pub(crate) fn committed(&self, record: &DeploymentRecord) {
        {
            let mut control = self.control.lock().expect("control lock");
            control.state = record.state;
            control.begun = true;
        }
        self.refresh_status(None);
    }

    /// Atomically close the cancel window before cutover.
    ///
    /// Returns the cancelling actor if a cancel landed first; otherwise the
    /// control state moves to CuttingOver and later cancels are refused.
    pub(crate) fn begin_cutover(&self, cancel: &CancelSignal) -> Option<String> {
        let mut control = self.control.lock().expect("control lock");
        if let Some(actor) = cancel.borrow().clone() {
            return Some(actor);
        }
        control.state = DeploymentState::CuttingOver;
        None
    }

    pub(crate) fn set_recovering(&self, recovering: bool) {
        self.control.lock().expect("control lock").recovering = recovering;
    }

    /// Start health-watching `instance` as the live instance.
    pub(crate) fn watch_live(&self, instance: &Instance, deployment_id: &str) {
        let weak = self.this.clone();
        let on_change: HealthCallback = Arc::new(move |instance_id, health| {
            if let Some(shared) = weak.upgrade() {
                shared.live_health_changed(&instance_id, health);
            }
        });
        let instances = self.instances.clone();
        let running: RunningCheck = Arc::new(move |watched: &Instance| instances.status(watched).is_running());
        let watch = LiveWatch::spawn(
            self.probe.clone(),
            &self.config.health,
            instance.clone(),
            HealthStatus::Healthy,
            running,
            Some(on_change),
        );
        let previous = self.live_watch.lock().expect("live watch lock").replace(watch);
        if let Some(previous) = previous {
            previous.stop();
        }
        *self.live_deployment.lock().expect("live deployment lock") = Some(deployment_id.to_string());
    }

    /// Drop the live watch if its instance is no longer the live one.
    fn retire_stale_watch(&self) {
        let live = self.instances.live();
        let mut slot = self.live_watch.lock().expect("live watch lock");
        let stale = match (slot.as_ref(), &live) {
            (Some(watch), Some(live)) => watch.instance_id() != live.id || watch.is_finished(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stale {
            if let Some(watch) = slot.take() {
                info!(instance = %watch.instance_id(), "live health watch retired");
                watch.stop();
            }
        }
    }

    fn live_health_changed(&self, instance_id: &str, health: HealthStatus) {
        if health == HealthStatus::Unhealthy {
            warn!(service = %self.config.service, instance = %instance_id, "live instance unhealthy");
        } else {
            info!(service = %self.config.service, instance = %instance_id, ?health, "live instance health changed");
        }
        self.status.send_modify(|status| {
            if let Some(live) = status.live.as_mut() {
                if live.instance.id == instance_id {
                    live.health = health;
                }
            }
        });
    }

    fn refresh_status(&self, completed: Option<&DeploymentRecord>) {
        let (state, in_flight) = {
            let control = self.control.lock().expect("control lock");
            (control.state, control.in_flight.clone())
        };
        let queued: Vec<DeploymentId> = self.queue.lock().expect("queue lock").iter().cloned().collect();
        let health = {
            let watch = self.live_watch.lock().expect("live watch lock");
            watch.as_ref().map(|w| (w.instance_id().to_string(), w.status()))
        };
        let live_deployment = self.live_deployment.lock().expect("live deployment lock").clone();
        let live = self.instances.live().map(|instance| {
            let (deployment_id, health) = match &health {
                Some((watched, status)) if *watched == instance.id => (live_deployment.clone(), *status),
                _ => (None, HealthStatus::Unknown),
            };
            LiveView {
                instance,
                deployment_id,
                health,
            }
        });
        let last = completed.and_then(CompletedView::from_record);

        self.status.send_modify(|status| {
            status.state = if in_flight.is_some() { state } else { DeploymentState::Idle };
            status.in_flight = in_flight;
            status.live = live;
            status.queued = queued;
            if last.is_some() {
                status.last_completed = last;
            }
        });
    }

    /// Pop the next deployment, or `None` when the queue is empty.
    fn next_queued(&self) -> Option<DeploymentId> {
        self.queue.lock().expect("queue lock").pop_front()
    }

    fn begin(&self, id: &str) -> CancelSignal {
        let (tx, rx) = watch::channel(None);
        *self.control.lock().expect("control lock") = Control {
            in_flight: Some(id.to_string()),
            cancel: Some(tx),
            ..Control::idle()
        };
        rx
    }

    fn complete(&self, record: &DeploymentRecord) {
        *self.control.lock().expect("control lock") = Control::idle();
        self.retire_stale_watch();
        self.refresh_status(Some(record));

        let waiters = self.waiters.lock().expect("waiters lock").remove(&record.id);
        for tx in waiters.into_iter().flatten() {
            let _ = tx.send(record.clone());
        }
    }

    /// Close a deployment whose execution hit an internal error.
    fn fail_internal(&self, id: &str, err: &OrchestratorError) -> DeploymentRecord {
        error!(deployment = %id, error = %err, "deployment aborted by internal error");
        let mut record = match self.store.get_deployment(id) {
            Ok(Some(record)) => record,
            _ => DeploymentRecord::queued(
                id.to_string(),
                &self.config.service,
                DeploymentKind::Deploy {
                    source: String::new(),
                },
                "shipd",
            ),
        };
        if record.outcome.is_none() {
            record.outcome = Some(DeploymentOutcome::Aborted);
            record.finished_at = Some(epoch_millis());
        }
        record.warnings.push(format!("internal error: {err}"));
        if let Err(e) = self.store.put_deployment(&record) {
            error!(deployment = %id, error = %e, "failed to persist aborted deployment");
        }
        let _ = self.store.append_event(
            NewEvent::note(id, record.state, EventKind::Note, format!("internal error: {err}"), "orchestrator")
                .with_severity(Severity::Alert),
        );
        record
    }
}

fn describe(kind: &DeploymentKind) -> String {
    match kind {
        DeploymentKind::Deploy { source } => format!("deploy of {source}"),
        DeploymentKind::Rollback { target } => format!("rollback to {target}"),
    }
}

async fn run_worker(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some(id) = shared.next_queued() else {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            continue;
        };

        let record = match shared.store.require_deployment(&id) {
            Ok(record) => record,
            Err(StateError::NotFound(_)) => {
                warn!(deployment = %id, "queued deployment vanished from the store");
                continue;
            }
            Err(e) => {
                let record = shared.fail_internal(&id, &OrchestratorError::State(e));
                shared.complete(&record);
                continue;
            }
        };

        let cancel = shared.begin(&id);
        info!(deployment = %id, kind = %describe(&record.kind), "deployment started");

        tokio::select! {
            result = shared.execute(record, cancel) => {
                let record = match result {
                    Ok(record) => record,
                    Err(e) => shared.fail_internal(&id, &e),
                };
                info!(
                    deployment = %id,
                    state = %record.state,
                    outcome = ?record.outcome,
                    exit_code = ?record.exit_code(),
                    "deployment finished"
                );
                shared.complete(&record);
            }
            _ = shutdown.changed() => {
                warn!(deployment = %id, "shutting down with a deployment in flight");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picked_up() -> Control {
        Control {
            in_flight: Some("dep-000001".to_string()),
            ..Control::idle()
        }
    }

    #[test]
    fn cancel_needs_a_deployment_in_flight() {
        assert!(matches!(
            Control::idle().check_cancel(),
            Err(OrchestratorError::NothingInFlight)
        ));
    }

    #[test]
    fn cancel_accepted_before_the_first_transition() {
        assert_eq!(picked_up().check_cancel().unwrap(), "dep-000001");
    }

    #[test]
    fn cancel_follows_the_state_once_begun() {
        let mut control = picked_up();
        control.begun = true;
        control.state = DeploymentState::Starting;
        assert!(control.check_cancel().is_ok());

        control.state = DeploymentState::CuttingOver;
        assert!(matches!(
            control.check_cancel(),
            Err(OrchestratorError::CancelNotPermitted(DeploymentState::CuttingOver))
        ));
    }

    #[test]
    fn cancel_refused_during_recovery() {
        let mut control = picked_up();
        control.begun = true;
        control.state = DeploymentState::AwaitingHealth;
        control.recovering = true;
        assert!(control.check_cancel().is_err());
    }
}
