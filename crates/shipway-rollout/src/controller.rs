//! Execution of one deployment.
//!
//! A `Run` owns the deployment record while it is in flight. Every state
//! change goes through `transition`, which checks the move against the
//! state table, persists the record, appends the event and republishes
//! the status snapshot, in that order.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use shipway_core::format_duration;
use shipway_gate::GateRunnerError;
use shipway_health::HealthMonitor;
use shipway_instance::StopOutcome;
use shipway_state::{
    Artifact, DeploymentKind, DeploymentOutcome, DeploymentRecord, DeploymentState, EventKind,
    FailureKind, HealthStatus, HealthTimeoutCause, Instance, InstanceStatus, NewEvent, Severity,
    epoch_millis,
};

use crate::error::OrchestratorError;
use crate::service::{CancelSignal, Shared};

use DeploymentState::*;

const ACTOR: &str = "orchestrator";

/// While an instance is not yet accepting connections, or between health
/// polls, its status is rechecked this often so a crash ends the wait
/// promptly.
const STATUS_RECHECK: Duration = Duration::from_millis(250);

enum Raced<T> {
    Done(T),
    Cancelled(String),
}

/// How a bounded wait on a starting instance ended.
enum Wait {
    Reached,
    DeadlineExceeded,
    Crashed,
    Cancelled(String),
}

/// Resolves once a cancel is latched, with the requesting actor.
async fn cancelled(cancel: &mut CancelSignal) -> String {
    let latched = cancel
        .wait_for(|actor| actor.is_some())
        .await
        .map(|actor| actor.clone().unwrap_or_default());
    match latched {
        Ok(actor) => actor,
        // The latch outlives the run; a closed channel never cancels.
        Err(_) => std::future::pending().await,
    }
}

/// Run `fut` unless a cancel is (or becomes) latched first.
async fn race<F: Future>(cancel: &mut CancelSignal, fut: F) -> Raced<F::Output> {
    tokio::select! {
        biased;
        actor = cancelled(cancel) => Raced::Cancelled(actor),
        out = fut => Raced::Done(out),
    }
}

struct Run<'a> {
    shared: &'a Shared,
    record: DeploymentRecord,
    cancel: CancelSignal,
}

impl Shared {
    pub(crate) async fn execute(
        &self,
        record: DeploymentRecord,
        cancel: CancelSignal,
    ) -> Result<DeploymentRecord, OrchestratorError> {
        let mut run = Run {
            shared: self,
            record,
            cancel,
        };
        run.drive().await?;
        Ok(run.record)
    }
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<(), OrchestratorError> {
        self.record.started_at = Some(epoch_millis());
        self.record.previous_instance = self.shared.instances.live();
        self.shared.store.put_deployment(&self.record)?;

        let latched = self.cancel.borrow().clone();
        if let Some(by) = latched {
            self.record.failure = Some(FailureKind::OperatorAbort { state: Idle });
            self.record.outcome = Some(DeploymentOutcome::Aborted);
            self.record.finished_at = Some(epoch_millis());
            return self.note(Severity::Warning, format!("cancelled by {by} before it started"));
        }

        let artifact = match self.record.kind.clone() {
            DeploymentKind::Deploy { source } => match self.build_and_gate(&source).await? {
                Some(artifact) => artifact,
                None => return Ok(()),
            },
            DeploymentKind::Rollback { target } => {
                let target_record = self.shared.store.require_deployment(&target)?;
                let artifact = target_record
                    .artifact
                    .ok_or_else(|| OrchestratorError::NotRollbackTarget(target.clone()))?;
                self.record.artifact = Some(artifact.clone());
                let actor = self.record.actor.clone();
                self.transition(
                    Starting,
                    format!("rolling back to {target} (artifact {}), skipping build and gates", artifact.id),
                    &actor,
                )?;
                artifact
            }
        };

        self.rollout(artifact).await
    }

    // ── Building / Gating ─────────────────────────────────────────

    async fn build_and_gate(&mut self, source: &str) -> Result<Option<Artifact>, OrchestratorError> {
        let actor = self.record.actor.clone();
        self.transition(Building, format!("building {source}"), &actor)?;

        let shared = self.shared;
        let artifact = match race(&mut self.cancel, shared.builder.build(source)).await {
            Raced::Cancelled(by) => return self.abort(&by).map(|_| None),
            Raced::Done(Err(e)) => {
                self.record.failure = Some(FailureKind::BuildFailure { message: e.to_string() });
                self.conclude(Idle, DeploymentOutcome::Aborted, format!("build failed: {e}"), Severity::Warning)?;
                return Ok(None);
            }
            Raced::Done(Ok(artifact)) => artifact,
        };
        self.record.artifact = Some(artifact.clone());
        self.transition(
            Gating,
            format!("artifact {} built, running {} gate(s)", artifact.id, shared.gates.gates().len()),
            ACTOR,
        )?;

        let id = self.record.id.clone();
        let gated = race(&mut self.cancel, shared.gates.run(&id, &artifact, &shared.store)).await;
        match gated {
            Raced::Cancelled(by) => self.abort(&by).map(|_| None),
            Raced::Done(Err(e)) => {
                let message = match e {
                    GateRunnerError::Crashed { gate, message } => format!("gate {gate}: {message}"),
                    GateRunnerError::Log(e) => format!("deployment log: {e}"),
                };
                self.record.failure = Some(FailureKind::GateRunnerCrash { message: message.clone() });
                self.conclude(
                    Idle,
                    DeploymentOutcome::Aborted,
                    format!("gate runner crashed: {message}"),
                    Severity::Alert,
                )?;
                Ok(None)
            }
            Raced::Done(Ok(run)) => match run.failure() {
                Some(failure) => {
                    let gate = run.failed_gate().unwrap_or_default().to_string();
                    self.record.failure = Some(failure);
                    self.conclude(
                        GateFailed,
                        DeploymentOutcome::Aborted,
                        format!("gate {gate} failed; previous instance untouched"),
                        Severity::Warning,
                    )?;
                    Ok(None)
                }
                None => {
                    self.transition(Starting, "all gates passed", ACTOR)?;
                    Ok(Some(artifact))
                }
            },
        }
    }

    /// Operator cancel before any instance was started.
    fn abort(&mut self, actor: &str) -> Result<(), OrchestratorError> {
        let state = self.record.state;
        self.record.failure = Some(FailureKind::OperatorAbort { state });
        self.record.outcome = Some(DeploymentOutcome::Aborted);
        self.record.finished_at = Some(epoch_millis());
        self.transition_as(Idle, format!("cancelled by {actor} while {state}"), actor, Severity::Warning)
    }

    // ── Starting / AwaitingHealth / CuttingOver / Draining ────────

    async fn rollout(&mut self, artifact: Artifact) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let instance = match self.shared.instances.start(&artifact).await {
            Ok(instance) => instance,
            Err(e) => {
                self.record.failure = Some(FailureKind::StartFailure { message: e.to_string() });
                return self.conclude(
                    Idle,
                    DeploymentOutcome::Aborted,
                    format!("instance failed to start: {e}"),
                    Severity::Warning,
                );
            }
        };
        self.record.new_instance = Some(instance.clone());
        self.shared.store.put_deployment(&self.record)?;

        // Starting until the instance accepts connections, then AwaitingHealth
        // until the probes agree. One deadline covers both.
        let ready = self.await_ready(&instance, started).await;
        if !matches!(ready, Wait::Reached) {
            return self.give_up(&instance, ready).await;
        }
        self.transition(
            AwaitingHealth,
            format!("instance {} ready at {}, awaiting health", instance.id, instance.address),
            ACTOR,
        )?;
        let healthy = self.await_health(&instance, started).await;
        if !matches!(healthy, Wait::Reached) {
            return self.give_up(&instance, healthy).await;
        }

        if let Some(by) = self.shared.begin_cutover(&self.cancel) {
            return self.health_timeout(&instance, HealthTimeoutCause::DeadlineExceeded, Some(by)).await;
        }
        self.transition(CuttingOver, format!("instance {} healthy, cutting over", instance.id), ACTOR)?;

        let previous = self.record.previous_instance.clone();
        if let Err(e) = self
            .shared
            .instances
            .cut_over(&instance, HealthStatus::Healthy, previous.as_ref())
            .await
        {
            self.stop_instance(&instance).await;
            self.record.failure = Some(FailureKind::CrashDuringCutover {
                degraded: false,
                message: e.to_string(),
            });
            return self.conclude(
                RolledBack,
                DeploymentOutcome::RolledBack,
                format!("cutover rejected: {e}; previous instance still live"),
                Severity::Warning,
            );
        }

        if let Err(message) = self.verify_after_cutover(&instance).await {
            return self.recover(&instance, message).await;
        }

        let old = previous.as_ref().map(|o| o.id.as_str()).unwrap_or("none");
        self.transition(Draining, format!("traffic on {}, draining {old}", instance.id), ACTOR)?;
        let id = self.record.id.clone();
        self.shared.watch_live(&instance, &id);
        self.shared.committed(&self.record);

        if let Some(old) = &previous {
            self.drain(old).await?;
        }
        self.conclude(Succeeded, DeploymentOutcome::Succeeded, "deployment succeeded", Severity::Info)
    }

    /// Wait until `instance` reports Ready, the deadline (counted from
    /// `started`) passes, the instance dies, or a cancel is latched.
    async fn await_ready(&mut self, instance: &Instance, started: Instant) -> Wait {
        let shared = self.shared;
        let recheck = shared.config.health.interval.min(STATUS_RECHECK);
        let wait = async {
            loop {
                match shared.instances.status(instance) {
                    InstanceStatus::Ready | InstanceStatus::Draining => return Wait::Reached,
                    InstanceStatus::Crashed | InstanceStatus::Stopped => return Wait::Crashed,
                    InstanceStatus::Starting => tokio::time::sleep(recheck).await,
                }
            }
        };
        self.bounded(started + shared.config.health.deadline, wait).await
    }

    /// Wait until `instance` is Healthy, the deadline (counted from
    /// `started`) passes, the instance dies, or a cancel is latched.
    async fn await_health(&mut self, instance: &Instance, started: Instant) -> Wait {
        let shared = self.shared;
        let policy = &shared.config.health;
        let mut monitor = HealthMonitor::new(shared.probe.clone(), policy, started);

        let wait = async {
            loop {
                if !shared.instances.status(instance).is_running() {
                    return Wait::Crashed;
                }
                if monitor.poll(instance).await == HealthStatus::Healthy {
                    return Wait::Reached;
                }

                // Sleep out the interval in short steps so a crash is noticed.
                let next_poll = Instant::now() + policy.interval;
                while Instant::now() < next_poll {
                    let step = next_poll.saturating_duration_since(Instant::now()).min(STATUS_RECHECK);
                    tokio::time::sleep(step).await;
                    if !shared.instances.status(instance).is_running() {
                        return Wait::Crashed;
                    }
                }
            }
        };
        self.bounded(started + policy.deadline, wait).await
    }

    async fn bounded(&mut self, deadline: Instant, wait: impl Future<Output = Wait>) -> Wait {
        match race(&mut self.cancel, tokio::time::timeout_at(deadline, wait)).await {
            Raced::Cancelled(by) => Wait::Cancelled(by),
            Raced::Done(Ok(outcome)) => outcome,
            Raced::Done(Err(_)) => Wait::DeadlineExceeded,
        }
    }

    async fn give_up(&mut self, instance: &Instance, wait: Wait) -> Result<(), OrchestratorError> {
        match wait {
            Wait::Crashed => self.health_timeout(instance, HealthTimeoutCause::Crashed, None).await,
            Wait::Cancelled(by) => {
                self.health_timeout(instance, HealthTimeoutCause::DeadlineExceeded, Some(by)).await
            }
            Wait::Reached | Wait::DeadlineExceeded => {
                self.health_timeout(instance, HealthTimeoutCause::DeadlineExceeded, None).await
            }
        }
    }

    /// The new instance never became ready or healthy (or the operator
    /// gave up on it): stop it. The previous instance was never touched.
    async fn health_timeout(
        &mut self,
        instance: &Instance,
        cause: HealthTimeoutCause,
        cancelled_by: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let state = self.record.state;
        let deadline = format_duration(self.shared.config.health.deadline);
        let goal = if state == Starting { "ready" } else { "healthy" };
        let (reason, actor) = match (&cancelled_by, cause) {
            (Some(by), _) => (format!("cancelled by {by} while {state}"), by.clone()),
            (None, HealthTimeoutCause::DeadlineExceeded) => (
                format!("instance {} not {goal} within {deadline}", instance.id),
                ACTOR.to_string(),
            ),
            (None, HealthTimeoutCause::Crashed) => (
                format!("instance {} crashed before becoming healthy", instance.id),
                ACTOR.to_string(),
            ),
        };
        self.transition_as(HealthTimeout, reason, &actor, Severity::Warning)?;
        self.stop_instance(instance).await;

        let (failure, outcome) = match cancelled_by {
            Some(_) => (FailureKind::OperatorAbort { state }, DeploymentOutcome::Aborted),
            None => (FailureKind::HealthTimeout { cause }, DeploymentOutcome::RolledBack),
        };
        self.record.failure = Some(failure);
        let kept = match &self.record.previous_instance {
            Some(old) => format!("instance {} stopped; {} still live", instance.id, old.id),
            None => format!("instance {} stopped; no previous instance", instance.id),
        };
        self.conclude(RolledBack, outcome, kept, Severity::Info)
    }

    /// Raw probes after cutover; every one must succeed.
    async fn verify_after_cutover(&self, instance: &Instance) -> Result<(), String> {
        let checks = self.shared.config.health.post_cutover_checks;
        for n in 0..checks {
            if n > 0 {
                tokio::time::sleep(self.shared.config.health.interval).await;
            }
            if !self.shared.instances.status(instance).is_running() {
                return Err(format!("instance {} crashed after cutover", instance.id));
            }
            if !self.shared.probe.check(instance).await.is_success() {
                return Err(format!(
                    "instance {} failed post-cutover check {}/{checks}",
                    instance.id,
                    n + 1
                ));
            }
        }
        if !self.shared.instances.status(instance).is_running() {
            return Err(format!("instance {} crashed after cutover", instance.id));
        }
        Ok(())
    }

    /// The new instance failed right after taking traffic.
    async fn recover(&mut self, failed: &Instance, message: String) -> Result<(), OrchestratorError> {
        warn!(deployment = %self.record.id, instance = %failed.id, %message, "instance failed after cutover");

        let previous = self.record.previous_instance.clone();
        if let Some(old) = previous {
            if self.shared.instances.status(&old).is_running() {
                match self.shared.instances.revert(&old, failed).await {
                    Ok(()) => {
                        self.stop_instance(failed).await;
                        self.record.failure = Some(FailureKind::CrashDuringCutover {
                            degraded: false,
                            message: message.clone(),
                        });
                        return self.conclude(
                            RolledBack,
                            DeploymentOutcome::RolledBack,
                            format!("{message}; traffic returned to {}", old.id),
                            Severity::Warning,
                        );
                    }
                    Err(e) => {
                        warn!(deployment = %self.record.id, error = %e, "revert to previous instance failed");
                    }
                }
            }
        }

        self.shared.set_recovering(true);
        let result = self.degraded_recovery(failed, message).await;
        self.shared.set_recovering(false);
        result
    }

    /// Redeploy the last successful artifact because the previous instance
    /// is gone.
    async fn degraded_recovery(&mut self, failed: &Instance, message: String) -> Result<(), OrchestratorError> {
        self.record.failure = Some(FailureKind::CrashDuringCutover {
            degraded: true,
            message: message.clone(),
        });

        let target = self
            .shared
            .store
            .latest_succeeded(Some(&self.record.id))?
            .and_then(|r| r.artifact.map(|a| (r.id, a)));
        let Some((target_id, artifact)) = target else {
            self.stop_instance(failed).await;
            return self.conclude(
                RolledBack,
                DeploymentOutcome::Failed,
                format!("{message}; no previous successful deployment to recover, service has no live instance"),
                Severity::Alert,
            );
        };

        self.note(
            Severity::Alert,
            format!("{message}; previous instance is gone, redeploying artifact {} from {target_id}", artifact.id),
        )?;
        self.transition_as(Starting, format!("degraded recovery from {target_id}"), ACTOR, Severity::Alert)?;

        let started = Instant::now();
        let recovery = match self.shared.instances.start(&artifact).await {
            Ok(instance) => instance,
            Err(e) => {
                self.stop_instance(failed).await;
                return self.conclude(
                    Idle,
                    DeploymentOutcome::Failed,
                    format!("recovery instance failed to start: {e}"),
                    Severity::Alert,
                );
            }
        };
        self.record.recovery_instance = Some(recovery.clone());
        self.shared.store.put_deployment(&self.record)?;

        let ready = matches!(self.await_ready(&recovery, started).await, Wait::Reached);
        if ready {
            self.transition(
                AwaitingHealth,
                format!("recovery instance {} ready, awaiting health", recovery.id),
                ACTOR,
            )?;
        }
        if !ready || !matches!(self.await_health(&recovery, started).await, Wait::Reached) {
            let goal = if ready { "healthy" } else { "ready" };
            self.transition_as(
                HealthTimeout,
                format!("recovery instance {} never became {goal}", recovery.id),
                ACTOR,
                Severity::Alert,
            )?;
            self.stop_instance(&recovery).await;
            self.stop_instance(failed).await;
            return self.conclude(
                RolledBack,
                DeploymentOutcome::Failed,
                "degraded recovery failed, service has no live instance",
                Severity::Alert,
            );
        }

        self.transition(CuttingOver, format!("recovery instance {} healthy", recovery.id), ACTOR)?;
        if let Err(e) = self
            .shared
            .instances
            .cut_over(&recovery, HealthStatus::Healthy, Some(failed))
            .await
        {
            self.stop_instance(&recovery).await;
            self.stop_instance(failed).await;
            return self.conclude(
                RolledBack,
                DeploymentOutcome::Failed,
                format!("cutover to recovery instance rejected: {e}"),
                Severity::Alert,
            );
        }

        self.transition(Draining, format!("traffic on recovery instance {}", recovery.id), ACTOR)?;
        self.shared.watch_live(&recovery, &target_id);
        self.shared.committed(&self.record);
        self.stop_instance(failed).await;
        self.conclude(
            RolledBack,
            DeploymentOutcome::RolledBack,
            format!("recovered on artifact {} from {target_id}", artifact.id),
            Severity::Alert,
        )
    }

    /// Stop the old instance after cutover. A drain timeout is a warning.
    async fn drain(&mut self, old: &Instance) -> Result<(), OrchestratorError> {
        let drain_timeout = self.shared.config.drain_timeout;
        let warning = match self.shared.instances.stop(old, drain_timeout).await {
            Ok(StopOutcome::Graceful) => return Ok(()),
            Ok(StopOutcome::Forced) => format!(
                "drain timeout: instance {} still running after {}, killed",
                old.id,
                format_duration(drain_timeout)
            ),
            Err(e) => format!("failed to stop instance {}: {e}", old.id),
        };
        warn!(deployment = %self.record.id, %warning, "drain did not complete cleanly");
        self.record.warnings.push(warning.clone());
        self.note(Severity::Warning, warning)
    }

    async fn stop_instance(&self, instance: &Instance) {
        match self.shared.instances.stop(instance, self.shared.config.drain_timeout).await {
            Ok(outcome) => {
                info!(deployment = %self.record.id, instance = %instance.id, ?outcome, "instance stopped")
            }
            Err(e) => {
                warn!(deployment = %self.record.id, instance = %instance.id, error = %e, "failed to stop instance")
            }
        }
    }

    // ── Bookkeeping ───────────────────────────────────────────────

    fn transition(&mut self, to: DeploymentState, reason: impl Into<String>, actor: &str) -> Result<(), OrchestratorError> {
        self.transition_as(to, reason, actor, Severity::Info)
    }

    fn transition_as(
        &mut self,
        to: DeploymentState,
        reason: impl Into<String>,
        actor: &str,
        severity: Severity,
    ) -> Result<(), OrchestratorError> {
        let from = self.record.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::IllegalTransition { from, to });
        }
        let reason = reason.into();

        self.record.state = to;
        self.shared.store.put_deployment(&self.record)?;
        self.shared.store.append_event(
            NewEvent::transition(&self.record.id, from, to, reason.clone(), actor).with_severity(severity),
        )?;
        self.shared.committed(&self.record);

        match severity {
            Severity::Info => info!(deployment = %self.record.id, %from, %to, %reason, "transition"),
            Severity::Warning => warn!(deployment = %self.record.id, %from, %to, %reason, "transition"),
            Severity::Alert => error!(deployment = %self.record.id, %from, %to, %reason, "transition"),
        }
        Ok(())
    }

    /// Move to a terminal state with an outcome.
    fn conclude(
        &mut self,
        to: DeploymentState,
        outcome: DeploymentOutcome,
        reason: impl Into<String>,
        severity: Severity,
    ) -> Result<(), OrchestratorError> {
        self.record.outcome = Some(outcome);
        self.record.finished_at = Some(epoch_millis());
        self.transition_as(to, reason, ACTOR, severity)
    }

    fn note(&self, severity: Severity, reason: String) -> Result<(), OrchestratorError> {
        if severity == Severity::Alert {
            error!(deployment = %self.record.id, state = %self.record.state, %reason, "alert");
        }
        self.shared.store.put_deployment(&self.record)?;
        self.shared.store.append_event(
            NewEvent::note(&self.record.id, self.record.state, EventKind::Note, reason, ACTOR)
                .with_severity(severity),
        )?;
        Ok(())
    }
}
