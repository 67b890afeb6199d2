//! Health monitors.
//!
//! `HealthMonitor` is polled by its owner (the orchestrator, while a new
//! instance is in `AwaitingHealth`). `LiveWatch` spawns a background task
//! that polls the live instance on a fixed interval and publishes the
//! status through a watch channel. The watch ends by itself once the
//! instance is no longer running.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use shipway_core::HealthPolicy;
use shipway_state::{HealthStatus, Instance, InstanceId};

use crate::checker::{HealthTracker, ProbeResult};
use crate::probe::Probe;

/// Callback invoked when a watched instance's health status changes.
pub type HealthCallback = Arc<dyn Fn(InstanceId, HealthStatus) + Send + Sync>;

/// Whether an instance is still running, asked before every live poll.
pub type RunningCheck = Arc<dyn Fn(&Instance) -> bool + Send + Sync>;

/// Probe + tracker for one instance.
pub struct HealthMonitor {
    probe: Arc<dyn Probe>,
    tracker: HealthTracker,
    /// When the instance was started; the start period counts from here.
    started: Instant,
    polls: u32,
    stopped: bool,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn Probe>, policy: &HealthPolicy, started: Instant) -> Self {
        Self {
            probe,
            tracker: HealthTracker::new(policy),
            started,
            polls: 0,
            stopped: false,
        }
    }

    /// Probe once and fold the result into the tracked status.
    ///
    /// Once stopped, no probe is sent and the last status is returned.
    pub async fn poll(&mut self, instance: &Instance) -> HealthStatus {
        if self.stopped {
            return self.tracker.status();
        }
        let result = self.probe.check(instance).await;
        self.polls += 1;
        let status = self.tracker.record_at(result, self.started.elapsed());
        debug!(
            instance = %instance.id,
            ?result,
            ?status,
            poll = self.polls,
            "health poll"
        );
        status
    }

    /// Stop polling (the instance was stopped).
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn status(&self) -> HealthStatus {
        self.tracker.status()
    }
}

/// Background health polling of the live instance.
pub struct LiveWatch {
    instance_id: InstanceId,
    status_rx: watch::Receiver<HealthStatus>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LiveWatch {
    /// Start watching `instance`, seeded with the status it was verified at.
    ///
    /// Polling stops for good the first time `running` reports the
    /// instance gone; the status is then published as `Unhealthy`.
    pub fn spawn(
        probe: Arc<dyn Probe>,
        policy: &HealthPolicy,
        instance: Instance,
        initial: HealthStatus,
        running: RunningCheck,
        on_change: Option<HealthCallback>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let instance_id = instance.id.clone();

        // The instance already proved itself, so the watch starts with a
        // tracker that is past the start period.
        let past_grace = Instant::now()
            .checked_sub(policy.start_period)
            .unwrap_or_else(Instant::now);
        let mut monitor = HealthMonitor::new(probe, policy, past_grace);
        if initial == HealthStatus::Healthy {
            for _ in 0..policy.healthy_threshold {
                monitor.tracker.record(ProbeResult::Healthy);
            }
        }

        let interval = policy.interval;
        let handle = tokio::spawn(async move {
            run_watch_loop(monitor, instance, interval, status_tx, running, on_change, shutdown_rx).await;
        });

        info!(instance = %instance_id, interval = ?policy.interval, "live health watch started");
        Self {
            instance_id,
            status_rx,
            shutdown_tx,
            handle,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Latest published status.
    pub fn status(&self) -> HealthStatus {
        *self.status_rx.borrow()
    }

    /// Whether the background task has ended (stopped, or the instance
    /// went away).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the background task.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        debug!(instance = %self.instance_id, "live health watch stopped");
    }
}

async fn run_watch_loop(
    mut monitor: HealthMonitor,
    instance: Instance,
    interval: Duration,
    status_tx: watch::Sender<HealthStatus>,
    running: RunningCheck,
    on_change: Option<HealthCallback>,
    mut shutdown: watch::Receiver<bool>,
) {
    let publish = |status: HealthStatus| {
        let prev = status_tx.send_replace(status);
        if status != prev {
            if let Some(ref cb) = on_change {
                cb(instance.id.clone(), status);
            }
        }
    };
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if !running(&instance) {
                    monitor.stop();
                    info!(instance = %instance.id, "watched instance no longer running, health watch ended");
                    publish(HealthStatus::Unhealthy);
                    break;
                }
                let status = monitor.poll(&instance).await;
                publish(status);
            }
            _ = shutdown.changed() => {
                debug!(instance = %instance.id, "live health watch shutting down");
                break;
            }
        }
    }
}
