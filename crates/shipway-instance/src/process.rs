//! Instances as local child processes.
//!
//! Each instance is `run.command` started with a fresh loopback port.
//! `{port}` and `{artifact}` in the command arguments are substituted; the
//! same values are also exported as `PORT` and `SHIPWAY_ARTIFACT`. An
//! instance is `Ready` once its port accepts TCP connections. A process
//! that exits without being stopped is `Crashed`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use shipway_core::RunPlan;
use shipway_state::{Artifact, HealthStatus, Instance, InstanceId, InstanceStatus, epoch_millis};

use crate::error::{InstanceError, InstanceResult};
use crate::manager::{InstanceManager, StopOutcome};
use crate::traffic::TrafficSwitch;

/// How often a starting instance's port is tried.
const READY_POLL: Duration = Duration::from_millis(100);

/// How long to wait for the exit after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

struct Tracked {
    status: InstanceStatus,
    pid: Option<u32>,
    stop_requested: bool,
    exited: watch::Receiver<bool>,
}

type Registry = Arc<Mutex<HashMap<InstanceId, Tracked>>>;

/// Runs instances as child processes on this host.
pub struct ProcessManager {
    plan: RunPlan,
    switch: TrafficSwitch,
    instances: Registry,
    live: RwLock<Option<Instance>>,
    cutover: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl ProcessManager {
    pub fn new(plan: RunPlan, switch: TrafficSwitch) -> Self {
        Self {
            plan,
            switch,
            instances: Arc::new(Mutex::new(HashMap::new())),
            live: RwLock::new(None),
            cutover: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn switch(&self) -> &TrafficSwitch {
        &self.switch
    }

    /// Stop every instance that is still running.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let running: Vec<Instance> = {
            let live = self.live.read().expect("live lock").clone();
            live.into_iter().collect()
        };
        for instance in running {
            if let Err(e) = self.stop(&instance, drain_timeout).await {
                warn!(instance = %instance.id, error = %e, "failed to stop instance on shutdown");
            }
        }

        let stragglers: Vec<(InstanceId, u32)> = {
            let mut instances = self.instances.lock().expect("instances lock");
            instances
                .iter_mut()
                .filter(|(_, t)| t.status.is_running())
                .filter_map(|(id, t)| {
                    t.stop_requested = true;
                    t.pid.map(|pid| (id.clone(), pid))
                })
                .collect()
        };
        for (id, pid) in stragglers {
            debug!(instance = %id, pid, "killing instance on shutdown");
            let _ = signal(&id, pid, libc::SIGKILL);
        }
    }

    fn set_status(&self, id: &str, status: InstanceStatus) {
        if let Some(tracked) = self.instances.lock().expect("instances lock").get_mut(id) {
            tracked.status = status;
        }
    }

    fn command_for(&self, artifact: &Artifact, port: u16, id: &str) -> InstanceResult<Command> {
        let substitute = |arg: &String| {
            arg.replace("{port}", &port.to_string())
                .replace("{artifact}", &artifact.reference)
        };
        let mut args = self.plan.command.iter().map(substitute);
        let exe = args
            .next()
            .ok_or_else(|| InstanceError::Start("run command is empty".to_string()))?;

        let mut cmd = Command::new(&exe);
        cmd.args(args)
            .envs(&self.plan.env)
            .env("PORT", port.to_string())
            .env("SHIPWAY_ARTIFACT", &artifact.reference)
            .env("SHIPWAY_ARTIFACT_ID", &artifact.id)
            .env("SHIPWAY_INSTANCE", id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            // Own process group, so signals reach wrapper shells' children too.
            .process_group(0);
        Ok(cmd)
    }
}

#[async_trait]
impl InstanceManager for ProcessManager {
    async fn start(&self, artifact: &Artifact) -> InstanceResult<Instance> {
        let port = free_port().map_err(|e| InstanceError::Start(format!("no free port: {e}")))?;
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let short: String = artifact.id.chars().take(8).collect();
        let id = format!("inst-{short}-{seq}");

        let mut cmd = self.command_for(artifact, port, &id)?;
        let child = cmd
            .spawn()
            .map_err(|e| InstanceError::Start(format!("{}: {e}", self.plan.command[0])))?;
        let pid = child.id();

        let instance = Instance {
            id: id.clone(),
            artifact_id: artifact.id.clone(),
            address: format!("127.0.0.1:{port}"),
            started_at: epoch_millis(),
        };

        let (exited_tx, exited_rx) = watch::channel(false);
        self.instances.lock().expect("instances lock").insert(
            id.clone(),
            Tracked {
                status: InstanceStatus::Starting,
                pid,
                stop_requested: false,
                exited: exited_rx,
            },
        );

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        tokio::spawn(supervise(child, id.clone(), addr, self.instances.clone(), exited_tx));

        info!(instance = %id, artifact = %artifact.id, %addr, ?pid, "instance started");
        Ok(instance)
    }

    fn status(&self, instance: &Instance) -> InstanceStatus {
        self.instances
            .lock()
            .expect("instances lock")
            .get(&instance.id)
            .map(|t| t.status)
            .unwrap_or(InstanceStatus::Stopped)
    }

    async fn cut_over(
        &self,
        new: &Instance,
        new_health: HealthStatus,
        old: Option<&Instance>,
    ) -> InstanceResult<()> {
        if new_health != HealthStatus::Healthy {
            return Err(InstanceError::NotHealthy {
                instance: new.id.clone(),
                health: new_health,
            });
        }
        let _guard = self
            .cutover
            .try_lock()
            .map_err(|_| InstanceError::CutoverInProgress)?;

        if !self.status(new).is_running() {
            return Err(InstanceError::NotRunning(new.id.clone()));
        }
        let addr = backend_addr(new)?;

        self.switch.point_to(addr);
        *self.live.write().expect("live lock") = Some(new.clone());
        if let Some(old) = old {
            if self.status(old).is_running() {
                self.set_status(&old.id, InstanceStatus::Draining);
            }
        }
        info!(new = %new.id, old = ?old.map(|o| &o.id), "cut over");
        Ok(())
    }

    async fn revert(&self, to: &Instance, from: &Instance) -> InstanceResult<()> {
        let _guard = self
            .cutover
            .try_lock()
            .map_err(|_| InstanceError::CutoverInProgress)?;

        if !self.status(to).is_running() {
            return Err(InstanceError::NotRunning(to.id.clone()));
        }
        let addr = backend_addr(to)?;

        self.switch.point_to(addr);
        *self.live.write().expect("live lock") = Some(to.clone());
        self.set_status(&to.id, InstanceStatus::Ready);
        if self.status(from).is_running() {
            self.set_status(&from.id, InstanceStatus::Draining);
        }
        warn!(to = %to.id, from = %from.id, "reverted to previous instance");
        Ok(())
    }

    async fn stop(&self, instance: &Instance, drain_timeout: Duration) -> InstanceResult<StopOutcome> {
        let (pid, mut exited) = {
            let mut instances = self.instances.lock().expect("instances lock");
            let tracked = instances
                .get_mut(&instance.id)
                .ok_or_else(|| InstanceError::Unknown(instance.id.clone()))?;
            if !tracked.status.is_running() {
                return Ok(StopOutcome::Graceful);
            }
            tracked.stop_requested = true;
            tracked.status = InstanceStatus::Draining;
            (tracked.pid, tracked.exited.clone())
        };

        {
            let mut live = self.live.write().expect("live lock");
            if live.as_ref().is_some_and(|l| l.id == instance.id) {
                *live = None;
                self.switch.clear();
            }
        }

        let Some(pid) = pid else {
            // Exited before we ever saw a pid.
            return Ok(StopOutcome::Graceful);
        };

        signal(&instance.id, pid, libc::SIGTERM)?;
        debug!(instance = %instance.id, pid, ?drain_timeout, "SIGTERM sent, draining");

        if tokio::time::timeout(drain_timeout, exited.wait_for(|done| *done))
            .await
            .is_ok()
        {
            info!(instance = %instance.id, "instance stopped");
            return Ok(StopOutcome::Graceful);
        }

        warn!(instance = %instance.id, ?drain_timeout, "drain timeout exceeded, killing instance");
        signal(&instance.id, pid, libc::SIGKILL)?;
        let _ = tokio::time::timeout(KILL_GRACE, exited.wait_for(|done| *done)).await;
        self.set_status(&instance.id, InstanceStatus::Stopped);
        Ok(StopOutcome::Forced)
    }

    fn live(&self) -> Option<Instance> {
        self.live.read().expect("live lock").clone()
    }
}

/// Watch one child: mark it Ready once its port answers, and record how
/// it exited.
async fn supervise(
    mut child: Child,
    id: InstanceId,
    addr: SocketAddr,
    instances: Registry,
    exited: watch::Sender<bool>,
) {
    let mut ready = false;
    let mut tick = tokio::time::interval(READY_POLL);

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = tick.tick(), if !ready => {
                if tokio::net::TcpStream::connect(addr).await.is_ok() {
                    ready = true;
                    let mut instances = instances.lock().expect("instances lock");
                    if let Some(t) = instances.get_mut(&id) {
                        if t.status == InstanceStatus::Starting {
                            t.status = InstanceStatus::Ready;
                        }
                    }
                    debug!(instance = %id, %addr, "instance accepting connections");
                }
            }
        }
    };

    {
        let mut instances = instances.lock().expect("instances lock");
        if let Some(t) = instances.get_mut(&id) {
            if t.stop_requested {
                t.status = InstanceStatus::Stopped;
            } else {
                t.status = InstanceStatus::Crashed;
                warn!(instance = %id, exit = ?status.as_ref().ok().and_then(|s| s.code()), "instance exited unexpectedly");
            }
        }
    }
    let _ = exited.send(true);
}

fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn backend_addr(instance: &Instance) -> InstanceResult<SocketAddr> {
    instance.address.parse().map_err(|_| InstanceError::BadAddress {
        instance: instance.id.clone(),
        address: instance.address.clone(),
    })
}

/// Signal the instance's whole process group.
fn signal(id: &str, pid: u32, sig: libc::c_int) -> InstanceResult<()> {
    let pgid = pid as libc::pid_t;
    // SAFETY: kill(2) with a negative pid signals a process group; it has
    // no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // ESRCH: the group is already gone.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(InstanceError::Signal {
        instance: id.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn manager(command: &[&str]) -> ProcessManager {
        let plan = RunPlan {
            command: command.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
        };
        ProcessManager::new(plan, TrafficSwitch::new())
    }

    fn artifact() -> Artifact {
        Artifact {
            id: "deadbeefcafef00d".to_string(),
            source: "./app".to_string(),
            reference: "./app/bin/server".to_string(),
            created_at: 0,
        }
    }

    async fn wait_status(m: &ProcessManager, i: &Instance, want: InstanceStatus) {
        for _ in 0..100 {
            if m.status(i) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("instance never reached {want:?}, is {:?}", m.status(i));
    }

    #[tokio::test]
    async fn start_returns_starting_instance() {
        let m = manager(&["sleep", "30"]);
        let inst = m.start(&artifact()).await.unwrap();
        assert!(inst.id.starts_with("inst-deadbeef-"));
        assert!(inst.address.starts_with("127.0.0.1:"));
        assert_eq!(m.status(&inst), InstanceStatus::Starting);
        assert_eq!(m.stop(&inst, Duration::from_secs(5)).await.unwrap(), StopOutcome::Graceful);
        assert_eq!(m.status(&inst), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn unasked_exit_is_a_crash() {
        let m = manager(&["sh", "-c", "exit 3"]);
        let inst = m.start(&artifact()).await.unwrap();
        wait_status(&m, &inst, InstanceStatus::Crashed).await;
        // Stopping a crashed instance is a no-op.
        assert_eq!(m.stop(&inst, Duration::from_secs(1)).await.unwrap(), StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let m = manager(&["/nonexistent/shipway-app"]);
        let err = m.start(&artifact()).await.unwrap_err();
        assert!(matches!(err, InstanceError::Start(_)));
    }

    #[tokio::test]
    async fn placeholders_are_substituted() {
        let m = manager(&["sh", "-c", "test \"$0\" = ./app/bin/server && sleep 30", "{artifact}"]);
        let inst = m.start(&artifact()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(m.status(&inst), InstanceStatus::Starting);
        m.stop(&inst, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn term_ignoring_instance_is_forced() {
        let m = manager(&["sh", "-c", "trap '' TERM; sleep 30"]);
        let inst = m.start(&artifact()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = m.stop(&inst, Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(m.status(&inst), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn ready_once_port_accepts() {
        // The instance "serves" by holding a listener the test opens on its port.
        let m = manager(&["sleep", "30"]);
        let inst = m.start(&artifact()).await.unwrap();
        let listener = tokio::net::TcpListener::bind(&inst.address).await.unwrap();
        wait_status(&m, &inst, InstanceStatus::Ready).await;
        drop(listener);
        m.stop(&inst, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn cut_over_requires_healthy() {
        let m = manager(&["sleep", "30"]);
        let inst = m.start(&artifact()).await.unwrap();

        let err = m.cut_over(&inst, HealthStatus::Unknown, None).await.unwrap_err();
        assert!(matches!(err, InstanceError::NotHealthy { .. }));
        assert!(m.live().is_none());
        assert_eq!(m.switch().current(), None);

        m.cut_over(&inst, HealthStatus::Healthy, None).await.unwrap();
        assert_eq!(m.live().unwrap().id, inst.id);
        assert_eq!(m.switch().current().unwrap().to_string(), inst.address);

        m.stop(&inst, Duration::from_secs(5)).await.unwrap();
        assert!(m.live().is_none());
        assert_eq!(m.switch().current(), None);
    }

    #[tokio::test]
    async fn cut_over_drains_old_and_revert_restores_it() {
        let m = manager(&["sleep", "30"]);
        let old = m.start(&artifact()).await.unwrap();
        m.cut_over(&old, HealthStatus::Healthy, None).await.unwrap();

        let new = m.start(&artifact()).await.unwrap();
        m.cut_over(&new, HealthStatus::Healthy, Some(&old)).await.unwrap();
        assert_eq!(m.status(&old), InstanceStatus::Draining);
        assert_eq!(m.live().unwrap().id, new.id);

        m.revert(&old, &new).await.unwrap();
        assert_eq!(m.live().unwrap().id, old.id);
        assert_eq!(m.status(&old), InstanceStatus::Ready);
        assert_eq!(m.status(&new), InstanceStatus::Draining);

        m.shutdown(Duration::from_secs(5)).await;
        m.stop(&new, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn revert_to_dead_instance_fails() {
        let m = manager(&["sh", "-c", "exit 0"]);
        let gone = m.start(&artifact()).await.unwrap();
        wait_status(&m, &gone, InstanceStatus::Crashed).await;

        let m2 = manager(&["sleep", "30"]);
        let other = m2.start(&artifact()).await.unwrap();
        let err = m.revert(&gone, &other).await.unwrap_err();
        assert!(matches!(err, InstanceError::NotRunning(_)));
        m2.stop(&other, Duration::from_secs(5)).await.unwrap();
    }
}
