//! The fail-fast gate sequencer.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use shipway_core::GateSpec;
use shipway_state::{Artifact, DeploymentLog, DeploymentState, EventKind, NewEvent, Severity, StateError};

use crate::executor::GateExecutor;
use crate::gate::{GateOutcome, GateReport, GateRun};

const ACTOR: &str = "gate-runner";

#[derive(Debug, thiserror::Error)]
pub enum GateRunnerError {
    /// The runner lost a gate mid-execution (the gate task panicked or
    /// was cancelled). Distinct from a gate failing.
    #[error("gate runner crashed during gate {gate}: {message}")]
    Crashed { gate: String, message: String },

    #[error("deployment log: {0}")]
    Log(#[from] StateError),
}

/// Runs the configured gates, in order, against one artifact.
pub struct GateRunner {
    gates: Vec<GateSpec>,
    executor: Arc<dyn GateExecutor>,
}

impl GateRunner {
    pub fn new(gates: Vec<GateSpec>, executor: Arc<dyn GateExecutor>) -> Self {
        Self { gates, executor }
    }

    pub fn gates(&self) -> &[GateSpec] {
        &self.gates
    }

    /// Run every gate until one fails.
    ///
    /// Each gate's start and end is appended to `log` under
    /// `deployment_id` as a `Gate` event. Running the same gates against
    /// the same artifact twice yields the same verdict as long as the gate
    /// commands are deterministic.
    pub async fn run(
        &self,
        deployment_id: &str,
        artifact: &Artifact,
        log: &dyn DeploymentLog,
    ) -> Result<GateRun, GateRunnerError> {
        let mut reports = Vec::with_capacity(self.gates.len());

        for (idx, gate) in self.gates.iter().enumerate() {
            log.append(gate_event(deployment_id, format!("gate {} started", gate.name)))?;

            let started = Instant::now();
            let outcome = self.run_one(gate, artifact).await?;
            let duration_ms = started.elapsed().as_millis() as u64;

            match &outcome {
                GateOutcome::Passed => {
                    info!(deployment = %deployment_id, gate = %gate.name, duration_ms, "gate passed");
                    log.append(gate_event(
                        deployment_id,
                        format!("gate {} passed in {duration_ms}ms", gate.name),
                    ))?;
                }
                failed => {
                    let detail = describe_failure(failed);
                    warn!(deployment = %deployment_id, gate = %gate.name, %detail, "gate failed");
                    log.append(
                        gate_event(deployment_id, format!("gate {} {detail}", gate.name))
                            .with_severity(Severity::Warning),
                    )?;
                }
            }

            let passed = outcome.passed();
            reports.push(GateReport {
                name: gate.name.clone(),
                outcome,
                duration_ms,
            });

            if !passed {
                let skipped: Vec<String> =
                    self.gates[idx + 1..].iter().map(|g| g.name.clone()).collect();
                if !skipped.is_empty() {
                    info!(deployment = %deployment_id, ?skipped, "remaining gates skipped");
                }
                return Ok(GateRun::finish(&artifact.id, reports, skipped));
            }
        }

        Ok(GateRun::finish(&artifact.id, reports, Vec::new()))
    }

    async fn run_one(&self, gate: &GateSpec, artifact: &Artifact) -> Result<GateOutcome, GateRunnerError> {
        let executor = self.executor.clone();
        let spec = gate.clone();
        let target = artifact.clone();
        let mut handle = GateTask(tokio::spawn(async move { executor.execute(&spec, &target).await }));

        match tokio::time::timeout(gate.timeout, &mut handle.0).await {
            Ok(Ok(Ok(execution))) if execution.success => Ok(GateOutcome::Passed),
            Ok(Ok(Ok(execution))) => Ok(GateOutcome::Failed {
                exit_code: execution.exit_code,
                output: execution.output,
            }),
            Ok(Ok(Err(error))) => Ok(GateOutcome::CouldNotStart { error }),
            Ok(Err(join_err)) => Err(GateRunnerError::Crashed {
                gate: gate.name.clone(),
                message: join_err.to_string(),
            }),
            Err(_) => {
                drop(handle);
                Ok(GateOutcome::TimedOut {
                    after_ms: gate.timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Aborts the gate task when dropped, on timeout or when the whole run is
/// cancelled. Aborting drops the executor future, which kills the child.
struct GateTask<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for GateTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn gate_event(deployment_id: &str, reason: String) -> NewEvent {
    NewEvent::note(deployment_id, DeploymentState::Gating, EventKind::Gate, reason, ACTOR)
}

fn describe_failure(outcome: &GateOutcome) -> String {
    match outcome {
        GateOutcome::Passed => "passed".to_string(),
        GateOutcome::Failed {
            exit_code: Some(code), ..
        } => format!("failed with exit code {code}"),
        GateOutcome::Failed { exit_code: None, .. } => "failed (terminated by signal)".to_string(),
        GateOutcome::TimedOut { after_ms } => format!("timed out after {after_ms}ms"),
        GateOutcome::CouldNotStart { error } => format!("could not start: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use shipway_state::{GateFailureReason, StateStore};

    use crate::executor::{CommandExecutor, GateExecution};
    use crate::gate::GateVerdict;

    #[derive(Clone, Copy)]
    enum Script {
        Pass,
        Fail(i32),
        Hang,
        NoStart,
        Panic,
    }

    /// Executor whose behaviour per gate name is fixed up front.
    struct ScriptedExecutor {
        script: HashMap<String, Script>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(script: &[(&str, Script)]) -> Arc<Self> {
            Arc::new(Self {
                script: script.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GateExecutor for ScriptedExecutor {
        async fn execute(&self, gate: &GateSpec, _artifact: &Artifact) -> Result<GateExecution, String> {
            self.calls.lock().unwrap().push(gate.name.clone());
            match self.script.get(&gate.name).copied().unwrap_or(Script::Pass) {
                Script::Pass => Ok(GateExecution {
                    success: true,
                    exit_code: Some(0),
                    output: String::new(),
                }),
                Script::Fail(code) => Ok(GateExecution {
                    success: false,
                    exit_code: Some(code),
                    output: format!("{} complained", gate.name),
                }),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("gate should have been timed out")
                }
                Script::NoStart => Err("executable not found".to_string()),
                Script::Panic => panic!("executor blew up"),
            }
        }
    }

    fn gates(names: &[&str]) -> Vec<GateSpec> {
        names
            .iter()
            .map(|n| GateSpec::new(n, &["true"], Duration::from_secs(5)))
            .collect()
    }

    fn artifact() -> Artifact {
        Artifact {
            id: "a1b2c3".to_string(),
            source: "./app".to_string(),
            reference: "./app/target/app".to_string(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn all_gates_pass_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = ScriptedExecutor::new(&[]);
        let runner = GateRunner::new(gates(&["test", "lint", "scan"]), executor.clone());

        let run = runner.run("dep-000001", &artifact(), &store).await.unwrap();
        assert!(run.passed());
        assert_eq!(executor.calls(), vec!["test", "lint", "scan"]);
        assert_eq!(run.reports.len(), 3);
        assert!(run.skipped.is_empty());

        let events = store.events_for("dep-000001").unwrap();
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.kind == EventKind::Gate));
        assert_eq!(events[0].reason, "gate test started");
        assert!(events[5].reason.starts_with("gate scan passed"));
    }

    #[tokio::test]
    async fn first_failure_skips_remaining_gates() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = ScriptedExecutor::new(&[("lint", Script::Fail(1))]);
        let runner = GateRunner::new(gates(&["test", "lint", "scan"]), executor.clone());

        let run = runner.run("dep-000001", &artifact(), &store).await.unwrap();
        assert_eq!(executor.calls(), vec!["test", "lint"]);
        assert_eq!(run.skipped, vec!["scan"]);
        match &run.verdict {
            GateVerdict::Fail { gate, reason, output } => {
                assert_eq!(gate, "lint");
                assert_eq!(*reason, GateFailureReason::Failed { exit_code: Some(1) });
                assert_eq!(output, "lint complained");
            }
            GateVerdict::Pass => panic!("lint should have failed"),
        }

        let events = store.events_for("dep-000001").unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.reason, "gate lint failed with exit code 1");
        assert_eq!(last.severity, Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_gate_times_out() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = ScriptedExecutor::new(&[("test", Script::Hang)]);
        let mut specs = gates(&["test", "lint"]);
        specs[0].timeout = Duration::from_secs(10);
        let runner = GateRunner::new(specs, executor.clone());

        let run = runner.run("dep-000001", &artifact(), &store).await.unwrap();
        assert_eq!(run.failed_gate(), Some("test"));
        assert_eq!(run.reports[0].outcome, GateOutcome::TimedOut { after_ms: 10_000 });
        assert_eq!(executor.calls(), vec!["test"]);
    }

    #[tokio::test]
    async fn could_not_start_is_a_gate_failure() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = ScriptedExecutor::new(&[("scan", Script::NoStart)]);
        let runner = GateRunner::new(gates(&["scan"]), executor);

        let run = runner.run("dep-000001", &artifact(), &store).await.unwrap();
        assert!(matches!(
            run.failure().map(|f| f.exit_code()),
            Some(1)
        ));
        assert!(matches!(
            run.reports[0].outcome,
            GateOutcome::CouldNotStart { .. }
        ));
    }

    #[tokio::test]
    async fn panicking_gate_is_a_runner_crash() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = ScriptedExecutor::new(&[("lint", Script::Panic)]);
        let runner = GateRunner::new(gates(&["test", "lint"]), executor);

        let err = runner.run("dep-000001", &artifact(), &store).await.unwrap_err();
        match err {
            GateRunnerError::Crashed { gate, .. } => assert_eq!(gate, "lint"),
            other => panic!("expected crash, got {other}"),
        }
    }

    #[tokio::test]
    async fn repeated_runs_agree() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = ScriptedExecutor::new(&[("lint", Script::Fail(2))]);
        let runner = GateRunner::new(gates(&["test", "lint"]), executor);

        let first = runner.run("dep-000001", &artifact(), &store).await.unwrap();
        let second = runner.run("dep-000002", &artifact(), &store).await.unwrap();
        assert_eq!(first.verdict, second.verdict);
    }

    #[tokio::test]
    async fn no_gates_is_a_pass() {
        let store = StateStore::open_in_memory().unwrap();
        let runner = GateRunner::new(Vec::new(), ScriptedExecutor::new(&[]));
        let run = runner.run("dep-000001", &artifact(), &store).await.unwrap();
        assert!(run.passed());
        assert!(store.events_for("dep-000001").unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_gates_end_to_end() {
        let store = StateStore::open_in_memory().unwrap();
        let specs = vec![
            GateSpec::new("test", &["sh", "-c", "exit 0"], Duration::from_secs(10)),
            GateSpec::new("lint", &["sh", "-c", "echo 'unused import' >&2; exit 1"], Duration::from_secs(10)),
            GateSpec::new("scan", &["sh", "-c", "exit 0"], Duration::from_secs(10)),
        ];
        let runner = GateRunner::new(specs, Arc::new(CommandExecutor::default()));

        let run = runner.run("dep-000001", &artifact(), &store).await.unwrap();
        assert_eq!(run.failed_gate(), Some("lint"));
        assert_eq!(run.skipped, vec!["scan"]);
        match &run.reports[1].outcome {
            GateOutcome::Failed { exit_code, output } => {
                assert_eq!(*exit_code, Some(1));
                assert!(output.contains("unused import"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_command_is_killed_at_timeout() {
        let store = StateStore::open_in_memory().unwrap();
        let specs = vec![GateSpec::new("scan", &["sleep", "30"], Duration::from_millis(200))];
        let runner = GateRunner::new(specs, Arc::new(CommandExecutor::default()));

        let started = Instant::now();
        let run = runner.run("dep-000001", &artifact(), &store).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(run.reports[0].outcome, GateOutcome::TimedOut { after_ms: 200 });
    }
}
