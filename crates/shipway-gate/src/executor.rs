//! Gate execution.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use shipway_core::GateSpec;
use shipway_state::Artifact;

/// Output retained from a gate, from the end of its combined output.
const OUTPUT_TAIL_BYTES: usize = 4096;

/// What a gate did once it was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateExecution {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Executes a single gate against an artifact.
///
/// `Err` means the gate could not be started at all; a gate that ran and
/// failed is `Ok` with `success == false`. Timeouts are enforced by the
/// runner, which drops the future.
#[async_trait]
pub trait GateExecutor: Send + Sync {
    async fn execute(&self, gate: &GateSpec, artifact: &Artifact) -> Result<GateExecution, String>;
}

/// Runs the gate's command as a child process.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    workdir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(workdir: Option<PathBuf>) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl GateExecutor for CommandExecutor {
    async fn execute(&self, gate: &GateSpec, artifact: &Artifact) -> Result<GateExecution, String> {
        let (exe, args) = gate
            .command
            .split_first()
            .ok_or_else(|| format!("gate {} has an empty command", gate.name))?;

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .env("SHIPWAY_ARTIFACT", &artifact.reference)
            .env("SHIPWAY_ARTIFACT_ID", &artifact.id)
            .env("SHIPWAY_SOURCE", &artifact.source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout kills the gate.
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| format!("{exe}: {e}"))?;
        debug!(gate = %gate.name, %exe, "gate process spawned");

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                return Ok(GateExecution {
                    success: false,
                    exit_code: None,
                    output: format!("failed to collect gate output: {e}"),
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(GateExecution {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: tail(&combined, OUTPUT_TAIL_BYTES).to_string(),
        })
    }
}

/// The last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
