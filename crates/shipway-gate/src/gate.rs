//! Gate run results.

use serde::{Deserialize, Serialize};

use shipway_state::{ArtifactId, FailureKind, GateFailureReason};

/// How one gate ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed { exit_code: Option<i32>, output: String },
    TimedOut { after_ms: u64 },
    CouldNotStart { error: String },
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, GateOutcome::Passed)
    }

    /// The failure reason, or `None` if the gate passed.
    pub fn failure_reason(&self) -> Option<GateFailureReason> {
        match self {
            GateOutcome::Passed => None,
            GateOutcome::Failed { exit_code, .. } => Some(GateFailureReason::Failed {
                exit_code: *exit_code,
            }),
            GateOutcome::TimedOut { after_ms } => Some(GateFailureReason::TimedOut {
                after_ms: *after_ms,
            }),
            GateOutcome::CouldNotStart { error } => Some(GateFailureReason::CouldNotStart {
                error: error.clone(),
            }),
        }
    }

    fn output(&self) -> String {
        match self {
            GateOutcome::Failed { output, .. } => output.clone(),
            GateOutcome::CouldNotStart { error } => error.clone(),
            _ => String::new(),
        }
    }
}

/// One executed gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub name: String,
    pub outcome: GateOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateVerdict {
    /// Every gate passed.
    Pass,
    /// The first failing gate, why, and what it printed.
    Fail {
        gate: String,
        reason: GateFailureReason,
        output: String,
    },
}

/// One execution of the full gate sequence against one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRun {
    pub artifact_id: ArtifactId,
    /// Gates that ran, in order.
    pub reports: Vec<GateReport>,
    /// Gates never started because an earlier one failed.
    pub skipped: Vec<String>,
    pub verdict: GateVerdict,
}

impl GateRun {
    pub(crate) fn finish(artifact_id: &str, reports: Vec<GateReport>, skipped: Vec<String>) -> Self {
        let verdict = match reports.iter().find(|r| !r.outcome.passed()) {
            Some(report) => GateVerdict::Fail {
                gate: report.name.clone(),
                // `find` only yields reports that did not pass.
                reason: report
                    .outcome
                    .failure_reason()
                    .unwrap_or(GateFailureReason::Failed { exit_code: None }),
                output: report.outcome.output(),
            },
            None => GateVerdict::Pass,
        };
        Self {
            artifact_id: artifact_id.to_string(),
            reports,
            skipped,
            verdict,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == GateVerdict::Pass
    }

    /// Name of the gate that failed, if any.
    pub fn failed_gate(&self) -> Option<&str> {
        match &self.verdict {
            GateVerdict::Pass => None,
            GateVerdict::Fail { gate, .. } => Some(gate),
        }
    }

    /// The deployment failure this run represents, if it failed.
    pub fn failure(&self) -> Option<FailureKind> {
        match &self.verdict {
            GateVerdict::Pass => None,
            GateVerdict::Fail { gate, reason, output } => Some(FailureKind::GateFailure {
                gate: gate.clone(),
                reason: reason.clone(),
                output: output.clone(),
            }),
        }
    }
}
