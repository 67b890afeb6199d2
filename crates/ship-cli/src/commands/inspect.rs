//! Read-only commands and their text rendering.

use std::fmt::Write as _;

use shipway_api::DeploymentView;
use shipway_rollout::ServiceStatus;
use shipway_state::{DeploymentEvent, DeploymentKind, EventKind, Severity};

use crate::client::ApiClient;

pub async fn status(client: &ApiClient, json: bool) -> anyhow::Result<i32> {
    let status = client.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", format_status(&status));
    }
    Ok(0)
}

pub async fn cancel(client: &ApiClient, actor: &str) -> anyhow::Result<i32> {
    let id = client.cancel(actor).await?;
    println!("cancel requested for {id}");
    Ok(0)
}

pub async fn history(client: &ApiClient, limit: usize) -> anyhow::Result<i32> {
    let deployments = client.deployments().await?;
    let skip = deployments.len().saturating_sub(limit);
    for view in &deployments[skip..] {
        println!("{}", format_history_row(view));
    }
    Ok(0)
}

pub async fn events(client: &ApiClient, id: &str) -> anyhow::Result<i32> {
    for event in client.events_for(id).await? {
        println!("{}", format_event(&event));
    }
    Ok(0)
}

pub fn describe_exit(code: i32) -> &'static str {
    match code {
        0 => "succeeded",
        1 => "gate failed",
        2 => "health timeout",
        3 => "aborted by operator",
        4 => "build or start failure",
        5 => "crash during cutover",
        _ => "failed",
    }
}

pub fn format_event(event: &DeploymentEvent) -> String {
    let level = match event.severity {
        Severity::Info => "",
        Severity::Warning => "WARN ",
        Severity::Alert => "ALERT ",
    };
    match event.kind {
        EventKind::Transition => format!(
            "#{} {level}{} -> {}: {} ({})",
            event.seq, event.from_state, event.to_state, event.reason, event.actor
        ),
        EventKind::Gate | EventKind::Note => format!(
            "#{} {level}[{}] {} ({})",
            event.seq, event.to_state, event.reason, event.actor
        ),
    }
}

pub fn outcome_line(view: &DeploymentView) -> String {
    let record = &view.record;
    let code = view.exit_code.unwrap_or_default();
    let mut line = format!("{} {} (exit {code}: {})", record.id, record.state, describe_exit(code));
    for warning in &record.warnings {
        let _ = write!(line, "\n  warning: {warning}");
    }
    line
}

pub fn format_history_row(view: &DeploymentView) -> String {
    let record = &view.record;
    let what = match &record.kind {
        DeploymentKind::Deploy { source } => format!("deploy {source}"),
        DeploymentKind::Rollback { target } => format!("rollback to {target}"),
    };
    let result = match view.exit_code {
        Some(code) => format!("exit {code}"),
        None => "in flight".to_string(),
    };
    let artifact = record.artifact.as_ref().map(|a| a.id.as_str()).unwrap_or("-");
    format!(
        "{:<12} {:<16} {:<10} {:<18} {what} by {}",
        record.id,
        record.state.as_str(),
        result,
        artifact,
        record.actor
    )
}

pub fn format_status(status: &ServiceStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "service   {}", status.service);
    match &status.in_flight {
        Some(id) => {
            let _ = writeln!(out, "state     {} ({id})", status.state);
        }
        None => {
            let _ = writeln!(out, "state     idle");
        }
    }
    match &status.live {
        Some(live) => {
            let _ = writeln!(
                out,
                "live      {} at {} artifact {} health {:?}{}",
                live.instance.id,
                live.instance.address,
                live.instance.artifact_id,
                live.health,
                live.deployment_id
                    .as_ref()
                    .map(|d| format!(" from {d}"))
                    .unwrap_or_default()
            );
        }
        None => {
            let _ = writeln!(out, "live      none");
        }
    }
    if !status.queued.is_empty() {
        let _ = writeln!(out, "queued    {}", status.queued.join(", "));
    }
    if let Some(last) = &status.last_completed {
        let _ = writeln!(
            out,
            "last      {} {} (exit {}: {})",
            last.deployment_id,
            last.state,
            last.exit_code,
            describe_exit(last.exit_code)
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipway_state::{DeploymentOutcome, DeploymentRecord, DeploymentState, FailureKind, HealthStatus, Instance};
    use shipway_rollout::{CompletedView, LiveView};

    fn event(kind: EventKind, severity: Severity) -> DeploymentEvent {
        DeploymentEvent {
            seq: 7,
            timestamp: 0,
            deployment_id: "dep-000002".to_string(),
            from_state: DeploymentState::Gating,
            to_state: DeploymentState::Starting,
            reason: "all gates passed".to_string(),
            actor: "orchestrator".to_string(),
            kind,
            severity,
        }
    }

    #[test]
    fn transitions_show_both_states() {
        let line = format_event(&event(EventKind::Transition, Severity::Info));
        assert_eq!(line, "#7 gating -> starting: all gates passed (orchestrator)");
    }

    #[test]
    fn notes_show_severity() {
        let line = format_event(&event(EventKind::Note, Severity::Alert));
        assert_eq!(line, "#7 ALERT [starting] all gates passed (orchestrator)");
    }

    #[test]
    fn outcome_lists_warnings() {
        let mut record = DeploymentRecord::queued(
            "dep-000004".to_string(),
            "web",
            DeploymentKind::Deploy {
                source: "image:web:v4".to_string(),
            },
            "alice",
        );
        record.state = DeploymentState::Succeeded;
        record.outcome = Some(DeploymentOutcome::Succeeded);
        record.warnings.push("drain timeout: instance inst-1 killed".to_string());
        let view = DeploymentView::from(record);

        let line = outcome_line(&view);
        assert!(line.starts_with("dep-000004 succeeded (exit 0: succeeded)"));
        assert!(line.contains("warning: drain timeout"));
    }

    #[test]
    fn history_row_for_failed_gate() {
        let mut record = DeploymentRecord::queued(
            "dep-000005".to_string(),
            "web",
            DeploymentKind::Rollback {
                target: "dep-000001".to_string(),
            },
            "bob",
        );
        record.state = DeploymentState::RolledBack;
        record.outcome = Some(DeploymentOutcome::RolledBack);
        record.failure = Some(FailureKind::HealthTimeout {
            cause: shipway_state::HealthTimeoutCause::DeadlineExceeded,
        });
        let row = format_history_row(&DeploymentView::from(record));
        assert!(row.contains("rolled_back"));
        assert!(row.contains("exit 2"));
        assert!(row.ends_with("rollback to dep-000001 by bob"));
    }

    #[test]
    fn status_summary() {
        let status = ServiceStatus {
            service: "web".to_string(),
            state: DeploymentState::AwaitingHealth,
            in_flight: Some("dep-000003".to_string()),
            live: Some(LiveView {
                instance: Instance {
                    id: "inst-1a2b3c4d-1".to_string(),
                    artifact_id: "1a2b3c4d5e6f7a8b".to_string(),
                    address: "127.0.0.1:41000".to_string(),
                    started_at: 0,
                },
                deployment_id: Some("dep-000001".to_string()),
                health: HealthStatus::Healthy,
            }),
            queued: vec!["dep-000004".to_string()],
            last_completed: Some(CompletedView {
                deployment_id: "dep-000002".to_string(),
                state: DeploymentState::GateFailed,
                outcome: DeploymentOutcome::Aborted,
                exit_code: 1,
            }),
        };
        let text = format_status(&status);
        assert!(text.contains("state     awaiting_health (dep-000003)"));
        assert!(text.contains("from dep-000001"));
        assert!(text.contains("queued    dep-000004"));
        assert!(text.contains("last      dep-000002 gate_failed (exit 1: gate failed)"));
    }

    #[test]
    fn exit_codes_have_descriptions() {
        assert_eq!(describe_exit(1), "gate failed");
        assert_eq!(describe_exit(3), "aborted by operator");
        assert_eq!(describe_exit(42), "failed");
    }
}
