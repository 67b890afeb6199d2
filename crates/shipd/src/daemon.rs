//! Serve mode: wires every subsystem for the configured service.
//!
//! The daemon:
//! 1. Loads and resolves `ship.toml`
//! 2. Opens the state store and closes deployments a previous run left open
//! 3. Starts the orchestrator over the process manager, builder and gates
//! 4. Re-deploys the last good artifact when configured to
//! 5. Serves public traffic on `service.listen` and the REST API
//! 6. On Ctrl-C or SIGTERM stops the API, the orchestrator and every instance

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use shipway_core::{ResolvedConfig, ShipConfig, format_duration};
use shipway_gate::{CommandExecutor, GateRunner};
use shipway_health::HttpProbe;
use shipway_instance::{ProcessManager, TrafficSwitch, serve_forwarder};
use shipway_rollout::{Collaborators, CommandBuilder, Orchestrator};
use shipway_state::StateStore;

const ACTOR: &str = "shipd";

pub struct ServeOptions {
    pub config: PathBuf,
    pub data_dir: PathBuf,
    pub api_addr: String,
}

/// Read and validate a ship.toml.
pub fn load_config(path: &Path) -> anyhow::Result<ResolvedConfig> {
    let config = ShipConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    config.resolve().with_context(|| format!("invalid config {}", path.display()))
}

/// Human-readable summary of resolved settings, for `shipd check`.
pub fn describe(config: &ResolvedConfig) -> String {
    let o = &config.orchestrator;
    let h = &o.health;
    let mut out = String::new();
    let _ = writeln!(out, "service      {}", o.service);
    let _ = writeln!(out, "listen       {}", config.listen);
    match &config.build {
        Some(build) => {
            let _ = writeln!(
                out,
                "build        {} (timeout {})",
                build.command.join(" "),
                format_duration(build.timeout)
            );
        }
        None => {
            let _ = writeln!(out, "build        none (image: sources only)");
        }
    }
    let _ = writeln!(out, "run          {}", config.run.command.join(" "));
    let _ = writeln!(
        out,
        "health       GET {} every {} (timeout {}), {} up / {} down, start period {}, deadline {}",
        h.endpoint,
        format_duration(h.interval),
        format_duration(h.timeout),
        h.healthy_threshold,
        h.unhealthy_threshold,
        format_duration(h.start_period),
        format_duration(h.deadline),
    );
    let _ = writeln!(
        out,
        "rollout      drain {}, queue {}, restore on start {}",
        format_duration(o.drain_timeout),
        o.queue_capacity,
        config.restore_on_start
    );
    if config.gates.is_empty() {
        let _ = writeln!(out, "gates        none");
    }
    for gate in &config.gates {
        let _ = writeln!(
            out,
            "gate         {} ({}): {}",
            gate.name,
            format_duration(gate.timeout),
            gate.command.join(" ")
        );
    }
    out
}

pub async fn run(opts: ServeOptions) -> anyhow::Result<()> {
    let config = load_config(&opts.config)?;
    info!(service = %config.orchestrator.service, config = ?opts.config, "shipd starting");

    // ── State store ────────────────────────────────────────────

    std::fs::create_dir_all(&opts.data_dir)
        .with_context(|| format!("creating data dir {}", opts.data_dir.display()))?;
    let db_path = opts.data_dir.join("shipway.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let stale = store.close_stale("orchestrator restarted")?;
    if !stale.is_empty() {
        warn!(deployments = ?stale, "closed deployments left in flight by a previous run");
    }

    // ── Subsystems ─────────────────────────────────────────────

    let workdir = opts
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);
    let switch = TrafficSwitch::new();
    let instances = Arc::new(ProcessManager::new(config.run.clone(), switch.clone()));
    let health = &config.orchestrator.health;
    let orchestrator = Orchestrator::start(
        config.orchestrator.clone(),
        Collaborators {
            builder: Arc::new(CommandBuilder::new(config.build.clone())),
            gates: GateRunner::new(config.gates.clone(), Arc::new(CommandExecutor::new(workdir))),
            instances: instances.clone(),
            probe: Arc::new(HttpProbe::new(&health.endpoint, health.timeout)),
            store,
        },
    );

    if config.restore_on_start {
        match orchestrator.restore(ACTOR) {
            Ok(Some(id)) => info!(deployment = %id, "restoring last successful deployment"),
            Ok(None) => info!("no previous successful deployment to restore"),
            Err(e) => warn!(error = %e, "restore on start failed"),
        }
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Public traffic ─────────────────────────────────────────

    let traffic = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding service listener {}", config.listen))?;
    info!(addr = %config.listen, "traffic forwarder listening");
    let forwarder = tokio::spawn(serve_forwarder(traffic, switch, shutdown_rx));

    // ── API server ─────────────────────────────────────────────

    let router = shipway_api::build_router(orchestrator.clone());
    let listener = TcpListener::bind(&opts.api_addr)
        .await
        .with_context(|| format!("binding API listener {}", opts.api_addr))?;
    info!(addr = %opts.api_addr, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // ── Teardown ───────────────────────────────────────────────

    orchestrator.shutdown().await;
    instances.shutdown(config.orchestrator.drain_timeout).await;
    match forwarder.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "traffic forwarder failed"),
        Err(e) => error!(error = %e, "traffic forwarder task panicked"),
    }

    info!("shipd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[service]
name = "web"
listen = "127.0.0.1:18080"

[run]
command = ["./bin/server", "--port", "{port}"]

[health]
endpoint = "/health/"
interval = "5s"
deadline = "60s"

[[gates]]
name = "lint"
command = ["make", "lint"]
timeout = "2m"
"#;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ship.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn load_and_describe() {
        let (_dir, path) = write_config(CONFIG);
        let config = load_config(&path).unwrap();
        assert_eq!(config.orchestrator.service, "web");
        assert_eq!(config.gates.len(), 1);

        let summary = describe(&config);
        assert!(summary.contains("service      web"));
        assert!(summary.contains("build        none"));
        assert!(summary.contains("GET /health/ every 5s"));
        assert!(summary.contains("gate         lint (2m): make lint"));
    }

    #[test]
    fn load_reports_the_offending_file() {
        let (_dir, path) = write_config("[service]\nname = \"web\"\n");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("ship.toml"));

        let missing = PathBuf::from("/nonexistent/ship.toml");
        assert!(load_config(&missing).is_err());
    }
}
