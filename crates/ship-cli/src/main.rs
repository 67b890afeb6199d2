use std::time::Duration;

use clap::{Parser, Subcommand};

mod client;
mod commands;

use client::ApiClient;

/// Exit code for requests shipd refused or never answered, kept apart from
/// the deployment outcome codes 0 through 5.
const EXIT_REQUEST_FAILED: i32 = 10;

#[derive(Parser)]
#[command(
    name = "ship",
    about = "shipway: zero-downtime deployments for a single service",
    version,
    propagate_version = true,
)]
struct Cli {
    /// shipd API address.
    #[arg(long, global = true, env = "SHIP_SERVER", default_value = "http://127.0.0.1:8470")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, gate and roll out a new artifact.
    ///
    /// The source is `image:<reference>` for a prebuilt image or a local
    /// path / `git+` URL handed to the configured build command. Waits for
    /// the deployment to finish and exits with its outcome code:
    /// 0 succeeded, 1 gate failed, 2 health timeout, 3 aborted,
    /// 4 build or start failure, 5 crash during cutover.
    Deploy {
        source: String,
        /// Recorded as the requester (default: $USER).
        #[arg(long, env = "SHIP_ACTOR")]
        actor: Option<String>,
        /// Return once the deployment is queued.
        #[arg(long)]
        no_wait: bool,
    },
    /// Redeploy the artifact of an earlier successful deployment.
    Rollback {
        /// Deployment id, e.g. dep-000007.
        deployment_id: String,
        #[arg(long, env = "SHIP_ACTOR")]
        actor: Option<String>,
        #[arg(long)]
        no_wait: bool,
    },
    /// Show the live instance and the in-flight deployment.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Cancel the in-flight deployment.
    Cancel {
        #[arg(long, env = "SHIP_ACTOR")]
        actor: Option<String>,
    },
    /// List recent deployments.
    History {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Print the event log of one deployment.
    Events { deployment_id: String },
    /// Generate a ship.toml scaffold.
    Init {
        #[arg(short, long, default_value = ".")]
        path: String,
        /// Service name.
        #[arg(long, default_value = "app")]
        name: String,
    },
}

const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn actor(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string())
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let client = ApiClient::new(&cli.server);
    match cli.command {
        Commands::Deploy { source, actor: who, no_wait } => {
            commands::deploy::deploy(&client, &source, &actor(who), !no_wait, POLL_INTERVAL).await
        }
        Commands::Rollback {
            deployment_id,
            actor: who,
            no_wait,
        } => commands::deploy::rollback(&client, &deployment_id, &actor(who), !no_wait, POLL_INTERVAL).await,
        Commands::Status { json } => commands::inspect::status(&client, json).await,
        Commands::Cancel { actor: who } => commands::inspect::cancel(&client, &actor(who)).await,
        Commands::History { limit } => commands::inspect::history(&client, limit).await,
        Commands::Events { deployment_id } => commands::inspect::events(&client, &deployment_id).await,
        Commands::Init { path, name } => commands::init::init(&path, &name),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("ship=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_REQUEST_FAILED
        }
    };
    std::process::exit(code);
}
