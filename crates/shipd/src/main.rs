//! shipd: the shipway daemon.
//!
//! Single binary that assembles the shipway subsystems for one service:
//! - State store (redb) and deployment log
//! - Artifact builder and gate runner
//! - Process-backed instance manager and the public traffic forwarder
//! - Deployment orchestrator
//! - REST API
//!
//! # Usage
//!
//! ```text
//! shipd serve --config ship.toml --data-dir /var/lib/shipway
//! shipd check --config ship.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "shipd", about = "shipway deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator, forwarder and API until interrupted.
    Serve {
        /// Path to ship.toml.
        #[arg(long, short, default_value = "ship.toml", env = "SHIPWAY_CONFIG")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/shipway", env = "SHIPWAY_DATA_DIR")]
        data_dir: PathBuf,

        /// Address the control API binds to.
        #[arg(long, default_value = "127.0.0.1")]
        api_host: String,

        /// Port the control API listens on.
        #[arg(long, default_value = "8470")]
        api_port: u16,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Validate a ship.toml and print the resolved settings.
    Check {
        #[arg(long, short, default_value = "ship.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,shipd=debug,shipway=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            data_dir,
            api_host,
            api_port,
            log_format,
        } => {
            init_tracing(log_format);
            daemon::run(daemon::ServeOptions {
                config,
                data_dir,
                api_addr: format!("{api_host}:{api_port}"),
            })
            .await
        }
        Command::Check { config } => {
            init_tracing(LogFormat::Text);
            let resolved = daemon::load_config(&config)?;
            print!("{}", daemon::describe(&resolved));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["shipd", "serve"]).unwrap();
        match cli.command {
            Command::Serve {
                config,
                api_port,
                log_format,
                ..
            } => {
                assert_eq!(config, PathBuf::from("ship.toml"));
                assert_eq!(api_port, 8470);
                assert_eq!(log_format, LogFormat::Text);
            }
            Command::Check { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn json_logs_and_custom_port() {
        let cli = Cli::try_parse_from([
            "shipd",
            "serve",
            "--config",
            "/etc/shipway/web.toml",
            "--api-port",
            "9000",
            "--log-format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Serve {
                config,
                api_port,
                log_format,
                ..
            } => {
                assert_eq!(config, PathBuf::from("/etc/shipway/web.toml"));
                assert_eq!(api_port, 9000);
                assert_eq!(log_format, LogFormat::Json);
            }
            Command::Check { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["shipd", "serve", "--log-format", "xml"]).is_err());
    }
}
