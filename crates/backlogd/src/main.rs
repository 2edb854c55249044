//! backlogd — queue-driven worker daemon.
//!
//! One process per instance of an auto-scaled group. It pulls jobs from
//! the shared queue, runs them on the local execution backend, sizes the
//! group to the backlog, and releases its own instance cleanly when the
//! group scales it in.
//!
//! # Usage
//!
//! ```text
//! backlogd run --config /etc/backlogd.toml
//! backlogd send --job workflow.json
//! backlogd local --jobs jobs.jsonl --until-empty
//! backlogd config --config /etc/backlogd.toml
//! ```

mod aws_mode;
mod local_mode;

use std::path::PathBuf;
use std::sync::Arc;

use backlog_core::{NoopNotifier, Notifier, WorkerConfig};
use backlog_worker::WebhookNotifier;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backlogd", about = "Queue-driven worker daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run against the cloud queue and scaling group.
    Run {
        /// TOML configuration file; the environment overrides it.
        #[arg(long, env = "BACKLOGD_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Enqueue one job and start the group if it is empty.
    Send {
        /// JSON file holding a job graph or a host command.
        #[arg(long)]
        job: PathBuf,

        #[arg(long, env = "BACKLOGD_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Run jobs from a JSON-lines file against an in-memory queue.
    Local {
        /// One job per line.
        #[arg(long)]
        jobs: PathBuf,

        #[arg(long, env = "BACKLOGD_CONFIG")]
        config: Option<PathBuf>,

        /// Stop once every job has been acknowledged.
        #[arg(long)]
        until_empty: bool,
    },

    /// Print the effective configuration and exit.
    Config {
        #[arg(long, env = "BACKLOGD_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => {
            let config = WorkerConfig::load(config.as_deref())?;
            aws_mode::run(config).await
        }
        Command::Send { job, config } => {
            let config = WorkerConfig::load(config.as_deref())?;
            aws_mode::send(config, &job).await
        }
        Command::Local {
            jobs,
            config,
            until_empty,
        } => {
            let config = WorkerConfig::load(config.as_deref())?;
            local_mode::run(config, &jobs, until_empty).await
        }
        Command::Config { config } => {
            let config = WorkerConfig::load(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,backlogd=debug,backlog=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Webhook notifier when one is configured.
fn notifier(config: &WorkerConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match &config.notify.webhook {
        Some(url) => {
            info!("webhook notifications enabled");
            Ok(Arc::new(WebhookNotifier::new(url.clone())?))
        }
        None => Ok(Arc::new(NoopNotifier)),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
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
    info!("shutdown signal received");
}
