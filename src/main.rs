use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeep::config::GatekeepConfig;
use gatekeep::Decision;

/// Probe configured rate limiters from the command line.
#[derive(Debug, Parser)]
#[command(name = "gatekeep", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "gatekeep.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send admission checks for one key through a limiter
    Probe {
        /// Limiter name from the configuration
        #[arg(short, long)]
        limiter: String,
        /// Caller key to check
        #[arg(short, long)]
        key: String,
        /// Number of checks to issue
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        /// Pause between checks, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Print the configured limiters
    List,
}

#[derive(Debug, Serialize)]
struct ProbeLine<'a> {
    limiter: &'a str,
    key: &'a str,
    attempt: u32,
    #[serde(flatten)]
    decision: Decision,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatekeepConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(limiters = config.limiters.len(), "Configuration loaded");

    match cli.command {
        Command::List => {
            for limiter in &config.limiters {
                println!("{}", serde_json::to_string(limiter)?);
            }
            Ok(())
        }
        Command::Probe {
            limiter,
            key,
            count,
            delay_ms,
        } => {
            tokio::select! {
                result = probe(&config, &limiter, &key, count, delay_ms) => result,
                _ = shutdown_signal() => {
                    info!("Probe interrupted");
                    Ok(())
                }
            }
        }
    }
}

async fn probe(
    config: &GatekeepConfig,
    name: &str,
    key: &str,
    count: u32,
    delay_ms: u64,
) -> anyhow::Result<()> {
    let limiter_config = config
        .limiter(name)
        .with_context(|| format!("no limiter named '{}' in configuration", name))?;

    let backend = config.backend.connect().await?;
    let limiter = limiter_config.build(&backend.store)?;
    info!(
        limiter = name,
        backend = backend.store.backend_name(),
        "Probing rate limiter"
    );

    for attempt in 1..=count {
        let decision = limiter.check(key).await?;
        let line = ProbeLine {
            limiter: name,
            key,
            attempt,
            decision,
        };
        println!("{}", serde_json::to_string(&line)?);

        if delay_ms > 0 && attempt < count {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
    }

    info!(remaining = limiter.remaining(key).await?, "Probe finished");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
