use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotaguard::config::{LoggingConfig, QuotaguardConfig};
use quotaguard::quota::QuotaTracker;

/// Per-user request quotas backed by a shared counter store.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check and record requests for a user
    Check {
        user_id: String,

        /// Number of requests to record
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,
    },
    /// Show a user's usage and whether quotas are enforced, without recording
    /// a request
    Usage { user_id: String },
    /// Check connectivity to the counter store
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = QuotaguardConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    // Needed before any rediss:// connection; a second install is harmless.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Quotaguard");

    let tracker = QuotaTracker::from_config(&config).context("building quota tracker")?;
    if config.fallback.sweep_interval_secs > 0 {
        let every = Duration::from_secs(config.fallback.sweep_interval_secs);
        let _sweeper = tracker.spawn_fallback_sweeper(every);
    }

    match cli.command {
        Command::Check { user_id, repeat } => {
            for _ in 0..repeat.max(1) {
                let decision = tracker.check_and_record(&user_id).await?;
                let mut out = serde_json::to_value(&decision)?;
                if let Some(message) = decision.message() {
                    out["message"] = json!(message);
                }
                println!("{}", serde_json::to_string(&out)?);
            }
            info!(stats = ?tracker.stats(), "Done");
        }
        Command::Usage { user_id } => {
            let status = tracker.status(&user_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Ping => match tracker.ping_store().await {
            None => anyhow::bail!("no counter store configured"),
            Some(Ok(())) => println!("{}", json!({ "store": "reachable" })),
            Some(Err(e)) => return Err(e).context("pinging counter store"),
        },
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
