//! BPM Daemon - approval-flow background service
//!
//! The daemon:
//! - Loads layered configuration (defaults, file, `BPM_` environment)
//! - Seeds the directory and publishes definitions from a JSON fixture
//! - Runs the timeout scheduler and job runner
//! - Logs lifecycle events until Ctrl+C or SIGTERM

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod runtime;

use config::{DaemonConfig, StorageConfig};
use error::DaemonResult;
use runtime::{Runtime, SeedFixture};

/// BPM Daemon CLI
#[derive(Parser)]
#[command(name = "bpmd")]
#[command(about = "BPM Daemon - Approval-flow engine and timeout runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "BPM_CONFIG")]
    config: Option<String>,

    /// Seed fixture (JSON) with users, departments and definitions
    #[arg(short, long, env = "BPM_SEED")]
    seed: Option<String>,

    /// Log level
    #[arg(long, env = "BPM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "BPM_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    // Override with CLI args
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let storage = match &config.storage {
        StorageConfig::Memory => "memory",
        StorageConfig::Postgres { .. } => "postgres",
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        storage,
        admin_role = %config.engine.admin_role,
        scan_interval_secs = config.timeout.scan_interval_secs,
        "Starting BPM daemon"
    );

    let runtime = Runtime::new(config).await?;

    if let Some(path) = cli.seed.as_deref() {
        let fixture = SeedFixture::from_file(path)?;
        let summary = runtime.seed(fixture).await?;
        tracing::info!(
            path,
            users = summary.users,
            departments = summary.departments,
            definitions = summary.definitions,
            "Seed fixture loaded"
        );
    } else {
        tracing::warn!("No seed fixture given; the directory is empty");
    }

    runtime.run().await
}
