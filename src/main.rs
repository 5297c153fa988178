use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use vera_agent::agent::Agent;
use vera_agent::config::{Config, SourceKind};
use vera_agent::export::health::HealthMetrics;
use vera_agent::remote::HttpRemoteStore;
use vera_agent::source::{ProcSource, SampleSource, StaticSource};
use vera_agent::storage::{FileStore, Persistence};

/// Host performance telemetry agent.
#[derive(Parser)]
#[command(name = "vera-agent", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("vera-agent {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting vera-agent",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

fn build_source(cfg: &Config) -> Box<dyn SampleSource> {
    match cfg.source.kind {
        SourceKind::Proc => Box::new(ProcSource::new(cfg.source.disk_path.clone())),
        SourceKind::Static => Box::new(StaticSource::new(cfg.source.sample)),
    }
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let health =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

    let remote = HttpRemoteStore::new(&cfg.remote)
        .context("creating remote store")?
        .with_metrics(health.remote_request_callback());

    let store = FileStore::open(cfg.storage.dir.clone())
        .with_context(|| format!("opening storage dir {}", cfg.storage.dir.display()))?;
    let persistence: Arc<dyn Persistence> = Arc::new(store);

    let source = build_source(&cfg);
    tracing::info!(source = source.name(), "metric source configured");

    let mut agent = Agent::new(cfg, health, Arc::new(remote), source, persistence);
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("vera-agent stopped");

    Ok(())
}
