use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use usbmirrord::core::{BackupTask, MirrorEngineType, Orchestrator, TargetLayout};
use usbmirrord::{config, context, logging};

#[derive(Parser)]
#[command(name = "usbmirrord")]
#[command(about = "Mirrors USB storage devices into a backup directory as they are plugged in", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: /etc/usbmirrord/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    simulation: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling loop until interrupted
    Daemon(DaemonArgs),
    /// Classify the attached devices once and print what would be backed up
    Scan,
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize, Default, Clone)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mirror_engine: Option<MirrorEngineType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    target_layout: Option<TargetLayout>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_mirror_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(skip)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut overrides = match &cli.command {
        Commands::Daemon(args) => args.clone(),
        _ => DaemonArgs::default(),
    };
    overrides.simulation = cli.simulation;

    let config = config::AppConfig::new(cli.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(logging::LogConfig::from(&config));
            config
                .prepare_backup_directory()
                .context("Refusing to start with an unusable backup directory")?;
            run_daemon(context::AppContext::new(config))
                .await
                .context("Daemon failed")?
        }
        Commands::Scan => {
            logging::init(logging::LogConfig::from(&config));
            run_scan(context::AppContext::new(config))
                .await
                .context("Failed to scan devices")?
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        }
    }

    Ok(())
}

async fn run_daemon(ctx: context::AppContext) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    Orchestrator::new(ctx).run(shutdown).await
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn forward_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, only Ctrl-C will stop the daemon");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Cannot listen for Ctrl-C either, stopping now");
            }
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

async fn run_scan(ctx: context::AppContext) -> Result<()> {
    let candidates = ctx.classifier().enumerate_candidates().await?;

    if candidates.is_empty() {
        println!("No USB storage mounted.");
        return Ok(());
    }

    for key in &candidates {
        match BackupTask::plan(key, &ctx.config.backup_directory, ctx.config.target_layout) {
            Some(task) => println!("{}  ->  {}", key, task.target.display()),
            None => println!("{}  ->  (no target name)", key),
        }
    }
    Ok(())
}
