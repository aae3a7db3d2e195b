//! treesync daemon entry point.
//!
//! Loads configuration, wires the local working tree, the ancestor snapshot
//! and the directory remote into a sync manager, then polls for changes
//! until a shutdown signal arrives.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use treesync_core::config::TreeSyncConfig;
use treesync_core::sync_manager::SyncManager;
use treesync_core::value::{AncestorStore, DirRemote, RemoteValue};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// treesync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "treesync-daemon",
    version,
    about = "Keeps a local directory in sync with a shared remote tree"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Initialise the ancestor from the remote if none exists yet.
    #[arg(long)]
    init: bool,

    /// Publish the local tree as a new remote when the remote is missing.
    #[arg(long, requires = "init")]
    create_remote: bool,

    /// Run a single sync cycle and exit.
    #[arg(long)]
    once: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        TreeSyncConfig::load_and_validate(&args.config).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("  treesync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Project root  : {}", config.project.root.display());
    info!("Remote        : {}", config.remote.path.display());
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Push enabled  : {}", config.sync.push_enabled);
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.project.root).context("failed to create project root")?;

    let local = config.local_tree().context("invalid project settings")?;

    let remote = DirRemote::new(config.remote.path.clone());
    if !remote.exists() {
        if !args.create_remote {
            bail!(
                "no remote at {} (pass --init --create-remote to publish the local tree)",
                config.remote.path.display()
            );
        }
        let tree = local.scan().context("failed to scan project root")?;
        DirRemote::create(config.remote.path.clone(), &tree)
            .context("failed to create remote")?;
        info!(files = tree.len(), "published local tree as new remote");
    }

    let ancestor =
        AncestorStore::open(config.state_path()).context("failed to open ancestor snapshot")?;

    let manager = SyncManager::new(
        local.clone(),
        ancestor,
        RemoteValue::new(remote.clone()),
        config.merge_engine(),
        config.sync_options(),
    );

    let stats = manager
        .init(args.init, true)
        .await
        .context("failed to initialise sync state")?;
    match stats {
        Some(s) => info!(pulls = s.pulls, pushes = s.pushes, "startup sync complete"),
        None => info!("sync state ready"),
    }

    if args.once {
        info!("single cycle requested, exiting");
        return Ok(());
    }

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();
    let mut sched = scheduler::Scheduler::new(
        manager.clone(),
        local,
        remote,
        config.poll_interval(),
    );
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");
    shutdown.notify_one();

    match tokio::time::timeout(std::time::Duration::from_secs(10), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 10s, forcing shutdown"),
    }

    info!("treesync daemon stopped.");
    Ok(())
}
