//! EFC Backup - centralized SSH backup orchestrator
//!
//! Composition root: loads configuration, initializes structured logging and
//! the SQLite catalog, wires the running-jobs registry, job runner, scheduler
//! and retention sweeper together, then parks until shutdown. Backup jobs are
//! triggered by the cron schedules or by operator request against the
//! scheduler's manual APIs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use efc_core::config::EngineConfig;
use efc_db::{Repository, SqliteRepository};
use efc_engine::drivers::SshSessionFactory;
use efc_engine::notify::LogNotifier;
use efc_engine::{BackupScheduler, JobRunner, RetentionSweeper, RunningJobs};

/// Grace window for shutdown before lingering tasks are dropped
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Interval between periodic retention sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load(std::env::var("EFC_CONFIG").ok().as_deref())
        .context("configuration")?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(fmt::layer())
        .init();

    info!("💾 EFC backup orchestrator starting");
    info!(
        "🔧 Archive root {}, retention {} days, {} parallel backup(s), timezone {}",
        config.backup_path.display(),
        config.retention_days,
        config.max_parallel_backups,
        config.timezone
    );

    std::fs::create_dir_all(&config.backup_path)
        .with_context(|| format!("creating archive root {}", config.backup_path.display()))?;

    let repo: Arc<dyn Repository> = Arc::new(
        SqliteRepository::connect(&config.database_url)
            .await
            .context("opening catalog database")?,
    );

    let registry = Arc::new(RunningJobs::new());
    let factory = Arc::new(SshSessionFactory::default());
    let runner = Arc::new(JobRunner::new(
        Arc::clone(&repo),
        Arc::clone(&registry),
        factory,
        config.clone(),
    ));
    let sweeper = Arc::new(RetentionSweeper::new(
        Arc::clone(&repo),
        config.backup_path.clone(),
        config.retention_days,
    ));

    let scheduler = BackupScheduler::new(
        Arc::clone(&repo),
        runner,
        config.clone(),
        Arc::new(LogNotifier),
        Some(Arc::clone(&sweeper)),
    );
    scheduler.init().await.context("initializing scheduler")?;

    // Daily retention sweep independent of backup activity
    let periodic_sweeper = Arc::clone(&sweeper);
    let sweep_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            match periodic_sweeper.sweep().await {
                Ok(report) => info!(
                    "🗑 Periodic sweep removed {} archive(s), freed {} bytes",
                    report.archives_deleted, report.bytes_freed
                ),
                Err(e) => error!("❌ Periodic retention sweep failed: {}", e),
            }
        }
    });

    info!("✅ EFC backup orchestrator ready");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Signal handler failed, shutting down: {}", e);
    }

    info!("🛑 Shutdown requested");
    sweep_task.abort();
    scheduler.shutdown();
    registry.shutdown();

    // Give in-flight jobs a short window to reach a terminal state; the
    // grace window bounds shutdown, never the other way around
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while registry.in_flight() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("🛑 EFC backup orchestrator stopped");
    Ok(())
}
