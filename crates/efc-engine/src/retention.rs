//! Retention sweeper
//!
//! Periodically retires artifacts older than the configured horizon: archive
//! directories (`backup_` prefix) and Linux archives (`efc-backup-*.tar.gz`)
//! under the archive root by mtime, then catalog rows, per-backup network
//! statistics and activity-log entries by timestamp, finishing with a catalog
//! compaction. The sweep is idempotent: a second pass right after the first
//! deletes nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{Duration, Utc};
use tracing::{info, instrument, warn};

use efc_common::Result;
use efc_db::Repository;

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Archive directories and files deleted
    pub archives_deleted: u64,
    /// Bytes freed on disk
    pub bytes_freed: u64,
    /// Catalog backup rows deleted
    pub backup_rows: u64,
    /// Network statistics rows deleted
    pub stats_rows: u64,
    /// Activity-log entries deleted
    pub activity_rows: u64,
}

/// Deletes archives and catalog rows older than the retention horizon
pub struct RetentionSweeper {
    repo: Arc<dyn Repository>,
    archive_root: PathBuf,
    retention_days: u32,
}

impl RetentionSweeper {
    /// Sweeper over one archive root
    pub fn new(repo: Arc<dyn Repository>, archive_root: PathBuf, retention_days: u32) -> Self {
        Self { repo, archive_root, retention_days }
    }

    /// Run one sweep. Safe to run repeatedly.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let cutoff_sys = SystemTime::now()
            - StdDuration::from_secs(self.retention_days as u64 * 24 * 3600);

        info!(
            "🗑 Retention sweep: horizon {} days, root {}",
            self.retention_days,
            self.archive_root.display()
        );

        if self.archive_root.is_dir() {
            let entries = std::fs::read_dir(&self.archive_root)?;
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                let is_tree = name.starts_with("backup_") && path.is_dir();
                let is_tarball =
                    name.starts_with("efc-backup-") && name.ends_with(".tar.gz") && path.is_file();
                if !is_tree && !is_tarball {
                    continue;
                }
                let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                    continue;
                };
                if modified >= cutoff_sys {
                    continue;
                }

                let size = if is_tree { dir_size(&path) } else { file_size(&path) };
                let removed = if is_tree {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match removed {
                    Ok(()) => {
                        report.archives_deleted += 1;
                        report.bytes_freed += size;
                        info!("🗑 Removed expired archive {} ({} bytes)", path.display(), size);
                    }
                    Err(e) => warn!("Could not remove {}: {}", path.display(), e),
                }
            }
        }

        report.backup_rows = self.repo.purge_backups_older_than(cutoff).await?;
        report.stats_rows = self.repo.purge_network_stats_older_than(cutoff).await?;
        report.activity_rows = self.repo.purge_activity_older_than(cutoff).await?;
        self.repo.compact().await?;

        info!(
            "✅ Sweep done: {} archive(s), {} bytes freed, {}/{}/{} catalog rows",
            report.archives_deleted,
            report.bytes_freed,
            report.backup_rows,
            report.stats_rows,
            report.activity_rows
        );
        Ok(report)
    }
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let child = entry.path();
            if child.is_dir() {
                total += dir_size(&child);
            } else if let Ok(metadata) = entry.metadata() {
                total += metadata.len();
            }
        }
    }
    total
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
