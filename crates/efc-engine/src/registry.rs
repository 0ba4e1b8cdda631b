//! Running-jobs registry
//!
//! In-memory map from backup id to [`RunningJob`], guarded by a mutex.
//! Readers (the dashboard) snapshot entries; writers (job runner and driver
//! progress callbacks) take the lock only for the update. Finished entries
//! linger — 10 s after success, 5 min after failure — so the dashboard can
//! observe the final state, then a timer removes them. Timers are cancellable
//! so shutdown is never delayed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use efc_core::types::{BackupKind, BackupStatus, RunningJob, TriggerOrigin};

/// How long a successful job stays visible after completion
pub const SUCCESS_LINGER: Duration = Duration::from_secs(10);

/// How long a failed job stays visible after completion
pub const FAILURE_LINGER: Duration = Duration::from_secs(5 * 60);

/// Registry of currently executing (and recently finished) backups
#[derive(Default)]
pub struct RunningJobs {
    jobs: Mutex<HashMap<String, RunningJob>>,
    lingers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RunningJobs {
    /// Fresh empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job the runner just accepted
    pub fn insert(&self, backup_id: &str, client: &str, kind: BackupKind, trigger: TriggerOrigin) {
        let job = RunningJob {
            backup_id: backup_id.to_string(),
            client_name: client.to_string(),
            kind,
            started_at: Utc::now(),
            phase: "accepted".to_string(),
            progress: 0,
            status: BackupStatus::Running,
            trigger,
        };
        self.jobs.lock().unwrap().insert(backup_id.to_string(), job);
    }

    /// Update phase and progress. Progress is clamped to be non-decreasing
    /// within the job; use [`Self::reset`] when a backup-level retry starts
    /// the driver over.
    pub fn update(&self, backup_id: &str, phase: &str, progress: u8) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(backup_id) {
            job.phase = phase.to_string();
            job.progress = job.progress.max(progress.min(100));
        }
    }

    /// Reset progress for a retry attempt re-entering the first driver phase
    pub fn reset(&self, backup_id: &str, phase: &str) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(backup_id) {
            job.phase = phase.to_string();
            job.progress = 0;
        }
    }

    /// Mark a job finished and schedule its removal after the linger window
    pub fn finish(self: &Arc<Self>, backup_id: &str, status: BackupStatus, phase: &str) {
        let linger = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(backup_id) else { return };
            job.status = status;
            job.phase = phase.to_string();
            if status == BackupStatus::Completed {
                job.progress = 100;
                SUCCESS_LINGER
            } else {
                FAILURE_LINGER
            }
        };

        let registry = Arc::clone(self);
        let id = backup_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            registry.jobs.lock().unwrap().remove(&id);
            debug!("🗑 Running-job entry {} expired", id);
        });
        self.lingers.lock().unwrap().push(handle);
    }

    /// Snapshot one entry
    pub fn get(&self, backup_id: &str) -> Option<RunningJob> {
        self.jobs.lock().unwrap().get(backup_id).cloned()
    }

    /// Snapshot all entries for the dashboard
    pub fn snapshot(&self) -> Vec<RunningJob> {
        let mut jobs: Vec<RunningJob> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Number of jobs still executing (terminal lingers excluded)
    pub fn in_flight(&self) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| !j.status.is_terminal())
            .count()
    }

    /// Abort all linger timers. Entries already marked terminal stay in the
    /// map, which is fine: the process is going away.
    pub fn shutdown(&self) {
        for handle in self.lingers.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
