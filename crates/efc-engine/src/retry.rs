//! Retry policy
//!
//! Classifies failures through [`BackupError::is_transient`] and schedules
//! exponential backoff: 2 s doubling per attempt, capped at 60 s, jittered
//! ±20 %. Two distinct budgets exist: SSH session operations get up to 5
//! attempts, whole backups get 2 (a backup retry re-runs the driver from its
//! first phase). Fatal errors skip retry entirely.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use efc_common::{BackupError, Result};

/// Backoff and budget parameters
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First backoff delay
    pub initial: Duration,
    /// Upper bound on any single delay, before jitter
    pub cap: Duration,
    /// Jitter fraction applied to each delay
    pub jitter: f64,
    /// Attempt budget for SSH session operations
    pub ssh_attempts: u32,
    /// Attempt budget for whole backups
    pub backup_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            jitter: 0.2,
            ssh_attempts: 5,
            backup_attempts: 2,
        }
    }
}

impl RetryPolicy {
    /// Deterministic backoff before jitter: `initial * 2^attempt`, capped.
    /// Monotonic non-decreasing in `attempt` and never above the cap.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let raw = self.initial.saturating_mul(factor.min(u32::MAX as u64) as u32);
        raw.min(self.cap)
    }

    /// Backoff with ±jitter applied, still clamped to the cap
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt).as_secs_f64();
        let spread = base * self.jitter;
        let jittered = base + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0)).min(self.cap)
    }

    /// Run an SSH-level operation under the session budget. Only transient
    /// transport errors are re-attempted.
    pub async fn retry_ssh<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry(label, self.ssh_attempts, BackupError::is_transient, &mut op)
            .await
    }

    /// Run a whole backup under the backup budget. Any phase failure short of
    /// a fatal error re-runs the driver from its first phase.
    pub async fn retry_backup<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry(label, self.backup_attempts, |e| !e.is_fatal(), &mut op)
            .await
    }

    async fn retry<T, F, Fut>(
        &self,
        label: &str,
        budget: u32,
        retryable: impl Fn(&BackupError) -> bool,
        op: &mut F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= budget {
                        return Err(e);
                    }
                    let delay = self.jittered_delay(attempt - 1);
                    warn!(
                        "Transient failure in {} (attempt {}/{}), retrying in {:?}: {}",
                        label, attempt, budget, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
