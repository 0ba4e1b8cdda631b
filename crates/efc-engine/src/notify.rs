//! Notification interface
//!
//! The notification transport (email/SMS gateways) lives outside the engine;
//! the scheduler only talks to this trait. The default implementation writes
//! structured log events, which is also what deployments without a gateway
//! run with.

use async_trait::async_trait;
use tracing::{error, info};

use crate::scheduler::BatchReport;

/// Receives batch outcome reports from the scheduler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called after every batch with at least one failure, and after
    /// successful batches when success notifications are enabled
    async fn notify_batch(&self, report: &BatchReport);
}

/// Notifier that only logs
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_batch(&self, report: &BatchReport) {
        if report.failed > 0 {
            error!(
                "❌ Backup batch '{}' finished with failures: {} succeeded, {} failed",
                report.trigger, report.succeeded, report.failed
            );
            for job in report.jobs.iter().filter(|j| !j.success) {
                error!(
                    "❌   {} ({}): {}",
                    job.client_name,
                    job.backup_id,
                    job.error.as_deref().unwrap_or("unknown error")
                );
            }
        } else {
            info!(
                "✅ Backup batch '{}' completed: {} job(s) succeeded",
                report.trigger, report.succeeded
            );
        }
    }
}
