//! Repository contract for the durable catalog
//!
//! The engine is written against this trait. All timestamps are ISO-8601 UTC;
//! the store enforces unique constraints (client name, backup id, schedule
//! name) and is safe for concurrent use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use efc_common::Result;
use efc_core::types::{
    ActivityEntry, BackupKind, BackupRecord, BackupStatus, CatalogStats, Client, NetworkStats,
    Schedule,
};

/// Filters for listing backup rows
#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    /// Restrict to one client
    pub client: Option<String>,
    /// Restrict to one status
    pub status: Option<BackupStatus>,
    /// Restrict to one kind
    pub kind: Option<BackupKind>,
    /// Only rows started at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Maximum rows returned, newest first
    pub limit: Option<u32>,
}

/// Durable store for client records, backup rows, schedules, activity log
/// and network statistics
#[async_trait]
pub trait Repository: Send + Sync {
    // -- clients ----------------------------------------------------------

    /// Insert or replace a client record keyed by name
    async fn upsert_client(&self, client: &Client) -> Result<()>;

    /// Fetch a client by name; soft-deleted clients are returned with
    /// `active = false`
    async fn get_client(&self, name: &str) -> Result<Option<Client>>;

    /// List clients, optionally only active ones
    async fn list_clients(&self, only_active: bool) -> Result<Vec<Client>>;

    /// Soft-delete a client
    async fn deactivate_client(&self, name: &str) -> Result<()>;

    // -- backups ----------------------------------------------------------

    /// Insert a new backup row (normally in `pending`)
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()>;

    /// Transition a backup row's status
    async fn set_backup_status(&self, id: &str, status: BackupStatus) -> Result<()>;

    /// Mark a backup completed with its final counters
    async fn complete_backup(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
        size_mb: f64,
        file_count: u64,
        path: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<()>;

    /// Mark a backup failed with its error text
    async fn fail_backup(&self, id: &str, failed_at: DateTime<Utc>, error: &str) -> Result<()>;

    /// Record the kind a job was actually run with (incremental promoted to
    /// full when no prior full exists)
    async fn set_backup_kind(&self, id: &str, kind: BackupKind) -> Result<()>;

    /// Fetch one backup row
    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>>;

    /// List backup rows, newest first
    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>>;

    /// Most recent completed full backup for a client, if any
    async fn latest_completed_full(&self, client: &str) -> Result<Option<BackupRecord>>;

    /// Aggregate catalog statistics
    async fn backup_stats(&self) -> Result<CatalogStats>;

    /// Delete backup rows older than the cutoff; returns rows removed
    async fn purge_backups_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // -- schedules --------------------------------------------------------

    /// Persist a custom schedule
    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()>;

    /// List persisted custom schedules, optionally only active ones
    async fn list_schedules(&self, only_active: bool) -> Result<Vec<Schedule>>;

    /// Soft-delete a custom schedule by name
    async fn remove_schedule(&self, name: &str) -> Result<()>;

    /// Increment a schedule's run counter
    async fn bump_schedule_runs(&self, name: &str) -> Result<()>;

    // -- activity log ------------------------------------------------------

    /// Append an audit entry
    async fn append_activity(&self, entry: &ActivityEntry) -> Result<()>;

    /// Delete audit entries older than the cutoff; returns rows removed
    async fn purge_activity_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // -- network stats -----------------------------------------------------

    /// Insert the per-backup network statistics row. Called exactly once per
    /// backup, and only when bytes actually moved.
    async fn insert_network_stats(&self, stats: &NetworkStats) -> Result<()>;

    /// Delete stats rows older than the cutoff; returns rows removed
    async fn purge_network_stats_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // -- settings ----------------------------------------------------------

    /// Fetch a settings value
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// Store a settings value
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// Compact the underlying store after a purge
    async fn compact(&self) -> Result<()>;
}
