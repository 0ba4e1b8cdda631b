//! Domain entities for the EFC backup orchestrator
//!
//! Semantic types, not storage layout: clients, schedules, backup records,
//! network statistics, activity entries and the in-memory running-job view
//! consumed by the dashboard.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operating system of an enrolled client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    /// Microsoft Windows (OpenSSH server, PowerShell remote shell)
    Windows,
    /// Any Linux distribution with a POSIX shell
    Linux,
}

impl OsKind {
    /// Stable lowercase name used in the catalog
    pub fn as_str(&self) -> &'static str {
        match self {
            OsKind::Windows => "windows",
            OsKind::Linux => "linux",
        }
    }

    /// Parse a catalog value back into an [`OsKind`]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "windows" => Some(OsKind::Windows),
            "linux" => Some(OsKind::Linux),
            _ => None,
        }
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of backup to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Capture every selected path regardless of change state
    Full,
    /// Capture only paths modified after the most recent full backup
    Incremental,
    /// Same semantics as incremental; reserved for future divergence
    Differential,
}

impl BackupKind {
    /// Stable lowercase name used in the catalog
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
            BackupKind::Differential => "differential",
        }
    }

    /// Parse a catalog value back into a [`BackupKind`]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Some(BackupKind::Full),
            "incremental" => Some(BackupKind::Incremental),
            "differential" => Some(BackupKind::Differential),
            _ => None,
        }
    }

    /// Whether this kind copies only changes since a reference point
    pub fn is_change_based(&self) -> bool {
        matches!(self, BackupKind::Incremental | BackupKind::Differential)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a backup in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Catalog row created, worker not yet started
    Pending,
    /// Worker is driving the backup state machine
    Running,
    /// Terminal: archive stored (or nothing to archive)
    Completed,
    /// Terminal: backup gave up after exhausting retries
    Failed,
}

impl BackupStatus {
    /// Stable lowercase name used in the catalog
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    /// Parse a catalog value back into a [`BackupStatus`]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(BackupStatus::Pending),
            "running" => Some(BackupStatus::Running),
            "completed" => Some(BackupStatus::Completed),
            "failed" => Some(BackupStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Failed)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enrolled backup client
#[derive(Clone, Serialize, Deserialize)]
pub struct Client {
    /// Unique client name
    pub name: String,

    /// Hostname or IP address
    pub host: String,

    /// SSH port
    pub port: u16,

    /// SSH username
    pub username: String,

    /// SSH secret. Redacted from serialized output; never logged at info.
    #[serde(skip_serializing, default)]
    pub secret: String,

    /// Operating system kind
    pub os: OsKind,

    /// Folder configuration: JSON array of `{path, enabled}` objects or a
    /// comma-separated path list. Parsed by [`crate::utils::parse_folder_config`].
    pub folders: String,

    /// Default backup kind when a trigger does not specify one
    pub default_kind: BackupKind,

    /// Inactive clients are refused by the job runner
    pub active: bool,

    /// Extra directory patterns excluded for this client only
    #[serde(default)]
    pub exclude_dirs: Vec<String>,

    /// Extra filename/extension globs excluded for this client only
    #[serde(default)]
    pub exclude_files: Vec<String>,
}

impl Client {
    /// Redacted rendering for operator-facing output
    pub fn redacted_secret() -> &'static str {
        "********"
    }
}

// The secret never reaches logs, not even at debug level
impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &Self::redacted_secret())
            .field("os", &self.os)
            .field("folders", &self.folders)
            .field("default_kind", &self.default_kind)
            .field("active", &self.active)
            .finish()
    }
}

/// Where a schedule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleOrigin {
    /// Materialized at startup from configuration
    BuiltIn,
    /// Created by an operator, persisted in the catalog
    Custom,
}

impl ScheduleOrigin {
    /// Stable name used in the catalog
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleOrigin::BuiltIn => "built-in",
            ScheduleOrigin::Custom => "custom",
        }
    }

    /// Parse a catalog value back into a [`ScheduleOrigin`]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "built-in" => Some(ScheduleOrigin::BuiltIn),
            "custom" => Some(ScheduleOrigin::Custom),
            _ => None,
        }
    }
}

/// A cron-driven backup schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule name
    pub name: String,

    /// Standard 5-field cron expression (minute hour day month dow)
    pub cron: String,

    /// Backup kind dispatched on each fire
    pub kind: BackupKind,

    /// Restrict the fire to these clients; `None` means all active clients
    pub clients: Option<Vec<String>>,

    /// Operator description
    pub description: String,

    /// Inactive schedules are not registered
    pub active: bool,

    /// Built-in or operator-created
    pub origin: ScheduleOrigin,

    /// Number of times this schedule has fired
    pub run_count: u64,
}

/// A catalog row tracking one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Opaque unique backup id
    pub id: String,

    /// Client name
    pub client_name: String,

    /// Backup kind. A promoted incremental is recorded as full.
    pub kind: BackupKind,

    /// Lifecycle status
    pub status: BackupStatus,

    /// When the worker accepted the job
    pub started_at: DateTime<Utc>,

    /// Set iff status is completed
    pub completed_at: Option<DateTime<Utc>>,

    /// Set iff status is failed
    pub failed_at: Option<DateTime<Utc>>,

    /// Archive size in megabytes; 0 for an empty incremental
    pub size_mb: f64,

    /// Number of files captured
    pub file_count: u64,

    /// On-disk archive path. Set iff completed with at least one file.
    pub path: Option<String>,

    /// Error text for failed backups
    pub error: Option<String>,

    /// Metadata blob: system info, folder results, driver flags
    pub metadata: serde_json::Value,
}

impl BackupRecord {
    /// Fresh pending record for a newly accepted job
    pub fn pending(id: &str, client: &str, kind: BackupKind, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            client_name: client.to_string(),
            kind,
            status: BackupStatus::Pending,
            started_at,
            completed_at: None,
            failed_at: None,
            size_mb: 0.0,
            file_count: 0,
            path: None,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Per-backup network statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Backup id this row belongs to
    pub backup_id: String,

    /// Bytes moved over the wire
    pub bytes_transferred: u64,

    /// Average transfer speed in Mbps
    pub avg_speed_mbps: f64,

    /// Transfer duration in seconds
    pub duration_secs: u64,

    /// Files transferred
    pub file_count: u64,

    /// Transfer start
    pub started_at: DateTime<Utc>,

    /// Transfer end
    pub completed_at: DateTime<Utc>,
}

impl NetworkStats {
    /// Compute stats from raw transfer counters
    pub fn from_transfer(
        backup_id: &str,
        bytes: u64,
        files: u64,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let duration_secs = (completed_at - started_at).num_seconds().max(0) as u64;
        let avg_speed_mbps = if duration_secs > 0 {
            (bytes as f64 * 8.0) / (duration_secs as f64 * 1_000_000.0)
        } else {
            0.0
        };
        Self {
            backup_id: backup_id.to_string(),
            bytes_transferred: bytes,
            avg_speed_mbps,
            duration_secs,
            file_count: files,
            started_at,
            completed_at,
        }
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Action performed, e.g. `backup_started`
    pub action: String,

    /// Client involved, if any
    pub client_name: Option<String>,

    /// Backup id involved, if any
    pub backup_id: Option<String>,

    /// Actor: `scheduler`, `operator`, ...
    pub actor: String,

    /// Structured details
    pub details: serde_json::Value,

    /// When the action happened
    pub timestamp: DateTime<Utc>,
}

/// What triggered a running job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "origin", content = "schedule")]
pub enum TriggerOrigin {
    /// Fired by a named schedule
    Scheduled(String),
    /// Requested by an operator
    Manual,
}

/// In-memory view of a backup currently executing, kept for the dashboard
/// independently of the durable catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningJob {
    /// Backup id
    pub backup_id: String,

    /// Client name
    pub client_name: String,

    /// Backup kind
    pub kind: BackupKind,

    /// When the job runner accepted the job
    pub started_at: DateTime<Utc>,

    /// Current driver phase, e.g. `copying /etc`
    pub phase: String,

    /// Progress percentage, 0..=100, monotonic except on retry reset
    pub progress: u8,

    /// Whether the job finished and how
    pub status: BackupStatus,

    /// What triggered the job
    pub trigger: TriggerOrigin,
}

/// Result of backing up one folder. A failed folder does not fail the backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderResult {
    /// Folder path on the client
    pub path: String,

    /// `completed`, `failed` or `skipped`
    pub status: String,

    /// Files captured from this folder
    pub files: u64,

    /// Bytes captured from this folder
    pub bytes: u64,

    /// Failure detail when status is `failed`
    pub error: Option<String>,
}

impl FolderResult {
    /// Successful folder capture
    pub fn completed(path: &str, files: u64, bytes: u64) -> Self {
        Self { path: path.to_string(), status: "completed".into(), files, bytes, error: None }
    }

    /// Folder skipped (absent on the client)
    pub fn skipped(path: &str) -> Self {
        Self { path: path.to_string(), status: "skipped".into(), files: 0, bytes: 0, error: None }
    }

    /// Folder failed; the backup continues
    pub fn failed(path: &str, error: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            status: "failed".into(),
            files: 0,
            bytes: 0,
            error: Some(error.into()),
        }
    }
}

/// Aggregate counters returned by the catalog stats query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogStats {
    /// Total rows
    pub total: u64,
    /// Completed rows
    pub completed: u64,
    /// Failed rows
    pub failed: u64,
    /// Rows currently pending or running
    pub in_flight: u64,
    /// Rows started within the last 24 hours
    pub last_24h: u64,
    /// Sum of size_mb over completed rows
    pub total_size_mb: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_enum_round_trips() {
        for kind in [BackupKind::Full, BackupKind::Incremental, BackupKind::Differential] {
            assert_eq!(BackupKind::parse(kind.as_str()), Some(kind));
        }
        for status in [
            BackupStatus::Pending,
            BackupStatus::Running,
            BackupStatus::Completed,
            BackupStatus::Failed,
        ] {
            assert_eq!(BackupStatus::parse(status.as_str()), Some(status));
        }
        for os in [OsKind::Windows, OsKind::Linux] {
            assert_eq!(OsKind::parse(os.as_str()), Some(os));
        }
        assert_eq!(BackupKind::parse("FULL"), Some(BackupKind::Full));
        assert_eq!(BackupKind::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!BackupStatus::Pending.is_terminal());
        assert!(!BackupStatus::Running.is_terminal());
        assert!(BackupStatus::Completed.is_terminal());
        assert!(BackupStatus::Failed.is_terminal());
    }

    #[test]
    fn test_secret_redacted_in_debug() {
        let client = Client {
            name: "srv1".into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "backup".into(),
            secret: "hunter2".into(),
            os: OsKind::Linux,
            folders: "/etc".into(),
            default_kind: BackupKind::Incremental,
            active: true,
            exclude_dirs: vec![],
            exclude_files: vec![],
        };
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("********"));
    }

    #[test]
    fn test_secret_not_serialized() {
        let client = Client {
            name: "srv1".into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "backup".into(),
            secret: "hunter2".into(),
            os: OsKind::Linux,
            folders: "/etc".into(),
            default_kind: BackupKind::Incremental,
            active: true,
            exclude_dirs: vec![],
            exclude_files: vec![],
        };
        let json = serde_json::to_string(&client).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_network_stats_speed() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(10);
        // 125 MB in 10 s = 100 Mbps
        let stats = NetworkStats::from_transfer("b1", 125_000_000, 42, start, end);
        assert!((stats.avg_speed_mbps - 100.0).abs() < 0.01);
        assert_eq!(stats.duration_secs, 10);

        // Zero-duration transfers report zero speed instead of dividing by zero
        let stats = NetworkStats::from_transfer("b1", 1_000, 1, start, start);
        assert_eq!(stats.avg_speed_mbps, 0.0);
    }

    #[test]
    fn test_pending_record() {
        let now = Utc::now();
        let rec = BackupRecord::pending("b1", "srv1", BackupKind::Full, now);
        assert_eq!(rec.status, BackupStatus::Pending);
        assert!(rec.completed_at.is_none());
        assert!(rec.failed_at.is_none());
        assert!(rec.path.is_none());
        assert_eq!(rec.size_mb, 0.0);
    }
}
