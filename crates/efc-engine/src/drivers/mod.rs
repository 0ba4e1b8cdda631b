//! Backup drivers
//!
//! Per-OS strategies implementing the backup state machine over a
//! [`RemoteSession`]. The job runner selects the variant by the client's OS
//! kind; both variants expose the same capability interface and report
//! progress at phase boundaries through a plain callback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use efc_common::{BackupError, Result};
use efc_core::types::{Client, FolderResult};
use efc_session::{RemoteSession, SshConfig, SshSession};

use crate::stats::TransferCounters;

pub mod linux;
pub mod windows;

pub use linux::LinuxDriver;
pub use windows::WindowsDriver;

/// Default per-command deadline for driver-issued remote commands
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Generous deadline for long-running copy and archive commands
pub const COPY_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

/// Progress callback invoked at phase boundaries: `(phase, percent)`
pub type ProgressSink = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// A no-op progress sink
pub fn null_progress() -> ProgressSink {
    Arc::new(|_, _| {})
}

/// Cancellation handle owned by the job runner
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation of the running backup
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation flag checked by drivers between remote operations
#[derive(Clone, Default)]
pub struct CancelFlag {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelFlag {
    /// A fresh (handle, flag) pair
    pub fn new() -> (CancelHandle, CancelFlag) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelFlag { rx: Some(rx) })
    }

    /// A flag that never cancels
    pub fn never() -> CancelFlag {
        CancelFlag::default()
    }

    /// Error out if cancellation was requested
    pub fn check(&self) -> Result<()> {
        match &self.rx {
            Some(rx) if *rx.borrow() => Err(BackupError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Everything a driver needs to know about the job it is running
#[derive(Clone)]
pub struct BackupContext {
    /// Opaque backup id
    pub backup_id: String,
    /// The client being backed up
    pub client: Client,
    /// Local permanent archive root
    pub archive_root: PathBuf,
    /// Caller-supplied folder list overriding the client configuration
    pub folders_override: Option<Vec<String>>,
    /// Attempt a volume-shadow snapshot before Windows copies
    pub use_vss: bool,
    /// Caller's system-image decision; `None` falls back to the environment
    /// flag for full backups
    pub create_image: Option<bool>,
    /// Environment default for system-image creation
    pub env_create_image: bool,
}

impl BackupContext {
    /// Whether the Windows driver should invoke the system-image tool.
    /// The caller's explicit choice wins; otherwise the environment flag
    /// applies, and only to full backups.
    pub fn wants_system_image(&self, is_full: bool) -> bool {
        match self.create_image {
            Some(explicit) => explicit && is_full,
            None => self.env_create_image && is_full,
        }
    }
}

/// What one backup produced
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    /// Transfer counters accumulated over all folders
    pub counters: TransferCounters,
    /// Archive size in megabytes (0 when nothing was transferred)
    pub size_mb: f64,
    /// Local archive path; `None` when nothing was transferred
    pub archive_path: Option<PathBuf>,
    /// Metadata blob persisted with the catalog row
    pub metadata: serde_json::Value,
    /// Per-folder results
    pub folder_results: Vec<FolderResult>,
    /// When the driver started its first phase
    pub started_at: DateTime<Utc>,
    /// When the driver finished its last phase
    pub completed_at: DateTime<Utc>,
}

/// Capability interface every driver implements. No inheritance hierarchy:
/// the Windows and Linux strategies are independent implementations.
#[async_trait]
pub trait BackupDriver: Send {
    /// Open the remote session
    async fn connect(&mut self) -> Result<()>;

    /// Close the remote session. Safe to call repeatedly.
    async fn disconnect(&mut self);

    /// Collect remote system information
    async fn get_system_info(&mut self) -> Result<serde_json::Value>;

    /// Run a full backup
    async fn perform_full_backup(&mut self) -> Result<BackupOutcome>;

    /// Run an incremental backup capturing changes after `reference`
    async fn perform_incremental_backup(
        &mut self,
        reference: DateTime<Utc>,
    ) -> Result<BackupOutcome>;
}

/// Opens remote sessions for drivers. A trait seam so tests can hand drivers
/// a scripted session instead of a live SSH connection.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open an authenticated session to the client
    async fn open(&self, client: &Client) -> Result<Box<dyn RemoteSession>>;
}

/// Production factory connecting over SSH
pub struct SshSessionFactory {
    /// TCP connect + handshake deadline
    pub connect_timeout: Duration,
    /// Optional known-hosts file for host-key verification
    pub known_hosts_file: Option<PathBuf>,
}

impl Default for SshSessionFactory {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(30), known_hosts_file: None }
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn open(&self, client: &Client) -> Result<Box<dyn RemoteSession>> {
        let mut config = SshConfig::new(&client.host, client.port, &client.username, &client.secret);
        config.connect_timeout = self.connect_timeout;
        config.known_hosts_file = self.known_hosts_file.clone();
        let session = SshSession::connect(config).await?;
        Ok(Box::new(session))
    }
}

/// Detect an out-of-space condition in tool output and upgrade the error so
/// the retry policy treats it as fatal
pub(crate) fn detect_out_of_space(stderr: &str, context: &str) -> Option<BackupError> {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("no space left on device") || lowered.contains("disk full") {
        Some(BackupError::OutOfSpace(context.to_string()))
    } else {
        None
    }
}

/// Filesystem-safe name for a folder's destination under the working
/// directory: `/var/www` becomes `var_www`, `C:\Users` becomes `C_Users`
pub(crate) fn folder_slug(path: &str) -> String {
    let slug: String = path
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '_',
            c => c,
        })
        .collect();
    slug.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_folder_slug() {
        assert_eq!(folder_slug("/var/www"), "var_www");
        assert_eq!(folder_slug("/etc"), "etc");
        assert_eq!(folder_slug(r"C:\Users\alice"), "C_Users_alice");
        assert_eq!(folder_slug("D:/Shared Data"), "D_Shared_Data");
    }

    #[test]
    fn test_detect_out_of_space() {
        assert!(detect_out_of_space("rsync: write failed: No space left on device (28)", "x")
            .is_some());
        assert!(detect_out_of_space("permission denied", "x").is_none());
    }

    #[test]
    fn test_cancel_flag() {
        let (handle, flag) = CancelFlag::new();
        assert!(flag.check().is_ok());
        handle.cancel();
        assert!(matches!(flag.check(), Err(BackupError::Cancelled)));
        assert!(CancelFlag::never().check().is_ok());
    }

    #[test]
    fn test_system_image_rule() {
        let client = Client {
            name: "pc1".into(),
            host: "10.0.0.9".into(),
            port: 22,
            username: "backup".into(),
            secret: "pw".into(),
            os: efc_core::types::OsKind::Windows,
            folders: String::new(),
            default_kind: efc_core::types::BackupKind::Full,
            active: true,
            exclude_dirs: vec![],
            exclude_files: vec![],
        };
        let mut ctx = BackupContext {
            backup_id: "b1".into(),
            client,
            archive_root: PathBuf::from("/tmp"),
            folders_override: None,
            use_vss: true,
            create_image: None,
            env_create_image: true,
        };
        // env flag applies to full backups only
        assert!(ctx.wants_system_image(true));
        assert!(!ctx.wants_system_image(false));
        // the caller's explicit decision wins over the env flag
        ctx.create_image = Some(false);
        assert!(!ctx.wants_system_image(true));
        ctx.create_image = Some(true);
        ctx.env_create_image = false;
        assert!(ctx.wants_system_image(true));
        assert!(!ctx.wants_system_image(false));
    }
}
