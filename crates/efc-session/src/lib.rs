//! EFC Backup Remote Session Library
//!
//! An authenticated SSH channel to one backup client: command execution with
//! per-command deadlines, SFTP download, and an application-level keepalive
//! every 30 seconds to survive idle NAT/firewall timeouts during long
//! transfers.
//!
//! The blocking `ssh2` session is confined to a dedicated actor thread; the
//! async side talks to it over channels. Backup drivers depend only on the
//! [`RemoteSession`] trait so tests can substitute a scripted fake.

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use efc_common::{BackupError, Result};

pub mod ssh;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;

pub use ssh::{SshConfig, SshSession};

/// Default per-command deadline
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between application-level keepalives on an idle session
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Output of one remote command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Exit code reported by the remote shell
    pub exit_code: i32,
}

/// Check a command's exit code against the caller's acceptable range.
///
/// Most tools succeed only with exit 0, but the Windows copy tool uses 0-7 to
/// report success with various amounts of work done, so callers pass an
/// override.
pub fn check_exit(output: CommandOutput, acceptable: (i32, i32)) -> Result<CommandOutput> {
    let (lo, hi) = acceptable;
    if output.exit_code < lo || output.exit_code > hi {
        let mut stderr = output.stderr;
        stderr.truncate(2048);
        return Err(BackupError::RemoteCommandFailed { exit: output.exit_code, stderr });
    }
    Ok(output)
}

/// An authenticated remote channel to a backup client
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command, failing on a non-zero exit code
    async fn run(&self, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        self.run_with_exit_range(cmd, timeout, (0, 0)).await
    }

    /// Run a command accepting any exit code within `acceptable` (inclusive)
    async fn run_with_exit_range(
        &self,
        cmd: &str,
        timeout: Duration,
        acceptable: (i32, i32),
    ) -> Result<CommandOutput>;

    /// Download a remote file over SFTP; returns bytes written
    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64>;

    /// Recursively download a remote directory over SFTP; returns
    /// (files, bytes) written
    async fn download_dir(&self, remote: &str, local: &Path) -> Result<(u64, u64)>;

    /// Close the session. Idempotent; also triggered on drop.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<T: RemoteSession + ?Sized> RemoteSession for std::sync::Arc<T> {
    async fn run_with_exit_range(
        &self,
        cmd: &str,
        timeout: Duration,
        acceptable: (i32, i32),
    ) -> Result<CommandOutput> {
        (**self).run_with_exit_range(cmd, timeout, acceptable).await
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64> {
        (**self).download_file(remote, local).await
    }

    async fn download_dir(&self, remote: &str, local: &Path) -> Result<(u64, u64)> {
        (**self).download_dir(remote, local).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}
