//! Error types for EFC backup operations
//!
//! This module defines the error kinds the engine distinguishes. The split
//! between transient and fatal kinds drives the retry policy: transient
//! errors are retried with backoff, fatal errors mark the job failed
//! immediately.

use std::io;
use thiserror::Error;

/// Main error type for backup operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// Host unreachable: connect timeout, DNS failure or connection refused
    #[error("Transport unreachable: {0}")]
    TransportUnreachable(String),

    /// SSH authentication rejected by the remote host
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Remote host key does not match the known-hosts entry
    #[error("Host key mismatch for {0}")]
    HostKeyMismatch(String),

    /// Remote command returned an unacceptable exit code
    #[error("Remote command failed with exit code {exit}: {stderr}")]
    RemoteCommandFailed {
        /// Exit code reported by the remote shell
        exit: i32,
        /// Captured stderr, truncated by the caller
        stderr: String,
    },

    /// Required remote tool is not installed and could not be installed
    #[error("Remote tool missing: {0}")]
    RemoteToolMissing(String),

    /// Remote or local filesystem out of space
    #[error("Out of space: {0}")]
    OutOfSpace(String),

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    LocalIo(#[from] io::Error),

    /// Catalog (repository) failure
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation cancelled by the operator
    #[error("Backup cancelled")]
    Cancelled,

    /// Unrecoverable internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create a new catalog error
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportUnreachable(msg.into())
    }

    /// Whether the SSH-operation retry budget may re-attempt the failed
    /// operation. Transient: network timeouts, connection refused, DNS not
    /// found and dropped streams — all surfaced as
    /// [`Self::TransportUnreachable`].
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportUnreachable(_))
    }

    /// Whether the error bypasses retry at every level: authentication
    /// failure, host-key mismatch, out of space, cancellation and invalid
    /// configuration are never worth a second attempt. Anything else may
    /// still be retried by the backup-level budget, which re-runs the driver
    /// from its first phase.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_)
                | Self::HostKeyMismatch(_)
                | Self::OutOfSpace(_)
                | Self::Cancelled
                | Self::Config(_)
        )
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_error_display() {
        let err = BackupError::TransportUnreachable("connect timed out".into());
        assert_eq!(err.to_string(), "Transport unreachable: connect timed out");

        let err = BackupError::RemoteCommandFailed {
            exit: 23,
            stderr: "rsync: permission denied".into(),
        };
        assert!(err.to_string().contains("exit code 23"));

        let err = BackupError::Cancelled;
        assert_eq!(err.to_string(), "Backup cancelled");
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackupError::transport("timeout").is_transient());
        assert!(!BackupError::RemoteCommandFailed { exit: 1, stderr: String::new() }.is_transient());

        assert!(BackupError::AuthenticationFailed("bad password".into()).is_fatal());
        assert!(BackupError::HostKeyMismatch("srv1".into()).is_fatal());
        assert!(BackupError::Cancelled.is_fatal());
        assert!(BackupError::OutOfSpace("/var/backups".into()).is_fatal());
        assert!(BackupError::config("bad").is_fatal());

        // a phase failure is not transient, but the backup-level budget may
        // still re-run the driver
        let phase_failure = BackupError::RemoteCommandFailed { exit: 23, stderr: String::new() };
        assert!(!phase_failure.is_fatal());
    }

    #[test]
    fn test_error_conversion_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: BackupError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_conversion_from_serde() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: BackupError = json_err.into();
        assert!(err.to_string().contains("Serialization error"));
    }
}
