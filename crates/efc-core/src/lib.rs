//! EFC Backup Core Library
//!
//! Core domain types, configuration and utilities shared by the EFC backup
//! orchestrator. The engine, repository and session crates all build on the
//! entities defined here.
//!
//! # Examples
//! ```rust
//! use efc_core::config::EngineConfig;
//!
//! let config = EngineConfig::default();
//! assert_eq!(config.max_parallel_backups, 2);
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod types;
pub mod utils;

pub use config::EngineConfig;
pub use efc_common::{BackupError, Result};
