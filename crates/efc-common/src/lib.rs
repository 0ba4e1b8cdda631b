//! EFC Backup Common Library
//!
//! Shared error handling for the EFC backup orchestrator. Every crate in the
//! workspace reports failures through [`BackupError`] so the retry policy can
//! classify them uniformly.

#![forbid(unsafe_code)]

pub mod error;

pub use error::{BackupError, Result};
