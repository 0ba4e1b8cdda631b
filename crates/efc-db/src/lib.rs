//! EFC Backup Catalog Layer
//!
//! The durable catalog behind the orchestrator: client records, backup rows,
//! custom schedules, activity log, per-backup network statistics and a small
//! key-value settings store. The engine only sees the [`Repository`] trait;
//! deployments get the SQLite adapter, tests get the in-memory one.

#![forbid(unsafe_code)]

pub mod memory;
pub mod repository;
pub mod sqlite;

pub use memory::MemoryRepository;
pub use repository::{BackupFilter, Repository};
pub use sqlite::SqliteRepository;
