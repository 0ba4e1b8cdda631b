//! In-memory catalog adapter
//!
//! Implements the full [`Repository`] contract on plain maps behind a mutex.
//! Used by the engine's tests and by ephemeral deployments that do not need a
//! durable catalog.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use efc_common::{BackupError, Result};
use efc_core::types::{
    ActivityEntry, BackupKind, BackupRecord, BackupStatus, CatalogStats, Client, NetworkStats,
    Schedule,
};

use crate::repository::{BackupFilter, Repository};

#[derive(Default)]
struct Inner {
    clients: HashMap<String, Client>,
    backups: Vec<BackupRecord>,
    schedules: HashMap<String, Schedule>,
    activity: Vec<ActivityEntry>,
    network_stats: Vec<NetworkStats>,
    settings: HashMap<String, String>,
}

/// Catalog adapter holding everything in memory
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    /// Fresh empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all network stats rows, for assertions in tests
    pub fn network_stats_rows(&self) -> Vec<NetworkStats> {
        self.inner.lock().unwrap().network_stats.clone()
    }

    /// Snapshot of all activity entries, for assertions in tests
    pub fn activity_rows(&self) -> Vec<ActivityEntry> {
        self.inner.lock().unwrap().activity.clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_client(&self, client: &Client) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .clients
            .insert(client.name.clone(), client.clone());
        Ok(())
    }

    async fn get_client(&self, name: &str) -> Result<Option<Client>> {
        Ok(self.inner.lock().unwrap().clients.get(name).cloned())
    }

    async fn list_clients(&self, only_active: bool) -> Result<Vec<Client>> {
        let inner = self.inner.lock().unwrap();
        let mut clients: Vec<Client> = inner
            .clients
            .values()
            .filter(|c| !only_active || c.active)
            .cloned()
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clients)
    }

    async fn deactivate_client(&self, name: &str) -> Result<()> {
        if let Some(client) = self.inner.lock().unwrap().clients.get_mut(name) {
            client.active = false;
        }
        Ok(())
    }

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.backups.iter().any(|b| b.id == record.id) {
            return Err(BackupError::catalog(format!("duplicate backup id {}", record.id)));
        }
        inner.backups.push(record.clone());
        Ok(())
    }

    async fn set_backup_status(&self, id: &str, status: BackupStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.backups.iter_mut().find(|b| b.id == id) {
            row.status = status;
        }
        Ok(())
    }

    async fn complete_backup(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
        size_mb: f64,
        file_count: u64,
        path: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.backups.iter_mut().find(|b| b.id == id) {
            row.status = BackupStatus::Completed;
            row.completed_at = Some(completed_at);
            row.failed_at = None;
            row.size_mb = size_mb;
            row.file_count = file_count;
            row.path = path.map(str::to_string);
            row.metadata = metadata.clone();
            row.error = None;
        }
        Ok(())
    }

    async fn fail_backup(&self, id: &str, failed_at: DateTime<Utc>, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.backups.iter_mut().find(|b| b.id == id) {
            row.status = BackupStatus::Failed;
            row.failed_at = Some(failed_at);
            row.completed_at = None;
            row.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn set_backup_kind(&self, id: &str, kind: BackupKind) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.backups.iter_mut().find(|b| b.id == id) {
            row.kind = kind;
        }
        Ok(())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .backups
            .iter()
            .find(|b| b.id == id)
            .cloned())
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<BackupRecord> = inner
            .backups
            .iter()
            .filter(|b| filter.client.as_deref().map_or(true, |c| b.client_name == c))
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .filter(|b| filter.kind.map_or(true, |k| b.kind == k))
            .filter(|b| filter.since.map_or(true, |t| b.started_at >= t))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn latest_completed_full(&self, client: &str) -> Result<Option<BackupRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .backups
            .iter()
            .filter(|b| {
                b.client_name == client
                    && b.kind == BackupKind::Full
                    && b.status == BackupStatus::Completed
            })
            .max_by_key(|b| b.started_at)
            .cloned())
    }

    async fn backup_stats(&self) -> Result<CatalogStats> {
        let inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let mut stats = CatalogStats::default();
        for b in &inner.backups {
            stats.total += 1;
            match b.status {
                BackupStatus::Completed => {
                    stats.completed += 1;
                    stats.total_size_mb += b.size_mb;
                }
                BackupStatus::Failed => stats.failed += 1,
                BackupStatus::Pending | BackupStatus::Running => stats.in_flight += 1,
            }
            if b.started_at >= cutoff {
                stats.last_24h += 1;
            }
        }
        Ok(stats)
    }

    async fn purge_backups_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.backups.len();
        inner.backups.retain(|b| b.started_at >= cutoff);
        Ok((before - inner.backups.len()) as u64)
    }

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .schedules
            .insert(schedule.name.clone(), schedule.clone());
        Ok(())
    }

    async fn list_schedules(&self, only_active: bool) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock().unwrap();
        let mut schedules: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|s| !only_active || s.active)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn remove_schedule(&self, name: &str) -> Result<()> {
        if let Some(schedule) = self.inner.lock().unwrap().schedules.get_mut(name) {
            schedule.active = false;
        }
        Ok(())
    }

    async fn bump_schedule_runs(&self, name: &str) -> Result<()> {
        if let Some(schedule) = self.inner.lock().unwrap().schedules.get_mut(name) {
            schedule.run_count += 1;
        }
        Ok(())
    }

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<()> {
        self.inner.lock().unwrap().activity.push(entry.clone());
        Ok(())
    }

    async fn purge_activity_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.activity.len();
        inner.activity.retain(|e| e.timestamp >= cutoff);
        Ok((before - inner.activity.len()) as u64)
    }

    async fn insert_network_stats(&self, stats: &NetworkStats) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.network_stats.iter().any(|s| s.backup_id == stats.backup_id) {
            return Err(BackupError::catalog(format!(
                "network stats already recorded for {}",
                stats.backup_id
            )));
        }
        inner.network_stats.push(stats.clone());
        Ok(())
    }

    async fn purge_network_stats_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.network_stats.len();
        inner.network_stats.retain(|s| s.started_at >= cutoff);
        Ok((before - inner.network_stats.len()) as u64)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}
