//! SQLite catalog adapter
//!
//! Stores every durable record in a single SQLite database file. All
//! timestamps are ISO-8601 UTC strings, which keeps range comparisons
//! lexicographic. Catalog compaction maps to `VACUUM`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use efc_common::{BackupError, Result};
use efc_core::types::{
    ActivityEntry, BackupKind, BackupRecord, BackupStatus, CatalogStats, Client, NetworkStats,
    OsKind, Schedule, ScheduleOrigin,
};
use efc_core::utils::{format_timestamp, parse_timestamp};

use crate::repository::{BackupFilter, Repository};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS clients (
        name TEXT PRIMARY KEY,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        username TEXT NOT NULL,
        secret TEXT NOT NULL,
        os TEXT NOT NULL,
        folders TEXT NOT NULL DEFAULT '',
        default_kind TEXT NOT NULL DEFAULT 'incremental',
        active INTEGER NOT NULL DEFAULT 1,
        exclude_dirs TEXT NOT NULL DEFAULT '[]',
        exclude_files TEXT NOT NULL DEFAULT '[]',
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS backups (
        id TEXT PRIMARY KEY,
        client_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        failed_at TEXT,
        size_mb REAL NOT NULL DEFAULT 0,
        file_count INTEGER NOT NULL DEFAULT 0,
        path TEXT,
        error TEXT,
        metadata TEXT NOT NULL DEFAULT 'null'
    )",
    "CREATE INDEX IF NOT EXISTS idx_backups_client ON backups(client_name, status, kind)",
    "CREATE INDEX IF NOT EXISTS idx_backups_started ON backups(started_at)",
    "CREATE TABLE IF NOT EXISTS schedules (
        name TEXT PRIMARY KEY,
        cron TEXT NOT NULL,
        kind TEXT NOT NULL,
        clients TEXT,
        description TEXT NOT NULL DEFAULT '',
        active INTEGER NOT NULL DEFAULT 1,
        origin TEXT NOT NULL DEFAULT 'custom',
        run_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS activity_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        client_name TEXT,
        backup_id TEXT,
        actor TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT '{}',
        timestamp TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS network_stats (
        backup_id TEXT PRIMARY KEY,
        bytes_transferred INTEGER NOT NULL,
        avg_speed_mbps REAL NOT NULL,
        duration_secs INTEGER NOT NULL,
        file_count INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// SQLite-backed catalog repository
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (creating if missing) the catalog database and run migrations
    #[instrument(level = "debug")]
    pub async fn connect(url: &str) -> Result<Self> {
        debug!("🔧 Opening catalog database: {}", url);
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| BackupError::catalog(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;

        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| BackupError::catalog(e.to_string()))?;
        }

        info!("✅ Catalog database ready");
        Ok(Self { pool })
    }

    /// Access the inner pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn client_from_row(row: &SqliteRow) -> Result<Client> {
    let os: String = row.get("os");
    let default_kind: String = row.get("default_kind");
    let exclude_dirs: String = row.get("exclude_dirs");
    let exclude_files: String = row.get("exclude_files");
    Ok(Client {
        name: row.get("name"),
        host: row.get("host"),
        port: row.get::<i64, _>("port") as u16,
        username: row.get("username"),
        secret: row.get("secret"),
        os: OsKind::parse(&os)
            .ok_or_else(|| BackupError::catalog(format!("unknown os kind {os:?}")))?,
        folders: row.get("folders"),
        default_kind: BackupKind::parse(&default_kind)
            .ok_or_else(|| BackupError::catalog(format!("unknown backup kind {default_kind:?}")))?,
        active: row.get::<i64, _>("active") != 0,
        exclude_dirs: serde_json::from_str(&exclude_dirs).unwrap_or_default(),
        exclude_files: serde_json::from_str(&exclude_files).unwrap_or_default(),
    })
}

fn backup_from_row(row: &SqliteRow) -> Result<BackupRecord> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    Ok(BackupRecord {
        id: row.get("id"),
        client_name: row.get("client_name"),
        kind: BackupKind::parse(&kind)
            .ok_or_else(|| BackupError::catalog(format!("unknown backup kind {kind:?}")))?,
        status: BackupStatus::parse(&status)
            .ok_or_else(|| BackupError::catalog(format!("unknown status {status:?}")))?,
        started_at: parse_timestamp(&row.get::<String, _>("started_at"))?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(|t| parse_timestamp(&t))
            .transpose()?,
        failed_at: row
            .get::<Option<String>, _>("failed_at")
            .map(|t| parse_timestamp(&t))
            .transpose()?,
        size_mb: row.get("size_mb"),
        file_count: row.get::<i64, _>("file_count") as u64,
        path: row.get("path"),
        error: row.get("error"),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule> {
    let kind: String = row.get("kind");
    let origin: String = row.get("origin");
    let clients: Option<String> = row.get("clients");
    Ok(Schedule {
        name: row.get("name"),
        cron: row.get("cron"),
        kind: BackupKind::parse(&kind)
            .ok_or_else(|| BackupError::catalog(format!("unknown backup kind {kind:?}")))?,
        clients: clients.and_then(|c| serde_json::from_str(&c).ok()),
        description: row.get("description"),
        active: row.get::<i64, _>("active") != 0,
        origin: ScheduleOrigin::parse(&origin).unwrap_or(ScheduleOrigin::Custom),
        run_count: row.get::<i64, _>("run_count") as u64,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn upsert_client(&self, client: &Client) -> Result<()> {
        debug!("🔧 Upserting client {}", client.name);
        sqlx::query(
            "INSERT INTO clients
                 (name, host, port, username, secret, os, folders, default_kind,
                  active, exclude_dirs, exclude_files, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(name) DO UPDATE SET
                 host = excluded.host, port = excluded.port,
                 username = excluded.username, secret = excluded.secret,
                 os = excluded.os, folders = excluded.folders,
                 default_kind = excluded.default_kind, active = excluded.active,
                 exclude_dirs = excluded.exclude_dirs,
                 exclude_files = excluded.exclude_files,
                 updated_at = excluded.updated_at",
        )
        .bind(&client.name)
        .bind(&client.host)
        .bind(client.port as i64)
        .bind(&client.username)
        .bind(&client.secret)
        .bind(client.os.as_str())
        .bind(&client.folders)
        .bind(client.default_kind.as_str())
        .bind(client.active as i64)
        .bind(serde_json::to_string(&client.exclude_dirs)?)
        .bind(serde_json::to_string(&client.exclude_files)?)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn get_client(&self, name: &str) -> Result<Option<Client>> {
        sqlx::query("SELECT * FROM clients WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?
            .map(|row| client_from_row(&row))
            .transpose()
    }

    async fn list_clients(&self, only_active: bool) -> Result<Vec<Client>> {
        let sql = if only_active {
            "SELECT * FROM clients WHERE active = 1 ORDER BY name"
        } else {
            "SELECT * FROM clients ORDER BY name"
        };
        sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?
            .iter()
            .map(client_from_row)
            .collect()
    }

    async fn deactivate_client(&self, name: &str) -> Result<()> {
        debug!("🗑 Soft-deleting client {}", name);
        sqlx::query("UPDATE clients SET active = 0, updated_at = ?2 WHERE name = ?1")
            .bind(name)
            .bind(format_timestamp(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO backups
                 (id, client_name, kind, status, started_at, completed_at, failed_at,
                  size_mb, file_count, path, error, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&record.id)
        .bind(&record.client_name)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(format_timestamp(record.started_at))
        .bind(record.completed_at.map(format_timestamp))
        .bind(record.failed_at.map(format_timestamp))
        .bind(record.size_mb)
        .bind(record.file_count as i64)
        .bind(record.path.as_deref())
        .bind(record.error.as_deref())
        .bind(serde_json::to_string(&record.metadata)?)
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn set_backup_status(&self, id: &str, status: BackupStatus) -> Result<()> {
        sqlx::query("UPDATE backups SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
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
        sqlx::query(
            "UPDATE backups SET status = 'completed', completed_at = ?2, failed_at = NULL,
                 size_mb = ?3, file_count = ?4, path = ?5, metadata = ?6, error = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .bind(format_timestamp(completed_at))
        .bind(size_mb)
        .bind(file_count as i64)
        .bind(path)
        .bind(serde_json::to_string(metadata)?)
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn fail_backup(&self, id: &str, failed_at: DateTime<Utc>, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backups SET status = 'failed', failed_at = ?2, completed_at = NULL,
                 error = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(format_timestamp(failed_at))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn set_backup_kind(&self, id: &str, kind: BackupKind) -> Result<()> {
        sqlx::query("UPDATE backups SET kind = ?2 WHERE id = ?1")
            .bind(id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        sqlx::query("SELECT * FROM backups WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?
            .map(|row| backup_from_row(&row))
            .transpose()
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let mut sql = String::from("SELECT * FROM backups WHERE 1 = 1");
        if filter.client.is_some() {
            sql.push_str(" AND client_name = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND started_at >= ?");
        }
        sql.push_str(" ORDER BY started_at DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(client) = &filter.client {
            query = query.bind(client);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(kind) = filter.kind {
            query = query.bind(kind.as_str());
        }
        if let Some(since) = filter.since {
            query = query.bind(format_timestamp(since));
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?
            .iter()
            .map(backup_from_row)
            .collect()
    }

    async fn latest_completed_full(&self, client: &str) -> Result<Option<BackupRecord>> {
        sqlx::query(
            "SELECT * FROM backups
             WHERE client_name = ?1 AND kind = 'full' AND status = 'completed'
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(client)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?
        .map(|row| backup_from_row(&row))
        .transpose()
    }

    async fn backup_stats(&self) -> Result<CatalogStats> {
        let cutoff = format_timestamp(Utc::now() - chrono::Duration::hours(24));
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                 COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                 COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                 COALESCE(SUM(CASE WHEN status IN ('pending', 'running') THEN 1 ELSE 0 END), 0)
                     AS in_flight,
                 COALESCE(SUM(CASE WHEN started_at >= ?1 THEN 1 ELSE 0 END), 0) AS last_24h,
                 COALESCE(SUM(CASE WHEN status = 'completed' THEN size_mb ELSE 0 END), 0.0)
                     AS total_size_mb
             FROM backups",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;

        Ok(CatalogStats {
            total: row.get::<i64, _>("total") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            in_flight: row.get::<i64, _>("in_flight") as u64,
            last_24h: row.get::<i64, _>("last_24h") as u64,
            total_size_mb: row.get("total_size_mb"),
        })
    }

    async fn purge_backups_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM backups WHERE started_at < ?1")
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        debug!("⏰ Persisting schedule {}", schedule.name);
        sqlx::query(
            "INSERT INTO schedules
                 (name, cron, kind, clients, description, active, origin, run_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                 cron = excluded.cron, kind = excluded.kind, clients = excluded.clients,
                 description = excluded.description, active = excluded.active",
        )
        .bind(&schedule.name)
        .bind(&schedule.cron)
        .bind(schedule.kind.as_str())
        .bind(
            schedule
                .clients
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&schedule.description)
        .bind(schedule.active as i64)
        .bind(schedule.origin.as_str())
        .bind(schedule.run_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn list_schedules(&self, only_active: bool) -> Result<Vec<Schedule>> {
        let sql = if only_active {
            "SELECT * FROM schedules WHERE active = 1 ORDER BY name"
        } else {
            "SELECT * FROM schedules ORDER BY name"
        };
        sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?
            .iter()
            .map(schedule_from_row)
            .collect()
    }

    async fn remove_schedule(&self, name: &str) -> Result<()> {
        debug!("🗑 Soft-deleting schedule {}", name);
        sqlx::query("UPDATE schedules SET active = 0 WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn bump_schedule_runs(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE schedules SET run_count = run_count + 1 WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity_log (action, client_name, backup_id, actor, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&entry.action)
        .bind(entry.client_name.as_deref())
        .bind(entry.backup_id.as_deref())
        .bind(&entry.actor)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(format_timestamp(entry.timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn purge_activity_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM activity_log WHERE timestamp < ?1")
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn insert_network_stats(&self, stats: &NetworkStats) -> Result<()> {
        sqlx::query(
            "INSERT INTO network_stats
                 (backup_id, bytes_transferred, avg_speed_mbps, duration_secs, file_count,
                  started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&stats.backup_id)
        .bind(stats.bytes_transferred as i64)
        .bind(stats.avg_speed_mbps)
        .bind(stats.duration_secs as i64)
        .bind(stats.file_count as i64)
        .bind(format_timestamp(stats.started_at))
        .bind(format_timestamp(stats.completed_at))
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn purge_network_stats_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM network_stats WHERE started_at < ?1")
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?
            .map(|row| row.get("value")))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }

    async fn compact(&self) -> Result<()> {
        debug!("🔧 Compacting catalog database");
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::catalog(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use efc_core::types::TriggerOrigin;

    async fn open_temp_repo() -> (tempfile::TempDir, SqliteRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/catalog.db", dir.path().display());
        let repo = SqliteRepository::connect(&url).await.unwrap();
        (dir, repo)
    }

    fn sample_client(name: &str) -> Client {
        Client {
            name: name.into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "backup".into(),
            secret: "s3cret".into(),
            os: OsKind::Linux,
            folders: "/etc,/home".into(),
            default_kind: BackupKind::Incremental,
            active: true,
            exclude_dirs: vec!["/var/tmp".into()],
            exclude_files: vec!["*.swp".into()],
        }
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let (_dir, repo) = open_temp_repo().await;
        repo.upsert_client(&sample_client("srv1")).await.unwrap();

        let fetched = repo.get_client("srv1").await.unwrap().unwrap();
        assert_eq!(fetched.host, "10.0.0.5");
        assert_eq!(fetched.os, OsKind::Linux);
        assert_eq!(fetched.exclude_dirs, vec!["/var/tmp".to_string()]);

        repo.deactivate_client("srv1").await.unwrap();
        assert!(repo.list_clients(true).await.unwrap().is_empty());
        assert_eq!(repo.list_clients(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_lifecycle() {
        let (_dir, repo) = open_temp_repo().await;
        let started = Utc::now();
        let record = BackupRecord::pending("b1", "srv1", BackupKind::Full, started);
        repo.insert_backup(&record).await.unwrap();
        repo.set_backup_status("b1", BackupStatus::Running).await.unwrap();

        let completed_at = started + chrono::Duration::seconds(30);
        repo.complete_backup(
            "b1",
            completed_at,
            12.5,
            42,
            Some("/var/backups/efc-backup/efc-backup-srv1.tar.gz"),
            &serde_json::json!({"folders": []}),
        )
        .await
        .unwrap();

        let row = repo.get_backup("b1").await.unwrap().unwrap();
        assert_eq!(row.status, BackupStatus::Completed);
        assert!(row.completed_at.is_some());
        assert!(row.failed_at.is_none());
        assert!(row.completed_at.unwrap() >= row.started_at);
        assert_eq!(row.file_count, 42);
        assert!(row.path.is_some());
    }

    #[tokio::test]
    async fn test_failed_backup_sets_exactly_one_terminal_timestamp() {
        let (_dir, repo) = open_temp_repo().await;
        let started = Utc::now();
        repo.insert_backup(&BackupRecord::pending("b2", "srv1", BackupKind::Full, started))
            .await
            .unwrap();
        repo.fail_backup("b2", started + chrono::Duration::seconds(5), "authentication failed")
            .await
            .unwrap();

        let row = repo.get_backup("b2").await.unwrap().unwrap();
        assert_eq!(row.status, BackupStatus::Failed);
        assert!(row.failed_at.is_some());
        assert!(row.completed_at.is_none());
        assert_eq!(row.error.as_deref(), Some("authentication failed"));
    }

    #[tokio::test]
    async fn test_latest_completed_full_skips_failed_and_incremental() {
        let (_dir, repo) = open_temp_repo().await;
        let t0 = Utc::now() - chrono::Duration::days(3);

        let mut failed_full = BackupRecord::pending("f1", "srv1", BackupKind::Full, t0);
        failed_full.status = BackupStatus::Failed;
        repo.insert_backup(&failed_full).await.unwrap();

        let mut old_full = BackupRecord::pending(
            "f2",
            "srv1",
            BackupKind::Full,
            t0 + chrono::Duration::hours(1),
        );
        old_full.status = BackupStatus::Completed;
        repo.insert_backup(&old_full).await.unwrap();

        let mut incr = BackupRecord::pending(
            "i1",
            "srv1",
            BackupKind::Incremental,
            t0 + chrono::Duration::hours(2),
        );
        incr.status = BackupStatus::Completed;
        repo.insert_backup(&incr).await.unwrap();

        let latest = repo.latest_completed_full("srv1").await.unwrap().unwrap();
        assert_eq!(latest.id, "f2");
        assert!(repo.latest_completed_full("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_backups_filters() {
        let (_dir, repo) = open_temp_repo().await;
        let now = Utc::now();
        for (id, client, days_ago) in [("a", "srv1", 10), ("b", "srv1", 1), ("c", "srv2", 1)] {
            let rec = BackupRecord::pending(
                id,
                client,
                BackupKind::Full,
                now - chrono::Duration::days(days_ago),
            );
            repo.insert_backup(&rec).await.unwrap();
        }

        let filter = BackupFilter {
            client: Some("srv1".into()),
            since: Some(now - chrono::Duration::days(2)),
            ..Default::default()
        };
        let rows = repo.list_backups(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b");

        let limited = repo
            .list_backups(&BackupFilter { limit: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        // newest first
        assert!(limited[0].started_at >= limited[1].started_at);
    }

    #[tokio::test]
    async fn test_purges_and_compaction() {
        let (_dir, repo) = open_temp_repo().await;
        let now = Utc::now();
        let old = now - chrono::Duration::days(40);
        repo.insert_backup(&BackupRecord::pending("old", "srv1", BackupKind::Full, old))
            .await
            .unwrap();
        repo.insert_backup(&BackupRecord::pending("new", "srv1", BackupKind::Full, now))
            .await
            .unwrap();
        repo.append_activity(&ActivityEntry {
            action: "backup_started".into(),
            client_name: Some("srv1".into()),
            backup_id: Some("old".into()),
            actor: "scheduler".into(),
            details: serde_json::json!({}),
            timestamp: old,
        })
        .await
        .unwrap();
        repo.insert_network_stats(&NetworkStats::from_transfer("old", 1000, 3, old, old))
            .await
            .unwrap();

        let cutoff = now - chrono::Duration::days(30);
        assert_eq!(repo.purge_backups_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(repo.purge_activity_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(repo.purge_network_stats_older_than(cutoff).await.unwrap(), 1);
        // idempotent: second pass deletes nothing
        assert_eq!(repo.purge_backups_older_than(cutoff).await.unwrap(), 0);
        repo.compact().await.unwrap();
        assert!(repo.get_backup("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_schedules_and_settings() {
        let (_dir, repo) = open_temp_repo().await;
        let schedule = Schedule {
            name: "nightly-opt".into(),
            cron: "30 1 * * *".into(),
            kind: BackupKind::Incremental,
            clients: Some(vec!["srv1".into()]),
            description: "nightly /opt capture".into(),
            active: true,
            origin: ScheduleOrigin::Custom,
            run_count: 0,
        };
        repo.insert_schedule(&schedule).await.unwrap();
        repo.bump_schedule_runs("nightly-opt").await.unwrap();

        let listed = repo.list_schedules(true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_count, 1);
        assert_eq!(listed[0].clients.as_deref(), Some(&["srv1".to_string()][..]));

        repo.remove_schedule("nightly-opt").await.unwrap();
        assert!(repo.list_schedules(true).await.unwrap().is_empty());

        repo.set_setting("last_sweep", "2026-01-01T00:00:00Z").await.unwrap();
        repo.set_setting("last_sweep", "2026-02-01T00:00:00Z").await.unwrap();
        assert_eq!(
            repo.get_setting("last_sweep").await.unwrap().as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
        assert!(repo.get_setting("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backup_stats_aggregate() {
        let (_dir, repo) = open_temp_repo().await;
        let now = Utc::now();

        let mut done = BackupRecord::pending("d1", "srv1", BackupKind::Full, now);
        done.status = BackupStatus::Completed;
        done.size_mb = 100.0;
        repo.insert_backup(&done).await.unwrap();

        let mut failed =
            BackupRecord::pending("f1", "srv1", BackupKind::Full, now - chrono::Duration::days(2));
        failed.status = BackupStatus::Failed;
        repo.insert_backup(&failed).await.unwrap();

        repo.insert_backup(&BackupRecord::pending("p1", "srv2", BackupKind::Incremental, now))
            .await
            .unwrap();

        let stats = repo.backup_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.last_24h, 2);
        assert!((stats.total_size_mb - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_trigger_origin_serde() {
        let manual = serde_json::to_string(&TriggerOrigin::Manual).unwrap();
        assert!(manual.contains("manual"));
    }
}
