//! Job runner
//!
//! Drives one client through one backup: refuses inactive clients, registers
//! the running-job entry, walks the catalog row through
//! `pending → running → (completed | failed)`, resolves the incremental
//! reference point (promoting to full when no prior full exists), invokes the
//! OS driver inside the backup-level retry budget, and persists network
//! statistics exactly once on success.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use efc_common::Result;
use efc_core::config::EngineConfig;
use efc_core::types::{
    BackupKind, BackupRecord, BackupStatus, Client, NetworkStats, TriggerOrigin,
};
use efc_core::utils::{generate_backup_id, parse_timestamp};
use efc_db::Repository;

use crate::drivers::{
    BackupContext, BackupDriver, CancelFlag, CancelHandle, LinuxDriver, ProgressSink,
    SessionFactory, WindowsDriver,
};
use crate::registry::RunningJobs;
use crate::retry::RetryPolicy;

/// Per-job options a trigger may carry
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Backup kind; defaults to the client's configured kind
    pub kind: Option<BackupKind>,
    /// Folder list overriding the client configuration
    pub folders: Option<Vec<String>>,
    /// Windows: create a system image (falls back to the environment flag)
    pub create_image: Option<bool>,
}

/// Outcome of one job, as seen by the scheduler
#[derive(Debug, Clone)]
pub struct JobReport {
    /// Client the job ran against
    pub client_name: String,
    /// Backup id (empty when the job was refused before a row existed)
    pub backup_id: String,
    /// Kind the job actually ran with (promotions included)
    pub kind: BackupKind,
    /// Whether the backup completed
    pub success: bool,
    /// Error text for failures
    pub error: Option<String>,
    /// Final archive size in megabytes
    pub size_mb: f64,
}

impl JobReport {
    fn refused(client: &str, kind: BackupKind, reason: &str) -> Self {
        Self {
            client_name: client.to_string(),
            backup_id: String::new(),
            kind,
            success: false,
            error: Some(reason.to_string()),
            size_mb: 0.0,
        }
    }
}

/// Runs backups one client at a time
pub struct JobRunner {
    repo: Arc<dyn Repository>,
    registry: Arc<RunningJobs>,
    factory: Arc<dyn SessionFactory>,
    policy: RetryPolicy,
    config: EngineConfig,
    cancels: Mutex<HashMap<String, CancelHandle>>,
}

impl JobRunner {
    /// Runner wired to a catalog, a running-jobs registry and a session
    /// factory
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<RunningJobs>,
        factory: Arc<dyn SessionFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            factory,
            policy: RetryPolicy::default(),
            config,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// The running-jobs registry this runner feeds
    pub fn registry(&self) -> Arc<RunningJobs> {
        Arc::clone(&self.registry)
    }

    /// Run one backup start to finish, generating the backup id
    pub async fn run_backup(
        self: &Arc<Self>,
        client_name: &str,
        options: BackupOptions,
        trigger: TriggerOrigin,
    ) -> JobReport {
        let backup_id = generate_backup_id(client_name);
        self.run_with_id(&backup_id, client_name, options, trigger).await
    }

    /// Request cancellation of a running backup. Cancellation is fatal: the
    /// current remote operation is interrupted and no retry happens.
    pub fn cancel(&self, backup_id: &str) -> bool {
        if let Some(handle) = self.cancels.lock().unwrap().get(backup_id) {
            warn!("Cancelling backup {}", backup_id);
            handle.cancel();
            true
        } else {
            false
        }
    }

    /// Run one backup under a caller-chosen id
    #[instrument(skip(self, options))]
    pub async fn run_with_id(
        self: &Arc<Self>,
        backup_id: &str,
        client_name: &str,
        options: BackupOptions,
        trigger: TriggerOrigin,
    ) -> JobReport {
        let requested_kind = options.kind.unwrap_or(BackupKind::Full);

        let client = match self.repo.get_client(client_name).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                error!("❌ Backup refused: unknown client {}", client_name);
                return JobReport::refused(client_name, requested_kind, "unknown client");
            }
            Err(e) => {
                error!("❌ Catalog lookup for {} failed: {}", client_name, e);
                return JobReport::refused(client_name, requested_kind, &e.to_string());
            }
        };
        if !client.active {
            error!("❌ Backup refused: client {} is inactive", client_name);
            return JobReport::refused(client_name, requested_kind, "client is inactive");
        }

        let kind = options.kind.unwrap_or(client.default_kind);
        self.registry.insert(backup_id, client_name, kind, trigger.clone());

        let started_at = Utc::now();
        let record = BackupRecord::pending(backup_id, client_name, kind, started_at);
        if let Err(e) = self.repo.insert_backup(&record).await {
            error!("❌ Could not insert catalog row for {}: {}", backup_id, e);
            self.registry.finish(backup_id, BackupStatus::Failed, "failed: catalog error");
            return JobReport::refused(client_name, kind, &e.to_string());
        }
        self.log_activity("backup_started", &client, backup_id, json!({ "kind": kind, "trigger": trigger }))
            .await;
        if let Err(e) = self.repo.set_backup_status(backup_id, BackupStatus::Running).await {
            warn!("Could not mark {} running: {}", backup_id, e);
        }

        // Incremental needs a reference point; without a prior completed full
        // the job is promoted
        let (kind, reference) = if kind.is_change_based() {
            match self.find_reference(&client).await {
                Some(reference) => (kind, Some(reference)),
                None => {
                    warn!(
                        "No prior full backup for {}, promoting {} to full",
                        client_name, kind
                    );
                    if let Err(e) = self.repo.set_backup_kind(backup_id, BackupKind::Full).await {
                        warn!("Could not record promoted kind for {}: {}", backup_id, e);
                    }
                    self.log_activity(
                        "backup_promoted_to_full",
                        &client,
                        backup_id,
                        json!({ "requested": kind }),
                    )
                    .await;
                    (BackupKind::Full, None)
                }
            }
        } else {
            (kind, None)
        };

        let (cancel_handle, cancel_flag) = CancelFlag::new();
        self.cancels.lock().unwrap().insert(backup_id.to_string(), cancel_handle);

        let result = self.drive(backup_id, &client, options, reference, cancel_flag).await;
        self.cancels.lock().unwrap().remove(backup_id);

        match result {
            Ok(outcome) => {
                let completed_at = outcome.completed_at;
                let path = outcome.archive_path.as_ref().map(|p| p.display().to_string());
                // A catalog hiccup here must not undo a finished archive; the
                // sweeper reconciles later
                if let Err(e) = self
                    .repo
                    .complete_backup(
                        backup_id,
                        completed_at,
                        outcome.size_mb,
                        outcome.counters.files_transferred,
                        path.as_deref(),
                        &outcome.metadata,
                    )
                    .await
                {
                    error!("❌ Final catalog update for {} failed: {}", backup_id, e);
                }
                if outcome.counters.bytes_transferred > 0 {
                    let stats = NetworkStats::from_transfer(
                        backup_id,
                        outcome.counters.bytes_transferred,
                        outcome.counters.files_transferred,
                        outcome.started_at,
                        completed_at,
                    );
                    if let Err(e) = self.repo.insert_network_stats(&stats).await {
                        warn!("Could not persist network stats for {}: {}", backup_id, e);
                    }
                }
                self.log_activity(
                    "backup_completed",
                    &client,
                    backup_id,
                    json!({
                        "size_mb": outcome.size_mb,
                        "files": outcome.counters.files_transferred,
                    }),
                )
                .await;
                self.registry.finish(backup_id, BackupStatus::Completed, "completed");
                info!(
                    "✅ Backup {} of {} completed ({:.1} MB, {} files)",
                    backup_id, client_name, outcome.size_mb, outcome.counters.files_transferred
                );
                JobReport {
                    client_name: client_name.to_string(),
                    backup_id: backup_id.to_string(),
                    kind,
                    success: true,
                    error: None,
                    size_mb: outcome.size_mb,
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(db_err) = self.repo.fail_backup(backup_id, Utc::now(), &message).await {
                    error!("❌ Could not mark {} failed: {}", backup_id, db_err);
                }
                self.log_activity("backup_failed", &client, backup_id, json!({ "error": message }))
                    .await;
                self.registry
                    .finish(backup_id, BackupStatus::Failed, &format!("failed: {message}"));
                error!("❌ Backup {} of {} failed: {}", backup_id, client_name, message);
                JobReport {
                    client_name: client_name.to_string(),
                    backup_id: backup_id.to_string(),
                    kind,
                    success: false,
                    error: Some(message),
                    size_mb: 0.0,
                }
            }
        }
    }

    /// Build a fresh driver and run it under the backup-level retry budget.
    /// Every attempt re-enters the driver's first phase.
    async fn drive(
        &self,
        backup_id: &str,
        client: &Client,
        options: BackupOptions,
        reference: Option<DateTime<Utc>>,
        cancel: CancelFlag,
    ) -> Result<crate::drivers::BackupOutcome> {
        let registry = Arc::clone(&self.registry);
        let progress_id = backup_id.to_string();
        // The driver reports phases; the registry serializes and clamps them
        let sink: ProgressSink = Arc::new(move |phase, pct| {
            registry.update(&progress_id, phase, pct);
        });

        let attempts = AtomicU32::new(0);
        self.policy
            .retry_backup("backup", || {
                let ctx = BackupContext {
                    backup_id: backup_id.to_string(),
                    client: client.clone(),
                    archive_root: self.config.backup_path.clone(),
                    folders_override: options.folders.clone(),
                    use_vss: self.config.use_vss,
                    create_image: options.create_image,
                    env_create_image: self.config.create_system_image,
                };
                let factory = Arc::clone(&self.factory);
                let sink = Arc::clone(&sink);
                let cancel = cancel.clone();
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt > 0 {
                    self.registry.reset(backup_id, "retrying from first phase");
                }
                async move {
                    let mut driver: Box<dyn BackupDriver> = match ctx.client.os {
                        efc_core::types::OsKind::Linux => {
                            Box::new(LinuxDriver::new(ctx, factory, sink, cancel))
                        }
                        efc_core::types::OsKind::Windows => {
                            Box::new(WindowsDriver::new(ctx, factory, sink, cancel))
                        }
                    };
                    let result = async {
                        driver.connect().await?;
                        match reference {
                            Some(reference) => driver.perform_incremental_backup(reference).await,
                            None => driver.perform_full_backup().await,
                        }
                    }
                    .await;
                    // sessions are released on every exit path
                    driver.disconnect().await;
                    result
                }
            })
            .await
    }

    /// Reference point for an incremental: the most recent completed full in
    /// the catalog, else the newest full metadata document under the archive
    /// root
    async fn find_reference(&self, client: &Client) -> Option<DateTime<Utc>> {
        match self.repo.latest_completed_full(&client.name).await {
            Ok(Some(record)) => return Some(record.started_at),
            Ok(None) => {}
            Err(e) => warn!("Catalog scan for prior full failed: {}", e),
        }
        scan_disk_for_full(&self.config.backup_path, &client.name)
    }

    async fn log_activity(
        &self,
        action: &str,
        client: &Client,
        backup_id: &str,
        details: serde_json::Value,
    ) {
        let entry = efc_core::types::ActivityEntry {
            action: action.to_string(),
            client_name: Some(client.name.clone()),
            backup_id: Some(backup_id.to_string()),
            actor: "engine".to_string(),
            details,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.repo.append_activity(&entry).await {
            warn!("Could not append activity entry: {}", e);
        }
    }
}

/// Walk the archive root for `backup_<client>_*` trees and read each
/// candidate's metadata document, returning the newest full backup timestamp
fn scan_disk_for_full(archive_root: &Path, client: &str) -> Option<DateTime<Utc>> {
    let prefix = format!("backup_{client}_");
    let mut newest: Option<DateTime<Utc>> = None;
    let entries = std::fs::read_dir(archive_root).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&prefix) || !entry.path().is_dir() {
            continue;
        }
        let metadata_path = entry.path().join("backup_metadata.json");
        let Ok(raw) = std::fs::read(&metadata_path) else { continue };
        let Ok(doc) = serde_json::from_slice::<serde_json::Value>(&raw) else { continue };
        if doc.get("type").and_then(|t| t.as_str()) != Some("full") {
            continue;
        }
        if let Some(ts) = doc
            .get("timestamp")
            .and_then(|t| t.as_str())
            .and_then(|t| parse_timestamp(t).ok())
        {
            newest = Some(newest.map_or(ts, |n: DateTime<Utc>| n.max(ts)));
        }
    }
    newest
}
