//! Windows backup driver
//!
//! Drives one Windows client (OpenSSH + PowerShell) through the backup state
//! machine: CIM system inventory with a `systeminfo` fallback, volume
//! detection and categorization, optional volume-shadow snapshot, robocopy
//! into a remote working directory (exit codes 0-7 mean success), registry
//! hive export, optional system image, then a recursive SFTP download into a
//! tree-style archive directory. Incremental runs use robocopy `/MAXAGE`,
//! which only understands whole days, so the age is rounded up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use efc_common::{BackupError, Result};
use efc_core::types::{FolderResult, OsKind};
use efc_session::{CommandOutput, RemoteSession};

use crate::exclusions::ExclusionSet;
use crate::retry::RetryPolicy;
use crate::stats::{parse_robocopy_summary, TransferCounters};

use super::{
    detect_out_of_space, folder_slug, BackupContext, BackupDriver, BackupOutcome, CancelFlag,
    ProgressSink, SessionFactory, COMMAND_TIMEOUT, COPY_TIMEOUT,
};

// Robocopy reports success with exit codes 0 through 7
const ROBOCOPY_OK: (i32, i32) = (0, 7);

/// How a detected volume is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCategory {
    /// The volume carrying the operating system
    System,
    /// A fixed data volume
    Data,
    /// A mapped network drive
    Network,
    /// Removable media
    Removable,
}

/// A detected logical volume
#[derive(Debug, Clone)]
pub struct Volume {
    /// Drive letter with colon, e.g. `C:`
    pub device_id: String,
    /// Usage category
    pub category: VolumeCategory,
}

/// Categorize a volume from its drive letter and Win32 drive type
pub fn categorize_volume(device_id: &str, drive_type: u64) -> VolumeCategory {
    match drive_type {
        2 => VolumeCategory::Removable,
        4 => VolumeCategory::Network,
        _ if device_id.eq_ignore_ascii_case("C:") => VolumeCategory::System,
        _ => VolumeCategory::Data,
    }
}

/// Default folders backed up for a volume of the given category
pub fn default_folders_for(volume: &Volume) -> Vec<String> {
    match volume.category {
        VolumeCategory::System => vec![
            format!("{}\\Users", volume.device_id),
            format!("{}\\ProgramData", volume.device_id),
        ],
        VolumeCategory::Data => vec![format!("{}\\", volume.device_id)],
        // network and removable volumes are never backed up by default
        VolumeCategory::Network | VolumeCategory::Removable => Vec::new(),
    }
}

/// Backup driver for Windows clients
pub struct WindowsDriver {
    ctx: BackupContext,
    factory: Arc<dyn SessionFactory>,
    session: Option<Box<dyn RemoteSession>>,
    policy: RetryPolicy,
    progress: ProgressSink,
    cancel: CancelFlag,
    exclusions: ExclusionSet,
}

impl WindowsDriver {
    /// Driver for one job
    pub fn new(
        ctx: BackupContext,
        factory: Arc<dyn SessionFactory>,
        progress: ProgressSink,
        cancel: CancelFlag,
    ) -> Self {
        let exclusions = ExclusionSet::for_os(OsKind::Windows)
            .with_extra(&ctx.client.exclude_dirs, &ctx.client.exclude_files);
        Self {
            ctx,
            factory,
            session: None,
            policy: RetryPolicy::default(),
            progress,
            cancel,
            exclusions,
        }
    }

    fn emit(&self, phase: &str, pct: u8) {
        (self.progress)(phase, pct);
    }

    fn session(&self) -> Result<&dyn RemoteSession> {
        self.session
            .as_deref()
            .ok_or_else(|| BackupError::internal("driver used before connect"))
    }

    async fn exec(
        &self,
        cmd: &str,
        timeout: Duration,
        acceptable: (i32, i32),
    ) -> Result<CommandOutput> {
        let session = self.session()?;
        self.policy
            .retry_ssh("remote command", || {
                session.run_with_exit_range(cmd, timeout, acceptable)
            })
            .await
    }

    /// Run a PowerShell command line
    async fn ps(&self, script: &str, timeout: Duration, acceptable: (i32, i32)) -> Result<CommandOutput> {
        let cmd = format!("powershell -NoProfile -NonInteractive -Command \"{script}\"");
        self.exec(&cmd, timeout, acceptable).await
    }

    /// Best-effort PowerShell: `None` on non-zero exit
    async fn try_ps(&self, script: &str) -> Result<Option<String>> {
        let out = self.ps(script, COMMAND_TIMEOUT, (0, 255)).await?;
        if out.exit_code == 0 && !out.stdout.trim().is_empty() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// System inventory through CIM, falling back to the legacy tool when the
    /// modern shell command fails
    async fn collect_system_info(&self) -> Result<serde_json::Value> {
        let os = self
            .try_ps(
                "Get-CimInstance Win32_OperatingSystem | \
                 Select-Object Caption,Version,BuildNumber,OSArchitecture,TotalVisibleMemorySize | \
                 ConvertTo-Json",
            )
            .await?
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());

        if let Some(os) = os {
            let cpu = self
                .try_ps(
                    "Get-CimInstance Win32_Processor | \
                     Select-Object Name,NumberOfCores,NumberOfLogicalProcessors | ConvertTo-Json",
                )
                .await?
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());
            let adapters = self
                .try_ps(
                    "Get-CimInstance Win32_NetworkAdapterConfiguration -Filter 'IPEnabled=true' | \
                     Select-Object Description,IPAddress,MACAddress | ConvertTo-Json",
                )
                .await?
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());
            return Ok(json!({
                "os": os,
                "cpu": cpu,
                "network_adapters": adapters,
            }));
        }

        warn!("CIM query failed on {}, falling back to systeminfo", self.ctx.client.name);
        let raw = self
            .exec("systeminfo", COMMAND_TIMEOUT, (0, 255))
            .await?
            .stdout;
        Ok(json!({ "raw": raw.trim() }))
    }

    /// Detect volumes: PowerShell first, the legacy tool second, a minimal
    /// safe default last
    async fn detect_volumes(&self) -> Result<Vec<Volume>> {
        if let Some(text) = self
            .try_ps(
                "Get-CimInstance Win32_LogicalDisk | \
                 Select-Object DeviceID,DriveType,Size,FreeSpace | ConvertTo-Json",
            )
            .await?
        {
            if let Some(volumes) = parse_volume_json(&text) {
                return Ok(volumes);
            }
        }

        if let Ok(out) = self
            .exec("wmic logicaldisk get DeviceID,DriveType /format:csv", COMMAND_TIMEOUT, (0, 255))
            .await
        {
            if out.exit_code == 0 {
                let volumes = parse_wmic_csv(&out.stdout);
                if !volumes.is_empty() {
                    return Ok(volumes);
                }
            }
        }

        warn!("Volume detection failed on {}, assuming C: only", self.ctx.client.name);
        Ok(vec![Volume { device_id: "C:".into(), category: VolumeCategory::System }])
    }

    async fn resolve_folders(&self) -> Result<Vec<String>> {
        let candidates = if let Some(folders) = &self.ctx.folders_override {
            folders.clone()
        } else {
            let configured = efc_core::utils::parse_folder_config(&self.ctx.client.folders);
            if !configured.is_empty() {
                configured
            } else {
                let mut defaults = Vec::new();
                for volume in self.detect_volumes().await? {
                    defaults.extend(default_folders_for(&volume));
                }
                defaults
            }
        };

        // Probe each path and drop the absent ones
        let mut folders = Vec::with_capacity(candidates.len());
        for path in candidates {
            let present = self
                .try_ps(&format!("Test-Path -Path '{path}'"))
                .await?
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            if present {
                folders.push(path);
            } else {
                warn!("Folder {} missing on {}, dropping", path, self.ctx.client.name);
            }
        }
        Ok(folders)
    }

    /// Volume-shadow snapshot on the system drive; failure is survivable
    async fn create_shadow(&self) -> Option<String> {
        let out = self
            .exec("vssadmin create shadow /for=C:", COMMAND_TIMEOUT, (0, 255))
            .await
            .ok()?;
        if out.exit_code != 0 {
            warn!("VSS snapshot failed on {}: {}", self.ctx.client.name, out.stderr.trim());
            return None;
        }
        let shadow_id = parse_shadow_id(&out.stdout);
        if let Some(id) = &shadow_id {
            info!("✅ Shadow copy {} created on {}", id, self.ctx.client.name);
        }
        shadow_id
    }

    async fn copy_folder(
        &self,
        folder: &str,
        workdir: &str,
        maxage_days: Option<i64>,
    ) -> Result<(FolderResult, TransferCounters)> {
        let dest = format!("{workdir}\\{}", folder_slug(folder));
        let src = folder.trim_end_matches('\\');
        let mode = match maxage_days {
            Some(days) => format!("/S /MAXAGE:{days}"),
            None => "/MIR".to_string(),
        };
        let cmd = format!(
            "robocopy \"{src}\" \"{dest}\" {mode} /R:2 /W:5 /NP /NFL /NDL {}",
            self.exclusions.to_robocopy_args().join(" ")
        );
        let out = self.exec(&cmd, COPY_TIMEOUT, ROBOCOPY_OK).await?;
        let counters = parse_robocopy_summary(&out.stdout);
        Ok((
            FolderResult::completed(folder, counters.files_transferred, counters.bytes_transferred),
            counters,
        ))
    }

    /// Export the three registry hives into the working directory
    async fn export_registry(&self, workdir: &str) {
        let regdir = format!("{workdir}\\registry");
        if let Err(e) = self
            .ps(
                &format!("New-Item -ItemType Directory -Force -Path '{regdir}' | Out-Null"),
                COMMAND_TIMEOUT,
                (0, 0),
            )
            .await
        {
            warn!("Could not create registry folder on {}: {}", self.ctx.client.name, e);
            return;
        }
        for (hive, file) in [
            ("HKLM\\SOFTWARE", "software.reg"),
            ("HKLM\\SYSTEM", "system.reg"),
            ("HKCU\\SOFTWARE", "user_software.reg"),
        ] {
            let cmd = format!("reg export {hive} \"{regdir}\\{file}\" /y");
            match self.exec(&cmd, COPY_TIMEOUT, (0, 255)).await {
                Ok(out) if out.exit_code == 0 => {
                    debug!("Exported {} on {}", hive, self.ctx.client.name);
                }
                Ok(out) => {
                    warn!(
                        "Registry export of {} failed on {} (exit {})",
                        hive, self.ctx.client.name, out.exit_code
                    );
                }
                Err(e) => {
                    warn!("Registry export of {} failed on {}: {}", hive, self.ctx.client.name, e);
                }
            }
        }
    }

    /// Built-in system image against the backup destination; best-effort
    async fn create_system_image(&self, workdir: &str) -> bool {
        let cmd = format!(
            "wbadmin start backup -backupTarget:\"{workdir}\" -allCritical -quiet"
        );
        match self.exec(&cmd, COPY_TIMEOUT, (0, 255)).await {
            Ok(out) if out.exit_code == 0 => {
                info!("✅ System image created on {}", self.ctx.client.name);
                true
            }
            Ok(out) => {
                warn!(
                    "System image failed on {} (exit {}): {}",
                    self.ctx.client.name,
                    out.exit_code,
                    out.stderr.trim()
                );
                false
            }
            Err(e) => {
                warn!("System image failed on {}: {}", self.ctx.client.name, e);
                false
            }
        }
    }

    async fn run_backup(&mut self, reference: Option<DateTime<Utc>>) -> Result<BackupOutcome> {
        let started_at = Utc::now();
        let is_full = reference.is_none();
        let kind_label = if is_full { "full" } else { "incremental" };
        let client_name = self.ctx.client.name.clone();
        info!("💾 Starting {} backup of {}", kind_label, client_name);

        self.cancel.check()?;
        self.emit("collecting system info", 10);
        let system_info = self.collect_system_info().await?;

        self.cancel.check()?;
        self.emit("resolving folders", 18);
        let folders = self.resolve_folders().await?;

        let temp_root = self
            .try_ps("Write-Output $env:TEMP")
            .await?
            .unwrap_or_else(|| "C:\\Windows\\Temp".to_string());
        let stamp = efc_core::utils::compact_timestamp(started_at);
        let workdir = format!("{temp_root}\\efc-backup-{client_name}-{stamp}");
        self.ps(
            &format!("New-Item -ItemType Directory -Force -Path '{workdir}' | Out-Null"),
            COMMAND_TIMEOUT,
            (0, 0),
        )
        .await?;

        let shadow_id = if self.ctx.use_vss {
            self.emit("creating shadow copy", 22);
            self.create_shadow().await
        } else {
            None
        };

        // robocopy MAXAGE only understands whole days: round the age up so a
        // reference 1 minute ago still captures today's changes
        let maxage_days = reference.map(|r| {
            let seconds = (started_at - r).num_seconds().max(0);
            (seconds + 86_399) / 86_400
        });
        let maxage_days = maxage_days.map(|d| d.max(1));

        let mut folder_results = Vec::with_capacity(folders.len());
        let mut counters = TransferCounters::default();
        let total = folders.len().max(1);
        for (index, folder) in folders.iter().enumerate() {
            self.cancel.check()?;
            let pct = 25 + ((index + 1) * 45 / total) as u8;
            self.emit(&format!("copying {folder}"), pct);
            match self.copy_folder(folder, &workdir, maxage_days).await {
                Ok((result, folder_counters)) => {
                    counters.accumulate(folder_counters);
                    folder_results.push(result);
                }
                Err(BackupError::RemoteCommandFailed { exit, stderr }) => {
                    if let Some(oos) = detect_out_of_space(&stderr, folder) {
                        return Err(oos);
                    }
                    warn!("Folder {} failed on {} (exit {})", folder, client_name, exit);
                    folder_results
                        .push(FolderResult::failed(folder, format!("exit {exit}: {stderr}")));
                }
                Err(e) if e.is_fatal() || e.is_transient() => return Err(e),
                Err(e) => {
                    warn!("Folder {} failed on {}: {}", folder, client_name, e);
                    folder_results.push(FolderResult::failed(folder, e.to_string()));
                }
            }
        }

        self.cancel.check()?;
        self.emit("exporting registry", 75);
        self.export_registry(&workdir).await;

        let image_created = if self.ctx.wants_system_image(is_full) {
            self.emit("creating system image", 80);
            self.create_system_image(&workdir).await
        } else {
            false
        };

        let metadata = json!({
            "backupId": self.ctx.backup_id,
            "clientName": client_name,
            "clientHost": self.ctx.client.host,
            "timestamp": efc_core::utils::format_timestamp(started_at),
            "type": kind_label,
            "folders": folder_results.clone(),
            "systemInfo": system_info.clone(),
            "shadowId": shadow_id,
            "imageCreated": image_created,
        });

        let (archive_path, size_mb) = if counters.files_transferred > 0 {
            self.emit("downloading backup tree", 88);
            std::fs::create_dir_all(&self.ctx.archive_root)?;
            let local_dir = self
                .ctx
                .archive_root
                .join(format!("backup_{}_{}", client_name, started_at.timestamp_millis()));
            let (files, bytes) = self.session()?.download_dir(&workdir, &local_dir).await?;
            debug!("Downloaded {} files ({} bytes) from {}", files, bytes, client_name);

            std::fs::write(
                local_dir.join("system_info.json"),
                serde_json::to_vec_pretty(&system_info)?,
            )?;
            std::fs::write(
                local_dir.join("backup_metadata.json"),
                serde_json::to_vec_pretty(&metadata)?,
            )?;
            (Some(local_dir), bytes as f64 / (1024.0 * 1024.0))
        } else {
            info!("No files copied for {}, skipping download", client_name);
            (None, 0.0)
        };

        self.emit("cleaning up remote directory", 96);
        if let Err(e) = self
            .ps(
                &format!("Remove-Item -Recurse -Force '{workdir}'"),
                COMMAND_TIMEOUT,
                (0, 0),
            )
            .await
        {
            warn!("Could not remove {} on {}: {}", workdir, client_name, e);
        }

        let completed_at = Utc::now();
        self.emit("completed", 100);

        Ok(BackupOutcome {
            counters,
            size_mb,
            archive_path,
            metadata,
            folder_results,
            started_at,
            completed_at,
        })
    }
}

#[async_trait]
impl BackupDriver for WindowsDriver {
    async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        self.emit("connecting", 5);
        let factory = Arc::clone(&self.factory);
        let client = self.ctx.client.clone();
        let session = self
            .policy
            .retry_ssh("connect", || {
                let factory = Arc::clone(&factory);
                let client = client.clone();
                async move { factory.open(&client).await }
            })
            .await?;
        self.session = Some(session);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.close().await;
        }
    }

    async fn get_system_info(&mut self) -> Result<serde_json::Value> {
        self.collect_system_info().await
    }

    async fn perform_full_backup(&mut self) -> Result<BackupOutcome> {
        self.run_backup(None).await
    }

    async fn perform_incremental_backup(
        &mut self,
        reference: DateTime<Utc>,
    ) -> Result<BackupOutcome> {
        self.run_backup(Some(reference)).await
    }
}

/// `ConvertTo-Json` yields a bare object for a single volume and an array
/// otherwise; accept both
fn parse_volume_json(text: &str) -> Option<Vec<Volume>> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let items: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(items) => items,
        object @ serde_json::Value::Object(_) => vec![object],
        _ => return None,
    };
    let mut volumes = Vec::new();
    for item in items {
        let device_id = item.get("DeviceID")?.as_str()?.to_string();
        let drive_type = item.get("DriveType").and_then(|v| v.as_u64()).unwrap_or(3);
        let category = categorize_volume(&device_id, drive_type);
        volumes.push(Volume { device_id, category });
    }
    if volumes.is_empty() {
        None
    } else {
        Some(volumes)
    }
}

fn parse_wmic_csv(text: &str) -> Vec<Volume> {
    let mut volumes = Vec::new();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.trim().split(',').collect();
        // Node,DeviceID,DriveType
        if fields.len() >= 3 {
            let device_id = fields[1].trim();
            if device_id.ends_with(':') {
                let drive_type: u64 = fields[2].trim().parse().unwrap_or(3);
                volumes.push(Volume {
                    device_id: device_id.to_string(),
                    category: categorize_volume(device_id, drive_type),
                });
            }
        }
    }
    volumes
}

/// Pull the GUID out of `vssadmin` output: `Shadow Copy ID: {9f0b5b1a-...}`
fn parse_shadow_id(output: &str) -> Option<String> {
    let idx = output.find("Shadow Copy ID:")?;
    let rest = &output[idx..];
    let start = rest.find('{')?;
    let end = rest.find('}')?;
    Some(rest[start..=end].to_string())
}
