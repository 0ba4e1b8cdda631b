//! Linux backup driver
//!
//! Drives one Linux client through the backup state machine: system
//! inventory, copy-tool provisioning, per-folder rsync into a remote working
//! directory, system configuration capture, archive creation and SFTP
//! download. Incremental runs enumerate changed files with `find -newermt`
//! (precise timestamps, not day granularity) and feed them to rsync in
//! `--files-from` mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use efc_common::{BackupError, Result};
use efc_core::types::{FolderResult, OsKind};
use efc_core::utils::compact_timestamp;
use efc_session::{CommandOutput, RemoteSession};

use crate::exclusions::ExclusionSet;
use crate::retry::RetryPolicy;
use crate::stats::{parse_rsync_stats, TransferCounters};

use super::{
    detect_out_of_space, folder_slug, BackupContext, BackupDriver, BackupOutcome, CancelFlag,
    ProgressSink, SessionFactory, COMMAND_TIMEOUT, COPY_TIMEOUT,
};

/// Folders captured when the client configures none
pub const DEFAULT_FOLDERS: &[&str] = &["/home", "/etc", "/var/www", "/opt"];

const SYSTEM_CONFIG_FILES: &[&str] =
    &["/etc/passwd", "/etc/group", "/etc/fstab", "/etc/hosts", "/etc/crontab"];

/// Backup driver for Linux clients
pub struct LinuxDriver {
    ctx: BackupContext,
    factory: Arc<dyn SessionFactory>,
    session: Option<Box<dyn RemoteSession>>,
    policy: RetryPolicy,
    progress: ProgressSink,
    cancel: CancelFlag,
    exclusions: ExclusionSet,
    rsync_available: bool,
}

impl LinuxDriver {
    /// Driver for one job
    pub fn new(
        ctx: BackupContext,
        factory: Arc<dyn SessionFactory>,
        progress: ProgressSink,
        cancel: CancelFlag,
    ) -> Self {
        let exclusions = ExclusionSet::for_os(OsKind::Linux)
            .with_extra(&ctx.client.exclude_dirs, &ctx.client.exclude_files);
        Self {
            ctx,
            factory,
            session: None,
            policy: RetryPolicy::default(),
            progress,
            cancel,
            exclusions,
            rsync_available: false,
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

    /// Run a command under the SSH retry budget
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

    /// Best-effort command: `None` on non-zero exit instead of an error.
    /// Transport failures still propagate.
    async fn try_exec(&self, cmd: &str) -> Result<Option<String>> {
        let out = self.exec(cmd, COMMAND_TIMEOUT, (0, 255)).await?;
        if out.exit_code == 0 {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    async fn collect_system_info(&self) -> Result<serde_json::Value> {
        let hostname = self.try_exec("hostname").await?;
        let distribution = self
            .try_exec("cat /etc/os-release")
            .await?
            .and_then(|text| {
                text.lines()
                    .find_map(|l| l.strip_prefix("PRETTY_NAME=").map(|v| v.trim_matches('"').to_string()))
            });
        let uptime = self.try_exec("uptime -p").await?;
        let root_fs = self.try_exec("df -P /").await?.and_then(|text| parse_df(&text));
        let memory_mb = self.try_exec("free -m").await?.and_then(|text| parse_free(&text));

        Ok(json!({
            "hostname": hostname,
            "distribution": distribution,
            "uptime": uptime,
            "root_fs": root_fs,
            "memory_mb": memory_mb,
        }))
    }

    /// Make sure rsync exists remotely, installing it through the host's
    /// package manager when possible. Returns false when the driver must fall
    /// back to a plain recursive copy.
    async fn ensure_copy_tool(&self) -> Result<bool> {
        if self
            .exec("command -v rsync", COMMAND_TIMEOUT, (0, 1))
            .await?
            .exit_code
            == 0
        {
            return Ok(true);
        }

        warn!("rsync missing on {}, attempting install", self.ctx.client.name);
        for (manager, install) in [
            ("apt-get", "apt-get install -y rsync"),
            ("dnf", "dnf install -y rsync"),
            ("yum", "yum install -y rsync"),
        ] {
            let probe = self
                .exec(&format!("command -v {manager}"), COMMAND_TIMEOUT, (0, 1))
                .await?;
            if probe.exit_code == 0 {
                let _ = self.exec(install, COPY_TIMEOUT, (0, 255)).await?;
                break;
            }
        }

        if self
            .exec("command -v rsync", COMMAND_TIMEOUT, (0, 1))
            .await?
            .exit_code
            == 0
        {
            info!("✅ Installed rsync on {}", self.ctx.client.name);
            Ok(true)
        } else {
            warn!(
                "Could not install rsync on {}, falling back to plain copy",
                self.ctx.client.name
            );
            Ok(false)
        }
    }

    /// Folder precedence: caller override, then the client configuration,
    /// then the defaults
    fn resolve_folders(&self) -> Vec<String> {
        if let Some(folders) = &self.ctx.folders_override {
            if !folders.is_empty() {
                return folders.clone();
            }
        }
        let configured = efc_core::utils::parse_folder_config(&self.ctx.client.folders);
        if !configured.is_empty() {
            return configured;
        }
        DEFAULT_FOLDERS.iter().map(|s| s.to_string()).collect()
    }

    async fn copy_folder(
        &self,
        folder: &str,
        workdir: &str,
        reference: Option<DateTime<Utc>>,
    ) -> Result<(FolderResult, TransferCounters)> {
        let exists = self
            .exec(&format!("test -d '{folder}'"), COMMAND_TIMEOUT, (0, 1))
            .await?;
        if exists.exit_code != 0 {
            warn!("Folder {} missing on {}, skipping", folder, self.ctx.client.name);
            return Ok((FolderResult::skipped(folder), TransferCounters::default()));
        }

        let slug = folder_slug(folder);
        let dest = format!("{workdir}/{slug}");
        self.exec(&format!("mkdir -p '{dest}'"), COMMAND_TIMEOUT, (0, 0)).await?;

        if !self.rsync_available {
            return self.copy_folder_plain(folder, &dest).await;
        }

        let copy_cmd = if let Some(reference) = reference {
            // Enumerate changes precisely, relativize, then let rsync
            // replay the manifest
            let manifest = format!("{workdir}/.manifest-{slug}");
            let find_cmd = format!(
                "find '{folder}' -type f -newermt '@{}' {} 2>/dev/null | sed 's|^{folder}/||' > '{manifest}'",
                reference.timestamp(),
                self.exclusions.to_find_predicates(),
            );
            self.exec(&find_cmd, COPY_TIMEOUT, (0, 1)).await?;

            let count = self
                .try_exec(&format!("wc -l < '{manifest}'"))
                .await?
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0);
            if count == 0 {
                debug!("No changes in {} since reference", folder);
                return Ok((FolderResult::completed(folder, 0, 0), TransferCounters::default()));
            }
            format!("rsync -a --stats --files-from='{manifest}' '{folder}/' '{dest}/'")
        } else {
            format!(
                "rsync -a --stats {} '{folder}/' '{dest}/'",
                self.exclusions.to_rsync_args().join(" ")
            )
        };

        let out = self.exec(&copy_cmd, COPY_TIMEOUT, (0, 0)).await?;
        let counters = parse_rsync_stats(&out.stdout);
        Ok((
            FolderResult::completed(folder, counters.files_transferred, counters.bytes_transferred),
            counters,
        ))
    }

    /// Fallback when rsync cannot be provisioned: plain recursive copy with
    /// counters gathered afterwards
    async fn copy_folder_plain(
        &self,
        folder: &str,
        dest: &str,
    ) -> Result<(FolderResult, TransferCounters)> {
        self.exec(&format!("cp -a '{folder}/.' '{dest}/'"), COPY_TIMEOUT, (0, 0))
            .await?;
        let files = self
            .try_exec(&format!("find '{dest}' -type f | wc -l"))
            .await?
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let bytes = self
            .try_exec(&format!("du -sb '{dest}' | cut -f1"))
            .await?
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let counters =
            TransferCounters { files_transferred: files, files_skipped: 0, bytes_transferred: bytes };
        Ok((FolderResult::completed(folder, files, bytes), counters))
    }

    /// Curated system configuration and the installed-package inventory
    async fn capture_system_config(&self, workdir: &str) {
        let sysdir = format!("{workdir}/system");
        let copy = format!(
            "mkdir -p '{sysdir}' && cp {} '{sysdir}/' 2>/dev/null || true",
            SYSTEM_CONFIG_FILES.join(" ")
        );
        if let Err(e) = self.exec(&copy, COMMAND_TIMEOUT, (0, 0)).await {
            warn!("System config capture failed on {}: {}", self.ctx.client.name, e);
        }
        let packages = format!(
            "dpkg -l > '{sysdir}/packages.txt' 2>/dev/null || rpm -qa > '{sysdir}/packages.txt' 2>/dev/null || true"
        );
        if let Err(e) = self.exec(&packages, COMMAND_TIMEOUT, (0, 0)).await {
            warn!("Package inventory failed on {}: {}", self.ctx.client.name, e);
        }
    }

    async fn run_backup(&mut self, reference: Option<DateTime<Utc>>) -> Result<BackupOutcome> {
        let started_at = Utc::now();
        let kind_label = if reference.is_some() { "incremental" } else { "full" };
        let client_name = self.ctx.client.name.clone();
        info!("💾 Starting {} backup of {}", kind_label, client_name);

        self.cancel.check()?;
        self.emit("collecting system info", 10);
        let system_info = self.collect_system_info().await?;

        self.cancel.check()?;
        self.emit("preparing remote copy tool", 15);
        self.rsync_available = self.ensure_copy_tool().await?;

        self.emit("resolving folders", 20);
        let folders = self.resolve_folders();
        let stamp = compact_timestamp(started_at);
        let workdir = format!("/tmp/efc-backup-{client_name}-{stamp}");
        // reap working directories orphaned by crashed or cancelled runs;
        // the naming convention makes them safe to match
        let reap = format!(
            "find /tmp -maxdepth 1 -name 'efc-backup-{client_name}-*' -mmin +1440 -exec rm -rf {{}} + 2>/dev/null || true"
        );
        if let Err(e) = self.exec(&reap, COMMAND_TIMEOUT, (0, 0)).await {
            warn!("Orphan reap on {} failed: {}", client_name, e);
        }
        self.exec(&format!("mkdir -p '{workdir}'"), COMMAND_TIMEOUT, (0, 0)).await?;

        let mut folder_results = Vec::with_capacity(folders.len());
        let mut counters = TransferCounters::default();
        let total = folders.len().max(1);
        for (index, folder) in folders.iter().enumerate() {
            self.cancel.check()?;
            let pct = 20 + ((index + 1) * 50 / total) as u8;
            self.emit(&format!("copying {folder}"), pct);
            match self.copy_folder(folder, &workdir, reference).await {
                Ok((result, folder_counters)) => {
                    counters.accumulate(folder_counters);
                    folder_results.push(result);
                }
                // a single folder must not sink the backup, but space
                // exhaustion, cancellation and dead transport must
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
        self.emit("capturing system configuration", 75);
        self.capture_system_config(&workdir).await;

        let (archive_path, size_mb) = if counters.files_transferred > 0 {
            self.emit("creating archive", 85);
            let remote_archive = format!("{workdir}.tar.gz");
            let tar_cmd = format!("tar -czf '{remote_archive}' -C '{workdir}' .");
            match self.exec(&tar_cmd, COPY_TIMEOUT, (0, 0)).await {
                Ok(_) => {}
                Err(BackupError::RemoteCommandFailed { stderr, exit }) => {
                    return Err(detect_out_of_space(&stderr, &remote_archive)
                        .unwrap_or(BackupError::RemoteCommandFailed { stderr, exit }));
                }
                Err(e) => return Err(e),
            }

            self.emit("downloading archive", 90);
            std::fs::create_dir_all(&self.ctx.archive_root)?;
            let local = self
                .ctx
                .archive_root
                .join(format!("efc-backup-{client_name}-{stamp}.tar.gz"));
            let bytes = self.session()?.download_file(&remote_archive, &local).await?;
            let _ = self
                .exec(&format!("rm -f '{remote_archive}'"), COMMAND_TIMEOUT, (0, 0))
                .await;
            info!("✅ Archive {} downloaded ({} bytes)", local.display(), bytes);
            (Some(local), bytes as f64 / (1024.0 * 1024.0))
        } else {
            // Nothing moved: record success with size 0 and no archive
            info!("No files transferred for {}, skipping archive", client_name);
            (None, 0.0)
        };

        self.emit("cleaning up remote directory", 96);
        if let Err(e) = self.exec(&format!("rm -rf '{workdir}'"), COMMAND_TIMEOUT, (0, 0)).await {
            warn!("Could not remove {} on {}: {}", workdir, client_name, e);
        }

        let completed_at = Utc::now();
        let metadata = json!({
            "backupId": self.ctx.backup_id,
            "clientName": client_name,
            "clientHost": self.ctx.client.host,
            "timestamp": efc_core::utils::format_timestamp(started_at),
            "type": kind_label,
            "folders": folder_results.clone(),
            "systemInfo": system_info,
        });
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
impl BackupDriver for LinuxDriver {
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

fn parse_df(output: &str) -> Option<serde_json::Value> {
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    Some(json!({
        "filesystem": fields[0],
        "size_kb": fields[1].parse::<u64>().ok(),
        "used_kb": fields[2].parse::<u64>().ok(),
        "use_percent": fields[4],
    }))
}

fn parse_free(output: &str) -> Option<u64> {
    let line = output.lines().find(|l| l.starts_with("Mem:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use efc_core::types::{BackupKind, Client};
    use efc_session::scripted::{ok_output, ScriptedSession};

    const RSYNC_STATS: &str = "\
Number of files: 120 (reg: 100, dir: 20)
Number of regular files transferred: 12
Total transferred file size: 4,096,000 bytes
Total bytes received: 900
";

    struct FixedFactory(Arc<ScriptedSession>);

    #[async_trait]
    impl SessionFactory for FixedFactory {
        async fn open(&self, _client: &Client) -> Result<Box<dyn RemoteSession>> {
            Ok(Box::new(Arc::clone(&self.0)))
        }
    }

    fn linux_client() -> Client {
        Client {
            name: "srv1".into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "backup".into(),
            secret: "pw".into(),
            os: OsKind::Linux,
            folders: "/etc,/home".into(),
            default_kind: BackupKind::Full,
            active: true,
            exclude_dirs: vec![],
            exclude_files: vec![],
        }
    }

    fn driver_with(
        session: Arc<ScriptedSession>,
        archive_root: &std::path::Path,
    ) -> LinuxDriver {
        let ctx = BackupContext {
            backup_id: "backup_srv1_test".into(),
            client: linux_client(),
            archive_root: archive_root.to_path_buf(),
            folders_override: None,
            use_vss: false,
            create_image: None,
            env_create_image: false,
        };
        LinuxDriver::new(ctx, Arc::new(FixedFactory(session)), super::super::null_progress(), CancelFlag::never())
    }

    fn full_backup_responder(cmd: &str) -> Result<CommandOutput> {
        if cmd.starts_with("rsync ") {
            return Ok(ok_output(RSYNC_STATS));
        }
        if cmd == "hostname" {
            return Ok(ok_output("srv1"));
        }
        if cmd.starts_with("cat /etc/os-release") {
            return Ok(ok_output("NAME=\"Debian\"\nPRETTY_NAME=\"Debian GNU/Linux 12\""));
        }
        if cmd.starts_with("df -P /") {
            return Ok(ok_output(
                "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 1000000 400000 600000 40% /",
            ));
        }
        if cmd.starts_with("free -m") {
            return Ok(ok_output("       total  used  free\nMem: 16000 8000 8000"));
        }
        Ok(ok_output(""))
    }

    #[tokio::test]
    async fn test_full_backup_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(full_backup_responder));
        let mut driver = driver_with(Arc::clone(&session), dir.path());

        driver.connect().await.unwrap();
        let outcome = driver.perform_full_backup().await.unwrap();
        driver.disconnect().await;

        // two folders, each reporting 12 transferred files
        assert_eq!(outcome.counters.files_transferred, 24);
        assert_eq!(outcome.folder_results.len(), 2);
        assert!(outcome.folder_results.iter().all(|f| f.status == "completed"));

        // the archive landed under the archive root with the expected name
        let archive = outcome.archive_path.expect("archive expected");
        assert!(archive.exists());
        let name = archive.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("efc-backup-srv1-"));
        assert!(name.ends_with(".tar.gz"));
        assert!(outcome.size_mb > 0.0);

        // remote artifacts were cleaned up
        let commands = session.commands();
        assert!(commands.iter().any(|c| c.starts_with("tar -czf")));
        assert!(commands.iter().any(|c| c.starts_with("rm -f ")));
        assert!(commands.iter().any(|c| c.starts_with("rm -rf '/tmp/efc-backup-srv1-")));
        assert!(session.is_closed());

        // metadata carries the folder results and system info
        assert_eq!(outcome.metadata["clientName"], "srv1");
        assert_eq!(outcome.metadata["type"], "full");
        assert_eq!(outcome.metadata["systemInfo"]["hostname"], "srv1");
        assert_eq!(
            outcome.metadata["systemInfo"]["distribution"],
            "Debian GNU/Linux 12"
        );
    }

    #[tokio::test]
    async fn test_incremental_with_no_changes_skips_archive() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(|cmd| {
            if cmd.starts_with("wc -l") {
                return Ok(ok_output("0"));
            }
            if cmd.starts_with("rsync ") {
                panic!("rsync must not run when the manifest is empty");
            }
            full_backup_responder(cmd)
        }));
        let mut driver = driver_with(Arc::clone(&session), dir.path());

        driver.connect().await.unwrap();
        let reference = Utc::now() - chrono::Duration::minutes(1);
        let outcome = driver.perform_incremental_backup(reference).await.unwrap();

        assert_eq!(outcome.counters.files_transferred, 0);
        assert!(outcome.archive_path.is_none());
        assert_eq!(outcome.size_mb, 0.0);
        assert!(session.downloads().is_empty(), "no archive download");
        assert!(!session.commands().iter().any(|c| c.starts_with("tar ")));
        // the change enumeration used precise timestamps
        assert!(session.commands().iter().any(|c| c.contains("-newermt '@")));
    }

    #[tokio::test]
    async fn test_folder_failure_does_not_fail_backup() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(|cmd| {
            if cmd.starts_with("rsync ") && cmd.contains("'/etc/'") {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: "rsync: permission denied".into(),
                    exit_code: 23,
                });
            }
            full_backup_responder(cmd)
        }));
        let mut driver = driver_with(Arc::clone(&session), dir.path());

        driver.connect().await.unwrap();
        let outcome = driver.perform_full_backup().await.unwrap();

        let etc = outcome.folder_results.iter().find(|f| f.path == "/etc").unwrap();
        assert_eq!(etc.status, "failed");
        assert!(etc.error.as_deref().unwrap().contains("exit 23"));
        let home = outcome.folder_results.iter().find(|f| f.path == "/home").unwrap();
        assert_eq!(home.status, "completed");
        // the healthy folder still produced an archive
        assert!(outcome.archive_path.is_some());
    }

    #[tokio::test]
    async fn test_out_of_space_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(|cmd| {
            if cmd.starts_with("rsync ") {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: "rsync: write failed: No space left on device (28)".into(),
                    exit_code: 11,
                });
            }
            full_backup_responder(cmd)
        }));
        let mut driver = driver_with(session, dir.path());

        driver.connect().await.unwrap();
        match driver.perform_full_backup().await {
            Err(BackupError::OutOfSpace(_)) => {}
            other => panic!("expected OutOfSpace, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_folder_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(|cmd| {
            if cmd == "test -d '/etc'" {
                return Ok(CommandOutput { exit_code: 1, ..Default::default() });
            }
            full_backup_responder(cmd)
        }));
        let mut driver = driver_with(Arc::clone(&session), dir.path());

        driver.connect().await.unwrap();
        let outcome = driver.perform_full_backup().await.unwrap();
        let etc = outcome.folder_results.iter().find(|f| f.path == "/etc").unwrap();
        assert_eq!(etc.status, "skipped");
        // no copy was attempted for the missing folder
        assert!(!session.commands().iter().any(|c| c.contains("'/etc/'")));
    }

    #[tokio::test]
    async fn test_fallback_plain_copy_when_rsync_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(|cmd| {
            if cmd.starts_with("command -v") {
                // neither rsync nor any package manager exists
                return Ok(CommandOutput { exit_code: 1, ..Default::default() });
            }
            if cmd.starts_with("find ") && cmd.contains("wc -l") {
                return Ok(ok_output("7"));
            }
            if cmd.starts_with("du -sb") {
                return Ok(ok_output("123456"));
            }
            full_backup_responder(cmd)
        }));
        let mut driver = driver_with(Arc::clone(&session), dir.path());

        driver.connect().await.unwrap();
        let outcome = driver.perform_full_backup().await.unwrap();

        assert!(session.commands().iter().any(|c| c.starts_with("cp -a ")));
        assert!(!session.commands().iter().any(|c| c.starts_with("rsync ")));
        assert_eq!(outcome.counters.files_transferred, 14); // 7 per folder
        assert_eq!(outcome.counters.bytes_transferred, 246_912);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backup() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(full_backup_responder));
        let ctx = BackupContext {
            backup_id: "backup_srv1_test".into(),
            client: linux_client(),
            archive_root: dir.path().to_path_buf(),
            folders_override: None,
            use_vss: false,
            create_image: None,
            env_create_image: false,
        };
        let (handle, flag) = CancelFlag::new();
        let mut driver = LinuxDriver::new(
            ctx,
            Arc::new(FixedFactory(session)),
            super::super::null_progress(),
            flag,
        );
        driver.connect().await.unwrap();
        handle.cancel();
        match driver.perform_full_backup().await {
            Err(BackupError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progress_is_emitted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(full_backup_responder));
        let seen: Arc<std::sync::Mutex<Vec<u8>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let progress: ProgressSink = Arc::new(move |_phase, pct| {
            sink_seen.lock().unwrap().push(pct);
        });
        let ctx = BackupContext {
            backup_id: "backup_srv1_test".into(),
            client: linux_client(),
            archive_root: dir.path().to_path_buf(),
            folders_override: None,
            use_vss: false,
            create_image: None,
            env_create_image: false,
        };
        let mut driver =
            LinuxDriver::new(ctx, Arc::new(FixedFactory(session)), progress, CancelFlag::never());
        driver.connect().await.unwrap();
        driver.perform_full_backup().await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress must be monotonic: {seen:?}");
        assert_eq!(seen.iter().filter(|p| **p == 100).count(), 1, "100 exactly once");
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[test]
    fn test_parse_df_and_free() {
        let df = "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 1000 400 600 40% /";
        let parsed = parse_df(df).unwrap();
        assert_eq!(parsed["use_percent"], "40%");
        assert_eq!(parsed["size_kb"], 1000);

        let free = "       total  used  free\nMem: 16000 8000 8000";
        assert_eq!(parse_free(free), Some(16000));
    }
}
