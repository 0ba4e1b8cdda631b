//! Backup scheduler
//!
//! Owns the cron entries: three built-ins materialized from configuration
//! (daily incremental, weekly full, monthly full) plus operator-created
//! custom schedules reloaded from the catalog at init. On each fire the
//! scheduler fans the eligible clients out to the job runner in batches of
//! `max_parallel_backups`, awaiting every batch before starting the next, so
//! the number of in-flight jobs never exceeds the configured bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use chrono_tz::Tz;
use tracing::{error, info, instrument, warn};

use efc_common::{BackupError, Result};
use efc_core::config::EngineConfig;
use efc_core::types::{BackupKind, Schedule, ScheduleOrigin, TriggerOrigin};
use efc_core::utils::{generate_backup_id, parse_cron, time_to_cron};
use efc_db::Repository;

use crate::notify::Notifier;
use crate::retention::RetentionSweeper;
use crate::runner::{BackupOptions, JobReport, JobRunner};

/// Aggregate outcome of one batch run
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Schedule name, or `manual`
    pub trigger: String,
    /// Jobs dispatched
    pub total: usize,
    /// Jobs that completed
    pub succeeded: usize,
    /// Jobs that failed
    pub failed: usize,
    /// Per-job reports
    pub jobs: Vec<JobReport>,
}

struct ScheduledEntry {
    schedule: Schedule,
    handle: tokio::task::JoinHandle<()>,
}

/// Cron-driven fan-out of backup jobs
pub struct BackupScheduler {
    repo: Arc<dyn Repository>,
    runner: Arc<JobRunner>,
    config: EngineConfig,
    notifier: Arc<dyn Notifier>,
    sweeper: Option<Arc<RetentionSweeper>>,
    schedules: Mutex<HashMap<String, ScheduledEntry>>,
}

impl BackupScheduler {
    /// Scheduler wired to a catalog, runner and notifier
    pub fn new(
        repo: Arc<dyn Repository>,
        runner: Arc<JobRunner>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
        sweeper: Option<Arc<RetentionSweeper>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            runner,
            config,
            notifier,
            sweeper,
            schedules: Mutex::new(HashMap::new()),
        })
    }

    /// Materialize the built-in schedules from configuration and reload the
    /// active custom schedules from the catalog
    #[instrument(skip(self))]
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        info!("⏰ Initializing backup scheduler");
        for schedule in self.built_in_schedules()? {
            self.register(schedule)?;
        }
        match self.repo.list_schedules(true).await {
            Ok(customs) => {
                for schedule in customs {
                    if let Err(e) = self.register(schedule.clone()) {
                        warn!("Skipping custom schedule {}: {}", schedule.name, e);
                    }
                }
            }
            Err(e) => warn!("Could not load custom schedules: {}", e),
        }
        info!("✅ Scheduler ready with {} schedule(s)", self.schedules.lock().unwrap().len());
        Ok(())
    }

    fn built_in_schedules(&self) -> Result<Vec<Schedule>> {
        let c = &self.config;
        Ok(vec![
            Schedule {
                name: "daily-incremental".into(),
                cron: time_to_cron(&c.daily_backup_time, None, None)?,
                kind: BackupKind::Incremental,
                clients: None,
                description: "Daily incremental backup of all active clients".into(),
                active: true,
                origin: ScheduleOrigin::BuiltIn,
                run_count: 0,
            },
            Schedule {
                name: "weekly-full".into(),
                cron: time_to_cron(&c.weekly_backup_time, Some(&c.weekly_backup_day), None)?,
                kind: BackupKind::Full,
                clients: None,
                description: "Weekly full backup of all active clients".into(),
                active: true,
                origin: ScheduleOrigin::BuiltIn,
                run_count: 0,
            },
            Schedule {
                name: "monthly-full".into(),
                cron: time_to_cron(&c.monthly_backup_time, None, Some(&c.monthly_backup_day))?,
                kind: BackupKind::Full,
                clients: None,
                description: "Monthly full backup of all active clients".into(),
                active: true,
                origin: ScheduleOrigin::BuiltIn,
                run_count: 0,
            },
        ])
    }

    /// Register a cron entry for a schedule. The entry lives until removed or
    /// shutdown.
    fn register(self: &Arc<Self>, schedule: Schedule) -> Result<()> {
        let cron = parse_cron(&schedule.cron)?;
        let tz: Tz = self.config.tz()?;
        let name = schedule.name.clone();

        let mut schedules = self.schedules.lock().unwrap();
        if schedules.contains_key(&name) {
            return Err(BackupError::config(format!("schedule {name:?} already registered")));
        }

        let scheduler = Arc::clone(self);
        let loop_name = name.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&tz);
                let Some(next) = cron.after(&now).next() else {
                    warn!("Schedule {} has no future fire time, stopping", loop_name);
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                scheduler.fire(&loop_name).await;
            }
        });

        info!("⏰ Registered schedule {} ({})", name, schedule.cron);
        schedules.insert(name, ScheduledEntry { schedule, handle });
        Ok(())
    }

    /// One fire of a named schedule: bump the run counter, batch the eligible
    /// clients through the runner, notify, and sweep after a successful
    /// full-kind run
    pub async fn fire(self: &Arc<Self>, name: &str) -> Option<BatchReport> {
        let schedule = {
            let mut schedules = self.schedules.lock().unwrap();
            let entry = schedules.get_mut(name)?;
            entry.schedule.run_count += 1;
            entry.schedule.clone()
        };
        info!("⏰ Schedule {} fired (run {})", name, schedule.run_count);
        if schedule.origin == ScheduleOrigin::Custom {
            if let Err(e) = self.repo.bump_schedule_runs(name).await {
                warn!("Could not persist run counter for {}: {}", name, e);
            }
        }

        let report = self
            .run_batch(
                schedule.clients.clone(),
                schedule.kind,
                TriggerOrigin::Scheduled(name.to_string()),
                name,
            )
            .await;

        self.dispatch_notifications(&report).await;
        if schedule.kind == BackupKind::Full && report.succeeded > 0 {
            self.run_retention_sweep().await;
        }
        Some(report)
    }

    /// Run a one-shot batch identical to a scheduled run
    pub async fn start_manual_backup(
        self: &Arc<Self>,
        clients: Option<Vec<String>>,
        kind: BackupKind,
    ) -> BatchReport {
        let report = self.run_batch(clients, kind, TriggerOrigin::Manual, "manual").await;
        self.dispatch_notifications(&report).await;
        if kind == BackupKind::Full && report.succeeded > 0 {
            self.run_retention_sweep().await;
        }
        report
    }

    /// Start a single client asynchronously, returning the backup id
    /// immediately; live progress is exposed through the running-jobs
    /// registry
    pub async fn start_manual_backup_for_client(
        self: &Arc<Self>,
        client_name: &str,
        options: BackupOptions,
    ) -> Result<String> {
        let client = self
            .repo
            .get_client(client_name)
            .await?
            .ok_or_else(|| BackupError::config(format!("unknown client {client_name:?}")))?;
        if !client.active {
            return Err(BackupError::config(format!("client {client_name:?} is inactive")));
        }

        let backup_id = generate_backup_id(client_name);
        let runner = Arc::clone(&self.runner);
        let id = backup_id.clone();
        let name = client_name.to_string();
        tokio::spawn(async move {
            runner.run_with_id(&id, &name, options, TriggerOrigin::Manual).await;
        });
        Ok(backup_id)
    }

    /// Persist a custom schedule and register its cron entry
    pub async fn add_custom_schedule(self: &Arc<Self>, mut schedule: Schedule) -> Result<()> {
        parse_cron(&schedule.cron)?;
        schedule.origin = ScheduleOrigin::Custom;
        schedule.active = true;
        self.repo.insert_schedule(&schedule).await?;
        self.register(schedule)
    }

    /// Destroy a schedule's cron entry; custom schedules are soft-deleted
    /// from the catalog as well
    pub async fn remove_schedule(self: &Arc<Self>, name: &str) -> Result<()> {
        let entry = self
            .schedules
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| BackupError::config(format!("unknown schedule {name:?}")))?;
        entry.handle.abort();
        if entry.schedule.origin == ScheduleOrigin::Custom {
            self.repo.remove_schedule(name).await?;
        }
        info!("🗑 Removed schedule {}", name);
        Ok(())
    }

    /// Rename is modeled as remove + add
    pub async fn rename_schedule(self: &Arc<Self>, old: &str, new: &str) -> Result<()> {
        let schedule = self
            .schedules
            .lock()
            .unwrap()
            .get(old)
            .map(|e| e.schedule.clone())
            .ok_or_else(|| BackupError::config(format!("unknown schedule {old:?}")))?;
        if schedule.origin != ScheduleOrigin::Custom {
            return Err(BackupError::config("built-in schedules cannot be renamed"));
        }
        self.remove_schedule(old).await?;
        let mut renamed = schedule;
        renamed.name = new.to_string();
        self.add_custom_schedule(renamed).await
    }

    /// Snapshot of every registered schedule with its current run counter
    pub fn schedules(&self) -> Vec<Schedule> {
        let mut all: Vec<Schedule> = self
            .schedules
            .lock()
            .unwrap()
            .values()
            .map(|e| e.schedule.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Abort every cron entry
    pub fn shutdown(&self) {
        let mut schedules = self.schedules.lock().unwrap();
        for (_, entry) in schedules.drain() {
            entry.handle.abort();
        }
        info!("🛑 Scheduler stopped");
    }

    /// Batch the eligible clients through the runner, `max_parallel_backups`
    /// at a time, awaiting each batch before the next
    async fn run_batch(
        self: &Arc<Self>,
        restriction: Option<Vec<String>>,
        kind: BackupKind,
        trigger: TriggerOrigin,
        label: &str,
    ) -> BatchReport {
        let client_names: Vec<String> = match restriction {
            Some(names) => names,
            None => match self.repo.list_clients(true).await {
                Ok(clients) => clients.into_iter().map(|c| c.name).collect(),
                Err(e) => {
                    error!("❌ Could not list clients for batch {}: {}", label, e);
                    Vec::new()
                }
            },
        };

        let mut report = BatchReport {
            trigger: label.to_string(),
            total: client_names.len(),
            ..Default::default()
        };
        let batch_size = self.config.max_parallel_backups.max(1);

        for batch in client_names.chunks(batch_size) {
            let futures: Vec<_> = batch
                .iter()
                .map(|client| {
                    let options = BackupOptions { kind: Some(kind), ..Default::default() };
                    self.runner.run_backup(client, options, trigger.clone())
                })
                .collect();
            for job in futures::future::join_all(futures).await {
                if job.success {
                    report.succeeded += 1;
                } else {
                    report.failed += 1;
                }
                report.jobs.push(job);
            }
        }

        info!(
            "⏰ Batch {} finished: {}/{} succeeded",
            label, report.succeeded, report.total
        );
        report
    }

    async fn dispatch_notifications(&self, report: &BatchReport) {
        if report.failed > 0 || self.config.notify_on_success {
            self.notifier.notify_batch(report).await;
        }
    }

    async fn run_retention_sweep(&self) {
        if let Some(sweeper) = &self.sweeper {
            if let Err(e) = sweeper.sweep().await {
                warn!("Post-backup retention sweep failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{LogNotifier, MockNotifier};
    use crate::registry::RunningJobs;
    use async_trait::async_trait;
    use efc_core::types::{Client, OsKind};
    use efc_db::MemoryRepository;
    use efc_session::scripted::{ok_output, ScriptedSession};
    use efc_session::RemoteSession;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::drivers::SessionFactory;

    fn linux_client(name: &str) -> Client {
        Client {
            name: name.into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "backup".into(),
            secret: "pw".into(),
            os: OsKind::Linux,
            folders: "/etc".into(),
            default_kind: BackupKind::Incremental,
            active: true,
            exclude_dirs: vec![],
            exclude_files: vec![],
        }
    }

    fn scripted() -> Arc<ScriptedSession> {
        Arc::new(ScriptedSession::new(|cmd| {
            if cmd.starts_with("rsync ") {
                return Ok(ok_output(
                    "Number of files: 10\nNumber of regular files transferred: 2\nTotal transferred file size: 2,048 bytes\n",
                ));
            }
            Ok(ok_output(""))
        }))
    }

    /// Factory tracking how many sessions are open concurrently
    struct CountingFactory {
        session: Arc<ScriptedSession>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        async fn open(&self, _client: &Client) -> efc_common::Result<Box<dyn RemoteSession>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            // hold the slot long enough for batch-mates to overlap
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Box::new(Arc::clone(&self.session)))
        }
    }

    struct TestEnv {
        repo: Arc<MemoryRepository>,
        scheduler: Arc<BackupScheduler>,
        _archive: tempfile::TempDir,
    }

    async fn env_with(
        clients: &[&str],
        notifier: Arc<dyn Notifier>,
        factory: Arc<dyn SessionFactory>,
        mutate: impl FnOnce(&mut EngineConfig),
    ) -> TestEnv {
        let archive = tempfile::tempdir().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        for name in clients {
            repo.upsert_client(&linux_client(name)).await.unwrap();
        }
        let mut config = EngineConfig::default();
        config.backup_path = archive.path().to_path_buf();
        mutate(&mut config);
        let registry = Arc::new(RunningJobs::new());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            registry,
            factory,
            config.clone(),
        ));
        let scheduler = BackupScheduler::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            runner,
            config,
            notifier,
            None,
        );
        TestEnv { repo, scheduler, _archive: archive }
    }

    fn fixed_factory() -> Arc<dyn SessionFactory> {
        struct F(Arc<ScriptedSession>);
        #[async_trait]
        impl SessionFactory for F {
            async fn open(&self, _client: &Client) -> efc_common::Result<Box<dyn RemoteSession>> {
                Ok(Box::new(Arc::clone(&self.0)))
            }
        }
        Arc::new(F(scripted()))
    }

    #[tokio::test]
    async fn test_init_registers_built_ins_from_config() {
        let env = env_with(&[], Arc::new(LogNotifier), fixed_factory(), |c| {
            c.daily_backup_time = "01:30".into();
            c.weekly_backup_day = "6".into();
            c.weekly_backup_time = "05:00".into();
            c.monthly_backup_day = "15".into();
            c.monthly_backup_time = "06:45".into();
        })
        .await;
        env.scheduler.init().await.unwrap();

        let schedules = env.scheduler.schedules();
        assert_eq!(schedules.len(), 3);
        let by_name: HashMap<String, Schedule> =
            schedules.into_iter().map(|s| (s.name.clone(), s)).collect();
        assert_eq!(by_name["daily-incremental"].cron, "30 1 * * *");
        assert_eq!(by_name["daily-incremental"].kind, BackupKind::Incremental);
        assert_eq!(by_name["weekly-full"].cron, "0 5 * * 6");
        assert_eq!(by_name["weekly-full"].kind, BackupKind::Full);
        assert_eq!(by_name["monthly-full"].cron, "45 6 15 * *");
        assert_eq!(by_name["monthly-full"].origin, ScheduleOrigin::BuiltIn);
        env.scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_init_reloads_custom_schedules() {
        let env = env_with(&[], Arc::new(LogNotifier), fixed_factory(), |_| {}).await;
        env.repo
            .insert_schedule(&Schedule {
                name: "nightly-opt".into(),
                cron: "30 1 * * *".into(),
                kind: BackupKind::Incremental,
                clients: Some(vec!["srv1".into()]),
                description: String::new(),
                active: true,
                origin: ScheduleOrigin::Custom,
                run_count: 3,
            })
            .await
            .unwrap();
        // inactive customs stay unregistered
        env.repo
            .insert_schedule(&Schedule {
                name: "disabled".into(),
                cron: "0 0 * * *".into(),
                kind: BackupKind::Full,
                clients: None,
                description: String::new(),
                active: false,
                origin: ScheduleOrigin::Custom,
                run_count: 0,
            })
            .await
            .unwrap();

        env.scheduler.init().await.unwrap();
        let names: Vec<String> =
            env.scheduler.schedules().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"nightly-opt".to_string()));
        assert!(!names.contains(&"disabled".to_string()));
        env.scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_batch_respects_max_parallel() {
        let factory = Arc::new(CountingFactory {
            session: scripted(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let env = env_with(
            &["a", "b", "c", "d", "e"],
            Arc::new(LogNotifier),
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
            |c| c.max_parallel_backups = 2,
        )
        .await;

        let report = env
            .scheduler
            .start_manual_backup(None, BackupKind::Full)
            .await;

        assert_eq!(report.total, 5);
        assert_eq!(report.succeeded, 5);
        let peak = factory.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "at most 2 jobs in flight, saw {peak}");
        assert!(peak >= 2, "batch mates should overlap, saw {peak}");
    }

    #[tokio::test]
    async fn test_manual_batch_reports_failures_and_notifies() {
        let mut mock = MockNotifier::new();
        mock.expect_notify_batch()
            .withf(|report: &BatchReport| report.failed == 1 && report.succeeded == 1)
            .times(1)
            .return_const(());
        let env = env_with(&["srv1"], Arc::new(mock), fixed_factory(), |_| {}).await;

        let report = env
            .scheduler
            .start_manual_backup(
                Some(vec!["srv1".into(), "ghost".into()]),
                BackupKind::Full,
            )
            .await;
        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let failed = report.jobs.iter().find(|j| !j.success).unwrap();
        assert_eq!(failed.client_name, "ghost");
    }

    #[tokio::test]
    async fn test_success_notification_only_when_enabled() {
        // disabled: no call expected
        let mut silent = MockNotifier::new();
        silent.expect_notify_batch().times(0);
        let env = env_with(&["srv1"], Arc::new(silent), fixed_factory(), |_| {}).await;
        env.scheduler.start_manual_backup(None, BackupKind::Full).await;

        // enabled: one call
        let mut chatty = MockNotifier::new();
        chatty.expect_notify_batch().times(1).return_const(());
        let env = env_with(&["srv1"], Arc::new(chatty), fixed_factory(), |c| {
            c.notify_on_success = true;
        })
        .await;
        env.scheduler.start_manual_backup(None, BackupKind::Full).await;
    }

    #[tokio::test]
    async fn test_fire_increments_run_counter() {
        let env = env_with(&["srv1"], Arc::new(LogNotifier), fixed_factory(), |_| {}).await;
        env.scheduler
            .add_custom_schedule(Schedule {
                name: "nightly".into(),
                cron: "15 1 * * *".into(),
                kind: BackupKind::Full,
                clients: Some(vec!["srv1".into()]),
                description: String::new(),
                active: true,
                origin: ScheduleOrigin::Custom,
                run_count: 0,
            })
            .await
            .unwrap();

        let report = env.scheduler.fire("nightly").await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.succeeded, 1);

        let in_memory = env.scheduler.schedules();
        let nightly = in_memory.iter().find(|s| s.name == "nightly").unwrap();
        assert_eq!(nightly.run_count, 1);
        // persisted run counter moved too
        let stored = env.repo.list_schedules(true).await.unwrap();
        assert_eq!(stored[0].run_count, 1);

        assert!(env.scheduler.fire("missing").await.is_none());
        env.scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_add_remove_and_rename_schedules() {
        let env = env_with(&[], Arc::new(LogNotifier), fixed_factory(), |_| {}).await;
        env.scheduler.init().await.unwrap();

        env.scheduler
            .add_custom_schedule(Schedule {
                name: "opt-hourly".into(),
                cron: "0 * * * *".into(),
                kind: BackupKind::Incremental,
                clients: None,
                description: "hourly /opt".into(),
                active: true,
                origin: ScheduleOrigin::Custom,
                run_count: 0,
            })
            .await
            .unwrap();
        assert_eq!(env.scheduler.schedules().len(), 4);

        // duplicate names are rejected
        let duplicate = env
            .scheduler
            .add_custom_schedule(Schedule {
                name: "opt-hourly".into(),
                cron: "0 * * * *".into(),
                kind: BackupKind::Incremental,
                clients: None,
                description: String::new(),
                active: true,
                origin: ScheduleOrigin::Custom,
                run_count: 0,
            })
            .await;
        assert!(duplicate.is_err());

        env.scheduler.rename_schedule("opt-hourly", "opt-nightly").await.unwrap();
        let names: Vec<String> =
            env.scheduler.schedules().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"opt-nightly".to_string()));
        assert!(!names.contains(&"opt-hourly".to_string()));

        env.scheduler.remove_schedule("opt-nightly").await.unwrap();
        assert_eq!(env.scheduler.schedules().len(), 3);
        // the catalog row is soft-deleted
        assert!(env.repo.list_schedules(true).await.unwrap().is_empty());

        // built-ins cannot be renamed
        assert!(env.scheduler.rename_schedule("weekly-full", "x").await.is_err());
        env.scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let env = env_with(&[], Arc::new(LogNotifier), fixed_factory(), |_| {}).await;
        let result = env
            .scheduler
            .add_custom_schedule(Schedule {
                name: "broken".into(),
                cron: "not a cron".into(),
                kind: BackupKind::Full,
                clients: None,
                description: String::new(),
                active: true,
                origin: ScheduleOrigin::Custom,
                run_count: 0,
            })
            .await;
        assert!(result.is_err());
        assert!(env.scheduler.schedules().is_empty());
        // nothing persisted either
        assert!(env.repo.list_schedules(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_backup_for_client_returns_id_immediately() {
        let env = env_with(&["srv1"], Arc::new(LogNotifier), fixed_factory(), |_| {}).await;
        let backup_id = env
            .scheduler
            .start_manual_backup_for_client("srv1", BackupOptions::default())
            .await
            .unwrap();
        assert!(backup_id.starts_with("backup_srv1_"));

        // the job completes in the background and lands in the catalog
        let mut status = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(row) = env.repo.get_backup(&backup_id).await.unwrap() {
                if row.status.is_terminal() {
                    status = Some(row.status);
                    break;
                }
            }
        }
        assert_eq!(status, Some(efc_core::types::BackupStatus::Completed));

        // unknown and inactive clients are refused synchronously
        assert!(env
            .scheduler
            .start_manual_backup_for_client("ghost", BackupOptions::default())
            .await
            .is_err());
    }
}
