//! Configuration for the EFC backup orchestrator
//!
//! Settings are layered figment-style: compiled defaults, then an optional
//! TOML file, then environment variables. The environment knob names are
//! stable operator interface and are recognized verbatim.

use std::path::PathBuf;

use chrono_tz::Tz;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use efc_common::{BackupError, Result};

/// Environment variables recognized by [`EngineConfig::load`]. Names are
/// stable; each maps onto the field of the same (lowercased) name.
const ENV_KNOBS: &[&str] = &[
    "DAILY_BACKUP_TIME",
    "WEEKLY_BACKUP_DAY",
    "WEEKLY_BACKUP_TIME",
    "MONTHLY_BACKUP_DAY",
    "MONTHLY_BACKUP_TIME",
    "MAX_PARALLEL_BACKUPS",
    "RETENTION_DAYS",
    "BACKUP_PATH",
    "USE_VSS",
    "CREATE_SYSTEM_IMAGE",
    "TIMEZONE",
    "DATABASE_URL",
    "LOG_LEVEL",
    "NOTIFY_ON_SUCCESS",
];

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock time (HH:MM) of the built-in daily incremental schedule
    pub daily_backup_time: String,

    /// Day of week (0 = Sunday) of the built-in weekly full schedule
    pub weekly_backup_day: String,

    /// Wall-clock time (HH:MM) of the built-in weekly full schedule
    pub weekly_backup_time: String,

    /// Day of month of the built-in monthly full schedule
    pub monthly_backup_day: String,

    /// Wall-clock time (HH:MM) of the built-in monthly full schedule
    pub monthly_backup_time: String,

    /// Batch size for concurrent backups
    pub max_parallel_backups: usize,

    /// Retention horizon in days
    pub retention_days: u32,

    /// Permanent archive root
    pub backup_path: PathBuf,

    /// Create a volume-shadow snapshot before Windows backups
    pub use_vss: bool,

    /// Create a system image during Windows full backups unless the caller
    /// decides otherwise
    pub create_system_image: bool,

    /// IANA timezone the cron expressions are evaluated in
    pub timezone: String,

    /// Catalog database URL
    pub database_url: String,

    /// Log level filter for the tracing subscriber
    pub log_level: String,

    /// Notify on successful runs too, not only on failures
    pub notify_on_success: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            daily_backup_time: "02:00".into(),
            weekly_backup_day: "0".into(),
            weekly_backup_time: "03:00".into(),
            monthly_backup_day: "1".into(),
            monthly_backup_time: "04:00".into(),
            max_parallel_backups: 2,
            retention_days: 30,
            backup_path: PathBuf::from("/var/backups/efc-backup"),
            use_vss: true,
            create_system_image: false,
            timezone: "UTC".into(),
            database_url: "sqlite://efc-backup.db".into(),
            log_level: "info".into(),
            notify_on_success: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then `path` (when given), then the
    /// recognized environment knobs.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: EngineConfig = figment
            .merge(Env::raw().only(ENV_KNOBS))
            .extract()
            .map_err(|e| BackupError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backup_path.as_os_str().is_empty() {
            return Err(BackupError::config("backup path cannot be empty"));
        }
        if self.max_parallel_backups == 0 {
            return Err(BackupError::config("max_parallel_backups must be at least 1"));
        }
        if self.retention_days == 0 {
            return Err(BackupError::config("retention_days must be at least 1"));
        }
        for (name, value) in [
            ("daily_backup_time", &self.daily_backup_time),
            ("weekly_backup_time", &self.weekly_backup_time),
            ("monthly_backup_time", &self.monthly_backup_time),
        ] {
            parse_hhmm(value)
                .ok_or_else(|| BackupError::config(format!("{name} is not HH:MM: {value:?}")))?;
        }
        let dow: u8 = self
            .weekly_backup_day
            .parse()
            .map_err(|_| BackupError::config("weekly_backup_day must be 0-6"))?;
        if dow > 6 {
            return Err(BackupError::config("weekly_backup_day must be 0-6"));
        }
        let dom: u8 = self
            .monthly_backup_day
            .parse()
            .map_err(|_| BackupError::config("monthly_backup_day must be 1-28"))?;
        if !(1..=28).contains(&dom) {
            return Err(BackupError::config("monthly_backup_day must be 1-28"));
        }
        self.tz()?;
        Ok(())
    }

    /// Parsed timezone
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| BackupError::config(format!("unknown timezone {:?}", self.timezone)))
    }
}

/// Parse an `HH:MM` wall-clock time
pub fn parse_hhmm(value: &str) -> Option<(u8, u8)> {
    let (h, m) = value.trim().split_once(':')?;
    let h: u8 = h.parse().ok()?;
    let m: u8 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some((h, m))
}
