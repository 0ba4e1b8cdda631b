//! Utility functions for the EFC backup orchestrator
//!
//! Cron expression helpers, the folder configuration parser and small id and
//! timestamp helpers shared across the workspace.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use efc_common::{BackupError, Result};

use crate::config::parse_hhmm;

/// Convert a wall-clock tuple into a standard 5-field cron expression:
/// monthly if `dom` is set, weekly if `dow` is set, else daily.
///
/// `time_to_cron("03:15", Some("0"), None)` yields `15 3 * * 0`;
/// `time_to_cron("04:30", None, Some("1"))` yields `30 4 1 * *`.
pub fn time_to_cron(hhmm: &str, dow: Option<&str>, dom: Option<&str>) -> Result<String> {
    let (h, m) = parse_hhmm(hhmm)
        .ok_or_else(|| BackupError::config(format!("not a HH:MM time: {hhmm:?}")))?;
    let expr = match (dom, dow) {
        (Some(dom), _) => format!("{m} {h} {dom} * *"),
        (None, Some(dow)) => format!("{m} {h} * * {dow}"),
        (None, None) => format!("{m} {h} * * *"),
    };
    Ok(expr)
}

/// Convert a standard 5-field cron expression into a [`cron::Schedule`].
///
/// The `cron` crate wants a seconds field and is picky about numeric
/// days-of-week, so a zero seconds field is prepended and numeric dow values
/// are mapped to names (`0` and `7` both mean Sunday).
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(BackupError::config(format!(
            "cron expression must have 5 fields, got {}: {expr:?}",
            fields.len()
        )));
    }
    let dow = map_dow(fields[4]);
    let six = format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow);
    six.parse::<cron::Schedule>()
        .map_err(|e| BackupError::config(format!("invalid cron expression {expr:?}: {e}")))
}

/// Map numeric day-of-week tokens to names the cron parser accepts on every
/// convention. Lists and ranges are mapped element-wise; `*` passes through.
fn map_dow(field: &str) -> String {
    const NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
    let map_one = |tok: &str| -> String {
        match tok.parse::<usize>() {
            Ok(n) if n <= 7 => NAMES[n % 7].to_string(),
            _ => tok.to_string(),
        }
    };
    field
        .split(',')
        .map(|part| {
            if let Some((a, b)) = part.split_once('-') {
                format!("{}-{}", map_one(a), map_one(b))
            } else {
                map_one(part)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Deserialize)]
struct FolderEntry {
    path: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Parse a client folders field.
///
/// The field historically carries either a JSON array of `{path, enabled}`
/// objects or a comma-separated string; JSON wins when the trimmed value
/// starts with `[`. Disabled entries are dropped.
pub fn parse_folder_config(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        match serde_json::from_str::<Vec<FolderEntry>>(trimmed) {
            Ok(entries) => {
                return entries
                    .into_iter()
                    .filter(|e| e.enabled && !e.path.trim().is_empty())
                    .map(|e| e.path)
                    .collect();
            }
            Err(e) => {
                tracing::warn!("Folder config looks like JSON but failed to parse: {}", e);
                return Vec::new();
            }
        }
    }
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Generate an opaque backup id for a client
pub fn generate_backup_id(client: &str) -> String {
    let fragment = uuid::Uuid::new_v4().simple().to_string();
    format!("backup_{}_{}", client, &fragment[..12])
}

/// Format a timestamp in ISO 8601 / RFC 3339 UTC
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parse an ISO 8601 timestamp back into UTC
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BackupError::config(format!("invalid timestamp {input:?}: {e}")))
}

/// Compact filesystem-safe timestamp used in remote working directory and
/// archive names
pub fn compact_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d-%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use test_log::test;

    #[test]
    fn test_time_to_cron_daily() {
        assert_eq!(time_to_cron("02:00", None, None).unwrap(), "0 2 * * *");
    }

    #[test]
    fn test_time_to_cron_weekly() {
        assert_eq!(time_to_cron("03:15", Some("0"), None).unwrap(), "15 3 * * 0");
    }

    #[test]
    fn test_time_to_cron_monthly() {
        assert_eq!(time_to_cron("04:30", None, Some("1")).unwrap(), "30 4 1 * *");
    }

    #[test]
    fn test_time_to_cron_rejects_garbage() {
        assert!(time_to_cron("99:00", None, None).is_err());
        assert!(time_to_cron("morning", None, None).is_err());
    }

    #[test]
    fn test_cron_round_trip_fires_at_time() {
        // cron(time_to_cron(h:m)) fires at (h, m) every day
        let expr = time_to_cron("02:00", None, None).unwrap();
        let schedule = parse_cron(&expr).unwrap();
        for next in schedule.upcoming(Utc).take(3) {
            assert_eq!(next.hour(), 2);
            assert_eq!(next.minute(), 0);
        }
    }

    #[test]
    fn test_parse_cron_weekly_numeric_dow() {
        use chrono::Datelike;
        let schedule = parse_cron("15 3 * * 0").unwrap();
        for next in schedule.upcoming(Utc).take(3) {
            assert_eq!(next.weekday(), chrono::Weekday::Sun);
            assert_eq!(next.hour(), 3);
            assert_eq!(next.minute(), 15);
        }
        // 7 is Sunday too
        assert!(parse_cron("15 3 * * 7").is_ok());
    }

    #[test]
    fn test_parse_cron_rejects_wrong_arity() {
        assert!(parse_cron("0 2 * *").is_err());
        assert!(parse_cron("0 0 2 * * *").is_err());
    }

    #[test]
    fn test_parse_folder_config_json() {
        let parsed = parse_folder_config(
            r#"[{"path":"/a","enabled":true},{"path":"/b","enabled":false}]"#,
        );
        assert_eq!(parsed, vec!["/a".to_string()]);
    }

    #[test]
    fn test_parse_folder_config_comma_list() {
        assert_eq!(
            parse_folder_config("/a, /b"),
            vec!["/a".to_string(), "/b".to_string()]
        );
    }

    #[test]
    fn test_parse_folder_config_edge_cases() {
        assert!(parse_folder_config("").is_empty());
        assert!(parse_folder_config("   ").is_empty());
        assert!(parse_folder_config("[not json").is_empty());
        // entries without an enabled flag default to enabled
        assert_eq!(parse_folder_config(r#"[{"path":"/a"}]"#), vec!["/a".to_string()]);
    }

    #[test]
    fn test_generate_backup_id() {
        let id1 = generate_backup_id("srv1");
        let id2 = generate_backup_id("srv1");
        assert!(id1.starts_with("backup_srv1_"));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(now)).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());
        assert!(parse_timestamp("not a time").is_err());
    }
}
