//! Copy-tool output parsing
//!
//! The drivers learn what actually moved by parsing the summary output of the
//! remote copy tools: `rsync --stats` on Linux and the robocopy job summary
//! on Windows. Both parsers are tolerant of label variations across tool
//! versions and return zeroed counters when a field is absent.

/// Counters extracted from one copy-tool run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    /// Files actually copied
    pub files_transferred: u64,
    /// Files considered but left alone
    pub files_skipped: u64,
    /// Bytes moved
    pub bytes_transferred: u64,
}

impl TransferCounters {
    /// Merge counters from several folder runs
    pub fn accumulate(&mut self, other: TransferCounters) {
        self.files_transferred += other.files_transferred;
        self.files_skipped += other.files_skipped;
        self.bytes_transferred += other.bytes_transferred;
    }
}

/// Parse `rsync --stats` summary output.
///
/// Recognizes both the modern "Number of regular files transferred" and the
/// older "Number of files transferred" labels; bytes come from "Total
/// transferred file size", falling back to "Total bytes received".
pub fn parse_rsync_stats(output: &str) -> TransferCounters {
    let mut total_files = None;
    let mut transferred = None;
    let mut bytes = None;
    let mut bytes_received = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(value) = labeled_number(line, "Number of regular files transferred:") {
            transferred = Some(value);
        } else if transferred.is_none() {
            if let Some(value) = labeled_number(line, "Number of files transferred:") {
                transferred = Some(value);
            }
        }
        if let Some(value) = labeled_number(line, "Number of files:") {
            total_files = Some(value);
        }
        if let Some(value) = labeled_number(line, "Total transferred file size:") {
            bytes = Some(value);
        }
        if let Some(value) = labeled_number(line, "Total bytes received:") {
            bytes_received = Some(value);
        }
    }

    let files_transferred = transferred.unwrap_or(0);
    TransferCounters {
        files_transferred,
        files_skipped: total_files.unwrap_or(files_transferred).saturating_sub(files_transferred),
        bytes_transferred: bytes.or(bytes_received).unwrap_or(0),
    }
}

/// Parse the robocopy job summary table:
///
/// ```text
///                Total    Copied   Skipped  Mismatch    FAILED    Extras
///     Dirs :        81         3        78         0         0         0
///    Files :       720        23       697         0         0         0
///    Bytes :   1.234 g   456.7 m   790.1 m         0         0         0
/// ```
pub fn parse_robocopy_summary(output: &str) -> TransferCounters {
    let mut counters = TransferCounters::default();
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Files :") {
            let cells = split_robocopy_cells(rest);
            if cells.len() >= 3 {
                counters.files_transferred = cells[1] as u64;
                counters.files_skipped = cells[2] as u64;
            }
        } else if let Some(rest) = line.strip_prefix("Bytes :") {
            let cells = split_robocopy_cells(rest);
            if cells.len() >= 2 {
                counters.bytes_transferred = cells[1] as u64;
            }
        }
    }
    counters
}

fn labeled_number(line: &str, label: &str) -> Option<u64> {
    let rest = line.strip_prefix(label)?.trim();
    let token = rest.split_whitespace().next()?;
    let cleaned: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
    cleaned.parse().ok()
}

/// Robocopy cells are either plain integers or scaled values like "456.7 m".
/// A unit suffix belongs to the preceding number.
fn split_robocopy_cells(rest: &str) -> Vec<f64> {
    let mut cells = Vec::new();
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut i = 0;
    while i < tokens.len() {
        if let Ok(value) = tokens[i].parse::<f64>() {
            let scaled = if i + 1 < tokens.len() {
                match tokens[i + 1].to_ascii_lowercase().as_str() {
                    "k" => {
                        i += 1;
                        value * 1024.0
                    }
                    "m" => {
                        i += 1;
                        value * 1024.0 * 1024.0
                    }
                    "g" => {
                        i += 1;
                        value * 1024.0 * 1024.0 * 1024.0
                    }
                    "t" => {
                        i += 1;
                        value * 1024.0 * 1024.0 * 1024.0 * 1024.0
                    }
                    _ => value,
                }
            } else {
                value
            };
            cells.push(scaled);
        }
        i += 1;
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    const RSYNC_MODERN: &str = "\
Number of files: 1,205 (reg: 1,000, dir: 205)
Number of created files: 14
Number of deleted files: 0
Number of regular files transferred: 23
Total file size: 1,234,567,890 bytes
Total transferred file size: 45,678,901 bytes
Literal data: 45,678,901 bytes
Matched data: 0 bytes
File list size: 32,456
Total bytes sent: 45,734,210
Total bytes received: 1,104
";

    const RSYNC_LEGACY: &str = "\
Number of files: 321
Number of files transferred: 17
Total file size: 99999 bytes
Total bytes sent: 54321
Total bytes received: 4242
";

    const ROBOCOPY: &str = "\
------------------------------------------------------------------------------

               Total    Copied   Skipped  Mismatch    FAILED    Extras
    Dirs :        81         3        78         0         0         0
   Files :       720        23       697         0         0         0
   Bytes :   1.234 g   456.7 m   790.1 m         0         0         0
   Times :   0:00:41   0:00:30                       0:00:00   0:00:10
";

    #[test]
    fn test_parse_rsync_modern() {
        let counters = parse_rsync_stats(RSYNC_MODERN);
        assert_eq!(counters.files_transferred, 23);
        assert_eq!(counters.files_skipped, 1205 - 23);
        assert_eq!(counters.bytes_transferred, 45_678_901);
    }

    #[test]
    fn test_parse_rsync_legacy() {
        let counters = parse_rsync_stats(RSYNC_LEGACY);
        assert_eq!(counters.files_transferred, 17);
        assert_eq!(counters.files_skipped, 321 - 17);
        // no "Total transferred file size" line: falls back to bytes received
        assert_eq!(counters.bytes_transferred, 4242);
    }

    #[test]
    fn test_parse_rsync_empty_run() {
        let counters = parse_rsync_stats("speedup is 1.00\n");
        assert_eq!(counters, TransferCounters::default());
    }

    #[test]
    fn test_parse_robocopy_summary() {
        let counters = parse_robocopy_summary(ROBOCOPY);
        assert_eq!(counters.files_transferred, 23);
        assert_eq!(counters.files_skipped, 697);
        let expected = (456.7 * 1024.0 * 1024.0) as u64;
        assert_eq!(counters.bytes_transferred, expected);
    }

    #[test]
    fn test_parse_robocopy_plain_integers() {
        let output = "   Files :        10         4         6         0         0         0\n   Bytes :      2048      1024      1024         0         0         0\n";
        let counters = parse_robocopy_summary(output);
        assert_eq!(counters.files_transferred, 4);
        assert_eq!(counters.files_skipped, 6);
        assert_eq!(counters.bytes_transferred, 1024);
    }

    #[test]
    fn test_accumulate() {
        let mut total = TransferCounters::default();
        total.accumulate(TransferCounters {
            files_transferred: 3,
            files_skipped: 1,
            bytes_transferred: 100,
        });
        total.accumulate(TransferCounters {
            files_transferred: 2,
            files_skipped: 0,
            bytes_transferred: 50,
        });
        assert_eq!(total.files_transferred, 5);
        assert_eq!(total.files_skipped, 1);
        assert_eq!(total.bytes_transferred, 150);
    }
}
