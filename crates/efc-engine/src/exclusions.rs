//! Exclusion filter
//!
//! Pure producer of OS-specific exclusion rule sets and their serialized
//! forms for the remote copy tools. One set feeds three consumers: robocopy
//! arguments on Windows, rsync arguments on Linux, and find-command
//! predicates for incremental change enumeration. The in-process
//! [`ExclusionSet::should_exclude`] oracle answers the same question for a
//! single path and must agree with the serialized forms.

use regex::Regex;

use efc_core::types::OsKind;

/// Global file-size cap: files above 2 GiB are never backed up
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

const LINUX_DIRS: &[&str] = &[
    "/tmp",
    "/var/tmp",
    "/var/cache",
    "/proc",
    "/sys",
    "/dev",
    "/run",
    "/home/*/.cache",
    "/home/*/.local/share/Trash",
    "/root/.cache",
    "lost+found",
];

const LINUX_FILES: &[&str] = &["*.tmp", "*.temp", "*.swp", "*.swo", "*.log", "*~"];

const WINDOWS_DIRS: &[&str] = &[
    "C:/Users/*/AppData/Local/Temp",
    "C:/Windows/Temp",
    "C:/Users/*/AppData/Local/Microsoft/Windows/INetCache",
    "C:/Users/*/AppData/Local/Google/Chrome/User Data/Default/Cache",
    "C:/Users/*/AppData/Local/Mozilla/Firefox/Profiles",
    "$Recycle.Bin",
    "System Volume Information",
];

const WINDOWS_FILES: &[&str] = &[
    "pagefile.sys",
    "hiberfil.sys",
    "swapfile.sys",
    "*.tmp",
    "*.temp",
    "Thumbs.db",
];

// Large media containers are skipped everywhere
const GLOBAL_FILES: &[&str] = &[
    "*.iso", "*.vmdk", "*.vhd", "*.vhdx", "*.avi", "*.mkv", "*.mp4", "*.mov", "*.wmv",
];

/// An exclusion rule set for one OS
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    /// Directory patterns; `*` matches within one path segment
    pub dir_patterns: Vec<String>,
    /// Filename/extension globs matched against the last path component
    pub file_patterns: Vec<String>,
    /// Maximum file size in bytes
    pub max_file_size: u64,
}

impl ExclusionSet {
    /// Default exclusions for an OS, global rules included
    pub fn for_os(os: OsKind) -> Self {
        let (dirs, files) = match os {
            OsKind::Linux => (LINUX_DIRS, LINUX_FILES),
            OsKind::Windows => (WINDOWS_DIRS, WINDOWS_FILES),
        };
        let mut file_patterns: Vec<String> = files.iter().map(|s| s.to_string()).collect();
        file_patterns.extend(GLOBAL_FILES.iter().map(|s| s.to_string()));
        Self {
            dir_patterns: dirs.iter().map(|s| s.to_string()).collect(),
            file_patterns,
            max_file_size: MAX_FILE_SIZE,
        }
    }

    /// Same set with per-client extra patterns appended
    pub fn with_extra(mut self, extra_dirs: &[String], extra_files: &[String]) -> Self {
        self.dir_patterns.extend(extra_dirs.iter().cloned());
        self.file_patterns.extend(extra_files.iter().cloned());
        self
    }

    /// Robocopy argument form: basename `/XD` list (the tool matches on the
    /// last path segment), one `/XF` clause with every file glob, and the
    /// byte cap.
    pub fn to_robocopy_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut basenames: Vec<String> = Vec::new();
        for pattern in &self.dir_patterns {
            let base = last_segment(pattern);
            if !base.is_empty() && !basenames.iter().any(|b| b == base) {
                basenames.push(base.to_string());
            }
        }
        if !basenames.is_empty() {
            args.push("/XD".to_string());
            args.extend(basenames.into_iter().map(|b| quote_if_spaced(&b)));
        }
        if !self.file_patterns.is_empty() {
            args.push("/XF".to_string());
            args.extend(self.file_patterns.iter().map(|p| quote_if_spaced(p)));
        }
        args.push(format!("/MAX:{}", self.max_file_size));
        args
    }

    /// Rsync argument form: one `--exclude=<pattern>` per rule plus
    /// `--max-size=<N>M`
    pub fn to_rsync_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for pattern in self.dir_patterns.iter().chain(self.file_patterns.iter()) {
            args.push(format!("--exclude={pattern}"));
        }
        args.push(format!("--max-size={}M", self.max_file_size / (1024 * 1024)));
        args
    }

    /// Find-command predicate fragment: negated `-path`/`-name`/`-size`
    /// clauses, ready to splice into a change-enumeration command
    pub fn to_find_predicates(&self) -> String {
        let mut clauses = Vec::new();
        for pattern in &self.dir_patterns {
            clauses.push(format!("! -path '{pattern}' ! -path '{pattern}/*'"));
        }
        for pattern in &self.file_patterns {
            clauses.push(format!("! -name '{pattern}'"));
        }
        clauses.push(format!("! -size +{}c", self.max_file_size));
        clauses.join(" ")
    }

    /// Whether a path is excluded by this set.
    ///
    /// Directory patterns match the path itself or any ancestor; bare
    /// patterns (no `/`) match any single segment. File globs match the last
    /// component only. Matching is case-insensitive since the set serves
    /// Windows tools too; backslashes are normalized away first.
    pub fn should_exclude(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        for pattern in &self.dir_patterns {
            if dir_pattern_matches(pattern, &normalized) {
                return true;
            }
        }
        if let Some(basename) = normalized.rsplit('/').next() {
            for pattern in &self.file_patterns {
                if glob_matches(pattern, basename) {
                    return true;
                }
            }
        }
        false
    }

    /// [`Self::should_exclude`] with the size cap applied as well
    pub fn should_exclude_with_size(&self, path: &str, size: u64) -> bool {
        size > self.max_file_size || self.should_exclude(path)
    }
}

fn last_segment(pattern: &str) -> &str {
    pattern
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(pattern)
}

fn quote_if_spaced(value: &str) -> String {
    if value.contains(' ') {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Translate a glob into an anchored regex. `*` stays within one path
/// segment, `?` matches one character, everything else is escaped literally.
fn glob_to_regex(pattern: &str) -> String {
    let mut rx = String::with_capacity(pattern.len() * 2);
    for ch in pattern.chars() {
        match ch {
            '*' => rx.push_str("[^/]*"),
            '?' => rx.push_str("[^/]"),
            c => rx.push_str(&regex::escape(&c.to_string())),
        }
    }
    rx
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let rx = format!("(?i)^{}$", glob_to_regex(pattern));
    Regex::new(&rx).map(|re| re.is_match(candidate)).unwrap_or(false)
}

fn dir_pattern_matches(pattern: &str, path: &str) -> bool {
    let normalized = pattern.replace('\\', "/");
    let body = glob_to_regex(normalized.trim_end_matches('/'));
    let rx = if normalized.contains('/') {
        // Anchored pattern: the path itself or anything beneath it
        format!("(?i)^{body}(/.*)?$")
    } else {
        // Bare pattern: any path segment
        format!("(?i)(^|/){body}(/|$)")
    };
    Regex::new(&rx).map(|re| re.is_match(path)).unwrap_or(false)
}
