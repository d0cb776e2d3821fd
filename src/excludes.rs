use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Name of the per-root user exclude list.
pub const EXCLUDE_FILE_NAME: &str = ".davsync-exclude.lst";

// Always excluded: our own bookkeeping files.
const SELF_LINES: &[&str] = &[
    ".sync_*.db",
    ".sync_*.db-wal",
    ".sync_*.db-shm",
    ".davsync.log",
    ".davsync-exclude.lst",
    ".davsync.lock",
];

// Excluded but worth retrying later: editors and download managers clean
// these up on their own.
const TRANSIENT_LINES: &[&str] = &[
    "*~",
    "~$*",
    ".#*",
    "*.part",
    "*.crdownload",
    "*.swp",
    ".~lock.*",
    "**/.*.~*",
];

const SYSTEM_LINES: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "Desktop.ini",
    ".Trash-*",
    ".fuse_hidden*",
];

// Windows-reserved device names; unsyncable regardless of platform.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const CONFLICT_MARKER: &str = " (conflicted copy ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeClass {
    NotExcluded,
    /// Temp files; sync may retry later.
    ExcludedTransient,
    ExcludedHidden,
    /// OS-reserved or otherwise unrepresentable names.
    ExcludedInvalidName,
    ExcludedTraversalDenied,
    ExcludedConflictFile,
    /// Matched the system or user pattern list.
    ExcludedPattern,
}

impl ExcludeClass {
    pub fn is_excluded(self) -> bool {
        self != ExcludeClass::NotExcluded
    }
}

/// Compiled matcher over merged system and user exclude patterns. Results
/// are cached for the lifetime of the engine; the folder loop rebuilds it
/// per sync run.
pub struct ExcludeEngine {
    always: Gitignore,
    transient: Gitignore,
    patterns: Gitignore,
    sync_hidden_files: bool,
    cache: Mutex<HashMap<(String, bool), ExcludeClass>>,
}

impl ExcludeEngine {
    pub fn load(root: &Path, sync_hidden_files: bool) -> Result<Self> {
        let always = build_matcher(root, SELF_LINES, &[])?;
        let transient = build_matcher(root, TRANSIENT_LINES, &[])?;

        let user_lines = {
            let path = root.join(EXCLUDE_FILE_NAME);
            if path.exists() {
                read_exclude_file(&path)?
            } else {
                Vec::new()
            }
        };
        let patterns = build_matcher(root, SYSTEM_LINES, &user_lines)?;

        Ok(Self {
            always,
            transient,
            patterns,
            sync_hidden_files,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn classify(&self, rel_path: &str, is_dir: bool) -> ExcludeClass {
        let key = (rel_path.to_string(), is_dir);
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return *hit;
            }
        }
        let class = self.classify_uncached(rel_path, is_dir);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, class);
        }
        class
    }

    pub fn is_excluded(&self, rel_path: &str, is_dir: bool) -> bool {
        self.classify(rel_path, is_dir).is_excluded()
    }

    fn classify_uncached(&self, rel_path: &str, is_dir: bool) -> ExcludeClass {
        let rel = Path::new(rel_path);
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);

        if self
            .always
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
        {
            return ExcludeClass::ExcludedPattern;
        }
        if name.contains(CONFLICT_MARKER) {
            return ExcludeClass::ExcludedConflictFile;
        }
        if self
            .transient
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
        {
            return ExcludeClass::ExcludedTransient;
        }
        if is_invalid_name(name) {
            return ExcludeClass::ExcludedInvalidName;
        }
        if !self.sync_hidden_files && rel_path.split('/').any(|seg| seg.starts_with('.')) {
            return ExcludeClass::ExcludedHidden;
        }
        if self
            .patterns
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
        {
            return ExcludeClass::ExcludedPattern;
        }
        ExcludeClass::NotExcluded
    }
}

fn build_matcher(root: &Path, builtin: &[&str], user: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for line in builtin {
        builder
            .add_line(None, line)
            .with_context(|| format!("add exclude line: {line}"))?;
    }
    for line in user {
        builder
            .add_line(None, line)
            .with_context(|| format!("add user exclude line: {line}"))?;
    }
    builder.build().context("build exclude matcher")
}

fn is_invalid_name(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    let stem = name.split('.').next().unwrap_or(name);
    if RESERVED_NAMES
        .iter()
        .any(|r| stem.eq_ignore_ascii_case(r))
    {
        return true;
    }
    if name.ends_with(' ') || name.ends_with('.') {
        return true;
    }
    name.chars().any(|c| c == '\0' || c == '\\' || c == ':' || c == '|')
}

fn read_exclude_file(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open exclude file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}
