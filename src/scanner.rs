use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::excludes::ExcludeEngine;
use crate::journal::SyncJournal;
use crate::types::{FileKind, PinState};
use crate::vfs::Vfs;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntry {
    pub path: String,
    pub kind: FileKind,
    pub size: i64,
    pub mtime: i64,
    pub inode: u64,
    pub is_placeholder: bool,
    pub pin_state: PinState,
}

/// Discovery mode for one run, chosen by the folder loop.
#[derive(Debug, Clone)]
pub enum ScanMode {
    /// Walk the entire tree under the root.
    FilesystemOnly,
    /// Walk only the touched subpaths; everything else is served from the
    /// journal.
    DatabaseAndFilesystem { touched: BTreeSet<String> },
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub entries: BTreeMap<String, LocalEntry>,
    /// Paths that clash with an earlier entry when compared
    /// case-insensitively; the byte-wise first path wins.
    pub case_collisions: Vec<String>,
    /// Directories we could not read.
    pub traversal_denied: Vec<String>,
}

pub fn scan_local(
    root: &Path,
    mode: &ScanMode,
    excludes: &ExcludeEngine,
    vfs: &dyn Vfs,
    journal: &SyncJournal,
) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();

    match mode {
        ScanMode::FilesystemOnly => {
            walk_subtree(root, "", excludes, vfs, journal, &mut outcome)?;
        }
        ScanMode::DatabaseAndFilesystem { touched } => {
            for record in journal.iterate("")?.into_values() {
                outcome.entries.insert(
                    record.path.clone(),
                    LocalEntry {
                        pin_state: journal.effective_pin_state(&record.path)?,
                        path: record.path,
                        kind: record.kind,
                        size: record.size,
                        mtime: record.mtime,
                        inode: record.inode,
                        is_placeholder: record.kind == FileKind::VirtualFile,
                    },
                );
            }
            for prefix in normalize_touched(touched) {
                outcome
                    .entries
                    .retain(|path, _| !is_same_or_under(path, &prefix));
                walk_subtree(root, &prefix, excludes, vfs, journal, &mut outcome)?;
            }
        }
    }

    dedupe_case_collisions(&mut outcome);
    Ok(outcome)
}

/// Collapse touched paths so nested prefixes are walked once.
fn normalize_touched(touched: &BTreeSet<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in touched {
        if out.iter().any(|kept| is_same_or_under(path, kept)) {
            continue;
        }
        out.push(path.clone());
    }
    out
}

fn is_same_or_under(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

fn walk_subtree(
    root: &Path,
    prefix: &str,
    excludes: &ExcludeEngine,
    vfs: &dyn Vfs,
    journal: &SyncJournal,
    outcome: &mut ScanOutcome,
) -> Result<()> {
    let start = if prefix.is_empty() {
        root.to_path_buf()
    } else {
        root.join(prefix)
    };
    if !start.exists() {
        return Ok(());
    }

    let walker = WalkDir::new(&start).follow_links(false).into_iter();
    let mut it = walker.filter_entry(|entry| {
        if entry.depth() == 0 {
            return true;
        }
        let rel = match rel_path(root, entry.path()) {
            Some(rel) => rel,
            None => return false,
        };
        !(entry.file_type().is_dir() && excludes.is_excluded(&rel, true))
    });

    while let Some(next) = it.next() {
        let entry = match next {
            Ok(e) => e,
            Err(err) => {
                if let Some(p) = err.path().and_then(|p| rel_path(root, p)) {
                    outcome.traversal_denied.push(p);
                }
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let Some(rel) = rel_path(root, entry.path()) else {
            continue;
        };

        let ftype = entry.file_type();
        let kind = if ftype.is_symlink() {
            FileKind::SoftLink
        } else if ftype.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };

        // Conflict copies take part in sync (they are uploaded so the
        // divergence reaches the server); every other exclusion skips.
        let class = excludes.classify(&rel, kind == FileKind::Directory);
        if class.is_excluded() && class != crate::excludes::ExcludeClass::ExcludedConflictFile {
            continue;
        }

        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let inode = inode_of(&meta);

        let name = rel.rsplit('/').next().unwrap_or(&rel).to_string();
        if kind == FileKind::File && vfs.is_placeholder_name(&name) {
            // A placeholder represents its underlying remote file.
            let Some(underlying) = vfs.underlying_file_name(&name) else {
                continue;
            };
            let mapped = match rel.rsplit_once('/') {
                Some((dir, _)) => format!("{dir}/{underlying}"),
                None => underlying,
            };
            let size = journal.get(&mapped)?.map(|r| r.size).unwrap_or(0);
            outcome.entries.insert(
                mapped.clone(),
                LocalEntry {
                    pin_state: journal.effective_pin_state(&mapped)?,
                    path: mapped,
                    kind: FileKind::VirtualFile,
                    size,
                    mtime,
                    inode,
                    is_placeholder: true,
                },
            );
            continue;
        }

        let size = if kind == FileKind::File {
            meta.len() as i64
        } else {
            0
        };
        outcome.entries.insert(
            rel.clone(),
            LocalEntry {
                pin_state: journal.effective_pin_state(&rel)?,
                path: rel,
                kind,
                size,
                mtime,
                inode,
                is_placeholder: false,
            },
        );
    }
    Ok(())
}

fn rel_path(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let raw = rel.to_string_lossy().replace('\\', "/");
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Entries differing only by case collapse to the byte-wise first path;
/// the rest are reported as collisions.
fn dedupe_case_collisions(outcome: &mut ScanOutcome) {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut losers: Vec<String> = Vec::new();
    for path in outcome.entries.keys() {
        let folded = path.to_lowercase();
        match seen.get(&folded) {
            None => {
                seen.insert(folded, path.clone());
            }
            Some(_winner) => losers.push(path.clone()),
        }
    }
    for loser in &losers {
        outcome.entries.remove(loser);
    }
    outcome.case_collisions.extend(losers);
}
