use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::config::VfsMode;
use crate::dav::{DavClient, RemoteEntry};
use crate::journal::{JournalRecord, SyncJournal};
use crate::queue::AbortFlag;
use crate::scanner::LocalEntry;
use crate::types::{
    Direction, FileKind, Instruction, ItemStatus, PinState, RemotePermissions, SyncFileItem,
};

/// Inputs to one reconciliation pass. Everything is a snapshot; the
/// reconciler itself does no I/O, so identical inputs produce identical
/// plans.
pub struct DiscoveryInput<'a> {
    pub local: &'a BTreeMap<String, LocalEntry>,
    pub remote: &'a BTreeMap<String, RemoteEntry>,
    pub journal: &'a BTreeMap<String, JournalRecord>,
    pub pins: &'a BTreeMap<String, PinState>,
    pub selective_blacklist: &'a [String],
    pub selective_undecided: &'a [String],
    pub case_collisions: &'a [String],
    pub big_folder_threshold: i64,
    pub vfs_mode: VfsMode,
}

#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    /// Ordered plan: one item per path seen in any input stream.
    pub plan: Vec<SyncFileItem>,
    /// New remote directories over the size threshold, for the undecided
    /// list and a user-facing event.
    pub new_big_folders: Vec<String>,
    /// Paths gone on both sides whose journal rows must be purged.
    pub journal_purges: Vec<String>,
}

pub fn reconcile(input: &DiscoveryInput<'_>) -> DiscoveryOutcome {
    let mut outcome = DiscoveryOutcome::default();

    let mut keys: BTreeSet<String> = BTreeSet::new();
    keys.extend(input.local.keys().cloned());
    keys.extend(input.remote.keys().cloned());
    keys.extend(input.journal.keys().cloned());

    let renames = detect_moves(input, &keys);
    let mut consumed: BTreeSet<String> = BTreeSet::new();
    for rename in &renames {
        // The rename carries its whole subtree: child rows move with the
        // journal rename on success and residual differences reconcile on
        // the follow-up run.
        let mut prefixes = vec![rename.path.clone()];
        if let Some(target) = &rename.rename_target {
            prefixes.push(target.clone());
        }
        for key in &keys {
            if under_any(key, &prefixes) {
                consumed.insert(key.clone());
            }
        }
    }

    // Subtrees demoted to ignore: newly discovered big folders plus
    // anything already parked on the undecided list.
    let mut ignored_subtrees: Vec<String> = input.selective_undecided.to_vec();

    let mut plan: Vec<SyncFileItem> = renames;

    for key in &keys {
        if consumed.contains(key) {
            continue;
        }
        if input.case_collisions.contains(key) {
            let mut item = SyncFileItem::new(key.clone(), FileKind::File);
            item.instruction = Instruction::Ignore;
            item.status = ItemStatus::FileIgnored;
            item.error_string = "case clash with another entry; first path wins".to_string();
            plan.push(item);
            continue;
        }
        if under_any(key, &ignored_subtrees) {
            plan.push(ignore_item(key, input));
            continue;
        }
        if under_any(key, input.selective_blacklist) {
            plan.push(selective_exclusion_item(key, input));
            continue;
        }

        let local = input.local.get(key);
        let remote = input.remote.get(key);
        let journal = input.journal.get(key);

        match (local, remote, journal) {
            (None, None, None) => {}
            (None, None, Some(_)) => outcome.journal_purges.push(key.clone()),
            (Some(l), None, None) => plan.push(local_new_item(key, l)),
            (None, Some(r), None) => {
                if r.kind == FileKind::Directory
                    && input.big_folder_threshold > 0
                    && r.dir_size > input.big_folder_threshold
                {
                    outcome.new_big_folders.push(key.clone());
                    ignored_subtrees.push(key.clone());
                    plan.push(ignore_item(key, input));
                    continue;
                }
                plan.push(remote_new_item(key, r, input));
            }
            (Some(l), Some(r), None) => plan.push(both_new_item(key, l, r)),
            (Some(l), None, Some(j)) => plan.push(remote_removed_item(key, l, j)),
            (None, Some(r), Some(j)) => plan.push(local_removed_item(key, r, j)),
            (Some(l), Some(r), Some(j)) => {
                if let Some(item) = all_present_item(key, l, r, j, input) {
                    plan.push(item);
                }
            }
        }
    }

    plan.sort_by(|a, b| {
        phase_rank(a)
            .cmp(&phase_rank(b))
            .then_with(|| match (phase_rank(a), phase_rank(b)) {
                // Removes run children-first.
                (0, 0) => b.path.cmp(&a.path),
                _ => a.path.cmp(&b.path),
            })
    });

    outcome.plan = plan;
    outcome
}

/// Plan execution order: removes, then renames, then directory creation,
/// then transfers, with informational items trailing. Within removes,
/// descendants precede their directories; everywhere else parents sort
/// first lexicographically.
fn phase_rank(item: &SyncFileItem) -> u8 {
    match item.instruction {
        Instruction::Remove => 0,
        Instruction::Rename => 1,
        Instruction::TypeChange => 2,
        Instruction::New | Instruction::UpdateMetadata if item.kind == FileKind::Directory => 3,
        Instruction::New
        | Instruction::Sync
        | Instruction::Conflict
        | Instruction::UpdateMetadata
        | Instruction::UpdateVfsMetadata => 4,
        Instruction::None | Instruction::Ignore | Instruction::Error => 5,
    }
}

fn under_any(path: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|p| !p.is_empty() && (path == p || path.starts_with(&format!("{p}/"))))
}

fn ignore_item(key: &str, input: &DiscoveryInput<'_>) -> SyncFileItem {
    let kind = input
        .remote
        .get(key)
        .map(|r| r.kind)
        .or_else(|| input.local.get(key).map(|l| l.kind))
        .unwrap_or(FileKind::File);
    let mut item = SyncFileItem::new(key, kind);
    item.instruction = Instruction::Ignore;
    item.status = ItemStatus::FileIgnored;
    item
}

/// Blacklisted prefix: previously synced local copies are removed once;
/// everything else is reported as ignored.
fn selective_exclusion_item(key: &str, input: &DiscoveryInput<'_>) -> SyncFileItem {
    let local = input.local.get(key);
    let journal = input.journal.get(key);
    if let (Some(l), Some(_)) = (local, journal) {
        let mut item = SyncFileItem::new(key, l.kind);
        item.instruction = Instruction::Remove;
        item.direction = Direction::Down;
        return item;
    }
    ignore_item(key, input)
}

fn local_new_item(key: &str, l: &LocalEntry) -> SyncFileItem {
    let mut item = SyncFileItem::new(key, l.kind);
    item.size = l.size;
    item.mtime = l.mtime;
    if l.is_placeholder {
        // An orphan placeholder with no journal row cannot be uploaded.
        item.instruction = Instruction::Ignore;
        item.status = ItemStatus::FileIgnored;
        item.error_string = "placeholder without journal state".to_string();
        return item;
    }
    if l.kind == FileKind::SoftLink {
        item.instruction = Instruction::Ignore;
        item.status = ItemStatus::FileIgnored;
        item.error_string = "symbolic links are not synced".to_string();
        return item;
    }
    item.instruction = Instruction::New;
    item.direction = Direction::Up;
    item
}

fn remote_new_item(key: &str, r: &RemoteEntry, input: &DiscoveryInput<'_>) -> SyncFileItem {
    let mut item = SyncFileItem::new(key, r.kind);
    fill_remote(&mut item, r);
    item.instruction = Instruction::New;
    item.direction = Direction::Down;
    if r.kind == FileKind::File
        && input.vfs_mode == VfsMode::Suffix
        && effective_pin(input.pins, key) != PinState::AlwaysLocal
    {
        // Materialize a placeholder instead of downloading content.
        item.kind = FileKind::VirtualFile;
    }
    item
}

fn both_new_item(key: &str, l: &LocalEntry, r: &RemoteEntry) -> SyncFileItem {
    let mut item = SyncFileItem::new(key, r.kind);
    fill_remote(&mut item, r);
    if l.kind == FileKind::Directory && r.kind == FileKind::Directory {
        // Same directory appeared on both sides; record it and descend.
        item.instruction = Instruction::UpdateMetadata;
        item.direction = Direction::Down;
        return item;
    }
    if l.kind != r.kind {
        item.instruction = Instruction::TypeChange;
        item.direction = Direction::Down;
        return item;
    }
    if l.size == r.size && l.mtime == r.mtime {
        // Equal enough to trust; the journal record is created and any
        // residual difference surfaces through checksums on the next run.
        item.instruction = Instruction::UpdateMetadata;
        item.direction = Direction::Down;
        return item;
    }
    item.instruction = Instruction::Conflict;
    item.direction = Direction::None;
    item.size = r.size;
    item.mtime = r.mtime;
    item
}

fn remote_removed_item(key: &str, l: &LocalEntry, j: &JournalRecord) -> SyncFileItem {
    let mut item = SyncFileItem::new(key, l.kind);
    item.size = l.size;
    item.mtime = l.mtime;
    if !local_changed(l, j) {
        item.instruction = Instruction::Remove;
        item.direction = Direction::Down;
    } else {
        // Remote deleted a file the user modified; keep the local copy and
        // push it back up.
        item.instruction = Instruction::New;
        item.direction = Direction::Up;
        item.status = ItemStatus::Restoration;
    }
    item
}

fn local_removed_item(key: &str, r: &RemoteEntry, j: &JournalRecord) -> SyncFileItem {
    let mut item = SyncFileItem::new(key, r.kind);
    fill_remote(&mut item, r);
    if r.etag == j.etag {
        item.instruction = Instruction::Remove;
        item.direction = Direction::Up;
    } else {
        // The server moved on since we last saw this path; restore it.
        item.instruction = Instruction::New;
        item.direction = Direction::Down;
        item.status = ItemStatus::Restoration;
    }
    item
}

fn all_present_item(
    key: &str,
    l: &LocalEntry,
    r: &RemoteEntry,
    j: &JournalRecord,
    input: &DiscoveryInput<'_>,
) -> Option<SyncFileItem> {
    let mut item = SyncFileItem::new(key, r.kind);
    fill_remote(&mut item, r);

    let local_is_placeholder = l.kind == FileKind::VirtualFile;
    let local_kind_for_compare = if local_is_placeholder {
        FileKind::File
    } else {
        l.kind
    };
    if local_kind_for_compare != r.kind {
        item.instruction = Instruction::TypeChange;
        // The side that changed type wins; the item carries the winning kind.
        if r.kind != j.kind {
            item.direction = Direction::Down;
            item.kind = r.kind;
        } else {
            item.direction = Direction::Up;
            item.kind = l.kind;
        }
        return Some(item);
    }

    let lc = local_changed(l, j);
    let rc = r.etag != j.etag;

    // Pin-driven hydration and dehydration are decided before content
    // changes; metadata-only changes never hydrate a placeholder.
    if input.vfs_mode == VfsMode::Suffix && r.kind == FileKind::File && !lc {
        let pin = effective_pin(input.pins, key);
        if local_is_placeholder && pin == PinState::AlwaysLocal && !rc {
            item.instruction = Instruction::Sync;
            item.direction = Direction::Down;
            item.kind = FileKind::File;
            return Some(item);
        }
        if !local_is_placeholder && pin == PinState::OnlineOnly && !rc {
            item.instruction = Instruction::UpdateVfsMetadata;
            item.direction = Direction::None;
            item.kind = FileKind::VirtualFile;
            return Some(item);
        }
        if local_is_placeholder && rc {
            item.instruction = Instruction::UpdateVfsMetadata;
            item.direction = Direction::Down;
            item.kind = FileKind::VirtualFile;
            return Some(item);
        }
    }

    match (lc, rc) {
        (false, false) => {
            // Journal rows written by uploads carry no permissions yet;
            // only a known permission change is worth an item.
            if !j.remote_perms.is_unknown() && r.perms != j.remote_perms {
                item.instruction = Instruction::UpdateMetadata;
                item.direction = Direction::Down;
                return Some(item);
            }
            None
        }
        (true, false) => {
            item.instruction = Instruction::New;
            item.direction = Direction::Up;
            item.size = l.size;
            item.mtime = l.mtime;
            Some(item)
        }
        (false, true) => {
            if r.kind == FileKind::Directory {
                item.instruction = Instruction::UpdateMetadata;
                item.direction = Direction::Down;
                return Some(item);
            }
            item.instruction = Instruction::New;
            item.direction = Direction::Down;
            Some(item)
        }
        (true, true) => {
            if r.kind == FileKind::Directory {
                item.instruction = Instruction::UpdateMetadata;
                item.direction = Direction::Down;
                return Some(item);
            }
            if let (Some(rc_sum), Some(jc_sum)) = (&r.checksum, &j.checksum) {
                if rc_sum == jc_sum {
                    // Remote content is unchanged despite the new etag;
                    // treat as a plain local edit.
                    item.instruction = Instruction::New;
                    item.direction = Direction::Up;
                    item.size = l.size;
                    item.mtime = l.mtime;
                    return Some(item);
                }
            }
            item.instruction = Instruction::Conflict;
            item.direction = Direction::None;
            Some(item)
        }
    }
}

fn local_changed(l: &LocalEntry, j: &JournalRecord) -> bool {
    if l.kind == FileKind::Directory {
        return false;
    }
    if l.kind == FileKind::VirtualFile {
        // Placeholder contents never change locally.
        return false;
    }
    l.mtime != j.mtime || l.size != j.size
}

fn fill_remote(item: &mut SyncFileItem, r: &RemoteEntry) {
    item.size = r.size;
    item.mtime = r.mtime;
    item.etag = r.etag.clone();
    item.file_id = r.file_id.clone();
    item.remote_perms = r.perms;
    item.checksum = r.checksum.clone();
}

fn effective_pin(pins: &BTreeMap<String, PinState>, path: &str) -> PinState {
    let mut current = path.to_string();
    loop {
        if let Some(state) = pins.get(&current) {
            if *state != PinState::Inherited {
                return *state;
            }
        }
        match current.rsplit_once('/') {
            Some((parent, _)) => current = parent.to_string(),
            None => break,
        }
    }
    pins.get("").copied().unwrap_or(PinState::Unspecified)
}

/// Collapse delete/create pairs that share an identity into renames.
/// Remote moves match by file id; local moves match by inode with
/// unchanged size and mtime. Moves degrade to remove-plus-new when server
/// permissions forbid them.
fn detect_moves(input: &DiscoveryInput<'_>, keys: &BTreeSet<String>) -> Vec<SyncFileItem> {
    let mut renames = Vec::new();

    // Remote side: entry appeared at a new path with a known file id.
    for key in keys {
        let Some(r) = input.remote.get(key) else {
            continue;
        };
        if input.journal.contains_key(key) || r.file_id.is_empty() {
            continue;
        }
        let Some(old) = input
            .journal
            .values()
            .find(|j| j.file_id == r.file_id && j.path != *key)
        else {
            continue;
        };
        // The old path must be gone remotely and unchanged locally.
        if input.remote.contains_key(&old.path) {
            continue;
        }
        let locally_clean = input
            .local
            .get(&old.path)
            .map(|l| !local_changed(l, old))
            .unwrap_or(true);
        if !locally_clean {
            continue;
        }

        let mut item = SyncFileItem::new(old.path.clone(), r.kind);
        fill_remote(&mut item, r);
        item.instruction = Instruction::Rename;
        item.direction = Direction::Down;
        item.rename_target = Some(key.clone());
        renames.push(item);
    }

    // Local side: a new local entry matches a journaled inode whose path
    // vanished locally while the remote stayed put.
    for key in keys {
        let Some(l) = input.local.get(key) else {
            continue;
        };
        if input.journal.contains_key(key)
            || input.remote.contains_key(key)
            || l.inode == 0
            || l.is_placeholder
        {
            continue;
        }
        let Some(old) = input
            .journal
            .values()
            .find(|j| j.inode == l.inode && j.path != *key && j.kind == l.kind)
        else {
            continue;
        };
        if input.local.contains_key(&old.path) {
            continue;
        }
        if l.kind == FileKind::File && (l.size != old.size || l.mtime != old.mtime) {
            continue;
        }
        // Remote must still hold the old path unchanged.
        let Some(r_old) = input.remote.get(&old.path) else {
            continue;
        };
        if r_old.etag != old.etag {
            continue;
        }
        if move_forbidden(input, old, key) {
            continue;
        }

        let mut item = SyncFileItem::new(old.path.clone(), l.kind);
        item.size = l.size;
        item.mtime = l.mtime;
        item.etag = old.etag.clone();
        item.file_id = old.file_id.clone();
        item.remote_perms = old.remote_perms;
        item.instruction = Instruction::Rename;
        item.direction = Direction::Up;
        item.rename_target = Some(key.clone());
        renames.push(item);
    }

    renames.sort_by(|a, b| a.path.cmp(&b.path));
    renames
}

fn move_forbidden(input: &DiscoveryInput<'_>, old: &JournalRecord, target: &str) -> bool {
    if old.remote_perms.forbids(RemotePermissions::RENAME)
        || old.remote_perms.forbids(RemotePermissions::MOVE)
    {
        return true;
    }
    let parent = match target.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    };
    if parent.is_empty() {
        return false;
    }
    let Some(parent_entry) = input.remote.get(&parent) else {
        return false;
    };
    let needed = if old.kind == FileKind::Directory {
        RemotePermissions::ADD_SUBDIRS
    } else {
        RemotePermissions::ADD_FILE
    };
    parent_entry.perms.forbids(needed)
}

/// Build the remote snapshot by walking collections breadth-first.
/// Subtrees whose directory etag still matches the journal and that
/// contain no touched path are served from the journal without a request.
pub async fn remote_snapshot(
    dav: &DavClient,
    journal: &SyncJournal,
    touched: Option<&BTreeSet<String>>,
    abort: &AbortFlag,
) -> Result<BTreeMap<String, RemoteEntry>> {
    let mut out = BTreeMap::new();
    let mut queue: Vec<String> = vec![String::new()];

    while let Some(dir) = queue.pop() {
        if abort.is_aborted() {
            anyhow::bail!("sync aborted");
        }
        let listing = dav.list(&dir).await?;
        for entry in listing.entries {
            if entry.kind == FileKind::Directory {
                let prunable = !subtree_touched(touched, &entry.path)
                    && journal
                        .get(&entry.path)?
                        .map(|j| !j.etag.is_empty() && j.etag == entry.etag)
                        .unwrap_or(false);
                if prunable {
                    out.insert(entry.path.clone(), entry.clone());
                    for (path, record) in journal.iterate(&entry.path)? {
                        if path == entry.path {
                            continue;
                        }
                        out.insert(path.clone(), record_to_remote(&record));
                    }
                    continue;
                }
                queue.push(entry.path.clone());
            }
            out.insert(entry.path.clone(), entry);
        }
    }
    Ok(out)
}

fn subtree_touched(touched: Option<&BTreeSet<String>>, dir: &str) -> bool {
    let Some(touched) = touched else {
        // Full discovery: nothing may be served from the journal by the
        // touched-set rule alone; etag pruning still applies.
        return false;
    };
    touched
        .iter()
        .any(|t| t == dir || t.starts_with(&format!("{dir}/")) || dir.starts_with(&format!("{t}/")))
}

fn record_to_remote(record: &JournalRecord) -> RemoteEntry {
    RemoteEntry {
        path: record.path.clone(),
        kind: if record.kind == FileKind::VirtualFile {
            FileKind::File
        } else {
            record.kind
        },
        size: record.size,
        mtime: record.mtime,
        etag: record.etag.clone(),
        file_id: record.file_id.clone(),
        perms: record.remote_perms,
        is_shared_mount: false,
        checksum: record.checksum.clone(),
        dir_size: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Checksum;

    fn local(path: &str, kind: FileKind, size: i64, mtime: i64, inode: u64) -> LocalEntry {
        LocalEntry {
            path: path.to_string(),
            kind,
            size,
            mtime,
            inode,
            is_placeholder: false,
            pin_state: PinState::Unspecified,
        }
    }

    fn remote(path: &str, kind: FileKind, size: i64, mtime: i64, etag: &str, id: &str) -> RemoteEntry {
        RemoteEntry {
            path: path.to_string(),
            kind,
            size,
            mtime,
            etag: etag.to_string(),
            file_id: id.to_string(),
            perms: RemotePermissions::unknown(),
            is_shared_mount: false,
            checksum: None,
            dir_size: 0,
        }
    }

    fn journal(path: &str, kind: FileKind, size: i64, mtime: i64, etag: &str, id: &str) -> JournalRecord {
        JournalRecord {
            path: path.to_string(),
            inode: 0,
            mtime,
            size,
            kind,
            etag: etag.to_string(),
            file_id: id.to_string(),
            remote_perms: RemotePermissions::unknown(),
            checksum: None,
            content_checksum: String::new(),
            has_dirty_placeholder_metadata: false,
        }
    }

    struct Fixture {
        local: BTreeMap<String, LocalEntry>,
        remote: BTreeMap<String, RemoteEntry>,
        journal: BTreeMap<String, JournalRecord>,
        pins: BTreeMap<String, PinState>,
        blacklist: Vec<String>,
        undecided: Vec<String>,
        collisions: Vec<String>,
        vfs_mode: VfsMode,
        big_folder_threshold: i64,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                local: BTreeMap::new(),
                remote: BTreeMap::new(),
                journal: BTreeMap::new(),
                pins: BTreeMap::new(),
                blacklist: Vec::new(),
                undecided: Vec::new(),
                collisions: Vec::new(),
                vfs_mode: VfsMode::Off,
                big_folder_threshold: 0,
            }
        }

        fn run(&self) -> DiscoveryOutcome {
            reconcile(&DiscoveryInput {
                local: &self.local,
                remote: &self.remote,
                journal: &self.journal,
                pins: &self.pins,
                selective_blacklist: &self.blacklist,
                selective_undecided: &self.undecided,
                case_collisions: &self.collisions,
                big_folder_threshold: self.big_folder_threshold,
                vfs_mode: self.vfs_mode,
            })
        }
    }

    fn find<'a>(plan: &'a [SyncFileItem], path: &str) -> &'a SyncFileItem {
        plan.iter()
            .find(|i| i.path == path)
            .unwrap_or_else(|| panic!("no item for {path}"))
    }

    #[test]
    fn first_sync_downloads_remote_tree_in_order() {
        let mut fx = Fixture::new();
        fx.remote
            .insert("a.txt".into(), remote("a.txt", FileKind::File, 10, 5, "e1", "F1"));
        fx.remote
            .insert("d".into(), remote("d", FileKind::Directory, 0, 5, "ed", "D1"));
        fx.remote
            .insert("d/b.txt".into(), remote("d/b.txt", FileKind::File, 20, 5, "e2", "F2"));

        let outcome = fx.run();
        let paths: Vec<&str> = outcome.plan.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["d", "a.txt", "d/b.txt"]);
        assert!(outcome
            .plan
            .iter()
            .all(|i| i.instruction == Instruction::New && i.direction == Direction::Down));
    }

    #[test]
    fn pure_upload_emits_single_up_item() {
        let mut fx = Fixture::new();
        fx.local
            .insert("x".into(), local("x", FileKind::File, 5, 7, 1));

        let outcome = fx.run();
        assert_eq!(outcome.plan.len(), 1);
        let item = &outcome.plan[0];
        assert_eq!(item.instruction, Instruction::New);
        assert_eq!(item.direction, Direction::Up);
        assert_eq!(item.size, 5);
    }

    #[test]
    fn unchanged_tree_produces_empty_plan() {
        let mut fx = Fixture::new();
        fx.local
            .insert("f".into(), local("f", FileKind::File, 3, 9, 1));
        fx.remote
            .insert("f".into(), remote("f", FileKind::File, 3, 9, "e1", "F1"));
        fx.journal
            .insert("f".into(), journal("f", FileKind::File, 3, 9, "e1", "F1"));

        let outcome = fx.run();
        assert!(outcome.plan.is_empty(), "got {:?}", outcome.plan);
    }

    #[test]
    fn discovery_is_idempotent() {
        let mut fx = Fixture::new();
        fx.local
            .insert("up.txt".into(), local("up.txt", FileKind::File, 5, 7, 1));
        fx.remote
            .insert("down.txt".into(), remote("down.txt", FileKind::File, 9, 2, "e", "F"));
        fx.journal
            .insert("gone".into(), journal("gone", FileKind::File, 1, 1, "x", "G"));

        let a = fx.run();
        let b = fx.run();
        assert_eq!(a.plan, b.plan);
        assert_eq!(a.journal_purges, b.journal_purges);
    }

    #[test]
    fn both_sides_changed_is_a_conflict() {
        let mut fx = Fixture::new();
        fx.local
            .insert("f".into(), local("f", FileKind::File, 4, 20, 1));
        fx.remote
            .insert("f".into(), remote("f", FileKind::File, 6, 21, "e2", "F1"));
        fx.journal
            .insert("f".into(), journal("f", FileKind::File, 3, 9, "e1", "F1"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "f");
        assert_eq!(item.instruction, Instruction::Conflict);
    }

    #[test]
    fn matching_checksums_suppress_false_conflict() {
        let sum = Checksum::parse("MD5:abcd").unwrap();
        let mut fx = Fixture::new();
        fx.local
            .insert("f".into(), local("f", FileKind::File, 4, 20, 1));
        let mut r = remote("f", FileKind::File, 3, 21, "e2", "F1");
        r.checksum = Some(sum.clone());
        fx.remote.insert("f".into(), r);
        let mut j = journal("f", FileKind::File, 3, 9, "e1", "F1");
        j.checksum = Some(sum);
        fx.journal.insert("f".into(), j);

        let outcome = fx.run();
        let item = find(&outcome.plan, "f");
        assert_eq!(item.instruction, Instruction::New);
        assert_eq!(item.direction, Direction::Up);
    }

    #[test]
    fn remote_removal_deletes_clean_local() {
        let mut fx = Fixture::new();
        fx.local
            .insert("f".into(), local("f", FileKind::File, 3, 9, 1));
        fx.journal
            .insert("f".into(), journal("f", FileKind::File, 3, 9, "e1", "F1"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "f");
        assert_eq!(item.instruction, Instruction::Remove);
        assert_eq!(item.direction, Direction::Down);
    }

    #[test]
    fn remote_removal_keeps_dirty_local_and_reuploads() {
        let mut fx = Fixture::new();
        fx.local
            .insert("f".into(), local("f", FileKind::File, 8, 30, 1));
        fx.journal
            .insert("f".into(), journal("f", FileKind::File, 3, 9, "e1", "F1"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "f");
        assert_eq!(item.instruction, Instruction::New);
        assert_eq!(item.direction, Direction::Up);
        assert_eq!(item.status, ItemStatus::Restoration);
    }

    #[test]
    fn local_removal_propagates_when_remote_unchanged() {
        let mut fx = Fixture::new();
        fx.remote
            .insert("f".into(), remote("f", FileKind::File, 3, 9, "e1", "F1"));
        fx.journal
            .insert("f".into(), journal("f", FileKind::File, 3, 9, "e1", "F1"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "f");
        assert_eq!(item.instruction, Instruction::Remove);
        assert_eq!(item.direction, Direction::Up);
    }

    #[test]
    fn local_removal_with_remote_change_restores() {
        let mut fx = Fixture::new();
        fx.remote
            .insert("f".into(), remote("f", FileKind::File, 5, 11, "e2", "F1"));
        fx.journal
            .insert("f".into(), journal("f", FileKind::File, 3, 9, "e1", "F1"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "f");
        assert_eq!(item.instruction, Instruction::New);
        assert_eq!(item.direction, Direction::Down);
        assert_eq!(item.status, ItemStatus::Restoration);
    }

    #[test]
    fn vanished_on_both_sides_purges_journal() {
        let mut fx = Fixture::new();
        fx.journal
            .insert("gone".into(), journal("gone", FileKind::File, 3, 9, "e1", "F1"));

        let outcome = fx.run();
        assert!(outcome.plan.is_empty());
        assert_eq!(outcome.journal_purges, vec!["gone".to_string()]);
    }

    #[test]
    fn remote_move_collapses_to_rename() {
        let mut fx = Fixture::new();
        fx.local
            .insert("old.bin".into(), local("old.bin", FileKind::File, 100, 9, 1));
        fx.remote
            .insert("new.bin".into(), remote("new.bin", FileKind::File, 100, 9, "e1", "F1"));
        fx.journal
            .insert("old.bin".into(), journal("old.bin", FileKind::File, 100, 9, "e1", "F1"));

        let outcome = fx.run();
        assert_eq!(outcome.plan.len(), 1);
        let item = &outcome.plan[0];
        assert_eq!(item.instruction, Instruction::Rename);
        assert_eq!(item.direction, Direction::Down);
        assert_eq!(item.path, "old.bin");
        assert_eq!(item.rename_target.as_deref(), Some("new.bin"));
    }

    #[test]
    fn local_move_collapses_to_rename_without_upload() {
        let mut fx = Fixture::new();
        let mut j = journal("old.bin", FileKind::File, 100, 9, "e1", "F1");
        j.inode = 77;
        fx.journal.insert("old.bin".into(), j);
        fx.remote
            .insert("old.bin".into(), remote("old.bin", FileKind::File, 100, 9, "e1", "F1"));
        fx.local
            .insert("new.bin".into(), local("new.bin", FileKind::File, 100, 9, 77));

        let outcome = fx.run();
        assert_eq!(outcome.plan.len(), 1);
        let item = &outcome.plan[0];
        assert_eq!(item.instruction, Instruction::Rename);
        assert_eq!(item.direction, Direction::Up);
        assert_eq!(item.path, "old.bin");
        assert_eq!(item.rename_target.as_deref(), Some("new.bin"));
    }

    #[test]
    fn forbidden_move_degrades_to_remove_plus_new() {
        let mut fx = Fixture::new();
        let mut j = journal("ro/old.bin", FileKind::File, 100, 9, "e1", "F1");
        j.inode = 77;
        j.remote_perms = RemotePermissions::from_dav_string("S"); // no rename bits
        fx.journal.insert("ro/old.bin".into(), j);
        fx.remote
            .insert("ro/old.bin".into(), remote("ro/old.bin", FileKind::File, 100, 9, "e1", "F1"));
        fx.local
            .insert("ro/new.bin".into(), local("ro/new.bin", FileKind::File, 100, 9, 77));

        let outcome = fx.run();
        let upload = find(&outcome.plan, "ro/new.bin");
        assert_eq!(upload.instruction, Instruction::New);
        assert_eq!(upload.direction, Direction::Up);
        let removal = find(&outcome.plan, "ro/old.bin");
        assert_eq!(removal.instruction, Instruction::Remove);
    }

    #[test]
    fn type_change_wins_for_the_changed_side() {
        let mut fx = Fixture::new();
        fx.local
            .insert("x".into(), local("x", FileKind::File, 3, 9, 1));
        fx.remote
            .insert("x".into(), remote("x", FileKind::Directory, 0, 9, "e2", "F1"));
        fx.journal
            .insert("x".into(), journal("x", FileKind::File, 3, 9, "e1", "F1"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "x");
        assert_eq!(item.instruction, Instruction::TypeChange);
        assert_eq!(item.direction, Direction::Down);
    }

    #[test]
    fn big_new_remote_folder_is_demoted_to_ignore() {
        let mut fx = Fixture::new();
        fx.big_folder_threshold = 1000;
        let mut dir = remote("big", FileKind::Directory, 0, 5, "ed", "D1");
        dir.dir_size = 5000;
        fx.remote.insert("big".into(), dir);
        fx.remote
            .insert("big/huge.bin".into(), remote("big/huge.bin", FileKind::File, 5000, 5, "e1", "F1"));

        let outcome = fx.run();
        assert_eq!(outcome.new_big_folders, vec!["big".to_string()]);
        assert!(outcome
            .plan
            .iter()
            .all(|i| i.instruction == Instruction::Ignore));
    }

    #[test]
    fn selective_blacklist_ignores_and_removes_synced_copies() {
        let mut fx = Fixture::new();
        fx.blacklist.push("big".to_string());
        fx.remote
            .insert("big".into(), remote("big", FileKind::Directory, 0, 5, "ed", "D1"));
        fx.remote
            .insert("big/huge.bin".into(), remote("big/huge.bin", FileKind::File, 10, 5, "e1", "F1"));
        fx.local
            .insert("big".into(), local("big", FileKind::Directory, 0, 5, 2));
        fx.local
            .insert("big/old.bin".into(), local("big/old.bin", FileKind::File, 4, 4, 3));
        fx.journal
            .insert("big".into(), journal("big", FileKind::Directory, 0, 5, "ed", "D1"));
        fx.journal
            .insert("big/old.bin".into(), journal("big/old.bin", FileKind::File, 4, 4, "e0", "F0"));

        let outcome = fx.run();
        let removal = find(&outcome.plan, "big/old.bin");
        assert_eq!(removal.instruction, Instruction::Remove);
        assert_eq!(removal.direction, Direction::Down);
        let ignored = find(&outcome.plan, "big/huge.bin");
        assert_eq!(ignored.instruction, Instruction::Ignore);
    }

    #[test]
    fn plan_orders_removes_before_creates_and_parents_first() {
        let mut fx = Fixture::new();
        // Remote removed a whole tree (delete down, children first)...
        fx.local
            .insert("dead".into(), local("dead", FileKind::Directory, 0, 1, 1));
        fx.local
            .insert("dead/f.txt".into(), local("dead/f.txt", FileKind::File, 1, 1, 2));
        fx.journal
            .insert("dead".into(), journal("dead", FileKind::Directory, 0, 1, "ed", "D0"));
        fx.journal
            .insert("dead/f.txt".into(), journal("dead/f.txt", FileKind::File, 1, 1, "e", "F0"));
        // ...and added a fresh one.
        fx.remote
            .insert("fresh".into(), remote("fresh", FileKind::Directory, 0, 1, "e2", "D2"));
        fx.remote
            .insert("fresh/g.txt".into(), remote("fresh/g.txt", FileKind::File, 1, 1, "e3", "F3"));

        let outcome = fx.run();
        let paths: Vec<&str> = outcome.plan.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["dead/f.txt", "dead", "fresh", "fresh/g.txt"]);
    }

    #[test]
    fn suffix_vfs_creates_placeholders_for_new_remote_files() {
        let mut fx = Fixture::new();
        fx.vfs_mode = VfsMode::Suffix;
        fx.remote
            .insert("movie.mkv".into(), remote("movie.mkv", FileKind::File, 100, 5, "e1", "F1"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "movie.mkv");
        assert_eq!(item.instruction, Instruction::New);
        assert_eq!(item.kind, FileKind::VirtualFile);
    }

    #[test]
    fn always_local_pin_downloads_new_files_fully() {
        let mut fx = Fixture::new();
        fx.vfs_mode = VfsMode::Suffix;
        fx.pins.insert("".into(), PinState::AlwaysLocal);
        fx.remote
            .insert("movie.mkv".into(), remote("movie.mkv", FileKind::File, 100, 5, "e1", "F1"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "movie.mkv");
        assert_eq!(item.kind, FileKind::File);
    }

    #[test]
    fn pinned_placeholder_hydrates_and_remote_change_stays_dehydrated() {
        let mut fx = Fixture::new();
        fx.vfs_mode = VfsMode::Suffix;
        let mut placeholder = local("film.mkv", FileKind::VirtualFile, 100, 5, 1);
        placeholder.is_placeholder = true;
        fx.local.insert("film.mkv".into(), placeholder.clone());
        fx.remote
            .insert("film.mkv".into(), remote("film.mkv", FileKind::File, 100, 5, "e1", "F1"));
        fx.journal
            .insert("film.mkv".into(), journal("film.mkv", FileKind::File, 100, 5, "e1", "F1"));
        fx.pins.insert("film.mkv".into(), PinState::AlwaysLocal);

        let outcome = fx.run();
        let item = find(&outcome.plan, "film.mkv");
        assert_eq!(item.instruction, Instruction::Sync);
        assert_eq!(item.direction, Direction::Down);

        // Same placeholder, no pin, remote content changed: metadata only.
        let mut fx2 = Fixture::new();
        fx2.vfs_mode = VfsMode::Suffix;
        fx2.local.insert("film.mkv".into(), placeholder);
        fx2.remote
            .insert("film.mkv".into(), remote("film.mkv", FileKind::File, 120, 6, "e2", "F1"));
        fx2.journal
            .insert("film.mkv".into(), journal("film.mkv", FileKind::File, 100, 5, "e1", "F1"));
        let outcome2 = fx2.run();
        let item2 = find(&outcome2.plan, "film.mkv");
        assert_eq!(item2.instruction, Instruction::UpdateVfsMetadata);
    }

    #[test]
    fn case_collisions_become_ignored_items() {
        let mut fx = Fixture::new();
        fx.local
            .insert("Readme.md".into(), local("Readme.md", FileKind::File, 1, 1, 1));
        fx.collisions.push("readme.md".to_string());
        fx.remote
            .insert("readme.md".into(), remote("readme.md", FileKind::File, 1, 1, "e", "F"));

        let outcome = fx.run();
        let item = find(&outcome.plan, "readme.md");
        assert_eq!(item.instruction, Instruction::Ignore);
        assert_eq!(item.status, ItemStatus::FileIgnored);
        assert!(item.error_string.contains("case clash"));
    }
}
