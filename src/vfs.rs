use std::path::Path;

use anyhow::{Context, Result};

use crate::config::VfsMode;
use crate::journal::SyncJournal;
use crate::types::{Availability, FileKind, FileStatus, PinState};

/// Reserved suffix for dehydrated files in suffix mode.
pub const PLACEHOLDER_SUFFIX: &str = ".davfile";

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderMetadata {
    pub size: i64,
    pub mtime: i64,
    pub etag: String,
    pub file_id: String,
}

/// Virtual-file strategy. The suffix strategy is the portable
/// implementation; an OS-native strategy plugs in behind the same trait and
/// lets the platform own placeholder semantics.
pub trait Vfs: Send + Sync {
    fn mode(&self) -> VfsMode;

    fn is_placeholder_name(&self, name: &str) -> bool;

    /// Strip the placeholder mapping; `None` when the name is not a
    /// placeholder.
    fn underlying_file_name(&self, name: &str) -> Option<String>;

    fn placeholder_file_name(&self, name: &str) -> String;

    /// Create (or refresh) a placeholder representing a remote-only file.
    fn materialize_placeholder(
        &self,
        root: &Path,
        rel_path: &str,
        meta: &PlaceholderMetadata,
    ) -> Result<()>;

    /// Request hydration: the next sync run downloads real contents.
    fn hydrate(&self, journal: &mut SyncJournal, rel_path: &str) -> Result<()>;

    /// Replace a hydrated file with a placeholder.
    fn dehydrate(&self, root: &Path, rel_path: &str, meta: &PlaceholderMetadata) -> Result<()>;

    fn pin_state(&self, journal: &SyncJournal, rel_path: &str) -> Result<PinState>;

    fn set_pin_state(
        &self,
        journal: &mut SyncJournal,
        rel_path: &str,
        state: PinState,
    ) -> Result<()>;

    fn availability(&self, journal: &SyncJournal, rel_path: &str) -> Result<Availability>;

    /// Overlay hook; the suffix strategy has nothing to forward to.
    fn on_file_status_changed(&self, _rel_path: &str, _status: FileStatus) {}
}

/// VFS disabled: every remote file is fully hydrated locally.
pub struct OffVfs;

impl Vfs for OffVfs {
    fn mode(&self) -> VfsMode {
        VfsMode::Off
    }

    fn is_placeholder_name(&self, _name: &str) -> bool {
        false
    }

    fn underlying_file_name(&self, _name: &str) -> Option<String> {
        None
    }

    fn placeholder_file_name(&self, name: &str) -> String {
        name.to_string()
    }

    fn materialize_placeholder(
        &self,
        _root: &Path,
        rel_path: &str,
        _meta: &PlaceholderMetadata,
    ) -> Result<()> {
        anyhow::bail!("virtual files are disabled for this root: {rel_path}")
    }

    fn hydrate(&self, _journal: &mut SyncJournal, rel_path: &str) -> Result<()> {
        anyhow::bail!("virtual files are disabled for this root: {rel_path}")
    }

    fn dehydrate(&self, _root: &Path, rel_path: &str, _meta: &PlaceholderMetadata) -> Result<()> {
        anyhow::bail!("virtual files are disabled for this root: {rel_path}")
    }

    fn pin_state(&self, _journal: &SyncJournal, _rel_path: &str) -> Result<PinState> {
        Ok(PinState::AlwaysLocal)
    }

    fn set_pin_state(
        &self,
        _journal: &mut SyncJournal,
        _rel_path: &str,
        _state: PinState,
    ) -> Result<()> {
        Ok(())
    }

    fn availability(&self, _journal: &SyncJournal, _rel_path: &str) -> Result<Availability> {
        Ok(Availability::AllHydrated)
    }
}

/// Remote-only files appear as zero-byte `<name>.davfile` entries; hydration
/// downloads and renames into place. Pin state persists in the journal.
pub struct SuffixVfs;

impl Vfs for SuffixVfs {
    fn mode(&self) -> VfsMode {
        VfsMode::Suffix
    }

    fn is_placeholder_name(&self, name: &str) -> bool {
        name.len() > PLACEHOLDER_SUFFIX.len() && name.ends_with(PLACEHOLDER_SUFFIX)
    }

    fn underlying_file_name(&self, name: &str) -> Option<String> {
        if !self.is_placeholder_name(name) {
            return None;
        }
        Some(name[..name.len() - PLACEHOLDER_SUFFIX.len()].to_string())
    }

    fn placeholder_file_name(&self, name: &str) -> String {
        format!("{name}{PLACEHOLDER_SUFFIX}")
    }

    fn materialize_placeholder(
        &self,
        root: &Path,
        rel_path: &str,
        _meta: &PlaceholderMetadata,
    ) -> Result<()> {
        let abs = root.join(self.placeholder_file_name(rel_path));
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&abs, b"").with_context(|| format!("write {}", abs.display()))?;
        Ok(())
    }

    fn hydrate(&self, journal: &mut SyncJournal, rel_path: &str) -> Result<()> {
        journal.set_pin_state(rel_path, PinState::AlwaysLocal)
    }

    fn dehydrate(&self, root: &Path, rel_path: &str, meta: &PlaceholderMetadata) -> Result<()> {
        let real = root.join(rel_path);
        let placeholder = root.join(self.placeholder_file_name(rel_path));
        std::fs::write(&placeholder, b"")
            .with_context(|| format!("write {}", placeholder.display()))?;
        if real.exists() {
            std::fs::remove_file(&real).with_context(|| format!("remove {}", real.display()))?;
        }
        let _ = meta;
        Ok(())
    }

    fn pin_state(&self, journal: &SyncJournal, rel_path: &str) -> Result<PinState> {
        journal.effective_pin_state(rel_path)
    }

    fn set_pin_state(
        &self,
        journal: &mut SyncJournal,
        rel_path: &str,
        state: PinState,
    ) -> Result<()> {
        journal.set_pin_state(rel_path, state)
    }

    fn availability(&self, journal: &SyncJournal, rel_path: &str) -> Result<Availability> {
        match journal.effective_pin_state(rel_path)? {
            PinState::AlwaysLocal => return Ok(Availability::AlwaysLocal),
            PinState::OnlineOnly => return Ok(Availability::OnlineOnly),
            PinState::Inherited | PinState::Unspecified => {}
        }

        let subtree = journal.iterate(rel_path)?;
        let mut hydrated = 0usize;
        let mut dehydrated = 0usize;
        for record in subtree.values() {
            match record.kind {
                FileKind::File => hydrated += 1,
                FileKind::VirtualFile => dehydrated += 1,
                FileKind::Directory | FileKind::SoftLink => {}
            }
        }
        Ok(match (hydrated, dehydrated) {
            (_, 0) => Availability::AllHydrated,
            (0, _) => Availability::AllDehydrated,
            _ => Availability::Mixed,
        })
    }
}

pub fn vfs_for_mode(mode: VfsMode) -> std::sync::Arc<dyn Vfs> {
    match mode {
        VfsMode::Off => std::sync::Arc::new(OffVfs),
        VfsMode::Suffix => std::sync::Arc::new(SuffixVfs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalRecord;
    use crate::types::RemotePermissions;
    use std::path::PathBuf;

    fn make_temp_root(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    fn record(path: &str, kind: FileKind) -> JournalRecord {
        JournalRecord {
            path: path.to_string(),
            inode: 0,
            mtime: 0,
            size: 1,
            kind,
            etag: "e".to_string(),
            file_id: format!("id-{path}"),
            remote_perms: RemotePermissions::unknown(),
            checksum: None,
            content_checksum: String::new(),
            has_dirty_placeholder_metadata: false,
        }
    }

    #[test]
    fn suffix_name_mapping_round_trips() {
        let vfs = SuffixVfs;
        assert!(vfs.is_placeholder_name("a.txt.davfile"));
        assert!(!vfs.is_placeholder_name("a.txt"));
        assert!(!vfs.is_placeholder_name(".davfile"));
        assert_eq!(vfs.underlying_file_name("a.txt.davfile").unwrap(), "a.txt");
        assert_eq!(vfs.placeholder_file_name("a.txt"), "a.txt.davfile");
        assert!(vfs.underlying_file_name("a.txt").is_none());
    }

    #[test]
    fn materialize_creates_zero_byte_placeholder() {
        let root = make_temp_root("davsync-vfs-mat");
        let vfs = SuffixVfs;
        vfs.materialize_placeholder(
            &root,
            "d/report.pdf",
            &PlaceholderMetadata {
                size: 1234,
                mtime: 99,
                etag: "e1".to_string(),
                file_id: "F1".to_string(),
            },
        )
        .unwrap();

        let placeholder = root.join("d/report.pdf.davfile");
        assert!(placeholder.is_file());
        assert_eq!(std::fs::metadata(&placeholder).unwrap().len(), 0);
    }

    #[test]
    fn dehydrate_replaces_real_file() {
        let root = make_temp_root("davsync-vfs-dehydrate");
        std::fs::write(root.join("big.iso"), b"contents").unwrap();

        let vfs = SuffixVfs;
        vfs.dehydrate(
            &root,
            "big.iso",
            &PlaceholderMetadata {
                size: 8,
                mtime: 0,
                etag: "e".to_string(),
                file_id: "F".to_string(),
            },
        )
        .unwrap();

        assert!(!root.join("big.iso").exists());
        assert!(root.join("big.iso.davfile").is_file());
    }

    #[test]
    fn availability_rolls_up_subtree() {
        let root = make_temp_root("davsync-vfs-avail");
        let mut journal = SyncJournal::open(&root).unwrap();
        journal.put(&record("d/a.txt", FileKind::File)).unwrap();
        journal
            .put(&record("d/b.txt", FileKind::VirtualFile))
            .unwrap();
        journal.put(&record("e/c.txt", FileKind::File)).unwrap();

        let vfs = SuffixVfs;
        assert_eq!(vfs.availability(&journal, "d").unwrap(), Availability::Mixed);
        assert_eq!(
            vfs.availability(&journal, "e").unwrap(),
            Availability::AllHydrated
        );

        journal.set_pin_state("d", PinState::OnlineOnly).unwrap();
        assert_eq!(
            vfs.availability(&journal, "d").unwrap(),
            Availability::OnlineOnly
        );
    }

    #[test]
    fn off_vfs_rejects_placeholder_operations() {
        let root = make_temp_root("davsync-vfs-off");
        let vfs = OffVfs;
        assert!(vfs
            .materialize_placeholder(
                &root,
                "x",
                &PlaceholderMetadata {
                    size: 0,
                    mtime: 0,
                    etag: String::new(),
                    file_id: String::new(),
                }
            )
            .is_err());
        assert!(!vfs.is_placeholder_name("x.davfile"));
    }
}
