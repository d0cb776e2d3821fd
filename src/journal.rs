use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha1::{Digest, Sha1};

use crate::types::{Checksum, ErrorCategory, FileKind, PinState, RemotePermissions};

/// Current schema version. Opening a journal with a higher major version is
/// refused; lower versions are migrated in a single transaction.
pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    inode INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL,
    size INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    etag TEXT NOT NULL,
    file_id TEXT NOT NULL,
    remote_perms TEXT NOT NULL DEFAULT '',
    checksum TEXT NOT NULL DEFAULT '',
    content_checksum TEXT NOT NULL DEFAULT '',
    dirty_placeholder INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_files_file_id ON files(file_id);

CREATE TABLE IF NOT EXISTS selective_sync (
    path TEXT NOT NULL,
    list INTEGER NOT NULL,
    PRIMARY KEY (path, list)
);

CREATE TABLE IF NOT EXISTS error_blacklist (
    path TEXT PRIMARY KEY,
    category INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    ignore_until INTEGER NOT NULL,
    error_string TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS download_info (
    path TEXT PRIMARY KEY,
    tmp_file TEXT NOT NULL,
    etag TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS upload_info (
    path TEXT PRIMARY KEY,
    transfer_id TEXT NOT NULL,
    chunk_map TEXT NOT NULL,
    chunk_size INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL,
    size INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conflicts (
    conflict_path TEXT PRIMARY KEY,
    base_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pin_states (
    path TEXT PRIMARY KEY,
    state INTEGER NOT NULL
);
"#;

/// Last-reconciled state for one path. A record exists iff the path was
/// last seen consistent on both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub path: String,
    pub inode: u64,
    pub mtime: i64,
    pub size: i64,
    pub kind: FileKind,
    pub etag: String,
    pub file_id: String,
    pub remote_perms: RemotePermissions,
    pub checksum: Option<Checksum>,
    pub content_checksum: String,
    pub has_dirty_placeholder_metadata: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectiveList {
    /// Never sync these prefixes.
    Blacklist,
    /// Explicit includes.
    Whitelist,
    /// Big new remote folders awaiting a user decision.
    Undecided,
}

impl SelectiveList {
    fn to_db(self) -> i64 {
        match self {
            SelectiveList::Blacklist => 0,
            SelectiveList::Whitelist => 1,
            SelectiveList::Undecided => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlacklistEntry {
    pub path: String,
    pub category: ErrorCategory,
    pub retry_count: i64,
    pub ignore_until: i64,
    pub error_string: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadInfo {
    pub path: String,
    pub tmp_file: String,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadInfo {
    pub path: String,
    pub transfer_id: String,
    /// Completed chunk numbers, ascending.
    pub chunk_map: Vec<i64>,
    /// Chunk size chosen at session start; resume reuses it.
    pub chunk_size: i64,
    pub mtime: i64,
    pub size: i64,
}

// Normal-category blacklist backoff, seconds: 1, 2, 5, 10, 30 minutes,
// then a 2 hour cap.
const BLACKLIST_BACKOFF_SECS: &[i64] = &[60, 120, 300, 600, 1800];
const BLACKLIST_BACKOFF_CAP_SECS: i64 = 7200;

/// Per-root durable sync state at `<root>/.sync_<hash>.db`. The journal is
/// owned by the root's owner task; writers are single-threaded by
/// construction (`Connection` is Send but not Sync).
#[derive(Debug)]
pub struct SyncJournal {
    conn: Connection,
    db_path: PathBuf,
    recreated: bool,
}

pub fn journal_db_path(root: &Path) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(root.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    root.join(format!(".sync_{}.db", &digest[..16]))
}

impl SyncJournal {
    pub fn open(root: &Path) -> Result<Self> {
        let db_path = journal_db_path(root);
        match Self::open_at(&db_path) {
            Ok(j) => Ok(j),
            Err(err) if is_corruption(&err) => {
                crate::logging::error(format!(
                    "journal corrupt, discarding and rescheduling full discovery: {err:#}"
                ));
                discard_db_files(&db_path);
                let mut j = Self::open_at(&db_path)?;
                j.recreated = true;
                Ok(j)
            }
            Err(err) => Err(err),
        }
    }

    fn open_at(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open journal {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enable WAL")?;
        conn.execute_batch(SCHEMA).context("init journal schema")?;

        let mut journal = SyncJournal {
            conn,
            db_path: db_path.to_path_buf(),
            recreated: false,
        };
        journal.migrate()?;
        Ok(journal)
    }

    /// True when a corrupt journal was discarded on open. The caller must
    /// treat the next run as a first sync.
    pub fn was_recreated(&self) -> bool {
        self.recreated
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn migrate(&mut self) -> Result<()> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let version = match stored {
            Some(raw) => raw.parse::<i64>().unwrap_or(0),
            None => {
                // Fresh database: stamp the current version.
                self.conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
                return Ok(());
            }
        };

        if version > SCHEMA_VERSION {
            anyhow::bail!(
                "journal schema version {version} is newer than supported {SCHEMA_VERSION}"
            );
        }
        if version == SCHEMA_VERSION {
            return Ok(());
        }

        let tx = self.conn.transaction().context("begin migration tx")?;
        if version < 2 {
            ensure_column(&tx, "files", "content_checksum", "TEXT NOT NULL DEFAULT ''")?;
            ensure_column(
                &tx,
                "files",
                "dirty_placeholder",
                "INTEGER NOT NULL DEFAULT 0",
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        tx.commit().context("commit migration tx")?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Option<JournalRecord>> {
        let rec = self
            .conn
            .query_row(
                "SELECT path, inode, mtime, size, kind, etag, file_id, remote_perms, checksum,
                        content_checksum, dirty_placeholder
                 FROM files WHERE path = ?1",
                params![path],
                row_to_record,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn get_by_file_id(&self, file_id: &str) -> Result<Option<JournalRecord>> {
        if file_id.is_empty() {
            return Ok(None);
        }
        let rec = self
            .conn
            .query_row(
                "SELECT path, inode, mtime, size, kind, etag, file_id, remote_perms, checksum,
                        content_checksum, dirty_placeholder
                 FROM files WHERE file_id = ?1 ORDER BY path LIMIT 1",
                params![file_id],
                row_to_record,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn put(&mut self, record: &JournalRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO files
             (path, inode, mtime, size, kind, etag, file_id, remote_perms, checksum,
              content_checksum, dirty_placeholder)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.path,
                record.inode as i64,
                record.mtime,
                record.size,
                kind_to_db(record.kind),
                record.etag,
                record.file_id,
                record.remote_perms.to_dav_string(),
                record
                    .checksum
                    .as_ref()
                    .map(|c| c.header_value())
                    .unwrap_or_default(),
                record.content_checksum,
                record.has_dirty_placeholder_metadata as i64,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Delete a record and everything under it.
    pub fn delete_subtree(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE path = ?1", params![path])?;
        self.conn.execute(
            "DELETE FROM files WHERE path LIKE ?1 ESCAPE '\\'",
            params![format!("{}/%", like_escape(path))],
        )?;
        Ok(())
    }

    /// Rename a record and all descendants, keeping file ids stable.
    pub fn rename_subtree(&mut self, from: &str, to: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        let rows: Vec<(String,)> = {
            let mut stmt = tx.prepare(
                "SELECT path FROM files WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'",
            )?;
            let iter = stmt.query_map(
                params![from, format!("{}/%", like_escape(from))],
                |row| Ok((row.get::<_, String>(0)?,)),
            )?;
            iter.collect::<std::result::Result<Vec<_>, _>>()?
        };
        for (old_path,) in rows {
            let new_path = if old_path == from {
                to.to_string()
            } else {
                format!("{to}{}", &old_path[from.len()..])
            };
            tx.execute(
                "UPDATE files SET path = ?1 WHERE path = ?2",
                params![new_path, old_path],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn iterate(&self, prefix: &str) -> Result<BTreeMap<String, JournalRecord>> {
        let mut out = BTreeMap::new();
        let (sql, pattern) = if prefix.is_empty() {
            (
                "SELECT path, inode, mtime, size, kind, etag, file_id, remote_perms, checksum,
                        content_checksum, dirty_placeholder
                 FROM files ORDER BY path",
                None,
            )
        } else {
            (
                "SELECT path, inode, mtime, size, kind, etag, file_id, remote_perms, checksum,
                        content_checksum, dirty_placeholder
                 FROM files WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\' ORDER BY path",
                Some(format!("{}/%", like_escape(prefix))),
            )
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows: Vec<JournalRecord> = match pattern {
            None => stmt
                .query_map([], row_to_record)?
                .collect::<std::result::Result<_, _>>()?,
            Some(p) => stmt
                .query_map(params![prefix, p], row_to_record)?
                .collect::<std::result::Result<_, _>>()?,
        };
        for rec in rows {
            out.insert(rec.path.clone(), rec);
        }
        Ok(out)
    }

    // -- selective sync ----------------------------------------------------

    pub fn selective_list(&self, list: SelectiveList) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM selective_sync WHERE list = ?1 ORDER BY path")?;
        let rows = stmt.query_map(params![list.to_db()], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn add_to_selective_list(&mut self, list: SelectiveList, path: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO selective_sync (path, list) VALUES (?1, ?2)",
            params![path, list.to_db()],
        )?;
        Ok(())
    }

    pub fn remove_from_selective_list(&mut self, list: SelectiveList, path: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM selective_sync WHERE path = ?1 AND list = ?2",
            params![path, list.to_db()],
        )?;
        Ok(())
    }

    // -- error blacklist ---------------------------------------------------

    pub fn blacklist_entry(&self, path: &str) -> Result<Option<BlacklistEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT path, category, retry_count, ignore_until, error_string
                 FROM error_blacklist WHERE path = ?1",
                params![path],
                |row| {
                    Ok(BlacklistEntry {
                        path: row.get(0)?,
                        category: ErrorCategory::from_db(row.get(1)?),
                        retry_count: row.get(2)?,
                        ignore_until: row.get(3)?,
                        error_string: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Record a failed item. `Normal` entries back off exponentially;
    /// `SoftLocal` and `FileLocked` entries park until the unlock event.
    pub fn record_failure(
        &mut self,
        path: &str,
        category: ErrorCategory,
        error_string: &str,
        now: i64,
    ) -> Result<BlacklistEntry> {
        let prior = self.blacklist_entry(path)?;
        let retry_count = prior.map(|e| e.retry_count).unwrap_or(0) + 1;
        let ignore_until = match category {
            ErrorCategory::Normal => {
                let idx = (retry_count - 1).max(0) as usize;
                let backoff = BLACKLIST_BACKOFF_SECS
                    .get(idx)
                    .copied()
                    .unwrap_or(BLACKLIST_BACKOFF_CAP_SECS);
                now + backoff
            }
            // Cleared by the unlock event or the next run.
            ErrorCategory::SoftLocal | ErrorCategory::FileLocked => now,
        };
        let entry = BlacklistEntry {
            path: path.to_string(),
            category,
            retry_count,
            ignore_until,
            error_string: error_string.to_string(),
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO error_blacklist
             (path, category, retry_count, ignore_until, error_string)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.path,
                entry.category.to_db(),
                entry.retry_count,
                entry.ignore_until,
                entry.error_string
            ],
        )?;
        Ok(entry)
    }

    pub fn clear_blacklist(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM error_blacklist WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Wipe soft-local and file-locked entries (on unlock events).
    pub fn wipe_soft_blacklist(&mut self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM error_blacklist WHERE category != ?1",
            params![ErrorCategory::Normal.to_db()],
        )?;
        Ok(())
    }

    /// Entry still inside its backoff window, if any.
    pub fn active_blacklist(&self, path: &str, now: i64) -> Result<Option<BlacklistEntry>> {
        let entry = self.blacklist_entry(path)?;
        Ok(entry.filter(|e| match e.category {
            ErrorCategory::Normal => e.ignore_until > now,
            ErrorCategory::SoftLocal | ErrorCategory::FileLocked => true,
        }))
    }

    // -- download / upload resume info ------------------------------------

    pub fn download_info(&self, path: &str) -> Result<Option<DownloadInfo>> {
        let info = self
            .conn
            .query_row(
                "SELECT path, tmp_file, etag FROM download_info WHERE path = ?1",
                params![path],
                |row| {
                    Ok(DownloadInfo {
                        path: row.get(0)?,
                        tmp_file: row.get(1)?,
                        etag: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    pub fn set_download_info(&mut self, info: &DownloadInfo) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO download_info (path, tmp_file, etag) VALUES (?1, ?2, ?3)",
            params![info.path, info.tmp_file, info.etag],
        )?;
        Ok(())
    }

    pub fn clear_download_info(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM download_info WHERE path = ?1", params![path])?;
        Ok(())
    }

    pub fn upload_info(&self, path: &str) -> Result<Option<UploadInfo>> {
        let info = self
            .conn
            .query_row(
                "SELECT path, transfer_id, chunk_map, chunk_size, mtime, size
                 FROM upload_info WHERE path = ?1",
                params![path],
                |row| {
                    let raw: String = row.get(2)?;
                    Ok(UploadInfo {
                        path: row.get(0)?,
                        transfer_id: row.get(1)?,
                        chunk_map: serde_json::from_str(&raw).unwrap_or_default(),
                        chunk_size: row.get(3)?,
                        mtime: row.get(4)?,
                        size: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    pub fn set_upload_info(&mut self, info: &UploadInfo) -> Result<()> {
        let chunk_map = serde_json::to_string(&info.chunk_map).context("encode chunk map")?;
        self.conn.execute(
            "INSERT OR REPLACE INTO upload_info
             (path, transfer_id, chunk_map, chunk_size, mtime, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                info.path,
                info.transfer_id,
                chunk_map,
                info.chunk_size,
                info.mtime,
                info.size
            ],
        )?;
        Ok(())
    }

    pub fn clear_upload_info(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM upload_info WHERE path = ?1", params![path])?;
        Ok(())
    }

    // -- conflicts ---------------------------------------------------------

    pub fn record_conflict(&mut self, conflict_path: &str, base_path: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO conflicts (conflict_path, base_path) VALUES (?1, ?2)",
            params![conflict_path, base_path],
        )?;
        Ok(())
    }

    pub fn conflict_base(&self, conflict_path: &str) -> Result<Option<String>> {
        let base = self
            .conn
            .query_row(
                "SELECT base_path FROM conflicts WHERE conflict_path = ?1",
                params![conflict_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(base)
    }

    pub fn remove_conflict(&mut self, conflict_path: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM conflicts WHERE conflict_path = ?1",
            params![conflict_path],
        )?;
        Ok(())
    }

    // -- pin states --------------------------------------------------------

    pub fn pin_state(&self, path: &str) -> Result<PinState> {
        let raw: Option<i64> = self
            .conn
            .query_row(
                "SELECT state FROM pin_states WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(PinState::from_db).unwrap_or(PinState::Inherited))
    }

    pub fn set_pin_state(&mut self, path: &str, state: PinState) -> Result<()> {
        if state == PinState::Inherited {
            self.conn
                .execute("DELETE FROM pin_states WHERE path = ?1", params![path])?;
            return Ok(());
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO pin_states (path, state) VALUES (?1, ?2)",
            params![path, state.to_db()],
        )?;
        Ok(())
    }

    /// All explicit pins, for snapshot-based discovery.
    pub fn pin_states(&self) -> Result<BTreeMap<String, PinState>> {
        let mut out = BTreeMap::new();
        let mut stmt = self.conn.prepare("SELECT path, state FROM pin_states")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (path, raw) = row?;
            out.insert(path, PinState::from_db(raw));
        }
        Ok(out)
    }

    /// Effective pin for a path: nearest explicit ancestor pin wins.
    pub fn effective_pin_state(&self, path: &str) -> Result<PinState> {
        let mut current = path.to_string();
        loop {
            let state = self.pin_state(&current)?;
            if state != PinState::Inherited {
                return Ok(state);
            }
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent.to_string(),
                None => break,
            }
        }
        let root_state = self.pin_state("")?;
        Ok(if root_state == PinState::Inherited {
            PinState::Unspecified
        } else {
            root_state
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalRecord> {
    let checksum_raw: String = row.get(8)?;
    Ok(JournalRecord {
        path: row.get(0)?,
        inode: row.get::<_, i64>(1)? as u64,
        mtime: row.get(2)?,
        size: row.get(3)?,
        kind: kind_from_db(row.get(4)?),
        etag: row.get(5)?,
        file_id: row.get(6)?,
        remote_perms: RemotePermissions::from_dav_string(&row.get::<_, String>(7)?),
        checksum: Checksum::parse(&checksum_raw),
        content_checksum: row.get(9)?,
        has_dirty_placeholder_metadata: row.get::<_, i64>(10)? != 0,
    })
}

fn kind_to_db(kind: FileKind) -> i64 {
    match kind {
        FileKind::File => 0,
        FileKind::Directory => 1,
        FileKind::VirtualFile => 2,
        FileKind::SoftLink => 3,
    }
}

fn kind_from_db(v: i64) -> FileKind {
    match v {
        1 => FileKind::Directory,
        2 => FileKind::VirtualFile,
        3 => FileKind::SoftLink,
        _ => FileKind::File,
    }
}

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(());
        }
    }
    conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])?;
    Ok(())
}

fn is_corruption(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(sql_err) = cause.downcast_ref::<rusqlite::Error>() {
            if let rusqlite::Error::SqliteFailure(inner, _) = sql_err {
                if matches!(
                    inner.code,
                    rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
                ) {
                    return true;
                }
            }
        }
    }
    false
}

fn discard_db_files(db_path: &Path) {
    let _ = std::fs::remove_file(db_path);
    for suffix in ["-wal", "-shm"] {
        let mut companion = db_path.as_os_str().to_owned();
        companion.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(companion));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChecksumAlgo;

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

    fn record(path: &str, etag: &str, file_id: &str) -> JournalRecord {
        JournalRecord {
            path: path.to_string(),
            inode: 42,
            mtime: 1_700_000_000,
            size: 10,
            kind: FileKind::File,
            etag: etag.to_string(),
            file_id: file_id.to_string(),
            remote_perms: RemotePermissions::from_dav_string("WDNVCK"),
            checksum: Some(Checksum {
                algo: ChecksumAlgo::Md5,
                hex: "00ff".to_string(),
            }),
            content_checksum: String::new(),
            has_dirty_placeholder_metadata: false,
        }
    }

    #[test]
    fn put_get_delete_round_trip() {
        let root = make_temp_root("davsync-journal-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        assert!(!journal.was_recreated());

        let rec = record("d/a.txt", "e1", "F1");
        journal.put(&rec).unwrap();
        let got = journal.get("d/a.txt").unwrap().unwrap();
        assert_eq!(got, rec);

        journal.delete("d/a.txt").unwrap();
        assert!(journal.get("d/a.txt").unwrap().is_none());
    }

    #[test]
    fn file_id_lookup_finds_renamed_source() {
        let root = make_temp_root("davsync-journal-fileid-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        journal.put(&record("old.bin", "e1", "F1")).unwrap();

        let got = journal.get_by_file_id("F1").unwrap().unwrap();
        assert_eq!(got.path, "old.bin");
        assert!(journal.get_by_file_id("F2").unwrap().is_none());
        assert!(journal.get_by_file_id("").unwrap().is_none());
    }

    #[test]
    fn iterate_prefix_is_subtree_scoped() {
        let root = make_temp_root("davsync-journal-prefix-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        journal.put(&record("d/a.txt", "e1", "F1")).unwrap();
        journal.put(&record("d/sub/b.txt", "e2", "F2")).unwrap();
        journal.put(&record("dx/c.txt", "e3", "F3")).unwrap();

        let under = journal.iterate("d").unwrap();
        assert_eq!(
            under.keys().cloned().collect::<Vec<_>>(),
            vec!["d/a.txt".to_string(), "d/sub/b.txt".to_string()]
        );
        assert_eq!(journal.iterate("").unwrap().len(), 3);
    }

    #[test]
    fn rename_subtree_moves_descendants() {
        let root = make_temp_root("davsync-journal-rename-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        journal.put(&record("old", "e0", "D1")).unwrap();
        journal.put(&record("old/a.txt", "e1", "F1")).unwrap();
        journal.put(&record("old/sub/b.txt", "e2", "F2")).unwrap();

        journal.rename_subtree("old", "new").unwrap();
        assert!(journal.get("old/a.txt").unwrap().is_none());
        assert_eq!(journal.get("new/a.txt").unwrap().unwrap().file_id, "F1");
        assert_eq!(journal.get("new/sub/b.txt").unwrap().unwrap().file_id, "F2");
    }

    #[test]
    fn blacklist_backoff_grows_then_caps() {
        let root = make_temp_root("davsync-journal-blacklist-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        let now = 1_000_000;

        let e1 = journal
            .record_failure("f", ErrorCategory::Normal, "boom", now)
            .unwrap();
        assert_eq!(e1.retry_count, 1);
        assert_eq!(e1.ignore_until, now + 60);

        let e2 = journal
            .record_failure("f", ErrorCategory::Normal, "boom", now)
            .unwrap();
        assert_eq!(e2.ignore_until, now + 120);

        for _ in 0..10 {
            journal
                .record_failure("f", ErrorCategory::Normal, "boom", now)
                .unwrap();
        }
        let capped = journal.blacklist_entry("f").unwrap().unwrap();
        assert_eq!(capped.ignore_until, now + 7200);

        assert!(journal.active_blacklist("f", now).unwrap().is_some());
        assert!(journal.active_blacklist("f", now + 8000).unwrap().is_none());
    }

    #[test]
    fn soft_blacklist_is_wiped_on_unlock() {
        let root = make_temp_root("davsync-journal-soft-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        journal
            .record_failure("locked.docx", ErrorCategory::FileLocked, "423", 100)
            .unwrap();
        journal
            .record_failure("failing.bin", ErrorCategory::Normal, "500", 100)
            .unwrap();

        journal.wipe_soft_blacklist().unwrap();
        assert!(journal.blacklist_entry("locked.docx").unwrap().is_none());
        assert!(journal.blacklist_entry("failing.bin").unwrap().is_some());
    }

    #[test]
    fn upload_info_round_trips_chunk_map() {
        let root = make_temp_root("davsync-journal-upload-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        let info = UploadInfo {
            path: "big.bin".to_string(),
            transfer_id: "t-123".to_string(),
            chunk_map: vec![1, 2, 3],
            chunk_size: 10 * 1024 * 1024,
            mtime: 77,
            size: 200 * 1024 * 1024,
        };
        journal.set_upload_info(&info).unwrap();
        assert_eq!(journal.upload_info("big.bin").unwrap().unwrap(), info);

        journal.clear_upload_info("big.bin").unwrap();
        assert!(journal.upload_info("big.bin").unwrap().is_none());
    }

    #[test]
    fn newer_schema_version_is_refused() {
        let root = make_temp_root("davsync-journal-version-test");
        let db_path = journal_db_path(&root);
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(SCHEMA).unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '99')",
                [],
            )
            .unwrap();
        }
        let err = SyncJournal::open_at(&db_path).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn corrupt_journal_is_discarded_and_flagged() {
        let root = make_temp_root("davsync-journal-corrupt-test");
        let db_path = journal_db_path(&root);
        std::fs::write(&db_path, b"this is not a sqlite file at all........").unwrap();

        let journal = SyncJournal::open(&root).unwrap();
        assert!(journal.was_recreated());
        assert!(journal.get("anything").unwrap().is_none());
    }

    #[test]
    fn effective_pin_state_walks_ancestors() {
        let root = make_temp_root("davsync-journal-pin-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        journal.set_pin_state("photos", PinState::OnlineOnly).unwrap();

        assert_eq!(
            journal.effective_pin_state("photos/2024/img.jpg").unwrap(),
            PinState::OnlineOnly
        );
        assert_eq!(
            journal.effective_pin_state("docs/readme.md").unwrap(),
            PinState::Unspecified
        );

        journal.set_pin_state("photos", PinState::Inherited).unwrap();
        assert_eq!(
            journal.effective_pin_state("photos/2024/img.jpg").unwrap(),
            PinState::Unspecified
        );
    }

    #[test]
    fn selective_lists_are_independent() {
        let root = make_temp_root("davsync-journal-selective-test");
        let mut journal = SyncJournal::open(&root).unwrap();
        journal
            .add_to_selective_list(SelectiveList::Blacklist, "big")
            .unwrap();
        journal
            .add_to_selective_list(SelectiveList::Undecided, "huge")
            .unwrap();

        assert_eq!(
            journal.selective_list(SelectiveList::Blacklist).unwrap(),
            vec!["big".to_string()]
        );
        assert_eq!(
            journal.selective_list(SelectiveList::Undecided).unwrap(),
            vec!["huge".to_string()]
        );
        assert!(journal
            .selective_list(SelectiveList::Whitelist)
            .unwrap()
            .is_empty());

        journal
            .remove_from_selective_list(SelectiveList::Blacklist, "big")
            .unwrap();
        assert!(journal
            .selective_list(SelectiveList::Blacklist)
            .unwrap()
            .is_empty());
    }
}
