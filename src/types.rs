use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    VirtualFile,
    SoftLink,
}

impl FileKind {
    pub fn is_directory(self) -> bool {
        matches!(self, FileKind::Directory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    None,
    New,
    UpdateMetadata,
    Rename,
    Remove,
    Conflict,
    Ignore,
    Error,
    /// Placeholder is replaced by the real file contents.
    Sync,
    UpdateVfsMetadata,
    TypeChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    NoStatus,
    Success,
    Warning,
    SoftError,
    NormalError,
    FatalError,
    FileLocked,
    FileIgnored,
    Conflict,
    Restoration,
    Blacklisted,
}

impl ItemStatus {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ItemStatus::SoftError
                | ItemStatus::NormalError
                | ItemStatus::FatalError
                | ItemStatus::FileLocked
        )
    }
}

/// Server-side permission bits, parsed from the DAV permissions string
/// ("WDNVCKRSM" letters in the ownCloud dialect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemotePermissions(u16);

impl RemotePermissions {
    pub const SHARED: u16 = 1 << 0;
    pub const DELETE: u16 = 1 << 1;
    pub const RENAME: u16 = 1 << 2;
    pub const MOVE: u16 = 1 << 3;
    pub const ADD_FILE: u16 = 1 << 4;
    pub const ADD_SUBDIRS: u16 = 1 << 5;
    pub const RESHARE: u16 = 1 << 6;
    pub const MOUNT: u16 = 1 << 7;
    pub const MOUNTED: u16 = 1 << 8;
    pub const UPDATE: u16 = 1 << 9;

    /// Unknown permissions: the server sent nothing, so nothing is forbidden.
    pub fn unknown() -> Self {
        RemotePermissions(0)
    }

    pub fn all() -> Self {
        RemotePermissions(
            Self::DELETE
                | Self::RENAME
                | Self::MOVE
                | Self::ADD_FILE
                | Self::ADD_SUBDIRS
                | Self::RESHARE
                | Self::UPDATE,
        )
    }

    pub fn from_dav_string(raw: &str) -> Self {
        let mut bits = 0u16;
        for c in raw.chars() {
            bits |= match c {
                'S' => Self::SHARED,
                'D' => Self::DELETE,
                'N' => Self::RENAME,
                'V' => Self::MOVE,
                'C' => Self::ADD_FILE,
                'K' => Self::ADD_SUBDIRS,
                'R' => Self::RESHARE,
                'M' => Self::MOUNTED,
                'G' => Self::MOUNT,
                'W' => Self::UPDATE,
                _ => 0,
            };
        }
        RemotePermissions(bits)
    }

    pub fn to_dav_string(self) -> String {
        let mut out = String::new();
        for (bit, c) in [
            (Self::SHARED, 'S'),
            (Self::DELETE, 'D'),
            (Self::RENAME, 'N'),
            (Self::MOVE, 'V'),
            (Self::ADD_FILE, 'C'),
            (Self::ADD_SUBDIRS, 'K'),
            (Self::RESHARE, 'R'),
            (Self::MOUNTED, 'M'),
            (Self::MOUNT, 'G'),
            (Self::UPDATE, 'W'),
        ] {
            if self.0 & bit != 0 {
                out.push(c);
            }
        }
        out
    }

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }

    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    /// A forbidden operation requires the bit to be known-absent; servers
    /// that send no permissions string allow everything.
    pub fn forbids(self, bit: u16) -> bool {
        !self.is_unknown() && !self.has(bit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgo {
    Md5,
    Sha1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algo: ChecksumAlgo,
    pub hex: String,
}

impl Checksum {
    /// Parse a `MD5:abcd…` / `SHA1:abcd…` header value.
    pub fn parse(raw: &str) -> Option<Self> {
        let (algo, hex) = raw.split_once(':')?;
        let algo = match algo.trim().to_ascii_uppercase().as_str() {
            "MD5" => ChecksumAlgo::Md5,
            "SHA1" => ChecksumAlgo::Sha1,
            _ => return None,
        };
        let hex = hex.trim().to_ascii_lowercase();
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Checksum { algo, hex })
    }

    pub fn header_value(&self) -> String {
        let name = match self.algo {
            ChecksumAlgo::Md5 => "MD5",
            ChecksumAlgo::Sha1 => "SHA1",
        };
        format!("{name}:{}", self.hex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    Inherited,
    AlwaysLocal,
    OnlineOnly,
    Unspecified,
}

impl PinState {
    pub fn from_db(v: i64) -> Self {
        match v {
            1 => PinState::AlwaysLocal,
            2 => PinState::OnlineOnly,
            3 => PinState::Unspecified,
            _ => PinState::Inherited,
        }
    }

    pub fn to_db(self) -> i64 {
        match self {
            PinState::Inherited => 0,
            PinState::AlwaysLocal => 1,
            PinState::OnlineOnly => 2,
            PinState::Unspecified => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    AllHydrated,
    AllDehydrated,
    AlwaysLocal,
    OnlineOnly,
    Mixed,
}

/// One unit of work in a sync plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFileItem {
    /// Relative to the sync root, forward slashes, NFC-normalized.
    pub path: String,
    /// Destination path for `Rename` instructions.
    pub rename_target: Option<String>,
    pub kind: FileKind,
    pub direction: Direction,
    pub instruction: Instruction,
    pub size: i64,
    pub mtime: i64,
    pub etag: String,
    pub file_id: String,
    pub checksum: Option<Checksum>,
    pub remote_perms: RemotePermissions,
    pub status: ItemStatus,
    pub error_string: String,
    pub http_error_code: u16,
    pub lock_expire_time: i64,
}

impl SyncFileItem {
    pub fn new(path: impl Into<String>, kind: FileKind) -> Self {
        SyncFileItem {
            path: path.into(),
            rename_target: None,
            kind,
            direction: Direction::None,
            instruction: Instruction::None,
            size: 0,
            mtime: 0,
            etag: String::new(),
            file_id: String::new(),
            checksum: None,
            remote_perms: RemotePermissions::unknown(),
            status: ItemStatus::NoStatus,
            error_string: String::new(),
            http_error_code: 0,
            lock_expire_time: 0,
        }
    }
}

/// Blacklist categories; `SoftLocal` entries are wiped on unlock events,
/// `Normal` entries expire with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Normal,
    SoftLocal,
    FileLocked,
}

impl ErrorCategory {
    pub fn from_db(v: i64) -> Self {
        match v {
            1 => ErrorCategory::SoftLocal,
            2 => ErrorCategory::FileLocked,
            _ => ErrorCategory::Normal,
        }
    }

    pub fn to_db(self) -> i64 {
        match self {
            ErrorCategory::Normal => 0,
            ErrorCategory::SoftLocal => 1,
            ErrorCategory::FileLocked => 2,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Normal => "normal",
            ErrorCategory::SoftLocal => "soft_local",
            ErrorCategory::FileLocked => "file_locked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRunStatus {
    Success,
    Problem,
    Error,
    SetupError,
    Aborted,
}

/// Result of one sync run. The first error of each class is preserved
/// verbatim; later duplicates are only counted.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub status: SyncRunStatus,
    pub items_total: usize,
    pub items_completed: usize,
    pub items_errored: usize,
    pub items_conflicted: usize,
    pub items_ignored: usize,
    pub first_normal_error: Option<String>,
    pub first_fatal_error: Option<String>,
    pub duplicate_error_count: usize,
    pub another_sync_needed: bool,
}

impl SyncResult {
    pub fn new() -> Self {
        SyncResult {
            status: SyncRunStatus::Success,
            items_total: 0,
            items_completed: 0,
            items_errored: 0,
            items_conflicted: 0,
            items_ignored: 0,
            first_normal_error: None,
            first_fatal_error: None,
            duplicate_error_count: 0,
            another_sync_needed: false,
        }
    }

    pub fn record_normal_error(&mut self, msg: &str) {
        self.items_errored += 1;
        if self.first_normal_error.is_none() {
            self.first_normal_error = Some(msg.to_string());
        } else {
            self.duplicate_error_count += 1;
        }
        if self.status == SyncRunStatus::Success {
            self.status = SyncRunStatus::Problem;
        }
    }

    pub fn record_fatal_error(&mut self, msg: &str) {
        if self.first_fatal_error.is_none() {
            self.first_fatal_error = Some(msg.to_string());
        } else {
            self.duplicate_error_count += 1;
        }
        self.status = SyncRunStatus::Error;
    }
}

impl Default for SyncResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Published per-path status for overlay consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    None,
    Sync,
    Warning,
    Error,
    Ok,
    Excluded,
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total_bytes: i64,
    pub completed_bytes: i64,
    pub total_items: usize,
    pub completed_items: usize,
    pub current_path: String,
}
