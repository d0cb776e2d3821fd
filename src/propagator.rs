use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::bandwidth::BandwidthManager;
use crate::dav::{dav_status, Capabilities, ChunkDialect, DavClient, PutResult};
use crate::events::{EventBus, SyncEvent};
use crate::journal::{DownloadInfo, JournalRecord, SyncJournal, UploadInfo};
use crate::logging::SyncLog;
use crate::queue::{interruptible_sleep, AbortFlag, JobQueue};
use crate::types::{
    Checksum, ChecksumAlgo, Direction, ErrorCategory, FileKind, FileStatus, Instruction,
    ItemStatus, ProgressInfo, RemotePermissions, SyncFileItem, SyncResult, SyncRunStatus,
};
use crate::vfs::{PlaceholderMetadata, Vfs};

const STREAM_BUF: usize = 64 * 1024;
const DEFAULT_CHUNK_SIZE: i64 = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct PropagatorOptions {
    pub parallelism: usize,
    pub chunk_threshold: i64,
    pub min_chunk_size: i64,
    pub max_chunk_size: i64,
    pub target_chunk_secs: u64,
    pub retry_schedule: Vec<Duration>,
}

impl PropagatorOptions {
    pub fn from_config(opts: &crate::config::SyncOptions, caps: &Capabilities) -> Self {
        let mut min_chunk = opts.min_chunk_size;
        let mut max_chunk = opts.max_chunk_size;
        if caps.chunking_ng.enabled {
            if caps.chunking_ng.min_chunk_size > 0 {
                min_chunk = min_chunk.max(caps.chunking_ng.min_chunk_size);
            }
            if caps.chunking_ng.max_chunk_size > 0 {
                max_chunk = max_chunk.min(caps.chunking_ng.max_chunk_size);
            }
        }
        let target = if caps.chunking_ng.target_chunk_upload_duration > 0 {
            caps.chunking_ng.target_chunk_upload_duration
        } else {
            opts.target_chunk_upload_secs
        };
        PropagatorOptions {
            parallelism: if caps.http2 {
                opts.parallelism_http2
            } else {
                opts.parallelism
            },
            chunk_threshold: opts.chunk_threshold,
            min_chunk_size: min_chunk,
            max_chunk_size: max_chunk.max(min_chunk),
            target_chunk_secs: target,
            retry_schedule: opts.retry_schedule(),
        }
    }
}

/// Everything a spawned job may touch. The journal is absent on purpose:
/// jobs report back and the owner task applies journal mutations.
#[derive(Clone)]
struct JobCtx {
    root: PathBuf,
    dav: Arc<DavClient>,
    bandwidth: Arc<BandwidthManager>,
    queue: Arc<JobQueue>,
    vfs: Arc<dyn Vfs>,
    abort: AbortFlag,
    caps: Arc<Capabilities>,
    opts: Arc<PropagatorOptions>,
    effects: mpsc::UnboundedSender<SideEffect>,
}

/// Journal-touching side effects emitted while a job is still running, so
/// chunk progress survives a crash.
enum SideEffect {
    SetUploadInfo(UploadInfo),
    SetDownloadInfo(DownloadInfo),
    Progress(i64),
}

#[derive(Clone)]
struct JobSpec {
    item: SyncFileItem,
    /// Etag from the journal for the If-Match precondition; `None` makes
    /// the transfer a create guarded by `If-None-Match: *`.
    base_etag: Option<String>,
    base_record: Option<JournalRecord>,
    upload_resume: Option<UploadInfo>,
    download_resume: Option<DownloadInfo>,
    checksum_algo: ChecksumAlgo,
    priority: bool,
}

enum Apply {
    Record(JournalRecord),
    RenameRecords {
        from: String,
        to: String,
        record: JournalRecord,
    },
    RemoveRecords,
    /// Server copy restored at the base path; the preserved local copy
    /// still needs its own upload item.
    ConflictResolved {
        conflict_path: String,
        record: JournalRecord,
        upload: SyncFileItem,
    },
    Blacklist {
        category: ErrorCategory,
        message: String,
    },
    /// Lost-update precondition failed; rediscover on a follow-up run.
    ConflictReclassified,
    Fatal {
        message: String,
    },
    Nothing,
}

struct JobDone {
    item: SyncFileItem,
    apply: Apply,
}

/// Executes one reconciliation plan. Owns the journal for the duration of
/// the run; transfers fan out on the runtime and rendezvous back here.
pub struct Propagator<'a> {
    pub root: PathBuf,
    pub dav: Arc<DavClient>,
    pub journal: &'a mut SyncJournal,
    pub vfs: Arc<dyn Vfs>,
    pub bandwidth: Arc<BandwidthManager>,
    pub queue: Arc<JobQueue>,
    pub events: EventBus,
    pub sync_log: Option<&'a SyncLog>,
    pub abort: AbortFlag,
    pub caps: Arc<Capabilities>,
    pub opts: PropagatorOptions,
    pub now: i64,
}

impl<'a> Propagator<'a> {
    pub async fn run(&mut self, plan: Vec<SyncFileItem>) -> Result<SyncResult> {
        let mut result = SyncResult::new();
        result.items_total = plan.len();

        let mut removes_files = Vec::new();
        let mut removes_dirs = Vec::new();
        let mut renames = Vec::new();
        let mut dir_ops = Vec::new();
        let mut transfers = Vec::new();
        let mut informational = Vec::new();

        for item in plan {
            match item.instruction {
                Instruction::Remove if item.kind == FileKind::Directory => removes_dirs.push(item),
                Instruction::Remove => removes_files.push(item),
                Instruction::Rename => renames.push(item),
                Instruction::TypeChange => transfers.push(item),
                Instruction::New | Instruction::UpdateMetadata
                    if item.kind == FileKind::Directory =>
                {
                    dir_ops.push(item)
                }
                Instruction::New
                | Instruction::Sync
                | Instruction::Conflict
                | Instruction::UpdateMetadata
                | Instruction::UpdateVfsMetadata => transfers.push(item),
                Instruction::None | Instruction::Ignore | Instruction::Error => {
                    informational.push(item)
                }
            }
        }

        for item in informational {
            if item.instruction == Instruction::Ignore {
                result.items_ignored += 1;
                self.publish_status(&item.path, FileStatus::Excluded);
            }
            self.events.publish(SyncEvent::ItemCompleted {
                root: self.root.clone(),
                item,
            });
        }

        // Descendant deletions precede their directories; directory removes
        // run serially so a parent can never overtake its children.
        let extra = self
            .run_items(removes_files, self.opts.parallelism, &mut result)
            .await?;
        debug_assert!(extra.is_empty());
        self.run_items(removes_dirs, 1, &mut result).await?;
        self.run_items(renames, 1, &mut result).await?;
        self.run_items(dir_ops, 1, &mut result).await?;
        let conflict_uploads = self
            .run_items(transfers, self.opts.parallelism, &mut result)
            .await?;
        // Conflict fixups queue the preserved copy as a fresh upload.
        self.run_items(conflict_uploads, self.opts.parallelism, &mut result)
            .await?;

        if self.abort.is_aborted() && result.status != SyncRunStatus::Error {
            result.status = SyncRunStatus::Aborted;
        }
        Ok(result)
    }

    async fn run_items(
        &mut self,
        items: Vec<SyncFileItem>,
        parallelism: usize,
        result: &mut SyncResult,
    ) -> Result<Vec<SyncFileItem>> {
        let mut follow_ups = Vec::new();
        if items.is_empty() {
            return Ok(follow_ups);
        }

        let (effects_tx, mut effects_rx) = mpsc::unbounded_channel();
        let limit = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut join: JoinSet<JobDone> = JoinSet::new();

        for item in items {
            if self.abort.is_aborted() || result.status == SyncRunStatus::Error {
                continue;
            }
            let spec = match self.prepare(item)? {
                Ok(spec) => spec,
                Err(done) => {
                    self.apply_done(done, result, &mut follow_ups)?;
                    continue;
                }
            };
            let ctx = JobCtx {
                root: self.root.clone(),
                dav: self.dav.clone(),
                bandwidth: self.bandwidth.clone(),
                queue: self.queue.clone(),
                vfs: self.vfs.clone(),
                abort: self.abort.clone(),
                caps: self.caps.clone(),
                opts: Arc::new(self.opts.clone()),
                effects: effects_tx.clone(),
            };
            let permit = limit.clone().acquire_owned().await?;
            self.publish_status(&spec.item.path, FileStatus::Sync);
            join.spawn(async move {
                let _permit = permit;
                execute_job(ctx, spec).await
            });

            self.drain_effects(&mut effects_rx, result)?;
        }
        drop(effects_tx);

        loop {
            tokio::select! {
                effect = effects_rx.recv() => {
                    match effect {
                        Some(e) => self.apply_effect(e, result)?,
                        None => {
                            // All senders dropped; collect remaining jobs.
                            while let Some(done) = join.join_next().await {
                                let done = done.context("sync job panicked")?;
                                self.apply_done(done, result, &mut follow_ups)?;
                            }
                            break;
                        }
                    }
                }
                joined = join.join_next() => {
                    match joined {
                        Some(done) => {
                            let done = done.context("sync job panicked")?;
                            self.apply_done(done, result, &mut follow_ups)?;
                        }
                        None => {
                            // Drain any trailing effects before finishing.
                            while let Ok(e) = effects_rx.try_recv() {
                                self.apply_effect(e, result)?;
                            }
                            break;
                        }
                    }
                }
            }
        }

        Ok(follow_ups)
    }

    fn drain_effects(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<SideEffect>,
        result: &mut SyncResult,
    ) -> Result<()> {
        while let Ok(effect) = rx.try_recv() {
            self.apply_effect(effect, result)?;
        }
        Ok(())
    }

    fn apply_effect(&mut self, effect: SideEffect, result: &mut SyncResult) -> Result<()> {
        match effect {
            SideEffect::SetUploadInfo(info) => self.journal.set_upload_info(&info)?,
            SideEffect::SetDownloadInfo(info) => self.journal.set_download_info(&info)?,
            SideEffect::Progress(bytes) => {
                self.events.publish(SyncEvent::TransmissionProgress {
                    root: self.root.clone(),
                    info: ProgressInfo {
                        total_bytes: 0,
                        completed_bytes: bytes,
                        total_items: result.items_total,
                        completed_items: result.items_completed,
                        current_path: String::new(),
                    },
                });
            }
        }
        Ok(())
    }

    /// Owner-side pre-checks: blacklist, permissions, and everything the
    /// job needs to read from the journal.
    fn prepare(&mut self, item: SyncFileItem) -> Result<std::result::Result<JobSpec, JobDone>> {
        if let Some(entry) = self.journal.active_blacklist(&item.path, self.now)? {
            let mut item = item;
            item.status = ItemStatus::Blacklisted;
            item.error_string = entry.error_string;
            return Ok(Err(JobDone {
                item,
                apply: Apply::Nothing,
            }));
        }

        if let Some(reason) = self.forbidden_reason(&item)? {
            let mut item = item;
            item.instruction = Instruction::Error;
            item.status = ItemStatus::NormalError;
            item.error_string = reason;
            return Ok(Err(JobDone {
                item,
                apply: Apply::Nothing,
            }));
        }

        let base_record = self.journal.get(&item.path)?;
        // Restorations push a side the other side deleted: the journal etag
        // refers to an object that no longer exists there, so the transfer
        // runs as a create.
        let base_etag = if item.status == ItemStatus::Restoration {
            None
        } else {
            base_record
                .as_ref()
                .map(|r| r.etag.clone())
                .filter(|e| !e.is_empty())
        };
        let upload_resume = self.journal.upload_info(&item.path)?;
        let download_resume = self.journal.download_info(&item.path)?;
        let checksum_algo = preferred_checksum_algo(&self.caps);

        Ok(Ok(JobSpec {
            priority: item.instruction == Instruction::Sync,
            item,
            base_etag,
            base_record,
            upload_resume,
            download_resume,
            checksum_algo,
        }))
    }

    /// Forbidden operations fail fast with a readable reason, not a retry.
    fn forbidden_reason(&mut self, item: &SyncFileItem) -> Result<Option<String>> {
        let parent = parent_of(&item.path);
        let parent_perms = match parent.as_deref() {
            Some(p) => self
                .journal
                .get(p)?
                .map(|r| r.remote_perms)
                .unwrap_or_default(),
            None => RemotePermissions::unknown(),
        };
        let own_perms = self
            .journal
            .get(&item.path)?
            .map(|r| r.remote_perms)
            .unwrap_or(item.remote_perms);

        let reason = match (item.instruction, item.direction) {
            (Instruction::New, Direction::Up) => {
                let updating = self.journal.get(&item.path)?.is_some();
                if updating && own_perms.forbids(RemotePermissions::UPDATE) {
                    Some("server forbids updating this file".to_string())
                } else if !updating && item.kind == FileKind::Directory
                    && parent_perms.forbids(RemotePermissions::ADD_SUBDIRS)
                {
                    Some("server forbids creating folders here".to_string())
                } else if !updating && item.kind != FileKind::Directory
                    && parent_perms.forbids(RemotePermissions::ADD_FILE)
                {
                    Some("server forbids adding files here".to_string())
                } else {
                    None
                }
            }
            (Instruction::Remove, Direction::Up) => {
                if own_perms.forbids(RemotePermissions::DELETE) {
                    Some("server forbids deleting this item".to_string())
                } else {
                    None
                }
            }
            (Instruction::Rename, Direction::Up) => {
                if own_perms.forbids(RemotePermissions::RENAME)
                    || own_perms.forbids(RemotePermissions::MOVE)
                {
                    Some("server forbids moving this item".to_string())
                } else {
                    None
                }
            }
            _ => None,
        };
        Ok(reason)
    }

    fn apply_done(
        &mut self,
        done: JobDone,
        result: &mut SyncResult,
        follow_ups: &mut Vec<SyncFileItem>,
    ) -> Result<()> {
        let mut item = done.item;
        match done.apply {
            Apply::Record(record) => {
                self.journal.put(&record)?;
                self.journal.clear_blacklist(&item.path)?;
                self.journal.clear_upload_info(&item.path)?;
                self.journal.clear_download_info(&item.path)?;
                item.status = ItemStatus::Success;
                result.items_completed += 1;
                self.publish_status(&item.path, FileStatus::Ok);
            }
            Apply::RenameRecords { from, to, record } => {
                self.journal.rename_subtree(&from, &to)?;
                self.journal.put(&record)?;
                self.journal.clear_blacklist(&from)?;
                item.status = ItemStatus::Success;
                result.items_completed += 1;
                self.publish_status(&to, FileStatus::Ok);
            }
            Apply::RemoveRecords => {
                self.journal.delete_subtree(&item.path)?;
                self.journal.clear_blacklist(&item.path)?;
                item.status = ItemStatus::Success;
                result.items_completed += 1;
                self.publish_status(&item.path, FileStatus::None);
            }
            Apply::ConflictResolved {
                conflict_path,
                record,
                upload,
            } => {
                self.journal.put(&record)?;
                self.journal.record_conflict(&conflict_path, &item.path)?;
                self.journal.clear_download_info(&item.path)?;
                item.status = ItemStatus::Conflict;
                result.items_conflicted += 1;
                result.items_completed += 1;
                follow_ups.push(upload);
                self.publish_status(&item.path, FileStatus::Warning);
            }
            Apply::Blacklist { category, message } => {
                self.journal
                    .record_failure(&item.path, category, &message, self.now)?;
                item.status = match category {
                    ErrorCategory::Normal => ItemStatus::NormalError,
                    ErrorCategory::SoftLocal => ItemStatus::SoftError,
                    ErrorCategory::FileLocked => ItemStatus::FileLocked,
                };
                item.error_string = message.clone();
                if category == ErrorCategory::Normal {
                    result.record_normal_error(&message);
                } else {
                    result.items_errored += 1;
                    if result.status == SyncRunStatus::Success {
                        result.status = SyncRunStatus::Problem;
                    }
                }
                self.publish_status(&item.path, FileStatus::Error);
            }
            Apply::ConflictReclassified => {
                item.status = ItemStatus::Conflict;
                item.instruction = Instruction::Conflict;
                result.items_conflicted += 1;
                result.another_sync_needed = true;
                self.publish_status(&item.path, FileStatus::Warning);
            }
            Apply::Fatal { message } => {
                item.status = ItemStatus::FatalError;
                item.error_string = message.clone();
                result.record_fatal_error(&message);
                self.abort.abort();
                self.publish_status(&item.path, FileStatus::Error);
            }
            Apply::Nothing => {
                if item.status == ItemStatus::NormalError {
                    result.record_normal_error(&item.error_string);
                    self.publish_status(&item.path, FileStatus::Error);
                }
            }
        }

        if let Some(log) = self.sync_log {
            log.line(
                "item",
                &[
                    ("path", &item.path),
                    ("instruction", &format!("{:?}", item.instruction)),
                    ("status", &format!("{:?}", item.status)),
                ],
            );
        }
        self.events.publish(SyncEvent::ItemCompleted {
            root: self.root.clone(),
            item,
        });
        Ok(())
    }

    fn publish_status(&self, path: &str, status: FileStatus) {
        self.vfs.on_file_status_changed(path, status);
        self.events.publish(SyncEvent::FileStatusChanged {
            root: self.root.clone(),
            path: path.to_string(),
            status,
        });
    }
}

fn parent_of(path: &str) -> Option<String> {
    path.rsplit_once('/').map(|(p, _)| p.to_string())
}

fn preferred_checksum_algo(caps: &Capabilities) -> ChecksumAlgo {
    for algo in &caps.checksums.supported_types {
        match algo.to_ascii_uppercase().as_str() {
            "SHA1" => return ChecksumAlgo::Sha1,
            "MD5" => return ChecksumAlgo::Md5,
            _ => {}
        }
    }
    ChecksumAlgo::Md5
}

pub fn conflict_file_name(path: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((d, n)) => (Some(d), n),
        None => (None, path),
    };
    let stamp = format!(
        "{} {}",
        now.format("%Y-%m-%d"),
        now.format("%H%M%S")
    );
    let marked = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{stem} (conflicted copy {stamp}).{ext}")
        }
        _ => format!("{name} (conflicted copy {stamp})"),
    };
    match dir {
        Some(d) => format!("{d}/{marked}"),
        None => marked,
    }
}

/// Chunk size aimed at `target_chunk_secs` of upload per chunk at the
/// measured link rate, clamped to the configured bounds. Until the first
/// throughput sample lands a fixed default applies.
fn adaptive_chunk_size(opts: &PropagatorOptions, rate_bytes_per_sec: f64) -> i64 {
    let target = if rate_bytes_per_sec > 0.0 {
        (rate_bytes_per_sec * opts.target_chunk_secs as f64) as i64
    } else {
        DEFAULT_CHUNK_SIZE
    };
    target.clamp(opts.min_chunk_size.max(1), opts.max_chunk_size.max(1))
}

// ---------------------------------------------------------------------------
// job execution
// ---------------------------------------------------------------------------

async fn execute_job(ctx: JobCtx, spec: JobSpec) -> JobDone {
    let item = spec.item.clone();
    let apply = run_with_retries(&ctx, &spec).await;
    JobDone { item, apply }
}

async fn run_with_retries(ctx: &JobCtx, spec: &JobSpec) -> Apply {
    let mut retries_done = 0usize;
    loop {
        if ctx.abort.is_aborted() {
            return Apply::Nothing;
        }
        match attempt(ctx, spec).await {
            Ok(apply) => return apply,
            Err(err) => match classify_failure(&err) {
                Failure::Retryable(msg) => {
                    if retries_done >= ctx.opts.retry_schedule.len() {
                        return Apply::Blacklist {
                            category: ErrorCategory::Normal,
                            message: msg,
                        };
                    }
                    let delay = ctx.opts.retry_schedule[retries_done];
                    retries_done += 1;
                    if !interruptible_sleep(delay, &ctx.abort).await {
                        return Apply::Nothing;
                    }
                }
                Failure::Normal(msg) => {
                    return Apply::Blacklist {
                        category: ErrorCategory::Normal,
                        message: msg,
                    }
                }
                Failure::SoftLocal(msg) => {
                    return Apply::Blacklist {
                        category: ErrorCategory::SoftLocal,
                        message: msg,
                    }
                }
                Failure::Locked(msg) => {
                    return Apply::Blacklist {
                        category: ErrorCategory::FileLocked,
                        message: msg,
                    }
                }
                Failure::Precondition => return Apply::ConflictReclassified,
                Failure::Fatal(msg) => return Apply::Fatal { message: msg },
            },
        }
    }
}

enum Failure {
    Retryable(String),
    Normal(String),
    SoftLocal(String),
    Locked(String),
    Precondition,
    Fatal(String),
}

fn classify_failure(err: &anyhow::Error) -> Failure {
    if let Some(status) = dav_status(err) {
        return match status {
            StatusCode::PRECONDITION_FAILED => Failure::Precondition,
            StatusCode::LOCKED => Failure::Locked(err.to_string()),
            StatusCode::INSUFFICIENT_STORAGE => Failure::Fatal(err.to_string()),
            StatusCode::UNAUTHORIZED => Failure::Fatal(err.to_string()),
            s if s.is_server_error() => Failure::Retryable(err.to_string()),
            _ => Failure::Normal(err.to_string()),
        };
    }
    for cause in err.chain() {
        if cause.downcast_ref::<std::io::Error>().is_some() {
            // Locked files, permission hiccups, transient local IO: parked
            // softly and retried on the next run or unlock event.
            return Failure::SoftLocal(err.to_string());
        }
        if let Some(req_err) = cause.downcast_ref::<reqwest::Error>() {
            if req_err.is_timeout() || req_err.is_connect() || req_err.is_request() {
                return Failure::Retryable(err.to_string());
            }
        }
    }
    Failure::Retryable(err.to_string())
}

async fn attempt(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let item = &spec.item;
    match (item.instruction, item.direction) {
        (Instruction::Remove, Direction::Up) => remove_remote(ctx, spec).await,
        (Instruction::Remove, _) => remove_local(ctx, spec).await,
        (Instruction::Rename, Direction::Up) => rename_remote(ctx, spec).await,
        (Instruction::Rename, _) => rename_local(ctx, spec).await,
        (Instruction::New | Instruction::UpdateMetadata, Direction::Down)
            if item.kind == FileKind::Directory =>
        {
            mkdir_local(ctx, spec).await
        }
        (Instruction::New, Direction::Up) if item.kind == FileKind::Directory => {
            mkdir_remote(ctx, spec).await
        }
        (Instruction::New, Direction::Down) if item.kind == FileKind::VirtualFile => {
            materialize_placeholder(ctx, spec).await
        }
        (Instruction::New | Instruction::Sync, Direction::Down) => download(ctx, spec).await,
        (Instruction::New, Direction::Up) => upload(ctx, spec).await,
        (Instruction::UpdateMetadata, _) => update_metadata(ctx, spec).await,
        (Instruction::UpdateVfsMetadata, _) => update_vfs_metadata(ctx, spec).await,
        (Instruction::Conflict, _) => resolve_conflict(ctx, spec).await,
        (Instruction::TypeChange, dir) => type_change(ctx, spec, dir).await,
        other => anyhow::bail!("unexpected job {:?} for {}", other, item.path),
    }
}

fn abs_path(ctx: &JobCtx, rel: &str) -> PathBuf {
    ctx.root.join(rel)
}

fn stat_local(path: &Path) -> Result<(u64, i64, i64)> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((inode_of(&meta), mtime, meta.len() as i64))
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

fn record_for(item: &SyncFileItem, kind: FileKind, inode: u64, mtime: i64, size: i64) -> JournalRecord {
    JournalRecord {
        path: item.path.clone(),
        inode,
        mtime,
        size,
        kind,
        etag: item.etag.clone(),
        file_id: item.file_id.clone(),
        remote_perms: item.remote_perms,
        checksum: item.checksum.clone(),
        content_checksum: String::new(),
        has_dirty_placeholder_metadata: false,
    }
}

/// Create missing parent directories, clearing any file squatting on a
/// parent path so the remote structure can land.
fn ensure_local_parents(target: &Path) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    if parent.is_dir() {
        return Ok(());
    }
    if parent.exists() {
        std::fs::remove_file(parent).with_context(|| format!("clear {}", parent.display()))?;
    }
    std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))
}

// -- removes ---------------------------------------------------------------

async fn remove_remote(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let _permit = ctx
        .queue
        .acquire(spec.priority, &ctx.abort)
        .await
        .ok_or_else(|| anyhow::anyhow!("sync aborted"))?;
    match ctx.dav.delete(&spec.item.path).await {
        Ok(()) => {}
        // Already gone is as good as deleted.
        Err(err) if dav_status(&err) == Some(StatusCode::NOT_FOUND) => {}
        Err(err) => return Err(err),
    }
    Ok(Apply::RemoveRecords)
}

async fn remove_local(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let abs = abs_path(ctx, &spec.item.path);
    if abs.exists() {
        if abs.is_dir() {
            std::fs::remove_dir_all(&abs).with_context(|| format!("remove {}", abs.display()))?;
        } else {
            std::fs::remove_file(&abs).with_context(|| format!("remove {}", abs.display()))?;
        }
    }
    // In suffix mode the entry may exist as a placeholder.
    let placeholder = abs_path(
        ctx,
        &ctx.vfs.placeholder_file_name(&spec.item.path),
    );
    if ctx.vfs.is_placeholder_name(
        placeholder
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(""),
    ) && placeholder.exists()
    {
        let _ = std::fs::remove_file(&placeholder);
    }
    Ok(Apply::RemoveRecords)
}

// -- renames ---------------------------------------------------------------

async fn rename_remote(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let target = spec
        .item
        .rename_target
        .clone()
        .ok_or_else(|| anyhow::anyhow!("rename without target"))?;
    let _permit = ctx
        .queue
        .acquire(spec.priority, &ctx.abort)
        .await
        .ok_or_else(|| anyhow::anyhow!("sync aborted"))?;

    // The destination's ancestors may be brand new on our side.
    ensure_remote_parents(ctx, &target).await?;
    let moved = ctx.dav.mv(&spec.item.path, &target).await?;

    let abs = abs_path(ctx, &target);
    let (inode, mtime, size) = stat_local(&abs)?;
    let mut record = record_for(&spec.item, spec.item.kind, inode, mtime, size);
    record.path = target.clone();
    apply_put_result(&mut record, &moved);
    if record.etag.is_empty() {
        if let Some(entry) = ctx.dav.stat(&target).await? {
            record.etag = entry.etag;
            record.file_id = entry.file_id;
        }
    }
    Ok(Apply::RenameRecords {
        from: spec.item.path.clone(),
        to: target,
        record,
    })
}

async fn rename_local(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let target = spec
        .item
        .rename_target
        .clone()
        .ok_or_else(|| anyhow::anyhow!("rename without target"))?;
    let from_abs = abs_path(ctx, &spec.item.path);
    let to_abs = abs_path(ctx, &target);
    ensure_local_parents(&to_abs)?;
    std::fs::rename(&from_abs, &to_abs)
        .with_context(|| format!("rename {} -> {}", from_abs.display(), to_abs.display()))?;

    let (inode, mtime, size) = stat_local(&to_abs)?;
    let mut record = record_for(&spec.item, spec.item.kind, inode, mtime, size);
    record.path = target.clone();
    Ok(Apply::RenameRecords {
        from: spec.item.path.clone(),
        to: target,
        record,
    })
}

async fn ensure_remote_parents(ctx: &JobCtx, rel: &str) -> Result<()> {
    let mut ancestors = Vec::new();
    let mut current = rel.to_string();
    while let Some((parent, _)) = current.rsplit_once('/') {
        ancestors.push(parent.to_string());
        current = parent.to_string();
    }
    for ancestor in ancestors.iter().rev() {
        if ancestor.is_empty() {
            continue;
        }
        match ctx.dav.mkcol(ancestor).await {
            Ok(_) => {}
            // 405 means the collection already exists.
            Err(err) if dav_status(&err) == Some(StatusCode::METHOD_NOT_ALLOWED) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

// -- directories -----------------------------------------------------------

async fn mkdir_local(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let abs = abs_path(ctx, &spec.item.path);
    ensure_local_parents(&abs)?;
    if !abs.is_dir() {
        if abs.exists() {
            std::fs::remove_file(&abs).with_context(|| format!("clear {}", abs.display()))?;
        }
        std::fs::create_dir(&abs).with_context(|| format!("mkdir {}", abs.display()))?;
    }
    let (inode, mtime, _) = stat_local(&abs)?;
    Ok(Apply::Record(record_for(
        &spec.item,
        FileKind::Directory,
        inode,
        mtime,
        0,
    )))
}

async fn mkdir_remote(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let _permit = ctx
        .queue
        .acquire(spec.priority, &ctx.abort)
        .await
        .ok_or_else(|| anyhow::anyhow!("sync aborted"))?;
    let created = match ctx.dav.mkcol(&spec.item.path).await {
        Ok(res) => res,
        // Someone else created it first; treat as ours and move on.
        Err(err) if dav_status(&err) == Some(StatusCode::METHOD_NOT_ALLOWED) => PutResult::default(),
        Err(err) => return Err(err),
    };

    let abs = abs_path(ctx, &spec.item.path);
    let (inode, mtime, _) = stat_local(&abs)?;
    let mut record = record_for(&spec.item, FileKind::Directory, inode, mtime, 0);
    apply_put_result(&mut record, &created);
    if record.etag.is_empty() || record.file_id.is_empty() {
        if let Some(entry) = ctx.dav.stat(&spec.item.path).await? {
            record.etag = entry.etag;
            record.file_id = entry.file_id;
            record.remote_perms = entry.perms;
        }
    }
    Ok(Apply::Record(record))
}

// -- metadata --------------------------------------------------------------

async fn update_metadata(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let abs = abs_path(ctx, &spec.item.path);
    let kind = if spec.item.kind == FileKind::Directory {
        FileKind::Directory
    } else if spec
        .base_record
        .as_ref()
        .map(|r| r.kind == FileKind::VirtualFile)
        .unwrap_or(false)
    {
        FileKind::VirtualFile
    } else {
        spec.item.kind
    };
    let stat_target = if kind == FileKind::VirtualFile {
        abs_path(ctx, &ctx.vfs.placeholder_file_name(&spec.item.path))
    } else {
        abs
    };
    let (inode, mtime, size) = stat_local(&stat_target)?;
    let mut record = record_for(&spec.item, kind, inode, mtime, size);
    if kind == FileKind::VirtualFile {
        // Keep the remote size; the placeholder itself is empty.
        record.size = spec.item.size;
    }
    Ok(Apply::Record(record))
}

async fn update_vfs_metadata(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let meta = PlaceholderMetadata {
        size: spec.item.size,
        mtime: spec.item.mtime,
        etag: spec.item.etag.clone(),
        file_id: spec.item.file_id.clone(),
    };
    let abs = abs_path(ctx, &spec.item.path);
    if spec.item.direction == Direction::None && abs.is_file() {
        // Pin flipped to online-only: drop local contents.
        ctx.vfs.dehydrate(&ctx.root, &spec.item.path, &meta)?;
    } else {
        // Refresh placeholder metadata; never hydrates.
        ctx.vfs
            .materialize_placeholder(&ctx.root, &spec.item.path, &meta)?;
    }
    let placeholder = abs_path(ctx, &ctx.vfs.placeholder_file_name(&spec.item.path));
    let (inode, mtime, _) = stat_local(&placeholder)?;
    let mut record = record_for(&spec.item, FileKind::VirtualFile, inode, mtime, 0);
    record.size = spec.item.size;
    Ok(Apply::Record(record))
}

async fn materialize_placeholder(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let meta = PlaceholderMetadata {
        size: spec.item.size,
        mtime: spec.item.mtime,
        etag: spec.item.etag.clone(),
        file_id: spec.item.file_id.clone(),
    };
    ctx.vfs
        .materialize_placeholder(&ctx.root, &spec.item.path, &meta)?;
    let placeholder = abs_path(ctx, &ctx.vfs.placeholder_file_name(&spec.item.path));
    let (inode, mtime, _) = stat_local(&placeholder)?;
    let mut record = record_for(&spec.item, FileKind::VirtualFile, inode, mtime, 0);
    record.size = spec.item.size;
    Ok(Apply::Record(record))
}

// -- downloads -------------------------------------------------------------

async fn download(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let record = download_to_path(ctx, spec, &spec.item.path).await?;
    if spec.item.instruction == Instruction::Sync {
        // Hydration: the placeholder made way for real contents.
        let placeholder = abs_path(ctx, &ctx.vfs.placeholder_file_name(&spec.item.path));
        if placeholder.exists() {
            let _ = std::fs::remove_file(&placeholder);
        }
    }
    Ok(Apply::Record(record))
}

async fn download_to_path(ctx: &JobCtx, spec: &JobSpec, dest_rel: &str) -> Result<JournalRecord> {
    let _permit = ctx
        .queue
        .acquire(spec.priority, &ctx.abort)
        .await
        .ok_or_else(|| anyhow::anyhow!("sync aborted"))?;

    let target = abs_path(ctx, dest_rel);
    ensure_local_parents(&target)?;

    // Resume a previous partial download when the server still has the
    // same content.
    let mut tmp: Option<PathBuf> = None;
    let mut offset: u64 = 0;
    if let Some(info) = &spec.download_resume {
        let candidate = ctx.root.join(&info.tmp_file);
        if info.etag == spec.item.etag && candidate.is_file() {
            offset = std::fs::metadata(&candidate).map(|m| m.len()).unwrap_or(0);
            tmp = Some(candidate);
        } else {
            let _ = std::fs::remove_file(&candidate);
        }
    }
    let tmp = match tmp {
        Some(t) => t,
        None => {
            let name = target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("download");
            let rand = uuid::Uuid::new_v4().simple().to_string();
            let tmp = target
                .parent()
                .map(|p| p.join(format!(".{name}.~{}", &rand[..8])))
                .ok_or_else(|| anyhow::anyhow!("target has no parent: {}", target.display()))?;
            let tmp_rel = tmp
                .strip_prefix(&ctx.root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| tmp.to_string_lossy().to_string());
            let _ = ctx.effects.send(SideEffect::SetDownloadInfo(DownloadInfo {
                path: spec.item.path.clone(),
                tmp_file: tmp_rel,
                etag: spec.item.etag.clone(),
            }));
            tmp
        }
    };

    let resp = ctx.dav.download(&spec.item.path, offset).await?;
    if offset > 0 && resp.status() != StatusCode::PARTIAL_CONTENT {
        // Server ignored the range; start over.
        offset = 0;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(offset == 0)
        .open(&tmp)
        .await
        .with_context(|| format!("open {}", tmp.display()))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }

    let stats = ctx.dav.stats();
    let mut written = offset as i64;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if ctx.abort.is_aborted() {
            anyhow::bail!("sync aborted");
        }
        let bytes = chunk.context("download stream")?;
        ctx.bandwidth.download.acquire(bytes.len()).await;
        stats.on_recv(bytes.len() as i64);
        file.write_all(&bytes).await?;
        written += bytes.len() as i64;
        let _ = ctx.effects.send(SideEffect::Progress(bytes.len() as i64));
    }
    file.flush().await?;
    drop(file);

    if spec.item.size > 0 && written != spec.item.size {
        let _ = std::fs::remove_file(&tmp);
        anyhow::bail!(
            "download length mismatch for {}: got {written}, want {}",
            spec.item.path,
            spec.item.size
        );
    }
    if let Some(expected) = &spec.item.checksum {
        let actual = compute_checksum(&tmp, expected.algo).await?;
        if actual.hex != expected.hex {
            let _ = std::fs::remove_file(&tmp);
            anyhow::bail!("checksum mismatch for {}", spec.item.path);
        }
    }

    if target.is_dir() {
        std::fs::remove_dir_all(&target)
            .with_context(|| format!("clear {}", target.display()))?;
    }
    std::fs::rename(&tmp, &target)
        .with_context(|| format!("rename {} -> {}", tmp.display(), target.display()))?;

    let (inode, mtime, size) = stat_local(&target)?;
    let mut record = record_for(&spec.item, FileKind::File, inode, mtime, size);
    record.path = dest_rel.to_string();
    Ok(record)
}

// -- uploads ---------------------------------------------------------------

async fn upload(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let abs = abs_path(ctx, &spec.item.path);
    let (_, mtime, size) = stat_local(&abs)?;

    let checksum = compute_checksum(&abs, spec.checksum_algo).await?;

    let _permit = ctx
        .queue
        .acquire(spec.priority, &ctx.abort)
        .await
        .ok_or_else(|| anyhow::anyhow!("sync aborted"))?;

    let put = if size <= ctx.opts.chunk_threshold {
        let body = paced_file_body(ctx, &abs, 0, size).await?;
        ctx.dav
            .put(
                &spec.item.path,
                body,
                spec.base_etag.as_deref(),
                Some(&checksum),
                mtime,
            )
            .await?
    } else {
        chunked_upload(ctx, spec, &abs, size, mtime, &checksum).await?
    };

    let (inode, mtime, size) = stat_local(&abs)?;
    let mut record = record_for(&spec.item, FileKind::File, inode, mtime, size);
    record.checksum = Some(checksum);
    apply_put_result(&mut record, &put);
    if record.etag.is_empty() || record.file_id.is_empty() {
        if let Some(entry) = ctx.dav.stat(&spec.item.path).await? {
            record.etag = entry.etag;
            record.file_id = entry.file_id;
            record.remote_perms = entry.perms;
        }
    }
    Ok(Apply::Record(record))
}

async fn chunked_upload(
    ctx: &JobCtx,
    spec: &JobSpec,
    abs: &Path,
    size: i64,
    mtime: i64,
    checksum: &Checksum,
) -> Result<PutResult> {
    let dialect = ctx
        .caps
        .preferred_dialect()
        .unwrap_or(ChunkDialect::FixedChunks);

    // Resume only when the file is unchanged since the interrupted session.
    let resume = spec
        .upload_resume
        .as_ref()
        .filter(|info| info.mtime == mtime && info.size == size && info.chunk_size > 0)
        .cloned();

    match dialect {
        ChunkDialect::ResumableToken => {
            token_chunked_upload(ctx, spec, abs, size, mtime, resume).await
        }
        ChunkDialect::ServerOffsets => {
            ng_chunked_upload(ctx, spec, abs, size, mtime, resume).await
        }
        ChunkDialect::FixedChunks => {
            fixed_chunked_upload(ctx, spec, abs, size, mtime, checksum, resume).await
        }
    }
}

async fn token_chunked_upload(
    ctx: &JobCtx,
    spec: &JobSpec,
    abs: &Path,
    size: i64,
    mtime: i64,
    resume: Option<UploadInfo>,
) -> Result<PutResult> {
    let (token, mut offset, chunk_size) = match resume {
        Some(info) => {
            let offset = ctx.dav.token_probe(&info.transfer_id).await?;
            (info.transfer_id, offset, info.chunk_size)
        }
        None => {
            let started = ctx.dav.token_start(&spec.item.path, size).await?;
            let chunk_size =
                adaptive_chunk_size(&ctx.opts, ctx.dav.stats().send_rate_bytes_per_sec());
            let _ = ctx.effects.send(SideEffect::SetUploadInfo(UploadInfo {
                path: spec.item.path.clone(),
                transfer_id: started.token.clone(),
                chunk_map: Vec::new(),
                chunk_size,
                mtime,
                size,
            }));
            (started.token, started.offset, chunk_size)
        }
    };

    while offset < size {
        if ctx.abort.is_aborted() {
            anyhow::bail!("sync aborted");
        }
        let len = chunk_size.min(size - offset);
        let body = paced_file_body(ctx, abs, offset, len).await?;
        offset = ctx.dav.token_put_chunk(&token, offset, body).await?;
        let _ = ctx.effects.send(SideEffect::SetUploadInfo(UploadInfo {
            path: spec.item.path.clone(),
            transfer_id: token.clone(),
            chunk_map: vec![offset],
            chunk_size,
            mtime,
            size,
        }));
    }

    ctx.dav
        .token_finalize(&token, &spec.item.path, spec.base_etag.as_deref(), mtime)
        .await
}

async fn ng_chunked_upload(
    ctx: &JobCtx,
    spec: &JobSpec,
    abs: &Path,
    size: i64,
    mtime: i64,
    resume: Option<UploadInfo>,
) -> Result<PutResult> {
    let (transfer_id, chunk_size, mut completed) = match resume {
        Some(info) => (
            info.transfer_id.clone(),
            info.chunk_size,
            info.chunk_map.clone(),
        ),
        None => {
            let transfer_id = uuid::Uuid::new_v4().simple().to_string();
            ctx.dav.ng_create_session(&transfer_id).await?;
            let chunk_size =
                adaptive_chunk_size(&ctx.opts, ctx.dav.stats().send_rate_bytes_per_sec());
            let _ = ctx.effects.send(SideEffect::SetUploadInfo(UploadInfo {
                path: spec.item.path.clone(),
                transfer_id: transfer_id.clone(),
                chunk_map: Vec::new(),
                chunk_size,
                mtime,
                size,
            }));
            (transfer_id, chunk_size, Vec::new())
        }
    };

    let chunk_count = div_ceil(size, chunk_size);
    for index in 0..chunk_count {
        if completed.contains(&index) {
            continue;
        }
        if ctx.abort.is_aborted() {
            anyhow::bail!("sync aborted");
        }
        let offset = index * chunk_size;
        let len = chunk_size.min(size - offset);
        let body = paced_file_body(ctx, abs, offset, len).await?;
        ctx.dav.ng_put_chunk(&transfer_id, offset, body).await?;
        completed.push(index);
        let _ = ctx.effects.send(SideEffect::SetUploadInfo(UploadInfo {
            path: spec.item.path.clone(),
            transfer_id: transfer_id.clone(),
            chunk_map: completed.clone(),
            chunk_size,
            mtime,
            size,
        }));
    }

    ctx.dav
        .ng_assemble(
            &transfer_id,
            &spec.item.path,
            spec.base_etag.as_deref(),
            size,
            mtime,
        )
        .await
}

async fn fixed_chunked_upload(
    ctx: &JobCtx,
    spec: &JobSpec,
    abs: &Path,
    size: i64,
    mtime: i64,
    _checksum: &Checksum,
    resume: Option<UploadInfo>,
) -> Result<PutResult> {
    let (transfer_id, chunk_size, mut completed) = match resume {
        Some(info) => (
            info.transfer_id.clone(),
            info.chunk_size,
            info.chunk_map.clone(),
        ),
        None => {
            let transfer_id = uuid::Uuid::new_v4().simple().to_string();
            let chunk_size =
                adaptive_chunk_size(&ctx.opts, ctx.dav.stats().send_rate_bytes_per_sec());
            let _ = ctx.effects.send(SideEffect::SetUploadInfo(UploadInfo {
                path: spec.item.path.clone(),
                transfer_id: transfer_id.clone(),
                chunk_map: Vec::new(),
                chunk_size,
                mtime,
                size,
            }));
            (transfer_id, chunk_size, Vec::new())
        }
    };

    let chunk_count = div_ceil(size, chunk_size);
    let mut last_result = PutResult::default();
    for index in 0..chunk_count {
        let is_final = index == chunk_count - 1;
        // The final chunk triggers assembly server-side, so it is always
        // re-sent on resume.
        if completed.contains(&index) && !is_final {
            continue;
        }
        if ctx.abort.is_aborted() {
            anyhow::bail!("sync aborted");
        }
        let offset = index * chunk_size;
        let len = chunk_size.min(size - offset);
        let body = paced_file_body(ctx, abs, offset, len).await?;
        last_result = ctx
            .dav
            .put_chunk_fixed(
                &spec.item.path,
                &transfer_id,
                index,
                chunk_count,
                body,
                spec.base_etag.as_deref(),
                mtime,
            )
            .await?;
        if !completed.contains(&index) {
            completed.push(index);
        }
        let _ = ctx.effects.send(SideEffect::SetUploadInfo(UploadInfo {
            path: spec.item.path.clone(),
            transfer_id: transfer_id.clone(),
            chunk_map: completed.clone(),
            chunk_size,
            mtime,
            size,
        }));
    }
    Ok(last_result)
}

fn div_ceil(n: i64, d: i64) -> i64 {
    if d <= 0 {
        return 0;
    }
    (n + d - 1) / d
}

/// Stream a file range as a request body, paced by the upload limiter so
/// cancellation stays observable between buffers.
async fn paced_file_body(
    ctx: &JobCtx,
    path: &Path,
    offset: i64,
    len: i64,
) -> Result<reqwest::Body> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset as u64)).await?;
    }

    let limiter: Arc<BandwidthManager> = ctx.bandwidth.clone();
    let stats = ctx.dav.stats();
    let abort = ctx.abort.clone();

    let stream = futures_util::stream::unfold(
        (file, len, limiter, stats, abort),
        |(mut file, remaining, limiter, stats, abort)| async move {
            if remaining <= 0 || abort.is_aborted() {
                return None;
            }
            let to_read = (STREAM_BUF as i64).min(remaining) as usize;
            let mut buf = vec![0u8; to_read];
            let mut filled = 0usize;
            while filled < to_read {
                match file.read(&mut buf[filled..]).await {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) => {
                        return Some((Err(err), (file, 0, limiter, stats, abort)));
                    }
                }
            }
            if filled == 0 {
                return None;
            }
            buf.truncate(filled);
            limiter.upload.acquire(filled).await;
            stats.on_send(filled as i64);
            let next_remaining = remaining - filled as i64;
            Some((
                Ok::<Vec<u8>, std::io::Error>(buf),
                (file, next_remaining, limiter, stats, abort),
            ))
        },
    );
    Ok(reqwest::Body::wrap_stream(stream))
}

async fn compute_checksum(path: &Path, algo: ChecksumAlgo) -> Result<Checksum> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut buf = vec![0u8; 1024 * 1024];
    match algo {
        ChecksumAlgo::Md5 => {
            let mut hasher = md5::Context::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.consume(&buf[..n]);
            }
            Ok(Checksum {
                algo,
                hex: format!("{:x}", hasher.compute()),
            })
        }
        ChecksumAlgo::Sha1 => {
            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(Checksum {
                algo,
                hex: format!("{:x}", hasher.finalize()),
            })
        }
    }
}

fn apply_put_result(record: &mut JournalRecord, put: &PutResult) {
    if !put.etag.is_empty() {
        record.etag = put.etag.clone();
    }
    if !put.file_id.is_empty() {
        record.file_id = put.file_id.clone();
    }
}

// -- conflicts -------------------------------------------------------------

/// Keep the server version at the original path and preserve the local
/// divergence under a conflict name, queued for upload.
async fn resolve_conflict(ctx: &JobCtx, spec: &JobSpec) -> Result<Apply> {
    let abs = abs_path(ctx, &spec.item.path);
    let conflict_rel = conflict_file_name(&spec.item.path, chrono::Utc::now());
    let conflict_abs = abs_path(ctx, &conflict_rel);

    if abs.exists() {
        std::fs::rename(&abs, &conflict_abs).with_context(|| {
            format!(
                "rename {} -> {}",
                abs.display(),
                conflict_abs.display()
            )
        })?;
    }

    let record = download_to_path(ctx, spec, &spec.item.path).await?;

    let mut upload = SyncFileItem::new(conflict_rel.clone(), FileKind::File);
    upload.instruction = Instruction::New;
    upload.direction = Direction::Up;
    if let Ok((_, mtime, size)) = stat_local(&conflict_abs) {
        upload.mtime = mtime;
        upload.size = size;
    }

    Ok(Apply::ConflictResolved {
        conflict_path: conflict_rel,
        record,
        upload,
    })
}

// -- type changes ----------------------------------------------------------

/// File became directory (or the reverse): drop the stale side, then let
/// the follow-up discovery create the replacement tree.
async fn type_change(ctx: &JobCtx, spec: &JobSpec, direction: Direction) -> Result<Apply> {
    match direction {
        Direction::Down => {
            let abs = abs_path(ctx, &spec.item.path);
            if abs.exists() {
                if abs.is_dir() {
                    std::fs::remove_dir_all(&abs)
                        .with_context(|| format!("remove {}", abs.display()))?;
                } else {
                    std::fs::remove_file(&abs)
                        .with_context(|| format!("remove {}", abs.display()))?;
                }
            }
            if spec.item.kind == FileKind::Directory {
                std::fs::create_dir_all(&abs)
                    .with_context(|| format!("mkdir {}", abs.display()))?;
                let (inode, mtime, _) = stat_local(&abs)?;
                return Ok(Apply::Record(record_for(
                    &spec.item,
                    FileKind::Directory,
                    inode,
                    mtime,
                    0,
                )));
            }
            let record = download_to_path(ctx, spec, &spec.item.path).await?;
            Ok(Apply::Record(record))
        }
        _ => {
            let _permit = ctx
                .queue
                .acquire(spec.priority, &ctx.abort)
                .await
                .ok_or_else(|| anyhow::anyhow!("sync aborted"))?;
            match ctx.dav.delete(&spec.item.path).await {
                Ok(()) => {}
                Err(err) if dav_status(&err) == Some(StatusCode::NOT_FOUND) => {}
                Err(err) => return Err(err),
            }
            if spec.item.kind == FileKind::Directory {
                ctx.dav.mkcol(&spec.item.path).await?;
                let abs = abs_path(ctx, &spec.item.path);
                let (inode, mtime, _) = stat_local(&abs)?;
                let mut record =
                    record_for(&spec.item, FileKind::Directory, inode, mtime, 0);
                if let Some(entry) = ctx.dav.stat(&spec.item.path).await? {
                    record.etag = entry.etag;
                    record.file_id = entry.file_id;
                }
                return Ok(Apply::Record(record));
            }
            // The old object is gone; the replacement uploads as a create.
            let mut create = spec.clone();
            create.base_etag = None;
            upload(ctx, &create).await
        }
    }
}
