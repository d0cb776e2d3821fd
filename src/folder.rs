use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::bandwidth::{BandwidthManager, TransferStats};
use crate::config::{Config, RootConfig, SyncOptions};
use crate::dav::{BasicCredentials, Capabilities, DavClient};
use crate::discovery::{reconcile, remote_snapshot, DiscoveryInput};
use crate::events::{EventBus, SyncEvent, SyncResultSummary};
use crate::excludes::ExcludeEngine;
use crate::journal::{SelectiveList, SyncJournal};
use crate::logging::SyncLog;
use crate::propagator::{Propagator, PropagatorOptions};
use crate::queue::{AbortFlag, JobQueue};
use crate::rootlock::RootLock;
use crate::scanner::{scan_local, LocalEntry, ScanMode};
use crate::types::{FileKind, PinState, SyncResult, SyncRunStatus};
use crate::vfs::{vfs_for_mode, Vfs};
use crate::watcher::LocalWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    NotYetStarted,
    SyncPrepare,
    SyncRunning,
    SyncAbortRequested,
    Success,
    Problem,
    Error,
    SetupError,
    Paused,
}

const MAX_FOLLOW_UPS: u8 = 3;

/// One sync root: etag polling, scheduling, running, reporting, and
/// retry/backoff. Runs are serialized by the caller; everything here
/// happens on the root's owner task.
pub struct Folder {
    root: PathBuf,
    options: SyncOptions,
    dav: Arc<DavClient>,
    journal: SyncJournal,
    vfs: Arc<dyn Vfs>,
    bandwidth: Arc<BandwidthManager>,
    queue: Arc<JobQueue>,
    events: EventBus,
    sync_log: Option<SyncLog>,
    state: FolderState,
    abort: AbortFlag,
    caps: Option<Arc<Capabilities>>,
    watcher: Option<LocalWatcher>,
    touched: BTreeSet<String>,
    last_remote_etag: String,
    last_poll: Option<Instant>,
    last_full_discovery: Option<Instant>,
    follow_ups_done: u8,
    pending_follow_up: bool,
    paused: bool,
    force_full_discovery: bool,
    _lock: RootLock,
}

impl Folder {
    pub fn new(
        cfg: &Config,
        root_cfg: &RootConfig,
        queue: Arc<JobQueue>,
        events: EventBus,
    ) -> Result<Self> {
        let root = root_cfg.local_dir.clone();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create sync root {}", root.display()))?;
        let lock = RootLock::try_lock(&root)?;

        let journal = SyncJournal::open(&root)?;
        let force_full_discovery = journal.was_recreated();

        let creds = Arc::new(BasicCredentials::new(
            &cfg.username,
            cfg.app_password.as_deref().unwrap_or(""),
        ));
        let stats = Arc::new(TransferStats::default());
        let dav = Arc::new(DavClient::new(
            &cfg.server_url,
            &root_cfg.remote_path,
            creds,
            stats,
        )?);

        let bandwidth = Arc::new(BandwidthManager::new(
            cfg.options.upload_limit,
            cfg.options.download_limit,
        ));

        let watcher = match LocalWatcher::start(root.clone()) {
            Ok(w) => Some(w),
            Err(err) => {
                crate::logging::error(format!(
                    "watcher unavailable for {}: {err:#}",
                    root.display()
                ));
                None
            }
        };

        let sync_log = match SyncLog::open(&root) {
            Ok(log) => Some(log),
            Err(err) => {
                crate::logging::error(format!("sync log unavailable: {err:#}"));
                None
            }
        };

        Ok(Folder {
            root,
            options: cfg.options.clone(),
            dav,
            journal,
            vfs: vfs_for_mode(root_cfg.vfs_mode),
            bandwidth,
            queue,
            events,
            sync_log,
            state: FolderState::NotYetStarted,
            abort: AbortFlag::new(),
            caps: None,
            watcher,
            touched: BTreeSet::new(),
            last_remote_etag: String::new(),
            last_poll: None,
            last_full_discovery: None,
            follow_ups_done: 0,
            pending_follow_up: false,
            paused: false,
            force_full_discovery,
            _lock: lock,
        })
    }

    pub fn state(&self) -> FolderState {
        if self.paused {
            FolderState::Paused
        } else {
            self.state
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn journal(&self) -> &SyncJournal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut SyncJournal {
        &mut self.journal
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Handle for cancelling the in-flight run from another task.
    pub fn abort_handle(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn abort(&mut self) {
        self.abort.abort();
        if self.state == FolderState::SyncRunning || self.state == FolderState::SyncPrepare {
            self.state = FolderState::SyncAbortRequested;
        }
    }

    fn poll_interval(&self) -> Duration {
        let secs = self
            .caps
            .as_ref()
            .and_then(|c| c.remote_poll_interval)
            .unwrap_or(self.options.remote_poll_secs);
        Duration::from_secs(secs.max(1))
    }

    fn drain_watcher(&mut self) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        for rel in watcher.drain_touched() {
            if is_internal_path(&rel) {
                continue;
            }
            self.touched.insert(rel);
        }
    }

    /// Decide whether work is due and run at most one sync. The daemon
    /// calls this for each root in turn, so at most one root syncs at any
    /// moment.
    pub async fn tick(&mut self) -> Result<Option<SyncResult>> {
        if self.paused {
            return Ok(None);
        }
        self.drain_watcher();

        let mut due = self.pending_follow_up
            || !self.touched.is_empty()
            || self.state == FolderState::NotYetStarted;

        let poll_elapsed = self
            .last_poll
            .map(|t| t.elapsed() >= self.poll_interval())
            .unwrap_or(true);
        if !due && poll_elapsed {
            self.last_poll = Some(Instant::now());
            match self.dav.root_etag().await {
                Ok(etag) => {
                    if etag != self.last_remote_etag {
                        due = true;
                    }
                }
                Err(err) => {
                    crate::logging::error(format!("etag poll failed: {err:#}"));
                    if self.dav.credentials().is_invalidated() {
                        self.state = FolderState::Error;
                        self.paused = true;
                    }
                }
            }
        }

        if !due {
            return Ok(None);
        }
        self.pending_follow_up = false;
        let result = self.sync_once().await?;
        Ok(Some(result))
    }

    pub async fn sync_once(&mut self) -> Result<SyncResult> {
        if self.paused {
            let mut result = SyncResult::new();
            result.status = SyncRunStatus::Aborted;
            return Ok(result);
        }

        self.state = FolderState::SyncPrepare;
        self.abort = AbortFlag::new();
        self.events.publish(SyncEvent::SyncStarted {
            root: self.root.clone(),
        });
        if let Some(log) = &self.sync_log {
            log.line("sync run start", &[("root", &self.root.display().to_string())]);
        }

        let run = self.run_inner().await;

        // Our own writes fed the watcher during the run; drop them.
        if let Some(watcher) = self.watcher.as_mut() {
            let _ = watcher.drain_touched();
        }

        let result = match run {
            Ok(result) => result,
            Err(err) => {
                if self.dav.credentials().is_invalidated() {
                    self.state = FolderState::Error;
                    self.paused = true;
                } else {
                    self.state = FolderState::Problem;
                }
                let mut result = SyncResult::new();
                result.record_fatal_error(&format!("{err:#}"));
                self.events.publish(SyncEvent::SyncFinished {
                    root: self.root.clone(),
                    result: SyncResultSummary::from(&result),
                });
                return Err(err);
            }
        };

        self.state = match result.status {
            SyncRunStatus::Success => FolderState::Success,
            SyncRunStatus::Problem | SyncRunStatus::Aborted => FolderState::Problem,
            SyncRunStatus::Error => FolderState::Error,
            SyncRunStatus::SetupError => FolderState::SetupError,
        };
        if self.dav.credentials().is_invalidated() {
            self.state = FolderState::Error;
            self.paused = true;
        }

        // Post-run follow-ups are capped so a flapping item cannot spin.
        if result.another_sync_needed && self.follow_ups_done < MAX_FOLLOW_UPS {
            self.pending_follow_up = true;
            self.follow_ups_done += 1;
        } else {
            self.follow_ups_done = 0;
        }

        if let Ok(etag) = self.dav.root_etag().await {
            self.last_remote_etag = etag;
        }
        self.last_poll = Some(Instant::now());

        if let Some(log) = &self.sync_log {
            log.line(
                "sync run finished",
                &[
                    ("items", &result.items_total.to_string()),
                    ("completed", &result.items_completed.to_string()),
                    ("errors", &result.items_errored.to_string()),
                ],
            );
        }
        self.events.publish(SyncEvent::SyncFinished {
            root: self.root.clone(),
            result: SyncResultSummary::from(&result),
        });
        Ok(result)
    }

    async fn run_inner(&mut self) -> Result<SyncResult> {
        let caps = match &self.caps {
            Some(caps) => caps.clone(),
            None => {
                let caps = Arc::new(self.dav.capabilities().await.context("capabilities")?);
                self.caps = Some(caps.clone());
                caps
            }
        };

        // Soft-local entries park until the lock goes away; a new run is
        // the retry signal.
        self.journal.wipe_soft_blacklist()?;

        self.drain_watcher();
        let full_due = self.force_full_discovery
            || self
                .last_full_discovery
                .map(|t| t.elapsed() >= Duration::from_secs(self.options.full_local_discovery_secs))
                .unwrap_or(true);
        let watcher_reliable = self.watcher.as_ref().map(|w| w.is_reliable()).unwrap_or(false);

        let touched = std::mem::take(&mut self.touched);
        let (mode, full_run) = if watcher_reliable && !full_due {
            (
                ScanMode::DatabaseAndFilesystem {
                    touched: touched.clone(),
                },
                false,
            )
        } else {
            (ScanMode::FilesystemOnly, true)
        };

        let excludes = ExcludeEngine::load(&self.root, self.options.sync_hidden_files)?;
        self.state = FolderState::SyncRunning;

        let mut scan = scan_local(
            &self.root,
            &mode,
            &excludes,
            self.vfs.as_ref(),
            &self.journal,
        )?;
        // Unreadable subtrees must not read as deletions; serve them from
        // the journal instead.
        for denied in scan.traversal_denied.clone() {
            for (path, record) in self.journal.iterate(&denied)? {
                scan.entries.entry(path.clone()).or_insert(LocalEntry {
                    pin_state: PinState::Unspecified,
                    path,
                    kind: record.kind,
                    size: record.size,
                    mtime: record.mtime,
                    inode: record.inode,
                    is_placeholder: record.kind == FileKind::VirtualFile,
                });
            }
        }

        let remote = remote_snapshot(&self.dav, &self.journal, Some(&touched), &self.abort)
            .await
            .context("remote listing")?;
        let journal_snapshot = self.journal.iterate("")?;
        let pins = self.journal.pin_states()?;
        let blacklist = self.journal.selective_list(SelectiveList::Blacklist)?;
        let undecided = self.journal.selective_list(SelectiveList::Undecided)?;

        let outcome = reconcile(&DiscoveryInput {
            local: &scan.entries,
            remote: &remote,
            journal: &journal_snapshot,
            pins: &pins,
            selective_blacklist: &blacklist,
            selective_undecided: &undecided,
            case_collisions: &scan.case_collisions,
            big_folder_threshold: self.options.big_folder_threshold_bytes,
            vfs_mode: self.vfs.mode(),
        });

        for purge in &outcome.journal_purges {
            self.journal.delete(purge)?;
        }
        for big in &outcome.new_big_folders {
            self.journal
                .add_to_selective_list(SelectiveList::Undecided, big)?;
            self.events.publish(SyncEvent::NewBigFolder {
                root: self.root.clone(),
                path: big.clone(),
            });
        }

        let opts = PropagatorOptions::from_config(&self.options, &caps);
        let mut propagator = Propagator {
            root: self.root.clone(),
            dav: self.dav.clone(),
            journal: &mut self.journal,
            vfs: self.vfs.clone(),
            bandwidth: self.bandwidth.clone(),
            queue: self.queue.clone(),
            events: self.events.clone(),
            sync_log: self.sync_log.as_ref(),
            abort: self.abort.clone(),
            caps: caps.clone(),
            opts,
            now: chrono::Utc::now().timestamp(),
        };
        let result = propagator.run(outcome.plan).await?;

        if full_run && result.status != SyncRunStatus::Error {
            self.last_full_discovery = Some(Instant::now());
            self.force_full_discovery = false;
        }
        Ok(result)
    }
}

fn is_internal_path(rel: &str) -> bool {
    let first = rel.split('/').next().unwrap_or(rel);
    if first.starts_with(".sync_")
        || first == crate::logging::SyncLog::FILE_NAME
        || first == crate::rootlock::LOCK_FILE_NAME
        || first == crate::excludes::EXCLUDE_FILE_NAME
    {
        return true;
    }
    // Download temp files: `.name.~xxxxxxxx`.
    let name = rel.rsplit('/').next().unwrap_or(rel);
    name.starts_with('.') && name.contains(".~")
}
