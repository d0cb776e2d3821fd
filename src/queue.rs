use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Cooperative cancellation shared by every job of a run. All suspension
/// points observe an abort within a second.
#[derive(Clone, Default)]
pub struct AbortFlag {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_aborted() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

/// Global scheduler bounding concurrent HTTP jobs across all roots so one
/// busy folder cannot starve the host. Normal jobs queue FIFO on the shared
/// permits; user-visible jobs (explicit hydrations) draw on a reserve so
/// they never wait behind bulk transfers.
pub struct JobQueue {
    shared: Arc<Semaphore>,
    reserve: Arc<Semaphore>,
}

pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
}

pub const DEFAULT_GLOBAL_JOBS: usize = 18;
const PRIORITY_RESERVE: usize = 2;

impl JobQueue {
    pub fn new(max_jobs: usize) -> Self {
        JobQueue {
            shared: Arc::new(Semaphore::new(max_jobs.max(1))),
            reserve: Arc::new(Semaphore::new(PRIORITY_RESERVE)),
        }
    }

    /// Wait for a slot; `None` when the run aborts first.
    pub async fn acquire(&self, priority: bool, abort: &AbortFlag) -> Option<JobPermit> {
        if abort.is_aborted() {
            return None;
        }

        if priority {
            // Prefer an idle shared slot; fall back to the reserve.
            if let Ok(permit) = self.shared.clone().try_acquire_owned() {
                return Some(JobPermit { _permit: permit });
            }
            tokio::select! {
                permit = self.reserve.clone().acquire_owned() => {
                    permit.ok().map(|p| JobPermit { _permit: p })
                }
                _ = abort.wait() => None,
            }
        } else {
            tokio::select! {
                permit = self.shared.clone().acquire_owned() => {
                    permit.ok().map(|p| JobPermit { _permit: p })
                }
                _ = abort.wait() => None,
            }
        }
    }

    pub fn available(&self) -> usize {
        self.shared.available_permits()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBAL_JOBS)
    }
}

/// Sleep that stays responsive to aborts; returns false when aborted.
pub async fn interruptible_sleep(duration: Duration, abort: &AbortFlag) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = abort.wait() => false,
    }
}
