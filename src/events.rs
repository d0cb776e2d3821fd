use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::types::{FileStatus, ProgressInfo, SyncFileItem, SyncResult};

/// Typed events published by a folder loop. Subscribers (UI, overlay
/// providers) attach via `subscribe`; slow consumers drop old events.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStarted {
        root: PathBuf,
    },
    ItemCompleted {
        root: PathBuf,
        item: SyncFileItem,
    },
    TransmissionProgress {
        root: PathBuf,
        info: ProgressInfo,
    },
    NewBigFolder {
        root: PathBuf,
        path: String,
    },
    SyncFinished {
        root: PathBuf,
        result: SyncResultSummary,
    },
    FileStatusChanged {
        root: PathBuf,
        path: String,
        status: FileStatus,
    },
}

/// Broadcast-friendly subset of `SyncResult`.
#[derive(Debug, Clone)]
pub struct SyncResultSummary {
    pub success: bool,
    pub items_total: usize,
    pub items_errored: usize,
    pub items_conflicted: usize,
    pub first_error: Option<String>,
}

impl From<&SyncResult> for SyncResultSummary {
    fn from(r: &SyncResult) -> Self {
        SyncResultSummary {
            success: matches!(r.status, crate::types::SyncRunStatus::Success),
            items_total: r.items_total,
            items_errored: r.items_errored,
            items_conflicted: r.items_conflicted,
            first_error: r
                .first_fatal_error
                .clone()
                .or_else(|| r.first_normal_error.clone()),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
