use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Filesystem watcher for one sync root. Touched relative paths accumulate
/// until the folder loop drains them into the next run's scan set.
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<String>,
    /// False once the backend reported an error; the folder loop then falls
    /// back to full-filesystem discovery.
    reliable: bool,
}

impl LocalWatcher {
    pub fn start(root: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let event = match res {
                    Ok(e) => e,
                    Err(_) => {
                        // Signal unreliability with a sentinel; the receiver
                        // side flips the flag.
                        let _ = tx.send(String::new());
                        return;
                    }
                };
                if !matches!(
                    event.kind,
                    EventKind::Create(_)
                        | EventKind::Modify(_)
                        | EventKind::Remove(_)
                        | EventKind::Any
                ) {
                    return;
                }
                for path in &event.paths {
                    if let Some(rel) = rel_path(&watch_root, path) {
                        let _ = tx.send(rel);
                    }
                }
            },
            notify::Config::default(),
        )
        .context("create filesystem watcher")?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;

        Ok(Self {
            _watcher: watcher,
            rx,
            reliable: true,
        })
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    /// Drain everything the watcher has seen since the last call.
    pub fn drain_touched(&mut self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        while let Ok(rel) = self.rx.try_recv() {
            if rel.is_empty() {
                self.reliable = false;
                continue;
            }
            out.insert(rel);
        }
        out
    }

    /// Await at least one touched path (or return None on channel close).
    pub async fn next_touched(&mut self) -> Option<String> {
        loop {
            let rel = self.rx.recv().await?;
            if rel.is_empty() {
                self.reliable = false;
                continue;
            }
            return Some(rel);
        }
    }
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
