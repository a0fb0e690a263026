//! Filesystem watcher for plugin manifests
//!
//! Raw `notify` events are coalesced per path and turned into
//! [`PluginChange`] messages once a directory has been quiet for the
//! debounce period. The manager consumes them from a channel and never
//! touches the watcher itself.

use super::manifest::is_manifest_path;
use crate::error::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A manifest file appeared, changed or went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginChange {
    Added(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl PluginChange {
    pub fn path(&self) -> &PathBuf {
        match self {
            PluginChange::Added(path) | PluginChange::Modified(path) | PluginChange::Removed(path) => path,
        }
    }
}

/// Watches plugin directories until dropped
pub struct PluginWatcher {
    _watcher: RecommendedWatcher,
    debouncer: JoinHandle<()>,
}

impl PluginWatcher {
    /// Watch every existing directory in `directories`
    pub fn start(
        directories: &[PathBuf],
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PluginChange>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!(error = %e, "Plugin watcher error"),
            }
        })?;

        for directory in directories {
            if directory.is_dir() {
                watcher.watch(directory, RecursiveMode::NonRecursive)?;
                debug!(directory = %directory.display(), "Watching plugin directory");
            } else {
                debug!(directory = %directory.display(), "Plugin directory missing, not watched");
            }
        }

        let (debouncer, changes) = spawn_debouncer(raw_rx, debounce);
        Ok((
            Self {
                _watcher: watcher,
                debouncer,
            },
            changes,
        ))
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        self.debouncer.abort();
    }
}

pub(crate) fn spawn_debouncer(
    raw: mpsc::UnboundedReceiver<notify::Event>,
    debounce: Duration,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<PluginChange>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(debounce_loop(raw, tx, debounce));
    (handle, rx)
}

async fn debounce_loop(
    mut raw: mpsc::UnboundedReceiver<notify::Event>,
    tx: mpsc::UnboundedSender<PluginChange>,
    debounce: Duration,
) {
    // path -> a create was seen in this burst
    let mut pending: HashMap<PathBuf, bool> = HashMap::new();

    loop {
        let next = if pending.is_empty() {
            raw.recv().await
        } else {
            match tokio::time::timeout(debounce, raw.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    if !flush(&mut pending, &tx) {
                        return;
                    }
                    continue;
                }
            }
        };

        let Some(event) = next else {
            flush(&mut pending, &tx);
            return;
        };

        if matches!(event.kind, notify::EventKind::Access(_)) {
            continue;
        }
        let created = matches!(event.kind, notify::EventKind::Create(_));
        for path in event.paths.into_iter().filter(|p| is_manifest_path(p)) {
            *pending.entry(path).or_insert(false) |= created;
        }
    }
}

/// Emit one change per pending path; false once the receiver is gone
fn flush(pending: &mut HashMap<PathBuf, bool>, tx: &mpsc::UnboundedSender<PluginChange>) -> bool {
    let mut paths: Vec<_> = pending.drain().collect();
    paths.sort();
    for (path, created) in paths {
        let change = if !path.exists() {
            PluginChange::Removed(path)
        } else if created {
            PluginChange::Added(path)
        } else {
            PluginChange::Modified(path)
        };
        debug!(?change, "Plugin manifest changed");
        if tx.send(change).is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    fn event(kind: notify::EventKind, path: &std::path::Path) -> notify::Event {
        notify::Event::new(kind).add_path(path.to_path_buf())
    }

    #[tokio::test]
    async fn test_burst_collapses_to_one_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.toml");
        std::fs::write(&path, "[plugin]").unwrap();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (_task, mut changes) = spawn_debouncer(raw_rx, Duration::from_millis(50));

        raw_tx.send(event(notify::EventKind::Create(CreateKind::File), &path)).unwrap();
        raw_tx.send(event(notify::EventKind::Modify(ModifyKind::Any), &path)).unwrap();
        raw_tx.send(event(notify::EventKind::Modify(ModifyKind::Any), &path)).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, PluginChange::Added(path.clone()));

        raw_tx.send(event(notify::EventKind::Modify(ModifyKind::Any), &path)).unwrap();
        let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, PluginChange::Modified(path));
    }

    #[tokio::test]
    async fn test_missing_file_is_removed_and_others_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone.toml");
        let notes = dir.path().join("notes.txt");

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (_task, mut changes) = spawn_debouncer(raw_rx, Duration::from_millis(20));

        raw_tx.send(event(notify::EventKind::Create(CreateKind::File), &notes)).unwrap();
        raw_tx.send(event(notify::EventKind::Remove(RemoveKind::File), &gone)).unwrap();
        drop(raw_tx);

        let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, PluginChange::Removed(gone));
        assert!(changes.recv().await.is_none());
    }
}
