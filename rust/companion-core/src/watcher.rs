//! Content-aware file change detection for cached documents.
//!
//! A single notify watcher observes the parent directories of tracked files.
//! Events are evaluated on a dedicated thread: only events whose path equals
//! a tracked path are considered, and a change is signalled only when the
//! file's content digest differs from the last known one. The digest
//! comparison is the only debounce; editors that rewrite identical bytes
//! produce no signal.
//!
//! The watcher thread never touches the transaction registry or the network.
//! It hands `ChangeSignal`s to the dispatch loop over a bounded channel.

use crate::digest::ContentDigest;
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher: notify error - {0}")]
    Notify(#[from] notify::Error),

    #[error("watcher: io error - {0}")]
    Io(#[from] std::io::Error),

    #[error("watcher: path must be absolute - {0:?}")]
    NotAbsolute(PathBuf),
}

/// A real content change of a tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    pub transaction_id: String,
    pub path: PathBuf,
    pub digest: ContentDigest,
}

#[derive(Debug, Clone)]
struct TrackedFile {
    transaction_id: String,
    digest: ContentDigest,
}

type TrackedFiles = Arc<Mutex<HashMap<PathBuf, TrackedFile>>>;

pub struct FileChangeWatcher {
    watcher: RecommendedWatcher,
    tracked: TrackedFiles,
    watched_dirs: HashMap<PathBuf, usize>,
}

impl FileChangeWatcher {
    /// Starts the watcher thread. Change signals arrive on the returned receiver.
    pub fn start(capacity: usize) -> Result<(Self, mpsc::Receiver<ChangeSignal>), WatchError> {
        let (event_tx, event_rx) = std_mpsc::channel();
        let (signal_tx, signal_rx) = mpsc::channel(capacity.max(1));
        let watcher = RecommendedWatcher::new(event_tx, notify::Config::default())?;
        let tracked: TrackedFiles = Arc::new(Mutex::new(HashMap::new()));

        let tracked_clone = Arc::clone(&tracked);
        std::thread::Builder::new()
            .name("companion-watcher".into())
            .spawn(move || {
                // Ends when the notify watcher (and its sender) is dropped.
                for result in event_rx {
                    let event: Event = match result {
                        Ok(event) => event,
                        Err(e) => {
                            log::warn!("file watcher error: {e}");
                            continue;
                        }
                    };
                    if !is_content_event(&event.kind) {
                        continue;
                    }
                    for path in &event.paths {
                        if let Some(signal) = evaluate(&tracked_clone, path) {
                            if signal_tx.blocking_send(signal).is_err() {
                                return;
                            }
                        }
                    }
                }
            })?;

        Ok((
            Self {
                watcher,
                tracked,
                watched_dirs: HashMap::new(),
            },
            signal_rx,
        ))
    }

    /// Tracks `path` for `transaction_id`, starting from `digest`.
    ///
    /// `path` must be absolute and canonical; events are matched by exact
    /// path equality. Tracking a path again replaces the previous entry.
    pub fn track(
        &mut self,
        transaction_id: &str,
        path: &Path,
        digest: ContentDigest,
    ) -> Result<(), WatchError> {
        if !path.is_absolute() {
            return Err(WatchError::NotAbsolute(path.to_path_buf()));
        }
        let dir = path
            .parent()
            .ok_or_else(|| WatchError::NotAbsolute(path.to_path_buf()))?
            .to_path_buf();

        let previous = lock(&self.tracked).insert(
            path.to_path_buf(),
            TrackedFile {
                transaction_id: transaction_id.to_string(),
                digest,
            },
        );

        match previous {
            Some(old) => {
                if old.transaction_id != transaction_id {
                    log::warn!(
                        "{} moved from transaction {} to {}",
                        path.display(),
                        old.transaction_id,
                        transaction_id
                    );
                }
            }
            None => {
                if !self.watched_dirs.contains_key(&dir) {
                    if let Err(e) = self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                        lock(&self.tracked).remove(path);
                        return Err(e.into());
                    }
                }
                *self.watched_dirs.entry(dir).or_insert(0) += 1;
            }
        }

        log::debug!("watching {} for transaction {transaction_id}", path.display());
        Ok(())
    }

    pub fn untrack(&mut self, path: &Path) {
        if lock(&self.tracked).remove(path).is_none() {
            return;
        }
        let Some(dir) = path.parent() else {
            return;
        };
        if let Some(count) = self.watched_dirs.get_mut(dir) {
            *count -= 1;
            if *count == 0 {
                self.watched_dirs.remove(dir);
                if let Err(e) = self.watcher.unwatch(dir) {
                    log::debug!("unwatch {} failed: {e}", dir.display());
                }
            }
        }
    }

    pub fn untrack_all(&mut self) {
        let paths: Vec<PathBuf> = lock(&self.tracked).keys().cloned().collect();
        for path in paths {
            self.untrack(&path);
        }
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        lock(&self.tracked).keys().cloned().collect()
    }
}

fn lock(tracked: &TrackedFiles) -> MutexGuard<'_, HashMap<PathBuf, TrackedFile>> {
    tracked.lock().unwrap_or_else(|e| e.into_inner())
}

// Modify covers in-place writes and rename-onto-target; close-write covers
// editors that write through a fresh handle without a separate modify.
fn is_content_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn evaluate(tracked: &TrackedFiles, path: &Path) -> Option<ChangeSignal> {
    let (transaction_id, previous) = {
        let map = lock(tracked);
        let entry = map.get(path)?;
        (entry.transaction_id.clone(), entry.digest)
    };

    let current = match ContentDigest::of_file(path) {
        Ok(digest) => digest,
        Err(e) => {
            // Mid-rename or deleted; a later event will carry the new file.
            log::debug!("cannot hash {}: {e}", path.display());
            return None;
        }
    };

    if current == previous {
        log::debug!("{} touched, content unchanged", path.display());
        return None;
    }

    let mut map = lock(tracked);
    let entry = map.get_mut(path)?;
    if entry.transaction_id != transaction_id || entry.digest != previous {
        return None;
    }
    entry.digest = current;
    log::info!("{} changed ({current})", path.display());

    Some(ChangeSignal {
        transaction_id,
        path: path.to_path_buf(),
        digest: current,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn tracked_with(path: &Path, content: &[u8]) -> TrackedFiles {
        let mut map = HashMap::new();
        map.insert(
            path.to_path_buf(),
            TrackedFile {
                transaction_id: "t1".into(),
                digest: ContentDigest::of_bytes(content),
            },
        );
        Arc::new(Mutex::new(map))
    }

    #[test]
    fn test_unchanged_content_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.docx");
        fs::write(&path, b"original").unwrap();
        let tracked = tracked_with(&path, b"original");

        assert!(evaluate(&tracked, &path).is_none());
    }

    #[test]
    fn test_changed_content_signals_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.docx");
        fs::write(&path, b"original").unwrap();
        let tracked = tracked_with(&path, b"original");

        fs::write(&path, b"edited").unwrap();
        let signal = evaluate(&tracked, &path).unwrap();
        assert_eq!(signal.transaction_id, "t1");
        assert_eq!(signal.digest, ContentDigest::of_bytes(b"edited"));

        // Stored digest was updated, so a repeated event is a no-op.
        assert!(evaluate(&tracked, &path).is_none());
    }

    #[test]
    fn test_other_paths_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.docx");
        let lock_file = dir.path().join(".~lock.doc.docx#");
        fs::write(&path, b"original").unwrap();
        fs::write(&lock_file, b"lock").unwrap();
        let tracked = tracked_with(&path, b"original");

        assert!(evaluate(&tracked, &lock_file).is_none());
        assert!(evaluate(&tracked, &dir.path().join("doc.docx.bak")).is_none());
    }

    #[test]
    fn test_missing_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.docx");
        let tracked = tracked_with(&path, b"original");
        assert!(evaluate(&tracked, &path).is_none());
    }

    #[test]
    fn test_relative_path_rejected() {
        let (mut watcher, _rx) = FileChangeWatcher::start(4).unwrap();
        let err = watcher
            .track("t1", Path::new("doc.docx"), ContentDigest::of_bytes(b""))
            .unwrap_err();
        assert!(matches!(err, WatchError::NotAbsolute(_)));
    }

    #[tokio::test]
    async fn test_watcher_delivers_signal() {
        let dir = tempdir().unwrap();
        let cache = fs::canonicalize(dir.path()).unwrap();
        let path = cache.join("doc.txt");
        fs::write(&path, b"v1").unwrap();

        let (mut watcher, mut rx) = FileChangeWatcher::start(4).unwrap();
        watcher
            .track("t1", &path, ContentDigest::of_file(&path).unwrap())
            .unwrap();
        assert_eq!(watcher.tracked_paths(), vec![path.clone()]);

        fs::write(&path, b"v2").unwrap();
        let expected = ContentDigest::of_bytes(b"v2");
        // The truncate preceding the write may be observed as its own change.
        let signal = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let signal = rx.recv().await.unwrap();
                if signal.digest == expected {
                    return signal;
                }
            }
        })
        .await
        .expect("no change signal");
        assert_eq!(signal.path, path);
        assert_eq!(signal.transaction_id, "t1");

        watcher.untrack(&path);
        assert!(watcher.tracked_paths().is_empty());
    }
}
