//! Collector for packages in a local directory.
//!
//! Instead of watching inotify events, the collector snapshots the directory
//! and diffs snapshots: once at startup and again whenever the process
//! receives SIGUSR1. Moves are recognized by inode so a rename does not
//! re-hash or re-register anything.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::SystemTime;

use qpy_protocol::PACKAGE_EXTENSION;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use super::CollectorError;
use crate::hash::hash_file;
use crate::indexer::Indexer;
use crate::indexer::ManifestOrPath;
use crate::package::Package;
use crate::package::SourceId;

/// Bidirectional path ↔ hash maps. One hash may be reachable through
/// several paths (identical copies of an archive).
#[derive(Default)]
pub(crate) struct PathToHash {
    paths: HashMap<PathBuf, String>,
    hashes: HashMap<String, HashSet<PathBuf>>,
}

impl PathToHash {
    pub fn insert(&mut self, hash: &str, path: PathBuf) {
        self.paths.insert(path.clone(), hash.to_string());
        self.hashes.entry(hash.to_string()).or_default().insert(path);
    }

    pub fn hash_of(&self, path: &Path) -> Option<&str> {
        self.paths.get(path).map(String::as_str)
    }

    pub fn paths_of(&self, hash: &str) -> Vec<PathBuf> {
        self.hashes
            .get(hash)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes one path, returning its hash and whether other paths still
    /// share it.
    pub fn remove_path(&mut self, path: &Path) -> Option<(String, bool)> {
        let hash = self.paths.remove(path)?;
        let mut shared = false;
        if let Some(paths) = self.hashes.get_mut(&hash) {
            paths.remove(path);
            shared = !paths.is_empty();
            if !shared {
                self.hashes.remove(&hash);
            }
        }
        Some((hash, shared))
    }

    pub fn unique_hash_count(&self) -> usize {
        self.hashes.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    inode: u64,
    size: u64,
    mtime_ok: bool,
    mtime: SystemTime,
}

type Snapshot = HashMap<PathBuf, FileStamp>;

#[derive(Default)]
struct SnapshotDiff {
    created: Vec<PathBuf>,
    deleted: Vec<PathBuf>,
    modified: Vec<PathBuf>,
    moved: Vec<(PathBuf, PathBuf)>,
}

fn take_snapshot(directory: &Path) -> std::io::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(PACKAGE_EXTENSION) {
            continue;
        }

        let metadata = entry.metadata()?;
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(&metadata);
        #[cfg(not(unix))]
        let inode = 0;

        let (mtime_ok, mtime) = match metadata.modified() {
            Ok(mtime) => (true, mtime),
            Err(_) => (false, SystemTime::UNIX_EPOCH),
        };
        snapshot.insert(
            path,
            FileStamp {
                inode,
                size: metadata.len(),
                mtime_ok,
                mtime,
            },
        );
    }
    Ok(snapshot)
}

fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();

    let mut disappeared: Vec<(&PathBuf, &FileStamp)> =
        old.iter().filter(|(path, _)| !new.contains_key(*path)).collect();
    let appeared: Vec<(&PathBuf, &FileStamp)> =
        new.iter().filter(|(path, _)| !old.contains_key(*path)).collect();

    for (new_path, new_stamp) in appeared {
        let moved_from = disappeared.iter().position(|(_, old_stamp)| {
            new_stamp.inode != 0 && old_stamp.inode == new_stamp.inode
        });
        match moved_from {
            Some(index) => {
                let (old_path, _) = disappeared.swap_remove(index);
                diff.moved.push((old_path.clone(), new_path.clone()));
            }
            None => diff.created.push(new_path.clone()),
        }
    }
    diff.deleted
        .extend(disappeared.into_iter().map(|(path, _)| path.clone()));

    for (path, new_stamp) in new {
        if let Some(old_stamp) = old.get(path) {
            if old_stamp != new_stamp {
                diff.modified.push(path.clone());
            }
        }
    }

    diff
}

pub struct LocalCollector {
    directory: PathBuf,
    source: SourceId,
    indexer: Arc<Indexer>,
    map: StdMutex<PathToHash>,
    /// Serializes updates and holds the previous snapshot.
    snapshot: Mutex<Option<Snapshot>>,
    signal_task: StdMutex<Option<JoinHandle<()>>>,
}

impl LocalCollector {
    pub fn new(directory: PathBuf, source: SourceId, indexer: Arc<Indexer>) -> Self {
        Self {
            directory,
            source,
            indexer,
            map: StdMutex::new(PathToHash::default()),
            snapshot: Mutex::new(None),
            signal_task: StdMutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), CollectorError> {
        {
            // Discard a possibly outdated snapshot, then pick up everything
            // currently in the directory.
            *self.snapshot.lock().await = None;
        }
        self.update(false).await?;

        #[cfg(unix)]
        {
            let collector = self.clone();
            let task = tokio::spawn(async move {
                let Ok(mut signal) = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::user_defined1(),
                ) else {
                    warn!("failed to install SIGUSR1 handler for the local collector");
                    return;
                };
                while signal.recv().await.is_some() {
                    if let Err(error) = collector.update(true).await {
                        warn!(%error, "local collector update failed");
                    }
                }
            });
            if let Ok(mut slot) = self.signal_task.lock() {
                *slot = Some(task);
            }
        }

        let unique = self.map.lock().map(|map| map.unique_hash_count()).unwrap_or(0);
        info!(
            "local collector started for directory {} with {unique} unique package(s)",
            self.directory.display(),
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if let Ok(mut slot) = self.signal_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// Reflects directory changes into the map and the indexer.
    pub async fn update(&self, with_log: bool) -> Result<(), CollectorError> {
        let mut snapshot_slot = self.snapshot.lock().await;
        let old = snapshot_slot.take().unwrap_or_default();

        let directory = self.directory.clone();
        let new = tokio::task::spawn_blocking(move || take_snapshot(&directory))
            .await
            .map_err(|err| CollectorError::Io(std::io::Error::other(err)))??;

        let diff = diff_snapshots(&old, &new);

        for path in &diff.created {
            self.add_package(path).await?;
        }

        for path in &diff.deleted {
            self.remove_package(path).await;
        }

        for path in &diff.modified {
            self.remove_package(path).await;
            self.add_package(path).await?;
            warn!(
                "package {} was modified; a worker currently reading it may misbehave",
                path.display()
            );
        }

        // Remove every old path before inserting new ones, so swapped paths
        // don't collide.
        let mut moves = Vec::new();
        for (old_path, new_path) in &diff.moved {
            let removed = self
                .map
                .lock()
                .ok()
                .and_then(|mut map| map.remove_path(old_path));
            if let Some((hash, _)) = removed {
                moves.push((hash, new_path.clone()));
            }
        }
        for (hash, new_path) in moves {
            if let Ok(mut map) = self.map.lock() {
                map.insert(&hash, new_path);
            }
        }

        *snapshot_slot = Some(new);
        drop(snapshot_slot);

        if with_log {
            info!(
                "updated packages: {} created, {} deleted, {} modified, {} moved",
                diff.created.len(),
                diff.deleted.len(),
                diff.modified.len(),
                diff.moved.len(),
            );
        }
        Ok(())
    }

    async fn add_package(&self, path: &Path) -> Result<(), CollectorError> {
        let hash_path = path.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || hash_file(&hash_path))
            .await
            .map_err(|err| CollectorError::Io(std::io::Error::other(err)))??;

        if let Ok(mut map) = self.map.lock() {
            map.insert(&hash, path.to_path_buf());
        }
        self.indexer
            .register(&hash, self.source, ManifestOrPath::Path(path.to_path_buf()))
            .await?;
        Ok(())
    }

    async fn remove_package(&self, path: &Path) {
        let removed = self
            .map
            .lock()
            .ok()
            .and_then(|mut map| map.remove_path(path));
        if let Some((hash, shared)) = removed {
            if !shared {
                self.indexer.unregister(&hash, self.source).await;
            }
        }
    }

    /// Path of the package, preferring any copy that still exists.
    pub async fn get_path(&self, package: &Package) -> Result<PathBuf, CollectorError> {
        let paths = self
            .map
            .lock()
            .map(|map| map.paths_of(package.hash()))
            .unwrap_or_default();
        paths
            .into_iter()
            .find(|path| path.is_file())
            .ok_or(CollectorError::NotFound)
    }
}
