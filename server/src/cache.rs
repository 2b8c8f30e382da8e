//! On-disk content-addressed LRU store.
//!
//! Entries live at `<dir>/<hex-hash><ext>`. Writes go to a `.tmp` sibling and
//! are renamed into place, so readers never observe partial files. All
//! mutation happens under a single async mutex; eviction walks the LRU end
//! until the accounted total fits the configured maximum again.

use std::path::Path;
use std::path::PathBuf;

use futures::future::BoxFuture;
use lru::LruCache;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::info;

/// Hook fired once after every eviction or explicit removal, with the
/// removed key. Installed by the package collection so LMS-only packages
/// drop out of the index when their file goes away.
pub type RemovalCallback =
    std::sync::Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

const TMP_EXTENSION: &str = "tmp";

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("no cached file for this key")]
    NotFound,

    #[error("item of {actual_size} bytes exceeds the cache maximum of {max_size} bytes")]
    ItemTooLarge { max_size: u64, actual_size: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedFile {
    path: PathBuf,
    size: u64,
}

struct Inner {
    files: LruCache<String, CachedFile>,
    total_size: u64,
}

pub struct FileLimitLru {
    directory: PathBuf,
    max_size: u64,
    /// Extension including the leading dot.
    extension: String,
    name: String,
    inner: Mutex<Inner>,
    on_remove: RwLock<Option<RemovalCallback>>,
}

impl FileLimitLru {
    /// Opens (and scans) the cache directory, purging leftover `.tmp` files
    /// and evicting overflow until the total fits `max_size`. Runs at server
    /// startup, so the scan is synchronous.
    pub fn new(
        directory: impl Into<PathBuf>,
        max_size: u64,
        extension: &str,
        name: &str,
    ) -> std::io::Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;

        let extension = format!(".{}", extension.trim_start_matches('.'));
        let mut files: LruCache<String, CachedFile> = LruCache::unbounded();
        let mut total_size: u64 = 0;

        for entry in std::fs::read_dir(&directory)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) == Some(TMP_EXTENSION) {
                let _ = std::fs::remove_file(&path);
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(&extension) else {
                continue;
            };

            let size = entry.metadata()?.len();
            if total_size + size > max_size {
                std::fs::remove_file(&path)?;
                continue;
            }

            total_size += size;
            files.put(stem.to_string(), CachedFile { path, size });
        }

        info!(
            "{name} initialised at {} with {} file(s) and {total_size}/{max_size} bytes",
            directory.display(),
            files.len(),
        );

        Ok(Self {
            directory,
            max_size,
            extension,
            name: name.to_string(),
            inner: Mutex::new(Inner { files, total_size }),
            on_remove: RwLock::new(None),
        })
    }

    /// Installs the removal hook. Call once during assembly, before traffic.
    pub async fn set_on_remove(&self, callback: RemovalCallback) {
        *self.on_remove.write().await = Some(callback);
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub async fn total_size(&self) -> u64 {
        self.inner.lock().await.total_size
    }

    pub async fn space_left(&self) -> u64 {
        self.max_size - self.inner.lock().await.total_size
    }

    /// True if the key is cached; touches the entry to the MRU end. No file
    /// system access.
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.files.get(key).is_some()
    }

    /// Path of the cached file, touching the entry to the MRU end.
    pub async fn get(&self, key: &str) -> Result<PathBuf, CacheError> {
        self.inner
            .lock()
            .await
            .files
            .get(key)
            .map(|file| file.path.clone())
            .ok_or(CacheError::NotFound)
    }

    /// Writes a file into the cache, atomically, then evicts from the LRU
    /// end until the accounted total is within bounds again.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<PathBuf, CacheError> {
        let size = value.len() as u64;
        if size > self.max_size {
            // Allowing this through would evict the entire cache and still
            // not fit.
            return Err(CacheError::ItemTooLarge {
                max_size: self.max_size,
                actual_size: size,
            });
        }

        let mut inner = self.inner.lock().await;

        let path = self.directory.join(format!("{key}{}", self.extension));
        let tmp_path = self.directory.join(format!("{key}{}.{TMP_EXTENSION}", self.extension));
        tokio::fs::write(&tmp_path, value).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        if let Some(replaced) = inner.files.put(
            key.to_string(),
            CachedFile {
                path: path.clone(),
                size,
            },
        ) {
            inner.total_size -= replaced.size;
        }
        inner.total_size += size;

        let mut removed_keys = Vec::new();
        while inner.total_size > self.max_size {
            let Some((evicted_key, evicted)) = inner.files.pop_lru() else {
                break;
            };
            tokio::fs::remove_file(&evicted.path).await.ok();
            inner.total_size -= evicted.size;
            removed_keys.push(evicted_key);
        }
        drop(inner);

        for removed in removed_keys {
            self.fire_on_remove(removed).await;
        }

        Ok(path)
    }

    /// Removes a file from the cache and the filesystem.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;
        let Some(file) = inner.files.pop(key) else {
            return Err(CacheError::NotFound);
        };
        tokio::fs::remove_file(&file.path).await.ok();
        inner.total_size -= file.size;
        drop(inner);

        self.fire_on_remove(key.to_string()).await;
        Ok(())
    }

    /// Keys currently cached, most recently used first. For diagnostics and
    /// tests.
    pub async fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.files.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn fire_on_remove(&self, key: String) {
        let callback = self.on_remove.read().await.clone();
        if let Some(callback) = callback {
            callback(key).await;
        }
    }
}
