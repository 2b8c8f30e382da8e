//! Collector for packages in a remote repository.
//!
//! A background task polls `META.json` on the configured interval; when the
//! index timestamp advances, the new index is fetched (verified, cached) and
//! diffed against the previous one. Archives themselves are only downloaded
//! on demand, straight into the package cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use super::CollectorError;
use crate::cache::CacheError;
use crate::cache::FileLimitLru;
use crate::indexer::Indexer;
use crate::indexer::ManifestOrPath;
use crate::package::Package;
use crate::package::SourceId;
use crate::repository::Repository;
use crate::repository::models::RepoPackage;

struct RepoState {
    last_timestamp: Option<i64>,
    packages: HashMap<String, RepoPackage>,
}

pub struct RepoCollector {
    repository: Repository,
    update_interval: Duration,
    source: SourceId,
    indexer: Arc<Indexer>,
    package_cache: Arc<FileLimitLru>,
    index_cache: Arc<FileLimitLru>,
    state: Mutex<RepoState>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RepoCollector {
    pub fn new(
        url: String,
        update_interval: Duration,
        source: SourceId,
        indexer: Arc<Indexer>,
        package_cache: Arc<FileLimitLru>,
        index_cache: Arc<FileLimitLru>,
    ) -> Self {
        Self {
            repository: Repository::new(url, reqwest::Client::new()),
            update_interval,
            source,
            indexer,
            package_cache,
            index_cache,
            state: Mutex::new(RepoState {
                last_timestamp: None,
                packages: HashMap::new(),
            }),
            poll_task: StdMutex::new(None),
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), CollectorError> {
        let collector = self.clone();
        let task = tokio::spawn(async move {
            loop {
                if let Err(error) = collector.update().await {
                    warn!(
                        url = collector.repository.base_url(),
                        %error,
                        "repository update failed",
                    );
                }
                tokio::time::sleep(collector.update_interval).await;
            }
        });
        if let Ok(mut slot) = self.poll_task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        if let Ok(mut slot) = self.poll_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// Fetches the index if it advanced and reconciles the indexer with it.
    pub async fn update(&self) -> Result<(), CollectorError> {
        let mut state = self.state.lock().await;

        let meta = self.repository.get_meta().await?;
        if state.last_timestamp.is_some_and(|last| meta.timestamp <= last) {
            return Ok(());
        }

        let index_gz = self.repository.fetch_index(&meta).await?;
        // Keep the verified index around; a restart can then diff against
        // it without an extra download.
        if let Err(error) = self.index_cache.put(&meta.sha256, &index_gz).await {
            warn!(%error, "failed to cache the repository index");
        }

        let new_packages = Repository::parse_index(&index_gz)?;

        let removed: Vec<String> = state
            .packages
            .keys()
            .filter(|hash| !new_packages.contains_key(*hash))
            .cloned()
            .collect();
        for hash in removed {
            self.indexer.unregister(&hash, self.source).await;
        }

        for (hash, package) in &new_packages {
            if !state.packages.contains_key(hash) {
                self.indexer
                    .register(
                        hash,
                        self.source,
                        ManifestOrPath::Manifest(package.manifest.clone()),
                    )
                    .await?;
            }
        }

        info!(
            url = self.repository.base_url(),
            packages = new_packages.len(),
            "repository index updated",
        );
        state.last_timestamp = Some(meta.timestamp);
        state.packages = new_packages;
        Ok(())
    }

    /// Downloads the archive into the package cache and returns its path.
    /// An archive the cache cannot hold behaves like a missing package.
    pub async fn get_path(&self, package: &Package) -> Result<PathBuf, CollectorError> {
        if let Ok(path) = self.package_cache.get(package.hash()).await {
            return Ok(path);
        }

        let repo_package = {
            let state = self.state.lock().await;
            state
                .packages
                .get(package.hash())
                .cloned()
                .ok_or(CollectorError::NotFound)?
        };

        let bytes = self.repository.get_package(&repo_package).await?;
        match self.package_cache.put(package.hash(), &bytes).await {
            Ok(path) => Ok(path),
            Err(CacheError::ItemTooLarge { .. }) => Err(CollectorError::NotFound),
            Err(error) => Err(error.into()),
        }
    }
}
