//! Collector for packages uploaded by the host.
//!
//! There is no inventory behind this collector; it stores whatever the host
//! sends into the package cache and registers the hash. Eviction from the
//! cache is the only way an upload leaves the index, wired through the
//! cache's removal callback.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::FileLimitLru;
use crate::hash::HashContainer;
use crate::indexer::Indexer;
use crate::indexer::ManifestOrPath;
use crate::package::Package;
use crate::package::SourceId;

use super::CollectorError;

pub struct LmsCollector {
    cache: Arc<FileLimitLru>,
    source: SourceId,
    indexer: Arc<Indexer>,
}

impl LmsCollector {
    pub fn new(cache: Arc<FileLimitLru>, source: SourceId, indexer: Arc<Indexer>) -> Self {
        Self {
            cache,
            source,
            indexer,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Stores an uploaded archive and registers it. A hash already in the
    /// cache is reused without rewriting the file.
    pub async fn put(&self, container: &HashContainer) -> Result<Arc<Package>, CollectorError> {
        let path = match self.cache.get(&container.hash).await {
            Ok(path) => path,
            Err(_) => self.cache.put(&container.hash, &container.data).await?,
        };

        Ok(self
            .indexer
            .register(&container.hash, self.source, ManifestOrPath::Path(path))
            .await?)
    }

    pub async fn get_path(&self, package: &Package) -> Result<PathBuf, CollectorError> {
        self.cache
            .get(package.hash())
            .await
            .map_err(|_| CollectorError::NotFound)
    }
}
