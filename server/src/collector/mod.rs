//! Package sources feeding the indexer, and the collection tying them
//! together.

pub mod lms;
pub mod local;
pub mod repo;

use std::path::PathBuf;
use std::sync::Arc;

use semver::Version;

use crate::cache::CacheError;
use crate::cache::FileLimitLru;
use crate::hash::HashContainer;
use crate::indexer::Indexer;
use crate::indexer::IndexerError;
use crate::package::Package;
use crate::package::PackageIdentifier;
use crate::package::SourceId;
use crate::package::SourceKind;
use crate::repository::DownloadError;
use crate::settings::CollectorSettings;
use crate::web::models::PackageVersionsInfo;
use crate::worker::WorkerPool;
use lms::LmsCollector;
use local::LocalCollector;
use repo::RepoCollector;

#[derive(thiserror::Error, Debug)]
pub enum CollectorError {
    #[error("the collector does not contain the package")]
    NotFound,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handles packages from a local directory, remote repositories, and
/// host uploads. Owns the indexer and resolves source ids back to the
/// collectors behind them.
pub struct PackageCollection {
    indexer: Arc<Indexer>,
    local: Option<Arc<LocalCollector>>,
    repos: Vec<Arc<RepoCollector>>,
    lms: Arc<LmsCollector>,
}

impl PackageCollection {
    pub async fn new(
        settings: &CollectorSettings,
        package_cache: Arc<FileLimitLru>,
        repo_index_cache: Arc<FileLimitLru>,
        pool: Arc<WorkerPool>,
    ) -> Arc<Self> {
        let indexer = Arc::new(Indexer::new(pool));
        let mut next_index = 0;

        let local = settings.local_directory().map(|directory| {
            let source = SourceId {
                kind: SourceKind::Local,
                index: next_index,
            };
            next_index += 1;
            Arc::new(LocalCollector::new(
                directory.clone(),
                source,
                indexer.clone(),
            ))
        });

        let mut repos = Vec::new();
        for url in settings.repository_urls() {
            let source = SourceId {
                kind: SourceKind::Repository,
                index: next_index,
            };
            next_index += 1;
            repos.push(Arc::new(RepoCollector::new(
                url,
                settings.repository_update_interval(),
                source,
                indexer.clone(),
                package_cache.clone(),
                repo_index_cache.clone(),
            )));
        }

        let lms_source = SourceId {
            kind: SourceKind::Lms,
            index: next_index,
        };
        let lms = Arc::new(LmsCollector::new(
            package_cache.clone(),
            lms_source,
            indexer.clone(),
        ));

        let collection = Arc::new(Self {
            indexer: indexer.clone(),
            local,
            repos,
            lms,
        });

        // Evicted uploads must leave the index; repository packages stay,
        // they are still downloadable.
        package_cache
            .set_on_remove(Arc::new(move |hash| {
                let indexer = indexer.clone();
                Box::pin(async move {
                    indexer.unregister(&hash, lms_source).await;
                })
            }))
            .await;

        collection
    }

    pub async fn start(&self) -> Result<(), CollectorError> {
        if let Some(local) = &self.local {
            local.start().await?;
        }
        for repo in &self.repos {
            repo.start().await?;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(local) = &self.local {
            local.stop().await;
        }
        for repo in &self.repos {
            repo.stop().await;
        }
    }

    /// Stores a host-uploaded package.
    pub async fn put(&self, container: &HashContainer) -> Result<Arc<Package>, CollectorError> {
        self.lms.put(container).await
    }

    pub fn get(&self, hash: &str) -> Option<Arc<Package>> {
        self.indexer.get_by_hash(hash)
    }

    pub fn get_by_identifier_and_version(
        &self,
        identifier: &PackageIdentifier,
        version: &Version,
    ) -> Option<Arc<Package>> {
        self.indexer.get_by_identifier_and_version(identifier, version)
    }

    pub fn get_package_versions_infos(&self) -> Vec<PackageVersionsInfo> {
        self.indexer.get_package_versions_infos()
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// On-disk path of a package, trying its sources in precedence order
    /// (local directory, repositories, uploads).
    pub async fn get_path(&self, package: &Package) -> Result<PathBuf, CollectorError> {
        for source in package.sources() {
            let result = match source.kind {
                SourceKind::Local => match &self.local {
                    Some(local) => local.get_path(package).await,
                    None => continue,
                },
                SourceKind::Repository => match self.repo_by_source(source) {
                    Some(repo) => repo.get_path(package).await,
                    None => continue,
                },
                SourceKind::Lms => self.lms.get_path(package).await,
            };
            match result {
                Ok(path) => return Ok(path),
                Err(CollectorError::NotFound) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(CollectorError::NotFound)
    }

    fn repo_by_source(&self, source: SourceId) -> Option<&Arc<RepoCollector>> {
        self.repos.iter().find(|repo| repo.source() == source)
    }
}
