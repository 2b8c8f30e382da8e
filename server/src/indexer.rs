//! In-memory registry of packages across all collectors.
//!
//! Two maps: hash → package, and (namespace, short name) → version → package.
//! A package enters the identifier map only while a searchable source offers
//! it; LMS uploads stay hash-only. Registrations are serialized by one async
//! lock; lookups take a short read lock on the maps.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use qpy_protocol::Manifest;
use qpy_protocol::PackageLocation;
use semver::Version;
use tokio::sync::Mutex;
use tracing::warn;

use crate::package::Package;
use crate::package::PackageIdentifier;
use crate::package::SourceId;
use crate::web::models::PackageInfo;
use crate::web::models::PackageVersionSpecificInfo;
use crate::web::models::PackageVersionsInfo;
use crate::worker::WorkerError;
use crate::worker::WorkerPool;

/// What a collector knows about a package at registration time. With only a
/// path, the manifest is resolved by asking a worker.
pub enum ManifestOrPath {
    Manifest(Manifest),
    Path(PathBuf),
}

#[derive(thiserror::Error, Debug)]
pub enum IndexerError {
    #[error("failed to resolve the package manifest: {0}")]
    ManifestResolution(#[from] WorkerError),
}

#[derive(Default)]
struct Maps {
    by_hash: HashMap<String, Arc<Package>>,
    by_identifier: HashMap<PackageIdentifier, BTreeMap<Version, Arc<Package>>>,
}

pub struct Indexer {
    pool: Arc<WorkerPool>,
    registration: Mutex<()>,
    maps: StdRwLock<Maps>,
}

impl Indexer {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            registration: Mutex::new(()),
            maps: StdRwLock::new(Maps::default()),
        }
    }

    pub fn get_by_hash(&self, hash: &str) -> Option<Arc<Package>> {
        self.maps.read().ok()?.by_hash.get(hash).cloned()
    }

    pub fn get_by_identifier(
        &self,
        identifier: &PackageIdentifier,
    ) -> BTreeMap<Version, Arc<Package>> {
        self.maps
            .read()
            .ok()
            .and_then(|maps| maps.by_identifier.get(identifier).cloned())
            .unwrap_or_default()
    }

    pub fn get_by_identifier_and_version(
        &self,
        identifier: &PackageIdentifier,
        version: &Version,
    ) -> Option<Arc<Package>> {
        self.maps
            .read()
            .ok()?
            .by_identifier
            .get(identifier)?
            .get(version)
            .cloned()
    }

    /// Overview of every searchable package: versions descending, manifest
    /// info from the highest version.
    pub fn get_package_versions_infos(&self) -> Vec<PackageVersionsInfo> {
        let Ok(maps) = self.maps.read() else {
            return Vec::new();
        };

        let mut identifiers: Vec<&PackageIdentifier> = maps.by_identifier.keys().collect();
        identifiers.sort();

        identifiers
            .into_iter()
            .filter_map(|identifier| {
                let versions = maps.by_identifier.get(identifier)?;
                let newest = versions.values().next_back()?;
                Some(PackageVersionsInfo {
                    manifest: PackageInfo::from_manifest(newest.manifest()),
                    versions: versions
                        .values()
                        .rev()
                        .map(|package| PackageVersionSpecificInfo {
                            package_hash: package.hash().to_string(),
                            version: package.version().clone(),
                        })
                        .collect(),
                })
            })
            .collect()
    }

    /// Registers a package under `source`. Re-registrations of a known hash
    /// only add the source. On an identifier/version collision with a
    /// different hash, the first winner stays and the newcomer is only
    /// reachable by hash.
    pub async fn register(
        &self,
        hash: &str,
        source: SourceId,
        manifest_or_path: ManifestOrPath,
    ) -> Result<Arc<Package>, IndexerError> {
        let _registration = self.registration.lock().await;

        let existing = self.get_by_hash(hash);
        let package = match existing {
            Some(package) => {
                package.add_source(source);
                package
            }
            None => {
                let manifest = match manifest_or_path {
                    ManifestOrPath::Manifest(manifest) => manifest,
                    ManifestOrPath::Path(path) => self.resolve_manifest(path).await?,
                };
                let package = Package::new(hash.to_string(), manifest, source);
                if let Ok(mut maps) = self.maps.write() {
                    maps.by_hash.insert(hash.to_string(), package.clone());
                }
                package
            }
        };

        if source.kind.is_searchable() {
            if let Ok(mut maps) = self.maps.write() {
                let versions = maps
                    .by_identifier
                    .entry(package.identifier())
                    .or_default();
                match versions.get(package.version()) {
                    Some(winner) if winner.hash() != package.hash() => {
                        warn!(
                            "package {} ({}) with hash {} already exists with a different hash: {}",
                            package.identifier(),
                            package.version(),
                            package.hash(),
                            winner.hash(),
                        );
                    }
                    Some(_) => {}
                    None => {
                        versions.insert(package.version().clone(), package.clone());
                    }
                }
            }
        }

        Ok(package)
    }

    /// Drops `source` from the package. Without a searchable source left the
    /// package leaves the identifier map; without any source it leaves the
    /// index entirely.
    pub async fn unregister(&self, hash: &str, source: SourceId) {
        let _registration = self.registration.lock().await;

        let Some(package) = self.get_by_hash(hash) else {
            return;
        };
        package.remove_source(source);

        let Ok(mut maps) = self.maps.write() else {
            return;
        };

        if source.kind.is_searchable() && !package.has_searchable_source() {
            let identifier = package.identifier();
            if let Some(versions) = maps.by_identifier.get_mut(&identifier) {
                // Only remove the entry if it is actually this package;
                // a collision loser was never inserted.
                if versions
                    .get(package.version())
                    .is_some_and(|entry| entry.hash() == package.hash())
                {
                    versions.remove(package.version());
                }
                if versions.is_empty() {
                    maps.by_identifier.remove(&identifier);
                }
            }
        }

        if !package.has_sources() {
            maps.by_hash.remove(hash);
        }
    }

    async fn resolve_manifest(&self, path: PathBuf) -> Result<Manifest, WorkerError> {
        let lease = self.pool.acquire(PackageLocation::zip(path)).await?;
        let manifest = lease.worker().get_manifest().await;
        lease.release().await;
        manifest
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::package::SourceKind;
    use crate::settings::WorkerKind;
    use crate::worker::pool::WorkerFactory;

    fn manifest(short_name: &str, version: &str) -> Manifest {
        serde_json::from_value(serde_json::json!({
            "short_name": short_name,
            "namespace": "acme",
            "version": version,
            "api_version": "0.2",
            "author": "a",
        }))
        .expect("manifest")
    }

    fn indexer() -> Indexer {
        let factory = WorkerFactory {
            kind: WorkerKind::Thread,
            executable: PathBuf::new(),
            limits: qpy_protocol::WorkerResourceLimits {
                max_memory: 100,
                max_cpu_time_seconds_per_call: 1.0,
            },
        };
        Indexer::new(Arc::new(WorkerPool::new(1, 100, factory)))
    }

    const LOCAL: SourceId = SourceId {
        kind: SourceKind::Local,
        index: 0,
    };
    const REPO: SourceId = SourceId {
        kind: SourceKind::Repository,
        index: 1,
    };
    const LMS: SourceId = SourceId {
        kind: SourceKind::Lms,
        index: 2,
    };

    #[tokio::test]
    async fn lms_packages_are_hash_only() {
        let indexer = indexer();
        indexer
            .register("aa", LMS, ManifestOrPath::Manifest(manifest("example", "1.0.0")))
            .await
            .expect("register");

        assert!(indexer.get_by_hash("aa").is_some());
        let identifier = PackageIdentifier {
            namespace: "acme".to_string(),
            short_name: "example".to_string(),
        };
        assert!(indexer.get_by_identifier(&identifier).is_empty());
    }

    #[tokio::test]
    async fn unregistering_one_source_keeps_the_package() {
        let indexer = indexer();
        indexer
            .register("aa", LOCAL, ManifestOrPath::Manifest(manifest("example", "1.0.0")))
            .await
            .expect("register local");
        indexer
            .register("aa", REPO, ManifestOrPath::Manifest(manifest("example", "1.0.0")))
            .await
            .expect("register repo");

        indexer.unregister("aa", LOCAL).await;
        let identifier = PackageIdentifier {
            namespace: "acme".to_string(),
            short_name: "example".to_string(),
        };
        assert!(indexer.get_by_hash("aa").is_some());
        assert_eq!(indexer.get_by_identifier(&identifier).len(), 1);

        indexer.unregister("aa", REPO).await;
        assert!(indexer.get_by_hash("aa").is_none());
        assert!(indexer.get_by_identifier(&identifier).is_empty());
    }

    #[tokio::test]
    async fn unregistering_searchable_sources_drops_identifier_lookup() {
        let indexer = indexer();
        indexer
            .register("aa", LOCAL, ManifestOrPath::Manifest(manifest("example", "1.0.0")))
            .await
            .expect("register local");
        indexer
            .register("aa", LMS, ManifestOrPath::Manifest(manifest("example", "1.0.0")))
            .await
            .expect("register lms");

        indexer.unregister("aa", LOCAL).await;

        let identifier = PackageIdentifier {
            namespace: "acme".to_string(),
            short_name: "example".to_string(),
        };
        // Still reachable by hash through the LMS source, but no longer
        // searchable.
        assert!(indexer.get_by_hash("aa").is_some());
        assert!(indexer.get_by_identifier(&identifier).is_empty());
    }

    #[tokio::test]
    async fn identifier_collision_keeps_first_winner() {
        let indexer = indexer();
        indexer
            .register("aa", LOCAL, ManifestOrPath::Manifest(manifest("example", "1.0.0")))
            .await
            .expect("register first");
        indexer
            .register("bb", REPO, ManifestOrPath::Manifest(manifest("example", "1.0.0")))
            .await
            .expect("register second");

        let identifier = PackageIdentifier {
            namespace: "acme".to_string(),
            short_name: "example".to_string(),
        };
        let version = Version::new(1, 0, 0);
        let winner = indexer
            .get_by_identifier_and_version(&identifier, &version)
            .expect("winner");
        assert_eq!(winner.hash(), "aa");
        // The loser is still reachable by hash.
        assert!(indexer.get_by_hash("bb").is_some());
    }

    #[tokio::test]
    async fn listing_sorts_versions_descending() {
        let indexer = indexer();
        indexer
            .register("aa", LOCAL, ManifestOrPath::Manifest(manifest("example", "0.0.1")))
            .await
            .expect("register old");
        indexer
            .register("bb", LOCAL, ManifestOrPath::Manifest(manifest("example", "1.0.0")))
            .await
            .expect("register new");
        indexer
            .register("cc", LOCAL, ManifestOrPath::Manifest(manifest("other", "0.2.0")))
            .await
            .expect("register other");

        let infos = indexer.get_package_versions_infos();
        assert_eq!(infos.len(), 2);

        let example = infos
            .iter()
            .find(|info| info.manifest.short_name == "example")
            .expect("example entry");
        let versions: Vec<String> = example
            .versions
            .iter()
            .map(|v| v.version.to_string())
            .collect();
        assert_eq!(versions, vec!["1.0.0".to_string(), "0.0.1".to_string()]);
        assert_eq!(example.versions[0].package_hash, "bb");
    }
}
