use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use qpy_protocol::Manifest;
use semver::Version;

/// Searchable identity shared by all versions of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageIdentifier {
    pub namespace: String,
    pub short_name: String,
}

impl PackageIdentifier {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            namespace: manifest.namespace.clone(),
            short_name: manifest.short_name.clone(),
        }
    }
}

impl fmt::Display for PackageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}/{}", self.namespace, self.short_name)
    }
}

/// Field order matters: local sources sort before repositories before LMS
/// uploads, which is the precedence `get_path` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceKind {
    Local,
    Repository,
    Lms,
}

impl SourceKind {
    /// Whether this source's inventory is authoritative by identifier.
    /// LMS uploads are reachable by hash only.
    pub fn is_searchable(self) -> bool {
        matches!(self, Self::Local | Self::Repository)
    }
}

/// Identity of one collector within the package collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId {
    pub kind: SourceKind,
    pub index: usize,
}

/// An indexed package: immutable by hash, enriched with every source that
/// currently offers it. Neither side owns the other; sources are plain ids
/// the collection resolves back to collectors.
pub struct Package {
    hash: String,
    manifest: Arc<Manifest>,
    sources: StdMutex<BTreeSet<SourceId>>,
}

impl Package {
    pub fn new(hash: String, manifest: Manifest, source: SourceId) -> Arc<Self> {
        Arc::new(Self {
            hash,
            manifest: Arc::new(manifest),
            sources: StdMutex::new(BTreeSet::from([source])),
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    pub fn identifier(&self) -> PackageIdentifier {
        PackageIdentifier::from_manifest(&self.manifest)
    }

    pub fn add_source(&self, source: SourceId) {
        if let Ok(mut sources) = self.sources.lock() {
            sources.insert(source);
        }
    }

    pub fn remove_source(&self, source: SourceId) {
        if let Ok(mut sources) = self.sources.lock() {
            sources.remove(&source);
        }
    }

    /// Sources in precedence order: local, then repositories, then LMS.
    pub fn sources(&self) -> Vec<SourceId> {
        self.sources
            .lock()
            .map(|sources| sources.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_searchable_source(&self) -> bool {
        self.sources
            .lock()
            .map(|sources| sources.iter().any(|s| s.kind.is_searchable()))
            .unwrap_or(false)
    }

    pub fn has_sources(&self) -> bool {
        self.sources
            .lock()
            .map(|sources| !sources.is_empty())
            .unwrap_or(false)
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("hash", &self.hash)
            .field("identifier", &self.identifier().to_string())
            .field("version", &self.manifest.version)
            .finish()
    }
}
