use qpy_protocol::Manifest;
use semver::Version;
use serde::Deserialize;
use serde::Serialize;

/// `META.json`: describes the current package index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoMeta {
    /// Unix timestamp of the index build; only a newer index is fetched.
    pub timestamp: i64,
    /// Size in bytes of `PACKAGES.json.gz`.
    pub size: u64,
    /// Hex sha256 of `PACKAGES.json.gz`.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoPackageVersion {
    pub version: Version,
    pub api_version: String,
    /// Path of the archive, relative to the repository base URL.
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// One entry of `PACKAGES.json`: a shared manifest plus all its versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoPackageVersions {
    pub manifest: Manifest,
    pub versions: Vec<RepoPackageVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoPackageIndex {
    pub packages: Vec<RepoPackageVersions>,
}

/// One concrete downloadable package version, manifest adjusted to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoPackage {
    pub manifest: Manifest,
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

impl RepoPackage {
    pub fn combine(manifest: &Manifest, version: &RepoPackageVersion) -> Self {
        let mut manifest = manifest.clone();
        manifest.version = version.version.clone();
        manifest.api_version = version.api_version.clone();
        Self {
            manifest,
            path: version.path.clone(),
            size: version.size,
            sha256: version.sha256.clone(),
        }
    }
}
