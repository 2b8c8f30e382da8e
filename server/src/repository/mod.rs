//! Client for a remote package repository.
//!
//! The repository serves three kinds of documents: `META.json` describing
//! the index, `PACKAGES.json.gz` (the index itself), and the package
//! archives it references. Every download is checked against the size and
//! sha256 the referring document announced.

pub mod models;

use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;
use tracing::debug;

use crate::hash::hash_bytes;
use models::RepoMeta;
use models::RepoPackage;
use models::RepoPackageIndex;

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("downloaded data has size {actual} but {expected} was announced")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("downloaded data does not match its announced sha256")]
    HashMismatch,

    #[error("repository document is invalid: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to decompress the package index: {0}")]
    Gzip(#[from] std::io::Error),
}

pub struct Repository {
    base_url: String,
    client: reqwest::Client,
}

impl Repository {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Downloads the repository metadata.
    ///
    /// The size and sha256 in here are trusted as-is; verifying the index
    /// signature is left to the deployment in front of this server.
    pub async fn get_meta(&self) -> Result<RepoMeta, DownloadError> {
        let bytes = self.download(&self.url("META.json"), None, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Downloads the gzipped package index, verified against `meta`.
    /// Returns the raw compressed bytes so callers can cache them.
    pub async fn fetch_index(&self, meta: &RepoMeta) -> Result<Vec<u8>, DownloadError> {
        self.download(
            &self.url("PACKAGES.json.gz"),
            Some(meta.size),
            Some(&meta.sha256),
        )
        .await
    }

    /// Decompresses and parses an index document into hash → package,
    /// de-duplicating hashes that appear more than once.
    pub fn parse_index(index_gz: &[u8]) -> Result<HashMap<String, RepoPackage>, DownloadError> {
        let mut decoder = GzDecoder::new(index_gz);
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;

        let index: RepoPackageIndex = serde_json::from_slice(&json)?;

        let mut packages = HashMap::new();
        for entry in &index.packages {
            for version in &entry.versions {
                packages
                    .entry(version.sha256.clone())
                    .or_insert_with(|| RepoPackage::combine(&entry.manifest, version));
            }
        }
        debug!(
            "parsed repository index with {} package version(s)",
            packages.len()
        );
        Ok(packages)
    }

    /// Downloads one package archive, verified against its index entry.
    pub async fn get_package(&self, package: &RepoPackage) -> Result<Vec<u8>, DownloadError> {
        self.download(
            &self.url(&package.path),
            Some(package.size),
            Some(&package.sha256),
        )
        .await
    }

    async fn download(
        &self,
        url: &str,
        expected_size: Option<u64>,
        expected_hash: Option<&str>,
    ) -> Result<Vec<u8>, DownloadError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        if let Some(expected) = expected_size {
            if bytes.len() as u64 != expected {
                return Err(DownloadError::SizeMismatch {
                    expected,
                    actual: bytes.len() as u64,
                });
            }
        }
        if let Some(expected) = expected_hash {
            if hash_bytes(&bytes) != expected {
                return Err(DownloadError::HashMismatch);
            }
        }
        Ok(bytes.to_vec())
    }
}
