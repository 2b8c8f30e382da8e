use std::fs::File;
use std::io::Read;
use std::path::Path;

use qpy_protocol::MANIFEST_FILENAME;
use qpy_protocol::Manifest;
use qpy_protocol::ManifestError;
use qpy_protocol::PackageLocation;
use qpy_protocol::DIST_DIR;
use zip::ZipArchive;
use zip::result::ZipError;

#[derive(thiserror::Error, Debug)]
pub enum PackageOpenError {
    #[error("package archive could not be opened: {0}")]
    Archive(#[from] ZipError),

    #[error("package manifest is missing")]
    MissingManifest,

    #[error("package manifest is invalid: {0}")]
    Manifest(#[from] ManifestError),

    #[error("no question type is registered for entrypoint '{0}'")]
    UnknownEntrypoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A package opened by the runtime: its validated manifest plus where it
/// came from. Opening is side-effect free; resolving the entrypoint happens
/// only for the main package.
#[derive(Debug, Clone)]
pub struct LoadedPackage {
    pub location: PackageLocation,
    pub manifest: Manifest,
}

impl LoadedPackage {
    pub fn open(location: &PackageLocation) -> Result<Self, PackageOpenError> {
        let manifest = match location {
            PackageLocation::Zip(zip) => read_zip_manifest(&zip.path)?,
            PackageLocation::Dir(dir) => read_dir_manifest(&dir.path)?,
            PackageLocation::Function(function) => {
                let manifest = function.manifest.clone();
                manifest.validate()?;
                manifest
            }
        };

        Ok(Self {
            location: location.clone(),
            manifest,
        })
    }

    /// Registry key of this package's entrypoint.
    pub fn entrypoint_key(&self) -> String {
        match &self.location {
            PackageLocation::Function(function) => {
                format!("{}:{}", function.module, function.function)
            }
            _ => entrypoint_key(&self.manifest),
        }
    }
}

pub(crate) fn entrypoint_key(manifest: &Manifest) -> String {
    format!("{}:{}", manifest.identifier(), manifest.entrypoint)
}

fn read_zip_manifest(path: &Path) -> Result<Manifest, PackageOpenError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;

    let manifest_path = format!("{DIST_DIR}/{MANIFEST_FILENAME}");
    let mut entry = match archive.by_name(&manifest_path) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(PackageOpenError::MissingManifest),
        Err(other) => return Err(other.into()),
    };

    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(Manifest::parse(&bytes)?)
}

fn read_dir_manifest(dist_dir: &Path) -> Result<Manifest, PackageOpenError> {
    let manifest_path = dist_dir.join(MANIFEST_FILENAME);
    let bytes = match std::fs::read(&manifest_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(PackageOpenError::MissingManifest);
        }
        Err(err) => return Err(err.into()),
    };
    Ok(Manifest::parse(&bytes)?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn manifest_json() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "short_name": "example",
            "namespace": "acme",
            "version": "0.1.0",
            "api_version": "0.2",
            "author": "Alice Example",
        }))
        .expect("serialize")
    }

    #[test]
    fn opens_dir_package() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(MANIFEST_FILENAME), manifest_json()).expect("write");

        let package =
            LoadedPackage::open(&PackageLocation::dir(dir.path())).expect("open");
        assert_eq!(package.manifest.short_name, "example");
        assert_eq!(package.entrypoint_key(), "@acme/example:__main__");
    }

    #[test]
    fn opens_zip_package() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive_path = dir.path().join("example.qpy");
        let mut writer = zip::ZipWriter::new(File::create(&archive_path).expect("create"));
        writer
            .start_file(format!("{DIST_DIR}/{MANIFEST_FILENAME}"), SimpleFileOptions::default())
            .expect("start manifest");
        writer.write_all(&manifest_json()).expect("write manifest");
        writer.finish().expect("finish");

        let package =
            LoadedPackage::open(&PackageLocation::zip(&archive_path)).expect("open");
        assert_eq!(package.manifest.namespace, "acme");
    }

    #[test]
    fn missing_manifest_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = LoadedPackage::open(&PackageLocation::dir(dir.path())).expect_err("no manifest");
        assert!(matches!(err, PackageOpenError::MissingManifest));
    }
}
