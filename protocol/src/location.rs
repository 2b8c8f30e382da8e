use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::Manifest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZipPackageLocation {
    /// Path to a zip-formatted package archive.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirPackageLocation {
    /// A package's dist directory, to be loaded without unpacking.
    pub path: PathBuf,
}

/// A package consisting only of a registered constructor. Intended mostly
/// for tests; no archive exists, so a manifest travels along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionPackageLocation {
    pub module: String,
    pub function: String,
    pub manifest: Manifest,
}

/// Identifies how a worker should open a package. Resolved at worker boot,
/// never at the HTTP layer; locations are side-effect free until loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PackageLocation {
    Zip(ZipPackageLocation),
    Dir(DirPackageLocation),
    Function(FunctionPackageLocation),
}

impl PackageLocation {
    pub fn zip(path: impl Into<PathBuf>) -> Self {
        Self::Zip(ZipPackageLocation { path: path.into() })
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self::Dir(DirPackageLocation { path: path.into() })
    }
}

impl fmt::Display for PackageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zip(loc) => write!(f, "{}", loc.path.display()),
            Self::Dir(loc) => write!(f, "{}", loc.path.display()),
            Self::Function(loc) => write!(f, "{}:{}", loc.module, loc.function),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn location_tagging() {
        let location = PackageLocation::zip("/tmp/example.qpy");
        let json = serde_json::to_value(&location).expect("serialize");
        assert_eq!(json["kind"], "zip");
        assert_eq!(json["path"], "/tmp/example.qpy");

        let parsed: PackageLocation = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, location);
    }
}
