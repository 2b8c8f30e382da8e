use std::collections::BTreeMap;
use std::collections::BTreeSet;

use semver::Version;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageType {
    QuestionType,
    Library,
}

impl Default for PackageType {
    fn default() -> Self {
        Self::QuestionType
    }
}

/// Inventory entry for one static file shipped inside a package's dist
/// subtree. `size` must equal the on-disk size; the server cross-checks it
/// before serving the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

fn default_entrypoint() -> String {
    "__main__".to_string()
}

/// Package metadata as stored in `dist/manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub short_name: String,
    pub namespace: String,
    pub version: Version,
    pub api_version: String,
    pub author: String,
    #[serde(default)]
    pub name: BTreeMap<String, String>,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub description: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(rename = "type", default)]
    pub package_type: PackageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub static_files: BTreeMap<String, PackageFile>,
}

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("invalid {field} '{value}': must match [a-z][a-z0-9_]* and be at most 127 characters")]
    InvalidName { field: &'static str, value: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 127
        && first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl Manifest {
    /// Parses and validates a raw `manifest.json` document. Version syntax is
    /// already enforced by the `semver` type during deserialization.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_valid_name(&self.short_name) {
            return Err(ManifestError::InvalidName {
                field: "short_name",
                value: self.short_name.clone(),
            });
        }
        if !is_valid_name(&self.namespace) {
            return Err(ManifestError::InvalidName {
                field: "namespace",
                value: self.namespace.clone(),
            });
        }
        Ok(())
    }

    /// `@namespace/short_name`, the searchable identity shared by all
    /// versions of a package.
    pub fn identifier(&self) -> String {
        format!("@{}/{}", self.namespace, self.short_name)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "short_name": "example",
            "namespace": "acme",
            "version": "0.1.0",
            "api_version": "0.2",
            "author": "Alice Example",
        })
    }

    #[test]
    fn parses_minimal_manifest_with_defaults() {
        let bytes = serde_json::to_vec(&minimal_json()).expect("serialize");
        let manifest = Manifest::parse(&bytes).expect("parse");

        assert_eq!(manifest.entrypoint, "__main__");
        assert_eq!(manifest.package_type, PackageType::QuestionType);
        assert_eq!(manifest.version, Version::new(0, 1, 0));
        assert_eq!(manifest.identifier(), "@acme/example");
        assert!(manifest.static_files.is_empty());
    }

    #[test]
    fn rejects_invalid_semver() {
        let mut json = minimal_json();
        json["version"] = "1.0".into();
        let bytes = serde_json::to_vec(&json).expect("serialize");
        assert!(Manifest::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_invalid_short_name() {
        let mut json = minimal_json();
        json["short_name"] = "Example".into();
        let bytes = serde_json::to_vec(&json).expect("serialize");
        assert!(matches!(
            Manifest::parse(&bytes),
            Err(ManifestError::InvalidName { field: "short_name", .. })
        ));
    }

    #[test]
    fn static_files_round_trip() {
        let mut json = minimal_json();
        json["static_files"] = serde_json::json!({
            "static/x.pdf": {"size": 9, "mime_type": "application/pdf"},
        });
        let bytes = serde_json::to_vec(&json).expect("serialize");
        let manifest = Manifest::parse(&bytes).expect("parse");

        let file = manifest.static_files.get("static/x.pdf").expect("entry");
        assert_eq!(file.size, 9);
        assert_eq!(file.mime_type.as_deref(), Some("application/pdf"));
    }
}
