//! Host-facing request and response bodies.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use qpy_protocol::Manifest;
use qpy_protocol::OptionsFormDefinition;
use qpy_protocol::PackageType;
use qpy_protocol::QuestionModel;
use semver::Version;
use serde::Deserialize;
use serde::Serialize;

use crate::package::Package;
use crate::worker::FormData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub short_name: String,
    pub namespace: String,
    pub name: BTreeMap<String, String>,
    #[serde(rename = "type")]
    pub package_type: PackageType,
    pub author: Option<String>,
    pub url: Option<String>,
    pub languages: Option<BTreeSet<String>>,
    pub description: Option<BTreeMap<String, String>>,
    pub icon: Option<String>,
    pub license: Option<String>,
    pub tags: Option<BTreeSet<String>>,
}

impl PackageInfo {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            short_name: manifest.short_name.clone(),
            namespace: manifest.namespace.clone(),
            name: manifest.name.clone(),
            package_type: manifest.package_type,
            author: Some(manifest.author.clone()),
            url: manifest.url.clone(),
            languages: Some(manifest.languages.clone()),
            description: Some(manifest.description.clone()),
            icon: manifest.icon.clone(),
            license: manifest.license.clone(),
            tags: Some(manifest.tags.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageVersionSpecificInfo {
    pub package_hash: String,
    pub version: Version,
}

/// Info for one concrete package version, as returned by
/// `GET /packages/{hash}` and `POST /package-extract-info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageVersionInfo {
    #[serde(flatten)]
    pub info: PackageInfo,
    #[serde(flatten)]
    pub version: PackageVersionSpecificInfo,
}

impl PackageVersionInfo {
    pub fn from_package(package: &Package) -> Self {
        Self {
            info: PackageInfo::from_manifest(package.manifest()),
            version: PackageVersionSpecificInfo {
                package_hash: package.hash().to_string(),
                version: package.version().clone(),
            },
        }
    }
}

/// One searchable package identity with every indexed version, newest
/// first; `manifest` belongs to the newest version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageVersionsInfo {
    pub manifest: PackageInfo,
    pub versions: Vec<PackageVersionSpecificInfo>,
}

/// Common fields of every `main` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBaseData {
    #[serde(default)]
    pub context: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionCreateArguments {
    #[serde(default)]
    pub context: Option<i64>,
    pub form_data: FormData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptStartArguments {
    #[serde(default)]
    pub context: Option<i64>,
    pub variant: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptViewArguments {
    #[serde(default)]
    pub context: Option<i64>,
    pub attempt_state: String,
    #[serde(default)]
    pub scoring_state: Option<String>,
    #[serde(default)]
    pub response: Option<FormData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptScoreArguments {
    #[serde(default)]
    pub context: Option<i64>,
    pub attempt_state: String,
    #[serde(default)]
    pub scoring_state: Option<String>,
    pub response: FormData,
    #[serde(default)]
    pub generate_hint: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionEditFormResponse {
    pub definition: OptionsFormDefinition,
    pub form_data: FormData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionCreatedResponse {
    #[serde(flatten)]
    pub question: QuestionModel,
    pub question_state: String,
}

impl From<qpy_protocol::QuestionCreated> for QuestionCreatedResponse {
    fn from(created: qpy_protocol::QuestionCreated) -> Self {
        Self {
            question: created.question_model,
            question_state: created.question_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestErrorCode {
    QueueWaitingTimeout,
    WorkerTimeout,
    OutOfMemory,
    InvalidPackage,
    InvalidRequest,
    PackageError,
    CallbackApiError,
    ServerError,
}

/// The single error body shape every failing request carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    pub error_code: RequestErrorCode,
    pub temporary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotFoundStatusWhat {
    Package,
    QuestionState,
}

/// 404 body telling the host which referenced thing was missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotFoundStatus {
    pub what: NotFoundStatusWhat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub requests_in_process: usize,
    pub requests_in_queue: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub version: String,
    pub allow_lms_packages: bool,
    pub max_package_size: u64,
    pub usage: Usage,
}
