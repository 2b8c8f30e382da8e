//! The seam between the runtime and in-package question-type code.
//!
//! Rust cannot import code out of an archive, so question types link into the
//! worker binary and register a constructor under their entrypoint key. The
//! archive still carries the package's static files and manifest; the
//! entrypoint in the manifest selects the linked implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use qpy_protocol::AttemptModel;
use qpy_protocol::AttemptScoredModel;
use qpy_protocol::AttemptStartedModel;
use qpy_protocol::Manifest;
use qpy_protocol::OptionsFormDefinition;
use qpy_protocol::QuestionModel;
use qpy_protocol::RequestUser;

pub type FormData = serde_json::Map<String, serde_json::Value>;

#[derive(thiserror::Error, Debug)]
pub enum QuestionTypeError {
    /// The persisted question state cannot be read by this package version.
    #[error("invalid question state: {0}")]
    InvalidQuestionState(String),

    /// The package could not allocate within its memory budget.
    #[error("memory limit exceeded")]
    MemoryExceeded,

    #[error("{0}")]
    Other(String),
}

impl From<std::collections::TryReserveError> for QuestionTypeError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::MemoryExceeded
    }
}

/// The message contract between the runtime and a question type. Handlers
/// are strictly request/response; there is no cancellation once one begins.
pub trait QuestionType: Send {
    fn options_form(
        &mut self,
        question_state: Option<&str>,
        request_user: &RequestUser,
    ) -> Result<(OptionsFormDefinition, FormData), QuestionTypeError>;

    fn create_question(
        &mut self,
        old_state: Option<&str>,
        form_data: &FormData,
        request_user: &RequestUser,
    ) -> Result<(String, QuestionModel), QuestionTypeError>;

    fn start_attempt(
        &mut self,
        question_state: &str,
        variant: u32,
        request_user: &RequestUser,
    ) -> Result<AttemptStartedModel, QuestionTypeError>;

    fn view_attempt(
        &mut self,
        question_state: &str,
        attempt_state: &str,
        scoring_state: Option<&str>,
        response: Option<&FormData>,
        request_user: &RequestUser,
    ) -> Result<AttemptModel, QuestionTypeError>;

    fn score_attempt(
        &mut self,
        question_state: &str,
        attempt_state: &str,
        scoring_state: Option<&str>,
        response: &FormData,
        request_user: &RequestUser,
    ) -> Result<AttemptScoredModel, QuestionTypeError>;
}

pub type QuestionTypeFactory = fn(&Manifest) -> Box<dyn QuestionType>;

static REGISTRY: Lazy<RwLock<HashMap<String, QuestionTypeFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a question-type constructor under an entrypoint key.
///
/// Zip and dir packages resolve `@namespace/short_name:entrypoint`; function
/// package locations resolve `module:function` directly.
pub fn register_question_type(key: impl Into<String>, factory: QuestionTypeFactory) {
    if let Ok(mut registry) = REGISTRY.write() {
        registry.insert(key.into(), factory);
    }
}

pub(crate) fn resolve_question_type(key: &str) -> Option<QuestionTypeFactory> {
    REGISTRY.read().ok()?.get(key).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::entrypoint_key;

    fn dummy_factory(_manifest: &Manifest) -> Box<dyn QuestionType> {
        unreachable!("never constructed in this test")
    }

    #[test]
    fn registry_resolves_by_key() {
        register_question_type("tests.registry:init", dummy_factory);
        assert!(resolve_question_type("tests.registry:init").is_some());
        assert!(resolve_question_type("tests.registry:other").is_none());
    }

    #[test]
    fn archive_entrypoint_key_shape() {
        let manifest: Manifest = serde_json::from_value(serde_json::json!({
            "short_name": "example",
            "namespace": "acme",
            "version": "1.2.3",
            "api_version": "0.2",
            "author": "a",
        }))
        .expect("manifest");
        assert_eq!(entrypoint_key(&manifest), "@acme/example:__main__");
    }
}
