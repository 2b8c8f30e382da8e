use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheControl {
    SharedCache,
    PrivateCache,
    NoCache,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: String,
}

/// Rendered markup of an attempt, split into the parts a host composes into
/// its own page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptUi {
    /// X(H)ML markup of the formulation part of the question.
    pub formulation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_answer: Option<String>,
    /// Names and values of the placeholders that appear in the markup.
    #[serde(default)]
    pub placeholders: BTreeMap<String, String>,
    #[serde(default)]
    pub css_files: Vec<String>,
    #[serde(default)]
    pub files: BTreeMap<String, AttemptFile>,
    #[serde(default = "default_cache_control")]
    pub cache_control: CacheControl,
}

fn default_cache_control() -> CacheControl {
    CacheControl::PrivateCache
}

impl AttemptUi {
    pub fn formulation(markup: impl Into<String>) -> Self {
        Self {
            formulation: markup.into(),
            general_feedback: None,
            specific_feedback: None,
            right_answer: None,
            placeholders: BTreeMap::new(),
            css_files: Vec::new(),
            files: BTreeMap::new(),
            cache_control: CacheControl::PrivateCache,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    pub variant: u32,
    pub ui: AttemptUi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptStartedModel {
    #[serde(flatten)]
    pub attempt: AttemptModel,
    pub attempt_state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoringCode {
    AutomaticallyScored,
    NeedsManualScoring,
    ResponseNotScorable,
    InvalidResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_state: Option<String>,
    pub scoring_code: ScoringCode,
    /// Must lie between the `score_min` and `score_max` set by the question.
    pub score: Option<f64>,
    pub score_final: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptScoredModel {
    #[serde(flatten)]
    pub attempt: AttemptModel,
    #[serde(flatten)]
    pub score: ScoreModel,
}
