use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoringMethod {
    AlwaysManualScoringRequired,
    AutomaticallyScorable,
    AutomaticallyScorableWithCountback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PossibleResponse {
    pub response_class: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubquestionModel {
    pub subquestion_id: String,
    pub score_max: Option<f64>,
    pub response_classes: Option<Vec<PossibleResponse>>,
}

/// Metadata a question type reports about a created question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default = "default_num_variants")]
    pub num_variants: u32,
    /// Lowest score used by this question.
    #[serde(default)]
    pub score_min: f64,
    /// Highest score used by this question.
    #[serde(default = "default_score_max")]
    pub score_max: f64,
    pub scoring_method: ScoringMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_guess_score: Option<f64>,
    #[serde(default)]
    pub response_analysis_by_variant: bool,
    #[serde(default)]
    pub subquestions: Vec<SubquestionModel>,
}

fn default_num_variants() -> u32 {
    1
}

fn default_score_max() -> f64 {
    1.0
}

impl QuestionModel {
    /// A question scored by hand and nothing else; the default shape question
    /// types start from.
    pub fn manual() -> Self {
        Self {
            lang: None,
            num_variants: 1,
            score_min: 0.0,
            score_max: 1.0,
            scoring_method: ScoringMethod::AlwaysManualScoringRequired,
            penalty: None,
            random_guess_score: None,
            response_analysis_by_variant: false,
            subquestions: Vec::new(),
        }
    }
}
