//! Typed stage artifacts
//!
//! Workers return opaque JSON; it is only interpreted here, at the point
//! where a concrete stage's rules consume it. Every field carries a serde
//! default so that the empty object `{}` is a valid (if uninformative)
//! artifact for every stage, which is what deterministic stages produce.

use serde::{Deserialize, Serialize};

use super::stage::Stage;

/// Raw bytes of the artifact deterministic stages fabricate in-process
pub const EMPTY_ARTIFACT: &[u8] = b"{}";

/// Recall: did a prior RCA already explain this symptom?
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallResult {
    #[serde(rename = "match")]
    pub matched: bool,
    pub prior_rca_id: Option<i64>,
    pub symptom_id: Option<i64>,
    pub confidence: f64,
    pub reasoning: String,
    pub is_regression: bool,
}

/// Triage: classify the failure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageResult {
    /// e.g. `product`, `automation`, `infra`, `flake`
    pub symptom_category: String,
    pub severity: Option<String>,
    pub defect_type_hypothesis: String,
    pub candidate_repos: Vec<String>,
    pub skip_investigation: bool,
    pub clock_skew_suspected: bool,
    pub cascade_suspected: bool,
    pub data_quality_notes: Option<String>,
}

impl TriageResult {
    pub fn is_category(&self, category: &str) -> bool {
        self.symptom_category.eq_ignore_ascii_case(category)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoSelection {
    pub name: String,
    pub path: Option<String>,
    pub focus_paths: Vec<String>,
    pub branch: Option<String>,
    pub reason: String,
}

/// Resolve: which repositories to investigate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveResult {
    pub selected_repos: Vec<RepoSelection>,
    pub cross_ref_strategy: Option<String>,
}

/// Investigate: the candidate root cause and how confident we are in it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigateResult {
    pub rca_message: String,
    pub defect_type: String,
    pub component: Option<String>,
    #[serde(alias = "convergence")]
    pub convergence_score: f64,
    pub evidence_refs: Vec<String>,
}

/// Correlate: is this a duplicate of a known RCA?
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelateResult {
    pub is_duplicate: bool,
    pub linked_rca_id: Option<i64>,
    pub confidence: f64,
    pub reasoning: String,
    pub cross_version_match: bool,
    pub affected_versions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    Reassess,
    Overturn,
}

impl std::fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reassess => write!(f, "reassess"),
            Self::Overturn => write!(f, "overturn"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanOverride {
    pub defect_type: String,
    pub rca_message: String,
}

/// Review: accept, send back, or overturn the conclusion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewDecision {
    pub decision: Option<ReviewVerdict>,
    pub human_override: Option<HumanOverride>,
    /// Stage to return to on reassess (defaults to Resolve)
    pub loop_target: Option<Stage>,
}

impl ReviewDecision {
    /// Reassess may only send a case back to a work stage before Review
    pub fn is_valid_loop_target(target: Stage) -> bool {
        target > Stage::Init && target < Stage::Review
    }
}

/// A parsed artifact, tagged by the stage that produced it
#[derive(Debug, Clone, PartialEq)]
pub enum StageArtifact {
    Recall(RecallResult),
    Triage(TriageResult),
    Resolve(ResolveResult),
    Investigate(InvestigateResult),
    Correlate(CorrelateResult),
    Review(ReviewDecision),
    Report(serde_json::Value),
    /// Init and Done have no payload
    None,
}

impl StageArtifact {
    /// Parse raw worker output for `stage`.
    ///
    /// The error string is suitable for surfacing to whoever submitted the bytes.
    pub fn parse(stage: Stage, bytes: &[u8]) -> Result<Self, String> {
        fn de<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
            serde_json::from_slice(bytes).map_err(|e| e.to_string())
        }

        Ok(match stage {
            Stage::Init | Stage::Done => Self::None,
            // A null recall result is a miss.
            Stage::Recall => Self::Recall(de::<Option<RecallResult>>(bytes)?.unwrap_or_default()),
            Stage::Triage => Self::Triage(de(bytes)?),
            Stage::Resolve => Self::Resolve(de(bytes)?),
            Stage::Investigate => Self::Investigate(de(bytes)?),
            Stage::Correlate => Self::Correlate(de(bytes)?),
            Stage::Review => {
                let review: ReviewDecision = de(bytes)?;
                if let Some(target) = review.loop_target {
                    if !ReviewDecision::is_valid_loop_target(target) {
                        return Err(format!(
                            "loop_target {target} must be a stage between {} and {}",
                            Stage::Recall,
                            Stage::Correlate
                        ));
                    }
                }
                Self::Review(review)
            }
            Stage::Report => {
                let value: serde_json::Value = de(bytes)?;
                if !value.is_object() {
                    return Err("report artifact must be a JSON object".to_string());
                }
                Self::Report(value)
            }
        })
    }

    /// The artifact a deterministic stage fabricates in-process
    pub fn empty(stage: Stage) -> Self {
        match stage {
            Stage::Init | Stage::Done => Self::None,
            Stage::Recall => Self::Recall(RecallResult::default()),
            Stage::Triage => Self::Triage(TriageResult::default()),
            Stage::Resolve => Self::Resolve(ResolveResult::default()),
            Stage::Investigate => Self::Investigate(InvestigateResult::default()),
            Stage::Correlate => Self::Correlate(CorrelateResult::default()),
            Stage::Review => Self::Review(ReviewDecision::default()),
            Stage::Report => Self::Report(serde_json::Value::Object(Default::default())),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        Some(match self {
            Self::Recall(_) => Stage::Recall,
            Self::Triage(_) => Stage::Triage,
            Self::Resolve(_) => Stage::Resolve,
            Self::Investigate(_) => Stage::Investigate,
            Self::Correlate(_) => Stage::Correlate,
            Self::Review(_) => Stage::Review,
            Self::Report(_) => Stage::Report,
            Self::None => return None,
        })
    }

    /// JSON form handed to store hooks
    pub fn to_value(&self) -> serde_json::Value {
        let value = match self {
            Self::Recall(a) => serde_json::to_value(a),
            Self::Triage(a) => serde_json::to_value(a),
            Self::Resolve(a) => serde_json::to_value(a),
            Self::Investigate(a) => serde_json::to_value(a),
            Self::Correlate(a) => serde_json::to_value(a),
            Self::Review(a) => serde_json::to_value(a),
            Self::Report(v) => Ok(v.clone()),
            Self::None => Ok(serde_json::Value::Null),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}
