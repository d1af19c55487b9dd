//! Heuristic Graph
//!
//! Rule-driven routing between pipeline stages.
//!
//! Each stage owns an ordered list of rules. Evaluation tries them in
//! priority order and the first one that returns an [`Action`] wins; when
//! none fire, the graph falls back to the stage's canonical successor under
//! the reserved rule id [`FALLBACK_RULE_ID`]. Evaluation is therefore total.
//!
//! Backward edges carry a loop key. Bounding a loop is the job of a companion
//! rule placed ahead of the looping rule that checks the same counter, so the
//! two guards are mutually exclusive and the graph never needs a global step
//! budget.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use super::artifact::{ReviewDecision, ReviewVerdict, StageArtifact};
use super::error::{PipelineError, PipelineResult};
use super::stage::Stage;
use super::state::CaseState;

/// Rule id recorded when no rule matched
pub const FALLBACK_RULE_ID: &str = "FALLBACK";

/// Loop key for Investigate → Resolve retries
pub const INVESTIGATE_LOOP: &str = "investigate";

/// Loop key for Review → reassess retries
pub const REASSESS_LOOP: &str = "reassess";

/// Tunable thresholds consulted by the default rules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Recall confidence at or above which a match short-circuits to Review
    pub recall_hit: f64,
    /// Lower bound for an uncertain recall match
    pub recall_uncertain: f64,
    /// Investigate convergence at or above which we move on to Correlate
    pub convergence_sufficient: f64,
    /// Maximum Investigate → Resolve loops
    pub max_investigate_loops: u32,
    /// Correlate confidence required to close a case as duplicate
    pub correlate_dup: f64,
    /// Maximum Review → reassess loops
    pub max_reassess_loops: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            recall_hit: 0.80,
            recall_uncertain: 0.40,
            convergence_sufficient: 0.70,
            max_investigate_loops: 2,
            correlate_dup: 0.80,
            max_reassess_loops: 1,
        }
    }
}

/// Descriptive edge classification, used for reporting only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
pub enum EdgeKind {
    Normal,
    /// Skips one or more stages
    Shortcut,
    /// Routes backward under the named loop counter
    Loop(String),
}

/// Routing decision produced by a rule
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub next_stage: Stage,
    pub context_additions: serde_json::Map<String, serde_json::Value>,
    pub explanation: String,
}

impl Action {
    pub fn to(next_stage: Stage, explanation: impl Into<String>) -> Self {
        Self {
            next_stage,
            context_additions: serde_json::Map::new(),
            explanation: explanation.into(),
        }
    }

    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context_additions.insert(key.to_string(), value);
        self
    }
}

type RuleFn = Box<dyn Fn(&StageArtifact, &CaseState) -> Option<Action> + Send + Sync>;

/// A guarded routing rule attached to one stage
pub struct HeuristicRule {
    pub id: String,
    pub name: String,
    pub stage: Stage,
    /// Declared target, used when describing the graph
    pub target: Stage,
    pub kind: EdgeKind,
    evaluate: RuleFn,
}

impl HeuristicRule {
    pub fn new<F>(id: &str, name: &str, stage: Stage, target: Stage, evaluate: F) -> Self
    where
        F: Fn(&StageArtifact, &CaseState) -> Option<Action> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            stage,
            target,
            kind: EdgeKind::Normal,
            evaluate: Box::new(evaluate),
        }
    }

    pub fn shortcut(mut self) -> Self {
        self.kind = EdgeKind::Shortcut;
        self
    }

    pub fn looping(mut self, key: &str) -> Self {
        self.kind = EdgeKind::Loop(key.to_string());
        self
    }

    pub fn evaluate(&self, artifact: &StageArtifact, state: &CaseState) -> Option<Action> {
        (self.evaluate)(artifact, state)
    }

    pub fn loop_key(&self) -> Option<&str> {
        match &self.kind {
            EdgeKind::Loop(key) => Some(key),
            _ => None,
        }
    }
}

impl std::fmt::Debug for HeuristicRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeuristicRule")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Outcome of evaluating one stage
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub rule_id: String,
    /// Loop key declared by the matched rule, if it is a loop edge
    pub loop_key: Option<String>,
}

impl Decision {
    pub fn is_fallback(&self) -> bool {
        self.rule_id == FALLBACK_RULE_ID
    }
}

/// One edge of the graph, for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDescription {
    pub id: String,
    pub name: String,
    pub from: Stage,
    pub to: Stage,
    pub kind: EdgeKind,
}

/// Ordered rule set per stage
#[derive(Debug, Default)]
pub struct HeuristicGraph {
    rules: BTreeMap<Stage, Vec<HeuristicRule>>,
}

impl HeuristicGraph {
    /// Empty graph: every stage falls back to its successor
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule at the lowest priority for its stage
    pub fn add_rule(&mut self, rule: HeuristicRule) -> PipelineResult<()> {
        if matches!(rule.stage, Stage::Init | Stage::Done) {
            return Err(PipelineError::InvalidGraph(format!(
                "rule {} attached to {}, which produces no artifact",
                rule.id, rule.stage
            )));
        }
        if rule.id == FALLBACK_RULE_ID || self.rule(&rule.id).is_some() {
            return Err(PipelineError::InvalidGraph(format!(
                "duplicate rule id {}",
                rule.id
            )));
        }
        self.rules.entry(rule.stage).or_default().push(rule);
        Ok(())
    }

    pub fn rule(&self, id: &str) -> Option<&HeuristicRule> {
        self.rules.values().flatten().find(|r| r.id == id)
    }

    /// Rules for `stage`, in priority order
    pub fn edges_from(&self, stage: Stage) -> &[HeuristicRule] {
        self.rules.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Check structural sanity: no rules on Init/Done, unique ids
    pub fn validate(&self) -> PipelineResult<()> {
        let mut seen = HashSet::new();
        for rule in self.rules.values().flatten() {
            if matches!(rule.stage, Stage::Init | Stage::Done) {
                return Err(PipelineError::InvalidGraph(format!(
                    "rule {} attached to {}",
                    rule.id, rule.stage
                )));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(PipelineError::InvalidGraph(format!(
                    "duplicate rule id {}",
                    rule.id
                )));
            }
        }
        Ok(())
    }

    /// Decide where a case goes after `stage`. Never fails.
    pub fn evaluate(&self, stage: Stage, artifact: &StageArtifact, state: &CaseState) -> Decision {
        for rule in self.edges_from(stage) {
            if let Some(action) = rule.evaluate(artifact, state) {
                info!(
                    case_id = %state.case_id,
                    stage = %stage,
                    rule = %rule.id,
                    next = %action.next_stage,
                    "Heuristic matched"
                );
                return Decision {
                    action,
                    rule_id: rule.id.clone(),
                    loop_key: rule.loop_key().map(str::to_string),
                };
            }
        }

        let next = stage.successor();
        debug!(case_id = %state.case_id, stage = %stage, next = %next, "No heuristic matched, falling back");
        Decision {
            action: Action::to(
                next,
                format!("fallback: default pipeline progression from {stage} to {next}"),
            ),
            rule_id: FALLBACK_RULE_ID.to_string(),
            loop_key: None,
        }
    }

    /// All declared edges plus the implicit fallback edges
    pub fn describe(&self) -> Vec<EdgeDescription> {
        let mut edges: Vec<EdgeDescription> = self
            .rules
            .values()
            .flatten()
            .map(|r| EdgeDescription {
                id: r.id.clone(),
                name: r.name.clone(),
                from: r.stage,
                to: r.target,
                kind: r.kind.clone(),
            })
            .collect();
        for stage in Stage::WORK {
            edges.push(EdgeDescription {
                id: FALLBACK_RULE_ID.to_string(),
                name: "default-progression".to_string(),
                from: stage,
                to: stage.successor(),
                kind: EdgeKind::Normal,
            });
        }
        edges
    }

    /// The standard RCA routing rules
    pub fn default_graph(th: Thresholds) -> Self {
        let mut graph = Self::new();
        for rule in default_rules(th) {
            // Ids are unique and no rule targets Init/Done as a source.
            if let Err(e) = graph.add_rule(rule) {
                tracing::error!(error = %e, "Skipping invalid default rule");
            }
        }
        graph
    }
}

fn default_rules(th: Thresholds) -> Vec<HeuristicRule> {
    use serde_json::json;
    use StageArtifact as A;

    vec![
        // Recall
        HeuristicRule::new("H1", "recall-hit", Stage::Recall, Stage::Review, move |a, _| match a {
            A::Recall(r) if r.matched && r.confidence >= th.recall_hit => Some(Action::to(
                Stage::Review,
                format!(
                    "recall hit: prior RCA matched with confidence {:.2} >= {:.2}",
                    r.confidence, th.recall_hit
                ),
            )),
            _ => None,
        })
        .shortcut(),
        HeuristicRule::new("H3", "recall-uncertain", Stage::Recall, Stage::Triage, move |a, _| match a {
            A::Recall(r)
                if r.matched
                    && r.confidence >= th.recall_uncertain
                    && r.confidence < th.recall_hit =>
            {
                Some(
                    Action::to(
                        Stage::Triage,
                        format!("recall uncertain: confidence {:.2}, triaging with candidate", r.confidence),
                    )
                    .with_context(
                        "recall_candidate",
                        json!({ "prior_rca_id": r.prior_rca_id, "confidence": r.confidence }),
                    ),
                )
            }
            _ => None,
        }),
        HeuristicRule::new("H2", "recall-miss", Stage::Recall, Stage::Triage, |a, _| match a {
            A::Recall(r) if r.matched => None,
            A::Recall(_) => Some(Action::to(Stage::Triage, "recall miss: no prior RCA")),
            _ => Some(Action::to(Stage::Triage, "recall miss: no recall result")),
        }),
        // Triage
        HeuristicRule::new("H4", "triage-infra", Stage::Triage, Stage::Review, |a, _| match a {
            A::Triage(t) if t.is_category("infra") => Some(Action::to(
                Stage::Review,
                "triage: infrastructure failure, skipping investigation",
            )),
            _ => None,
        })
        .shortcut(),
        HeuristicRule::new("H5", "triage-flake", Stage::Triage, Stage::Review, |a, _| match a {
            A::Triage(t) if t.is_category("flake") => Some(Action::to(
                Stage::Review,
                "triage: flaky test, skipping investigation",
            )),
            _ => None,
        })
        .shortcut(),
        HeuristicRule::new("H18", "triage-skip", Stage::Triage, Stage::Review, |a, _| match a {
            A::Triage(t) if t.skip_investigation => Some(Action::to(
                Stage::Review,
                "triage: worker requested to skip investigation",
            )),
            _ => None,
        })
        .shortcut(),
        HeuristicRule::new("H7", "triage-single-repo", Stage::Triage, Stage::Investigate, |a, _| match a {
            A::Triage(t) if t.candidate_repos.len() == 1 => {
                let repo = &t.candidate_repos[0];
                Some(
                    Action::to(
                        Stage::Investigate,
                        format!("triage: single candidate repo {repo}, skipping resolve"),
                    )
                    .with_context(
                        "selected_repos",
                        json!([{ "name": repo, "reason": "single candidate from triage" }]),
                    ),
                )
            }
            _ => None,
        })
        .shortcut(),
        HeuristicRule::new("H6", "triage-resolve", Stage::Triage, Stage::Resolve, |a, _| match a {
            A::Triage(t) => Some(Action::to(
                Stage::Resolve,
                format!("triage: {} candidate repos, resolving", t.candidate_repos.len()),
            )),
            _ => None,
        }),
        // Resolve
        HeuristicRule::new("H8", "resolve-investigate", Stage::Resolve, Stage::Investigate, |a, _| match a {
            A::Resolve(r) => Some(Action::to(
                Stage::Investigate,
                format!("resolve: {} repos selected", r.selected_repos.len()),
            )),
            _ => None,
        }),
        // Investigate: H11 guards H10 on the same counter
        HeuristicRule::new("H9", "investigate-converged", Stage::Investigate, Stage::Correlate, move |a, _| match a {
            A::Investigate(i) if i.convergence_score >= th.convergence_sufficient => Some(Action::to(
                Stage::Correlate,
                format!(
                    "investigate: convergence {:.2} >= {:.2}",
                    i.convergence_score, th.convergence_sufficient
                ),
            )),
            _ => None,
        }),
        HeuristicRule::new("H11", "investigate-exhausted", Stage::Investigate, Stage::Review, move |a, s| match a {
            A::Investigate(i)
                if i.convergence_score < th.convergence_sufficient
                    && s.is_loop_exhausted(INVESTIGATE_LOOP, th.max_investigate_loops) =>
            {
                Some(
                    Action::to(
                        Stage::Review,
                        format!(
                            "investigate: convergence {:.2} still low after {} loops, insufficient data",
                            i.convergence_score,
                            s.loop_count(INVESTIGATE_LOOP)
                        ),
                    )
                    .with_context("insufficient_data", json!(true)),
                )
            }
            _ => None,
        })
        .shortcut(),
        HeuristicRule::new("H10", "investigate-low", Stage::Investigate, Stage::Resolve, move |a, s| match a {
            A::Investigate(i)
                if i.convergence_score < th.convergence_sufficient
                    && !s.is_loop_exhausted(INVESTIGATE_LOOP, th.max_investigate_loops) =>
            {
                Some(Action::to(
                    Stage::Resolve,
                    format!(
                        "investigate: convergence {:.2} < {:.2}, re-resolving (loop {}/{})",
                        i.convergence_score,
                        th.convergence_sufficient,
                        s.loop_count(INVESTIGATE_LOOP) + 1,
                        th.max_investigate_loops
                    ),
                ))
            }
            _ => None,
        })
        .looping(INVESTIGATE_LOOP),
        // Correlate
        HeuristicRule::new("H15", "correlate-duplicate", Stage::Correlate, Stage::Done, move |a, _| match a {
            A::Correlate(c) if c.is_duplicate && c.confidence >= th.correlate_dup => Some(
                Action::to(
                    Stage::Done,
                    format!("correlate: duplicate of {:?} with confidence {:.2}", c.linked_rca_id, c.confidence),
                )
                .with_context("linked_rca_id", json!(c.linked_rca_id)),
            ),
            _ => None,
        })
        .shortcut(),
        HeuristicRule::new("H15b", "correlate-review", Stage::Correlate, Stage::Review, |a, _| match a {
            A::Correlate(_) => Some(Action::to(Stage::Review, "correlate: not a confident duplicate")),
            _ => None,
        }),
        // Review: H13x guards H13 on the same counter
        HeuristicRule::new("H12", "review-approve", Stage::Review, Stage::Report, |a, _| match a {
            A::Review(r) if r.decision == Some(ReviewVerdict::Approve) => {
                Some(Action::to(Stage::Report, "review: approved"))
            }
            _ => None,
        }),
        HeuristicRule::new("H13x", "review-reassess-exhausted", Stage::Review, Stage::Report, move |a, s| match a {
            A::Review(r)
                if r.decision == Some(ReviewVerdict::Reassess)
                    && s.is_loop_exhausted(REASSESS_LOOP, th.max_reassess_loops) =>
            {
                Some(
                    Action::to(
                        Stage::Report,
                        format!("review: reassess requested after {} loops, escalating", s.loop_count(REASSESS_LOOP)),
                    )
                    .with_context("escalated", json!(true)),
                )
            }
            _ => None,
        }),
        HeuristicRule::new("H13", "review-reassess", Stage::Review, Stage::Resolve, |a, _| match a {
            A::Review(r) if r.decision == Some(ReviewVerdict::Reassess) => {
                let target = r
                    .loop_target
                    .filter(|t| ReviewDecision::is_valid_loop_target(*t))
                    .unwrap_or(Stage::Resolve);
                Some(Action::to(target, format!("review: reassess, returning to {target}")))
            }
            _ => None,
        })
        .looping(REASSESS_LOOP),
        HeuristicRule::new("H14", "review-overturn", Stage::Review, Stage::Report, |a, _| match a {
            A::Review(r) if r.decision == Some(ReviewVerdict::Overturn) => {
                let mut action = Action::to(Stage::Report, "review: conclusion overturned by reviewer");
                if let Some(over) = &r.human_override {
                    action = action.with_context("human_override", json!(over));
                }
                Some(action)
            }
            _ => None,
        }),
    ]
}
