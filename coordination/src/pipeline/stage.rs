//! Pipeline stages and their canonical linear order

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One step in the fixed RCA pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "INIT")]
    Init,
    /// Look up prior RCAs that match the failure symptom
    #[serde(rename = "F0_RECALL")]
    Recall,
    /// Classify the failure and pick candidate repositories
    #[serde(rename = "F1_TRIAGE")]
    Triage,
    /// Resolve which repositories and paths to investigate
    #[serde(rename = "F2_RESOLVE")]
    Resolve,
    /// Dig into the selected repositories for a root cause
    #[serde(rename = "F3_INVESTIGATE")]
    Investigate,
    /// Check for duplicates against known RCAs
    #[serde(rename = "F4_CORRELATE")]
    Correlate,
    /// Human or agent review of the conclusion
    #[serde(rename = "F5_REVIEW")]
    Review,
    /// Produce the final report
    #[serde(rename = "F6_REPORT")]
    Report,
    #[serde(rename = "DONE")]
    Done,
}

impl Stage {
    /// All stages in canonical order
    pub const ALL: [Stage; 9] = [
        Stage::Init,
        Stage::Recall,
        Stage::Triage,
        Stage::Resolve,
        Stage::Investigate,
        Stage::Correlate,
        Stage::Review,
        Stage::Report,
        Stage::Done,
    ];

    /// Stages that produce an artifact (everything between Init and Done)
    pub const WORK: [Stage; 7] = [
        Stage::Recall,
        Stage::Triage,
        Stage::Resolve,
        Stage::Investigate,
        Stage::Correlate,
        Stage::Review,
        Stage::Report,
    ];

    /// Wire name used in signals, state files and requests
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Recall => "F0_RECALL",
            Self::Triage => "F1_TRIAGE",
            Self::Resolve => "F2_RESOLVE",
            Self::Investigate => "F3_INVESTIGATE",
            Self::Correlate => "F4_CORRELATE",
            Self::Review => "F5_REVIEW",
            Self::Report => "F6_REPORT",
            Self::Done => "DONE",
        }
    }

    /// Short family name, also used to key store hooks and artifact files
    pub fn family(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Recall => "recall",
            Self::Triage => "triage",
            Self::Resolve => "resolve",
            Self::Investigate => "investigate",
            Self::Correlate => "correlate",
            Self::Review => "review",
            Self::Report => "report",
            Self::Done => "done",
        }
    }

    /// Position in the canonical order
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// Next stage under the default linear progression.
    ///
    /// `Done` is its own successor.
    pub fn successor(&self) -> Stage {
        match self {
            Self::Init => Self::Recall,
            Self::Recall => Self::Triage,
            Self::Triage => Self::Resolve,
            Self::Resolve => Self::Investigate,
            Self::Investigate => Self::Correlate,
            Self::Correlate => Self::Review,
            Self::Review => Self::Report,
            Self::Report | Self::Done => Self::Done,
        }
    }

    /// True when moving from `self` to `to` goes against the canonical order
    pub fn is_backward(&self, to: Stage) -> bool {
        to.ordinal() < self.ordinal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// Error returned when a stage name is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    /// Accepts either the wire name (`F3_INVESTIGATE`) or the family name (`investigate`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Stage::ALL
            .iter()
            .copied()
            .find(|st| st.wire_name().eq_ignore_ascii_case(needle) || st.family() == needle)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_chain_reaches_done() {
        let mut stage = Stage::Init;
        let mut steps = 0;
        while stage != Stage::Done {
            stage = stage.successor();
            steps += 1;
        }
        assert_eq!(steps, 8);
        assert_eq!(Stage::Done.successor(), Stage::Done);
    }

    #[test]
    fn test_parse_wire_and_family_names() {
        assert_eq!("F3_INVESTIGATE".parse::<Stage>().unwrap(), Stage::Investigate);
        assert_eq!("review".parse::<Stage>().unwrap(), Stage::Review);
        assert!("F9_UNKNOWN".parse::<Stage>().is_err());
    }

    #[test]
    fn test_backward_detection() {
        assert!(Stage::Investigate.is_backward(Stage::Resolve));
        assert!(!Stage::Recall.is_backward(Stage::Review));
    }

    #[test]
    fn test_serde_uses_wire_name() {
        let json = serde_json::to_string(&Stage::Correlate).unwrap();
        assert_eq!(json, "\"F4_CORRELATE\"");
        let back: Stage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Stage::Correlate);
    }
}
