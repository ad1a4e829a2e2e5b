//! The fixed migration pipeline sequence.
//!
//! Stages are stateless descriptors: a name and a position in a total order.
//! The Run Controller owns the pointer into this sequence; nothing here is
//! mutable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One step in the migration pipeline. The sequence is fixed and linear;
/// the only conditional behavior is the hold at [`Stage::RiskAssessment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    WorkflowMining,
    DeadCodeDetection,
    TestGeneration,
    BaselineExecution,
    RiskAssessment,
    Migration,
    Validation,
    Reporting,
}

/// All stages in execution order.
pub const SEQUENCE: [Stage; 9] = [
    Stage::Ingest,
    Stage::WorkflowMining,
    Stage::DeadCodeDetection,
    Stage::TestGeneration,
    Stage::BaselineExecution,
    Stage::RiskAssessment,
    Stage::Migration,
    Stage::Validation,
    Stage::Reporting,
];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::WorkflowMining => "workflow_mining",
            Self::DeadCodeDetection => "dead_code_detection",
            Self::TestGeneration => "test_generation",
            Self::BaselineExecution => "baseline_execution",
            Self::RiskAssessment => "risk_assessment",
            Self::Migration => "migration",
            Self::Validation => "validation",
            Self::Reporting => "reporting",
        }
    }

    /// Position in [`SEQUENCE`].
    pub fn index(&self) -> usize {
        SEQUENCE.iter().position(|s| s == self).unwrap_or(0)
    }

    pub fn from_index(index: usize) -> Option<Stage> {
        SEQUENCE.get(index).copied()
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::from_index(self.index() + 1)
    }

    /// Stages the controller resolves itself rather than dispatching to the
    /// executor capability: the risk gate and the verdict computation.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::RiskAssessment | Self::Reporting)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "workflow_mining" => Ok(Self::WorkflowMining),
            "dead_code_detection" => Ok(Self::DeadCodeDetection),
            "test_generation" => Ok(Self::TestGeneration),
            "baseline_execution" => Ok(Self::BaselineExecution),
            "risk_assessment" => Ok(Self::RiskAssessment),
            "migration" => Ok(Self::Migration),
            "validation" => Ok(Self::Validation),
            "reporting" => Ok(Self::Reporting),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_totally_ordered() {
        for (i, stage) in SEQUENCE.iter().enumerate() {
            assert_eq!(stage.index(), i);
            assert_eq!(Stage::from_index(i), Some(*stage));
        }
        assert_eq!(Stage::from_index(SEQUENCE.len()), None);
    }

    #[test]
    fn next_walks_the_sequence() {
        assert_eq!(Stage::Ingest.next(), Some(Stage::WorkflowMining));
        assert_eq!(Stage::BaselineExecution.next(), Some(Stage::RiskAssessment));
        assert_eq!(Stage::RiskAssessment.next(), Some(Stage::Migration));
        assert_eq!(Stage::Reporting.next(), None);
    }

    #[test]
    fn as_str_from_str_roundtrip() {
        for stage in SEQUENCE {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("not_a_stage".parse::<Stage>().is_err());
    }

    #[test]
    fn internal_stages_are_gate_and_reporting() {
        let internal: Vec<Stage> = SEQUENCE.iter().copied().filter(Stage::is_internal).collect();
        assert_eq!(internal, vec![Stage::RiskAssessment, Stage::Reporting]);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&Stage::DeadCodeDetection).unwrap();
        assert_eq!(json, "\"dead_code_detection\"");
        let back: Stage = serde_json::from_str("\"baseline_execution\"").unwrap();
        assert_eq!(back, Stage::BaselineExecution);
    }
}
