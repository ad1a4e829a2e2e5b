//! Typed error hierarchy for the lockstep orchestration core.
//!
//! Four top-level enums cover the four failure domains:
//! - `StageError` — a stage collaborator failed; terminal for the session
//! - `GateError` — risk evaluation itself failed; treated as a stage failure
//! - `ProtocolError` — an invalid client call; rejected synchronously
//! - `TransportError` — an observer's channel failed; local to that observer

use thiserror::Error;

use crate::models::SessionStatus;
use crate::stage::Stage;

/// A stage collaborator failed. Recorded in the transition log and terminal
/// for the session; no retry is attempted at this layer.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage {stage} failed: {message}")]
    Failed { stage: Stage, message: String },

    #[error("Stage {stage} timed out after {timeout_secs}s")]
    TimedOut { stage: Stage, timeout_secs: u64 },

    #[error("Stage {stage} requires the {dependency} artifact, which is missing")]
    MissingDependency { stage: Stage, dependency: Stage },
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Failed { stage, .. }
            | Self::TimedOut { stage, .. }
            | Self::MissingDependency { stage, .. } => *stage,
        }
    }
}

/// Risk evaluation failed. Never silently treated as "no risk".
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Risk evaluation failed: {0}")]
    Evaluation(String),

    #[error("Risk gate requires the {0} artifact, which is missing")]
    MissingBaseline(Stage),
}

/// An invalid client call. Does not affect session state.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Session {0} already exists")]
    SessionExists(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Session {id} is not held (status: {status})")]
    NotHeld { id: String, status: SessionStatus },

    #[error("Session {id} is already terminal (status: {status})")]
    AlreadyTerminal { id: String, status: SessionStatus },

    #[error("No {stage} artifact for session {id}")]
    ArtifactNotFound { id: String, stage: Stage },

    #[error("No verdict computed yet for session {0}")]
    NoVerdict(String),

    #[error("No drift named '{test_name}' in session {id}")]
    DriftNotFound { id: String, test_name: String },

    #[error("Drift '{test_name}' is critical and cannot be accepted")]
    CriticalDrift { test_name: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// An observer's progress channel failed. Isolated to that observer; never
/// surfaces to the Run Controller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transition channel closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_carries_stage() {
        let err = StageError::TimedOut { stage: Stage::Migration, timeout_secs: 300 };
        assert_eq!(err.stage(), Stage::Migration);
        assert!(err.to_string().contains("300"));

        let err = StageError::MissingDependency {
            stage: Stage::Validation,
            dependency: Stage::BaselineExecution,
        };
        assert_eq!(err.stage(), Stage::Validation);
        assert!(err.to_string().contains("baseline_execution"));
    }

    #[test]
    fn protocol_error_not_held_names_status() {
        let err = ProtocolError::NotHeld {
            id: "abc123".into(),
            status: SessionStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn protocol_error_variants_are_distinct() {
        let exists = ProtocolError::SessionExists("a".into());
        let missing = ProtocolError::SessionNotFound("a".into());
        assert!(matches!(exists, ProtocolError::SessionExists(_)));
        assert!(!matches!(missing, ProtocolError::SessionExists(_)));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StageError::Failed { stage: Stage::Ingest, message: "x".into() });
        assert_std_error(&GateError::Evaluation("x".into()));
        assert_std_error(&ProtocolError::NoVerdict("a".into()));
        assert_std_error(&TransportError::Closed);
    }
}
