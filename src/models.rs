//! Domain types for a migration run: sessions, transitions, and the typed
//! artifact produced by each stage.
//!
//! Transitions are immutable once appended; artifacts are written once per
//! stage per session (an override that re-runs a stage overwrites its
//! artifact and invalidates everything later). Risk assessments and verdicts
//! are append-only versions with a latest pointer, never edited in place.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

// ── Session ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Held,
    Failed,
    Complete,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Held => "held",
            Self::Failed => "failed",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Complete | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "held" => Ok(Self::Held),
            "failed" => Ok(Self::Failed),
            "complete" => Ok(Self::Complete),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// One migration run. Mutated only by the Run Controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub stage_pointer: usize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied input for a run. The repo path doubles as the
/// fingerprint key for the risk-history lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInput {
    pub repo_path: String,
    #[serde(default)]
    pub target_module: Option<String>,
}

impl RunInput {
    pub fn fingerprint(&self) -> &str {
        &self.repo_path
    }
}

// ── Transitions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub message: String,
}

/// An immutable record of a stage completing, failing, or the run
/// holding/terminating. `sequence_number` is strictly increasing per
/// session and is the single source of truth both transports read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub session_id: String,
    pub stage: Stage,
    pub sequence_number: u64,
    pub payload_summary: String,
    pub timestamp: DateTime<Utc>,
    /// Session status after this transition.
    pub status: SessionStatus,
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

// ── Stage artifacts ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub root: String,
    pub file_count: usize,
    /// Deterministic content hash; used as the 'same codebase' key.
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Function,
    Class,
    Entrypoint,
    SideEffect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub module: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub side_effects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub entrypoints: Vec<String>,
}

impl WorkflowGraph {
    /// Fraction of nodes that touch a side effect, 0.0 when empty.
    pub fn side_effect_density(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let se = self.nodes.iter().filter(|n| n.kind == NodeKind::SideEffect).count();
        se as f64 / self.nodes.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadCodeKind {
    Unreachable,
    ZeroCallers,
    CommentedBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadCodeItem {
    pub name: String,
    pub module: String,
    pub line: u32,
    pub kind: DeadCodeKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadCodeReport {
    pub items: Vec<DeadCodeItem>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub total: usize,
    /// Percent of codebase functions covered by the generated tests.
    pub coverage_pct: f64,
    #[serde(default)]
    pub covered_functions: Vec<String>,
    #[serde(default)]
    pub uncovered_functions: Vec<String>,
}

impl TestSuite {
    /// 1.0 means nothing is covered.
    pub fn coverage_gap(&self) -> f64 {
        (1.0 - self.coverage_pct / 100.0).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub passed: bool,
    pub output: String,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRun {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    /// Deterministic hash of all test outputs, used for drift diffing.
    pub snapshot_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Syntax,
    Api,
    Semantic,
    DeadCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchChange {
    pub file: String,
    pub change_type: ChangeKind,
    pub description: String,
    pub line: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPatch {
    pub unified_diff: String,
    pub changes: Vec<PatchChange>,
    pub lint_passed: bool,
    #[serde(default)]
    pub lint_errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    Critical,
    NonCritical,
}

/// A detected behavioral difference between pre- and post-migration outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftItem {
    pub test_name: String,
    pub severity: DriftSeverity,
    pub description: String,
    pub before_output: String,
    pub after_output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<TestResult>,
    pub drifts: Vec<DriftItem>,
    pub critical_drift_count: usize,
    pub non_critical_drift_count: usize,
    pub behavior_preservation_pct: f64,
}

// ── Risk assessment ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Blocked,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSource {
    Memory,
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskWarning {
    pub source: WarningSource,
    pub function: String,
    pub severity: DriftSeverity,
    pub message: String,
    pub times_seen: u32,
}

/// Produced once after baseline; never mutated. An override produces a new
/// assessment record so the audit trail can answer "was this risk ever
/// flagged" after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 0.0 (safe) to 1.0 (blocked).
    pub score: f64,
    pub level: RiskLevel,
    pub warnings: Vec<RiskWarning>,
    pub blocked: bool,
    pub known_drift_count: usize,
    pub past_run_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_historical_verdict: Option<VerdictLabel>,
    pub side_effect_density: f64,
    pub test_coverage_gap: f64,
    pub computed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overridden_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overridden_at: Option<DateTime<Utc>>,
}

// ── Verdict ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictLabel {
    Safe,
    Risky,
    Blocked,
}

impl VerdictLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Risky => "RISKY",
            Self::Blocked => "BLOCKED",
        }
    }

    /// Ordering for "worst historical verdict": BLOCKED > RISKY > SAFE.
    pub fn severity_rank(&self) -> u8 {
        match self {
            Self::Safe => 1,
            Self::Risky => 2,
            Self::Blocked => 3,
        }
    }
}

impl fmt::Display for VerdictLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification of a completed run. Computed once; accepting a
/// drift produces a new Verdict record, the prior one is kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub label: VerdictLabel,
    pub behavior_preservation_pct: f64,
    pub critical_drifts: usize,
    pub non_critical_drifts: usize,
    pub test_coverage_pct: f64,
    pub risk_score: f64,
    /// Test names of drifts a human has accepted (excluded from counts).
    #[serde(default)]
    pub accepted_drifts: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

// ── Artifact envelope ─────────────────────────────────────────────────

/// The typed output of one stage, keyed by `(session, stage)` in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Artifact {
    SourceSnapshot(SourceSnapshot),
    WorkflowGraph(WorkflowGraph),
    DeadCodeReport(DeadCodeReport),
    TestSuite(TestSuite),
    BaselineRun(BaselineRun),
    RiskAssessment(RiskAssessment),
    MigrationPatch(MigrationPatch),
    ValidationReport(ValidationReport),
    Verdict(Verdict),
}

impl Artifact {
    /// The stage that produces this artifact.
    pub fn stage(&self) -> Stage {
        match self {
            Self::SourceSnapshot(_) => Stage::Ingest,
            Self::WorkflowGraph(_) => Stage::WorkflowMining,
            Self::DeadCodeReport(_) => Stage::DeadCodeDetection,
            Self::TestSuite(_) => Stage::TestGeneration,
            Self::BaselineRun(_) => Stage::BaselineExecution,
            Self::RiskAssessment(_) => Stage::RiskAssessment,
            Self::MigrationPatch(_) => Stage::Migration,
            Self::ValidationReport(_) => Stage::Validation,
            Self::Verdict(_) => Stage::Reporting,
        }
    }

    /// One-line summary used as the transition payload.
    pub fn summary(&self) -> String {
        match self {
            Self::SourceSnapshot(s) => format!("ingested {} files from {}", s.file_count, s.root),
            Self::WorkflowGraph(g) => format!(
                "mined {} nodes, {} edges, {} entrypoints",
                g.nodes.len(),
                g.edges.len(),
                g.entrypoints.len()
            ),
            Self::DeadCodeReport(r) => format!("{} dead code items", r.total),
            Self::TestSuite(t) => {
                format!("{} tests generated, {:.1}% coverage", t.total, t.coverage_pct)
            }
            Self::BaselineRun(b) => format!("baseline: {}/{} tests pass", b.passed, b.total),
            Self::RiskAssessment(a) => format!(
                "risk score {:.2} ({}), {} warnings",
                a.score,
                a.level.as_str(),
                a.warnings.len()
            ),
            Self::MigrationPatch(p) => format!(
                "{} changes, lint {}",
                p.changes.len(),
                if p.lint_passed { "passed" } else { "failed" }
            ),
            Self::ValidationReport(v) => format!(
                "{:.1}% preserved, {} critical / {} non-critical drifts",
                v.behavior_preservation_pct, v.critical_drift_count, v.non_critical_drift_count
            ),
            Self::Verdict(v) => format!(
                "verdict {} ({:.1}% preserved)",
                v.label, v.behavior_preservation_pct
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_terminal_states() {
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Held.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Complete.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn session_status_roundtrip() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Held,
            SessionStatus::Failed,
            SessionStatus::Complete,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn artifact_stage_mapping_is_total() {
        let verdict = Artifact::Verdict(Verdict {
            label: VerdictLabel::Safe,
            behavior_preservation_pct: 100.0,
            critical_drifts: 0,
            non_critical_drifts: 0,
            test_coverage_pct: 90.0,
            risk_score: 0.1,
            accepted_drifts: vec![],
            computed_at: Utc::now(),
        });
        assert_eq!(verdict.stage(), Stage::Reporting);
        assert!(verdict.summary().contains("SAFE"));
    }

    #[test]
    fn verdict_label_wire_format_is_uppercase() {
        assert_eq!(serde_json::to_string(&VerdictLabel::Blocked).unwrap(), "\"BLOCKED\"");
        let label: VerdictLabel = serde_json::from_str("\"RISKY\"").unwrap();
        assert_eq!(label, VerdictLabel::Risky);
    }

    #[test]
    fn verdict_severity_rank_orders_blocked_worst() {
        assert!(VerdictLabel::Blocked.severity_rank() > VerdictLabel::Risky.severity_rank());
        assert!(VerdictLabel::Risky.severity_rank() > VerdictLabel::Safe.severity_rank());
    }

    #[test]
    fn side_effect_density_counts_side_effect_nodes() {
        let graph = WorkflowGraph {
            nodes: vec![
                GraphNode {
                    id: "a".into(),
                    name: "a".into(),
                    module: "m".into(),
                    kind: NodeKind::Function,
                    side_effects: vec![],
                },
                GraphNode {
                    id: "b".into(),
                    name: "b".into(),
                    module: "m".into(),
                    kind: NodeKind::SideEffect,
                    side_effects: vec!["file_io".into()],
                },
            ],
            edges: vec![],
            entrypoints: vec!["a".into()],
        };
        assert!((graph.side_effect_density() - 0.5).abs() < f64::EPSILON);

        let empty = WorkflowGraph { nodes: vec![], edges: vec![], entrypoints: vec![] };
        assert_eq!(empty.side_effect_density(), 0.0);
    }

    #[test]
    fn coverage_gap_is_clamped() {
        let full = TestSuite {
            total: 10,
            coverage_pct: 100.0,
            covered_functions: vec![],
            uncovered_functions: vec![],
        };
        assert_eq!(full.coverage_gap(), 0.0);

        let none = TestSuite {
            total: 0,
            coverage_pct: 0.0,
            covered_functions: vec![],
            uncovered_functions: vec![],
        };
        assert_eq!(none.coverage_gap(), 1.0);
    }

    #[test]
    fn transition_serializes_without_empty_error() {
        let t = Transition {
            session_id: "abc123".into(),
            stage: Stage::Ingest,
            sequence_number: 1,
            payload_summary: "ingested 4 files".into(),
            timestamp: Utc::now(),
            status: SessionStatus::Running,
            terminal: false,
            error: None,
        };
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"sequence_number\":1"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn artifact_envelope_is_tagged() {
        let artifact = Artifact::DeadCodeReport(DeadCodeReport { items: vec![], total: 0 });
        let json = serde_json::to_string(&artifact).unwrap();
        assert!(json.contains("\"kind\":\"dead_code_report\""));
        let back: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stage(), Stage::DeadCodeDetection);
    }
}
