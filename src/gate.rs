//! The risk gate: the human-approval checkpoint between baseline execution
//! and the irreversible migration stage.
//!
//! Evaluation is a pure function of the baseline artifacts and the repo's
//! risk history, so it is independently testable. The block threshold comes
//! from configuration; the gate never hardcodes it.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use crate::config::GateConfig;
use crate::errors::GateError;
use crate::models::{
    DriftSeverity, RiskAssessment, RiskLevel, RiskWarning, VerdictLabel, WarningSource,
};
use crate::stage::Stage;
use crate::store::ArtifactView;

// ── Risk history collaborator ─────────────────────────────────────────

/// A drift observed in a past run of the same codebase.
#[derive(Debug, Clone)]
pub struct KnownDrift {
    pub function: String,
    pub severity: DriftSeverity,
    pub message: String,
    pub times_seen: u32,
}

/// What past runs of this codebase looked like. Absence of history yields
/// empty defaults, never an error.
#[derive(Debug, Clone, Default)]
pub struct RunHistory {
    pub past_verdicts: Vec<VerdictLabel>,
    pub known_drifts: Vec<KnownDrift>,
}

impl RunHistory {
    pub fn past_run_count(&self) -> usize {
        self.past_verdicts.len()
    }

    pub fn worst_verdict(&self) -> Option<VerdictLabel> {
        self.past_verdicts.iter().copied().max_by_key(VerdictLabel::severity_rank)
    }
}

/// Whatever remembers previous migration attempts. Recording is optional;
/// a read-only backend keeps the default no-ops.
pub trait RiskHistory: Send + Sync {
    fn lookup_past_runs(&self, fingerprint: &str) -> RunHistory;

    fn record_verdict(&self, _fingerprint: &str, _verdict: VerdictLabel) {}

    fn record_drift(&self, _fingerprint: &str, _drift: KnownDrift) {}
}

/// The no-history default: every repo looks new.
pub struct NoHistory;

impl RiskHistory for NoHistory {
    fn lookup_past_runs(&self, _fingerprint: &str) -> RunHistory {
        RunHistory::default()
    }
}

/// In-memory history keyed by repo fingerprint. Used by the demo server and
/// tests; a durable deployment swaps in a persistent implementation.
#[derive(Default)]
pub struct InMemoryHistory {
    entries: RwLock<HashMap<String, RunHistory>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RiskHistory for InMemoryHistory {
    fn lookup_past_runs(&self, fingerprint: &str) -> RunHistory {
        self.entries
            .read()
            .expect("history poisoned")
            .get(fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    fn record_verdict(&self, fingerprint: &str, verdict: VerdictLabel) {
        let mut entries = self.entries.write().expect("history poisoned");
        entries.entry(fingerprint.to_string()).or_default().past_verdicts.push(verdict);
    }

    fn record_drift(&self, fingerprint: &str, drift: KnownDrift) {
        let mut entries = self.entries.write().expect("history poisoned");
        let history = entries.entry(fingerprint.to_string()).or_default();
        if let Some(existing) =
            history.known_drifts.iter_mut().find(|d| d.function == drift.function)
        {
            existing.times_seen += 1;
        } else {
            history.known_drifts.push(drift);
        }
    }
}

// ── Gate ──────────────────────────────────────────────────────────────

pub struct RiskGate {
    config: GateConfig,
}

impl RiskGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Score the run before migration. Four weighted factors, each capped:
    ///
    /// - known drift severity  (max 0.35): critical x 0.15 + non-critical x 0.05
    /// - past verdict history  (max 0.25): BLOCKED x 0.10 + RISKY x 0.05
    /// - side-effect density   (max 0.20): density x 0.4
    /// - test coverage gap     (max 0.20): gap x 0.2
    pub fn evaluate(
        &self,
        artifacts: &ArtifactView,
        history: &RunHistory,
    ) -> Result<RiskAssessment, GateError> {
        if artifacts.baseline().is_none() {
            return Err(GateError::MissingBaseline(Stage::BaselineExecution));
        }

        let warnings = build_warnings(artifacts, history);

        let critical = warnings.iter().filter(|w| w.severity == DriftSeverity::Critical).count();
        let non_critical =
            warnings.iter().filter(|w| w.severity == DriftSeverity::NonCritical).count();
        let drift_factor = (critical as f64 * 0.15 + non_critical as f64 * 0.05).min(0.35);

        let blocked_runs = history
            .past_verdicts
            .iter()
            .filter(|v| **v == VerdictLabel::Blocked)
            .count();
        let risky_runs =
            history.past_verdicts.iter().filter(|v| **v == VerdictLabel::Risky).count();
        let verdict_factor = (blocked_runs as f64 * 0.10 + risky_runs as f64 * 0.05).min(0.25);

        let side_effect_density =
            artifacts.workflow_graph().map(|g| g.side_effect_density()).unwrap_or(0.0);
        let se_factor = (side_effect_density * 0.4).min(0.20);

        // No test suite at all is a full coverage gap.
        let coverage_gap = artifacts.test_suite().map(|t| t.coverage_gap()).unwrap_or(1.0);
        let coverage_factor = (coverage_gap * 0.2).min(0.20);

        let score = (drift_factor + verdict_factor + se_factor + coverage_factor).min(1.0);
        let level = score_to_level(score);
        let blocked = score >= self.config.block_threshold || level == RiskLevel::Blocked;

        Ok(RiskAssessment {
            score,
            level,
            blocked,
            known_drift_count: history.known_drifts.len(),
            past_run_count: history.past_run_count(),
            worst_historical_verdict: history.worst_verdict(),
            side_effect_density,
            test_coverage_gap: coverage_gap,
            warnings,
            computed_at: Utc::now(),
            overridden_by: None,
            overridden_at: None,
        })
    }

    /// Produce a new, unblocked assessment carrying the audit trail. The
    /// original record is untouched so "was this risk ever flagged" stays
    /// answerable.
    pub fn apply_override(&self, assessment: &RiskAssessment, approved_by: &str) -> RiskAssessment {
        let mut next = assessment.clone();
        next.blocked = false;
        next.overridden_by = Some(approved_by.to_string());
        next.overridden_at = Some(Utc::now());
        next
    }
}

fn build_warnings(artifacts: &ArtifactView, history: &RunHistory) -> Vec<RiskWarning> {
    let mut warnings: Vec<RiskWarning> = history
        .known_drifts
        .iter()
        .map(|d| RiskWarning {
            source: WarningSource::Memory,
            function: d.function.clone(),
            severity: d.severity,
            message: d.message.clone(),
            times_seen: d.times_seen,
        })
        .collect();

    // Heuristic: every side-effecting node is a place migration can go wrong.
    if let Some(graph) = artifacts.workflow_graph() {
        for node in &graph.nodes {
            if !node.side_effects.is_empty() {
                warnings.push(RiskWarning {
                    source: WarningSource::Heuristic,
                    function: node.name.clone(),
                    severity: DriftSeverity::NonCritical,
                    message: format!("touches side effects: {}", node.side_effects.join(", ")),
                    times_seen: 1,
                });
            }
        }
    }

    warnings
}

fn score_to_level(score: f64) -> RiskLevel {
    if score < 0.3 {
        RiskLevel::Low
    } else if score < 0.5 {
        RiskLevel::Medium
    } else if score < 0.8 {
        RiskLevel::High
    } else {
        RiskLevel::Blocked
    }
}
