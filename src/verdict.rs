//! The verdict engine: reduces validation evidence to SAFE / RISKY /
//! BLOCKED with fixed thresholds.
//!
//! Classification order matters. SAFE is checked first, then BLOCKED, then
//! RISKY as the default: the RISKY and BLOCKED clauses overlap as written
//! (95% preservation with 3 critical drifts matches both), and
//! under-preservation must never be downgraded to a softer verdict, so
//! BLOCKED wins whenever both match.

use chrono::Utc;

use crate::models::{DriftSeverity, ValidationReport, Verdict, VerdictLabel};

/// SAFE requires at least this much behavior preservation.
pub const SAFE_PRESERVATION_FLOOR: f64 = 98.0;

/// Below this preservation the run is BLOCKED outright.
pub const BLOCKED_PRESERVATION_FLOOR: f64 = 85.0;

/// More critical drifts than this is BLOCKED outright.
pub const MAX_TOLERATED_CRITICAL_DRIFTS: usize = 2;

/// Compute a verdict from validation evidence. Pure and deterministic.
///
/// `accepted` carries the test names of drifts a human has signed off on;
/// those drifts are excluded from the counts. Acceptance produces a new
/// Verdict record; callers keep the prior one for audit.
pub fn compute(
    validation: &ValidationReport,
    test_coverage_pct: f64,
    risk_score: f64,
    accepted: &[String],
) -> Verdict {
    let total = validation.results.len();
    let passing = validation.results.iter().filter(|r| r.passed).count();
    let behavior_preservation_pct =
        if total > 0 { passing as f64 / total as f64 * 100.0 } else { 0.0 };

    let critical_drifts = validation
        .drifts
        .iter()
        .filter(|d| d.severity == DriftSeverity::Critical && !accepted.contains(&d.test_name))
        .count();
    let non_critical_drifts = validation
        .drifts
        .iter()
        .filter(|d| d.severity == DriftSeverity::NonCritical && !accepted.contains(&d.test_name))
        .count();

    Verdict {
        label: classify(behavior_preservation_pct, critical_drifts),
        behavior_preservation_pct,
        critical_drifts,
        non_critical_drifts,
        test_coverage_pct,
        risk_score,
        accepted_drifts: accepted.to_vec(),
        computed_at: Utc::now(),
    }
}

/// SAFE, then BLOCKED, then RISKY. See the module docs for why the order is
/// not the order the thresholds are usually written in.
pub fn classify(preservation_pct: f64, critical_drifts: usize) -> VerdictLabel {
    if preservation_pct >= SAFE_PRESERVATION_FLOOR && critical_drifts == 0 {
        return VerdictLabel::Safe;
    }
    if preservation_pct < BLOCKED_PRESERVATION_FLOOR
        || critical_drifts > MAX_TOLERATED_CRITICAL_DRIFTS
    {
        return VerdictLabel::Blocked;
    }
    VerdictLabel::Risky
}
