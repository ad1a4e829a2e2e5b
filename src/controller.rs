//! The run controller: owns every session, drives the stage sequence, and
//! is the only writer of session state and transition logs.
//!
//! Each started session gets one worker task. The worker walks the stage
//! pointer forward, dispatching external stages to the [`StageExecutor`]
//! and resolving the two internal stages itself (risk assessment through
//! the gate, reporting through the verdict engine). A gate hold makes the
//! worker exit cleanly; an approved override re-spawns it at the same
//! pointer, so HELD costs no parked task.
//!
//! All state commits go through [`SessionHandle`] helpers that re-check the
//! session status under the state lock before appending, which is what
//! keeps the log's invariants (exactly one terminal transition, nothing
//! after it) intact when a cancel races a completing stage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{ProtocolError, StageError};
use crate::executor::StageExecutor;
use crate::gate::{KnownDrift, RiskGate, RiskHistory};
use crate::models::{
    Artifact, DriftSeverity, ErrorRecord, RiskAssessment, RunInput, Session, SessionStatus,
    Transition, Verdict,
};
use crate::stage::Stage;
use crate::store::{ArtifactStore, Subscription, TransitionLog};
use crate::verdict;

/// What the human decided about a held run.
#[derive(Debug, Clone)]
pub enum OverrideDecision {
    /// Accept the risk and continue into migration.
    Proceed { approved_by: String },
    /// Give up on the run. Terminal.
    Abort { reason: String },
    /// Re-run baseline and re-assess instead of trusting stale evidence.
    Rerun { approved_by: String },
}

struct SessionState {
    stage_pointer: usize,
    status: SessionStatus,
}

/// All state for one run. Shared between the controller, the worker task,
/// and any number of observers.
pub struct SessionHandle {
    pub id: String,
    pub created_at: DateTime<Utc>,
    input: RunInput,
    state: RwLock<SessionState>,
    log: TransitionLog,
    artifacts: ArtifactStore,
    /// Append-only; the last entry is the assessment currently in force.
    assessments: RwLock<Vec<Arc<RiskAssessment>>>,
    /// Append-only; accepting a drift pushes a recomputed verdict.
    verdicts: RwLock<Vec<Arc<Verdict>>>,
    cancel: watch::Sender<bool>,
}

impl SessionHandle {
    fn new(id: String, input: RunInput) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            log: TransitionLog::new(&id),
            id,
            created_at: Utc::now(),
            input,
            state: RwLock::new(SessionState {
                stage_pointer: 0,
                status: SessionStatus::Running,
            }),
            artifacts: ArtifactStore::new(),
            assessments: RwLock::new(Vec::new()),
            verdicts: RwLock::new(Vec::new()),
            cancel,
        }
    }

    pub fn session(&self) -> Session {
        let state = self.state.read().expect("session state poisoned");
        Session {
            id: self.id.clone(),
            stage_pointer: state.stage_pointer,
            status: state.status,
            created_at: self.created_at,
        }
    }

    fn status(&self) -> SessionStatus {
        self.state.read().expect("session state poisoned").status
    }

    fn stage_pointer(&self) -> usize {
        self.state.read().expect("session state poisoned").stage_pointer
    }

    /// Commit a completed stage: store its artifact, advance the pointer,
    /// and log the transition. Skipped (returns false) if the session is no
    /// longer running, so a racing cancel can never be followed by a write
    /// to the log or the artifact store.
    fn commit_stage(&self, stage: Stage, artifact: Option<Artifact>, summary: String) -> bool {
        let mut state = self.state.write().expect("session state poisoned");
        if state.status != SessionStatus::Running {
            return false;
        }
        if let Some(artifact) = artifact {
            self.artifacts.insert(artifact);
        }
        state.stage_pointer += 1;
        self.log.append(stage, SessionStatus::Running, summary, false, None);
        true
    }

    /// Park the session at the gate, storing the blocking assessment.
    /// Non-terminal.
    fn hold(&self, artifact: Artifact, summary: String) -> bool {
        let mut state = self.state.write().expect("session state poisoned");
        if state.status != SessionStatus::Running {
            return false;
        }
        self.artifacts.insert(artifact);
        state.status = SessionStatus::Held;
        self.log.append(Stage::RiskAssessment, SessionStatus::Held, summary, false, None);
        true
    }

    /// Idempotent terminal commit. The first caller wins, stores the final
    /// artifact if any, and appends the session's single terminal
    /// transition; later callers are no-ops.
    fn finish(
        &self,
        stage: Stage,
        status: SessionStatus,
        artifact: Option<Artifact>,
        summary: String,
        error: Option<ErrorRecord>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.write().expect("session state poisoned");
        if state.status.is_terminal() {
            return false;
        }
        if let Some(artifact) = artifact {
            self.artifacts.insert(artifact);
        }
        state.status = status;
        self.log.append(stage, status, summary, true, error);
        true
    }
}

pub struct RunController {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    executor: Arc<dyn StageExecutor>,
    gate: RiskGate,
    history: Arc<dyn RiskHistory>,
    config: Config,
}

impl RunController {
    pub fn new(
        executor: Arc<dyn StageExecutor>,
        history: Arc<dyn RiskHistory>,
        config: Config,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            executor,
            gate: RiskGate::new(config.gate.clone()),
            history,
            config,
        }
    }

    /// Create a session and spawn its worker. Stage pointer starts at
    /// ingest; the worker begins immediately. A caller-supplied id must be
    /// unused.
    pub fn start(
        self: &Arc<Self>,
        input: RunInput,
        id: Option<String>,
    ) -> Result<Session, ProtocolError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());
        let handle = Arc::new(SessionHandle::new(id.clone(), input));
        {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            if sessions.contains_key(&id) {
                return Err(ProtocolError::SessionExists(id));
            }
            sessions.insert(id.clone(), Arc::clone(&handle));
        }
        info!(session = %id, repo = %handle.input.repo_path, "run started");
        let session = handle.session();
        self.spawn_worker(handle);
        Ok(session)
    }

    fn handle(&self, id: &str) -> Result<Arc<SessionHandle>, ProtocolError> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ProtocolError::SessionNotFound(id.to_string()))
    }

    /// Point-read of session state (pull path).
    pub fn snapshot(&self, id: &str) -> Result<Session, ProtocolError> {
        Ok(self.handle(id)?.session())
    }

    /// Point-read of the full transition log (pull path).
    pub fn transitions(&self, id: &str) -> Result<Vec<Transition>, ProtocolError> {
        Ok(self.handle(id)?.log.snapshot().iter().map(|t| (**t).clone()).collect())
    }

    /// Tail-follow of the transition log (push path). A reconnecting
    /// observer passes its last acknowledged sequence number in `after` to
    /// replay what it missed; without one the stream starts at the tail.
    pub fn subscribe(&self, id: &str, after: Option<u64>) -> Result<Subscription, ProtocolError> {
        Ok(self.handle(id)?.log.subscribe(after))
    }

    pub fn artifact(&self, id: &str, stage: Stage) -> Result<Artifact, ProtocolError> {
        let handle = self.handle(id)?;
        handle
            .artifacts
            .get(stage)
            .map(|a| (*a).clone())
            .ok_or(ProtocolError::ArtifactNotFound { id: id.to_string(), stage })
    }

    /// The assessment currently in force (last in the ledger).
    pub fn risk_assessment(&self, id: &str) -> Result<RiskAssessment, ProtocolError> {
        let handle = self.handle(id)?;
        let assessments = handle.assessments.read().expect("assessments poisoned");
        assessments.last().map(|a| (**a).clone()).ok_or(ProtocolError::ArtifactNotFound {
            id: id.to_string(),
            stage: Stage::RiskAssessment,
        })
    }

    /// The verdict currently in force (last in the ledger).
    pub fn verdict(&self, id: &str) -> Result<Verdict, ProtocolError> {
        let handle = self.handle(id)?;
        let verdicts = handle.verdicts.read().expect("verdicts poisoned");
        verdicts.last().map(|v| (**v).clone()).ok_or(ProtocolError::NoVerdict(id.to_string()))
    }

    /// Every verdict ever computed for the session, oldest first.
    pub fn verdict_history(&self, id: &str) -> Result<Vec<Verdict>, ProtocolError> {
        let handle = self.handle(id)?;
        let verdicts = handle.verdicts.read().expect("verdicts poisoned");
        Ok(verdicts.iter().map(|v| (**v).clone()).collect())
    }

    /// Resolve a held run. Proceed and Rerun re-spawn the worker; Abort is
    /// terminal.
    pub fn override_run(
        self: &Arc<Self>,
        id: &str,
        decision: OverrideDecision,
    ) -> Result<Session, ProtocolError> {
        let handle = self.handle(id)?;
        match decision {
            OverrideDecision::Proceed { approved_by } => {
                let overridden = {
                    let mut state = handle.state.write().expect("session state poisoned");
                    if state.status != SessionStatus::Held {
                        return Err(ProtocolError::NotHeld { id: id.to_string(), status: state.status });
                    }
                    let mut assessments =
                        handle.assessments.write().expect("assessments poisoned");
                    let current = assessments
                        .last()
                        .cloned()
                        .ok_or_else(|| ProtocolError::BadRequest("held without assessment".into()))?;
                    let overridden = Arc::new(self.gate.apply_override(&current, &approved_by));
                    assessments.push(Arc::clone(&overridden));
                    handle.artifacts.insert(Artifact::RiskAssessment((*overridden).clone()));
                    state.status = SessionStatus::Running;
                    state.stage_pointer = Stage::RiskAssessment.index() + 1;
                    handle.log.append(
                        Stage::RiskAssessment,
                        SessionStatus::Running,
                        format!("gate override approved by {}", approved_by),
                        false,
                        None,
                    );
                    overridden
                };
                warn!(session = %id, approved_by = %overridden.overridden_by.as_deref().unwrap_or(""),
                      "blocked run overridden, proceeding to migration");
                self.spawn_worker(Arc::clone(&handle));
            }
            OverrideDecision::Rerun { approved_by } => {
                {
                    let mut state = handle.state.write().expect("session state poisoned");
                    if state.status != SessionStatus::Held {
                        return Err(ProtocolError::NotHeld { id: id.to_string(), status: state.status });
                    }
                    // Stale evidence out: baseline and everything after it.
                    handle.artifacts.invalidate_from(Stage::BaselineExecution);
                    state.status = SessionStatus::Running;
                    state.stage_pointer = Stage::BaselineExecution.index();
                    handle.log.append(
                        Stage::RiskAssessment,
                        SessionStatus::Running,
                        format!("gate override: rerun from baseline, requested by {}", approved_by),
                        false,
                        None,
                    );
                }
                info!(session = %id, "override rerun, restarting from baseline");
                self.spawn_worker(Arc::clone(&handle));
            }
            OverrideDecision::Abort { reason } => {
                {
                    let state = handle.state.read().expect("session state poisoned");
                    if state.status != SessionStatus::Held {
                        return Err(ProtocolError::NotHeld { id: id.to_string(), status: state.status });
                    }
                }
                handle.finish(
                    Stage::RiskAssessment,
                    SessionStatus::Cancelled,
                    None,
                    format!("run aborted at gate: {}", reason),
                    None,
                );
                info!(session = %id, %reason, "held run aborted");
            }
        }
        Ok(handle.session())
    }

    /// Cancel a run. Appends the single terminal cancelled transition here;
    /// the worker observes the watch flip and exits without appending.
    pub fn cancel(&self, id: &str) -> Result<Session, ProtocolError> {
        let handle = self.handle(id)?;
        let stage = Stage::from_index(handle.stage_pointer()).unwrap_or(Stage::Reporting);
        if !handle.finish(
            stage,
            SessionStatus::Cancelled,
            None,
            "run cancelled by client".to_string(),
            None,
        ) {
            return Err(ProtocolError::AlreadyTerminal { id: id.to_string(), status: handle.status() });
        }
        let _ = handle.cancel.send(true);
        info!(session = %id, %stage, "run cancelled");
        Ok(handle.session())
    }

    /// Accept a non-critical drift by test name. Recomputes the verdict
    /// with the accepted set and appends it to the ledger; prior verdicts
    /// are kept.
    pub fn accept_drift(&self, id: &str, test_name: &str) -> Result<Verdict, ProtocolError> {
        let handle = self.handle(id)?;
        let view = handle.artifacts.view();
        let validation = view
            .validation()
            .ok_or_else(|| ProtocolError::NoVerdict(id.to_string()))?;
        let drift = validation
            .drifts
            .iter()
            .find(|d| d.test_name == test_name)
            .ok_or_else(|| ProtocolError::DriftNotFound {
                id: id.to_string(),
                test_name: test_name.to_string(),
            })?;
        if drift.severity == DriftSeverity::Critical {
            return Err(ProtocolError::CriticalDrift { test_name: test_name.to_string() });
        }

        let mut verdicts = handle.verdicts.write().expect("verdicts poisoned");
        let current = verdicts.last().ok_or_else(|| ProtocolError::NoVerdict(id.to_string()))?;
        let mut accepted = current.accepted_drifts.clone();
        if !accepted.iter().any(|t| t == test_name) {
            accepted.push(test_name.to_string());
        }
        let next = Arc::new(verdict::compute(
            validation,
            current.test_coverage_pct,
            current.risk_score,
            &accepted,
        ));
        verdicts.push(Arc::clone(&next));
        handle.artifacts.insert(Artifact::Verdict((*next).clone()));
        info!(session = %id, %test_name, label = %next.label, "drift accepted, verdict recomputed");
        Ok((*next).clone())
    }

    fn spawn_worker(self: &Arc<Self>, handle: Arc<SessionHandle>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.worker(handle).await;
        });
    }

    /// Drive the stage pointer forward until the run holds, fails,
    /// completes, or is cancelled.
    async fn worker(self: Arc<Self>, handle: Arc<SessionHandle>) {
        let mut cancelled = handle.cancel.subscribe();
        loop {
            let (pointer, status) = {
                let state = handle.state.read().expect("session state poisoned");
                (state.stage_pointer, state.status)
            };
            if status != SessionStatus::Running {
                return;
            }
            let Some(stage) = Stage::from_index(pointer) else {
                return;
            };

            match stage {
                Stage::RiskAssessment => {
                    if !self.run_gate(&handle) {
                        return;
                    }
                }
                Stage::Reporting => {
                    self.run_reporting(&handle);
                    return;
                }
                _ => {
                    let view = handle.artifacts.view();
                    let execution = tokio::time::timeout(
                        self.config.stage_timeout,
                        self.executor.execute(stage, &handle.input, view),
                    );
                    let result = tokio::select! {
                        _ = cancelled.changed() => {
                            // cancel() already appended the terminal transition.
                            return;
                        }
                        result = execution => result,
                    };
                    let artifact = match result {
                        Err(_) => {
                            let err = StageError::TimedOut {
                                stage,
                                timeout_secs: self.config.stage_timeout.as_secs(),
                            };
                            self.fail(&handle, err);
                            return;
                        }
                        Ok(Err(err)) => {
                            self.fail(&handle, err);
                            return;
                        }
                        Ok(Ok(artifact)) => artifact,
                    };
                    let summary = artifact.summary();
                    if !handle.commit_stage(stage, Some(artifact), summary.clone()) {
                        return;
                    }
                    info!(session = %handle.id, %stage, %summary, "stage complete");
                }
            }
        }
    }

    /// Evaluate the gate. Returns false when the worker should exit (hold
    /// or failure).
    fn run_gate(&self, handle: &Arc<SessionHandle>) -> bool {
        let view = handle.artifacts.view();
        let history = self.history.lookup_past_runs(handle.input.fingerprint());
        let assessment = match self.gate.evaluate(&view, &history) {
            Ok(assessment) => Arc::new(assessment),
            Err(err) => {
                self.fail(
                    handle,
                    StageError::Failed { stage: Stage::RiskAssessment, message: err.to_string() },
                );
                return false;
            }
        };
        handle.assessments.write().expect("assessments poisoned").push(Arc::clone(&assessment));
        let artifact = Artifact::RiskAssessment((*assessment).clone());
        let summary = artifact.summary();

        if assessment.blocked {
            warn!(session = %handle.id, score = assessment.score, level = %assessment.level.as_str(),
                  "risk gate blocked the run, holding for override");
            handle.hold(artifact, format!("{}; held for override", summary));
            return false;
        }
        if handle.commit_stage(Stage::RiskAssessment, Some(artifact), summary.clone()) {
            info!(session = %handle.id, %summary, "risk gate passed");
            true
        } else {
            false
        }
    }

    /// Compute the verdict, record it into history, and complete the run.
    fn run_reporting(&self, handle: &Arc<SessionHandle>) {
        let view = handle.artifacts.view();
        let Some(validation) = view.validation() else {
            self.fail(
                handle,
                StageError::MissingDependency {
                    stage: Stage::Reporting,
                    dependency: Stage::Validation,
                },
            );
            return;
        };
        let coverage = view.test_suite().map(|t| t.coverage_pct).unwrap_or(0.0);
        let risk_score = handle
            .assessments
            .read()
            .expect("assessments poisoned")
            .last()
            .map(|a| a.score)
            .unwrap_or(0.0);
        let verdict = Arc::new(verdict::compute(validation, coverage, risk_score, &[]));

        let fingerprint = handle.input.fingerprint();
        self.history.record_verdict(fingerprint, verdict.label);
        for drift in &validation.drifts {
            self.history.record_drift(
                fingerprint,
                KnownDrift {
                    function: drift.test_name.clone(),
                    severity: drift.severity,
                    message: drift.description.clone(),
                    times_seen: 1,
                },
            );
        }

        handle.verdicts.write().expect("verdicts poisoned").push(Arc::clone(&verdict));
        let artifact = Artifact::Verdict((*verdict).clone());
        let summary = artifact.summary();
        if handle.finish(Stage::Reporting, SessionStatus::Complete, Some(artifact), summary.clone(), None) {
            info!(session = %handle.id, label = %verdict.label, "run complete");
        }
    }

    fn fail(&self, handle: &Arc<SessionHandle>, err: StageError) {
        let stage = err.stage();
        let record = ErrorRecord { stage, message: err.to_string() };
        if handle.finish(stage, SessionStatus::Failed, None, err.to_string(), Some(record)) {
            warn!(session = %handle.id, %stage, error = %err, "run failed");
        }
    }
}
