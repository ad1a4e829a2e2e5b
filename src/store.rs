//! Per-session shared state: the append-only transition log and the
//! artifact store.
//!
//! The transition log is the single source of truth for both observation
//! channels. The pull path ([`TransitionLog::snapshot`]) is a point-read of
//! the log; the push path ([`TransitionLog::subscribe`]) replays the log and
//! then follows a broadcast channel fed only by the append path. Because
//! both strategies read the same `Vec`, a client that drops its stream and
//! falls back to polling can never observe a state the stream would have
//! disagreed with.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::errors::TransportError;
use crate::models::{Artifact, ErrorRecord, SessionStatus, Transition};
use crate::stage::Stage;

/// Broadcast capacity per session. Slow observers that fall more than this
/// far behind are re-synced from the log rather than blocking the writer.
const CHANNEL_CAPACITY: usize = 256;

// ── Transition log ────────────────────────────────────────────────────

pub struct TransitionLog {
    session_id: String,
    entries: Arc<RwLock<Vec<Arc<Transition>>>>,
    tx: broadcast::Sender<Arc<Transition>>,
}

impl TransitionLog {
    pub fn new(session_id: &str) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id: session_id.to_string(),
            entries: Arc::new(RwLock::new(Vec::new())),
            tx,
        }
    }

    /// Append a transition, assigning the next sequence number, and fan it
    /// out to live subscribers. Send errors (no subscribers) are ignored:
    /// the controller's progress is never coupled to whether anyone watches.
    pub fn append(
        &self,
        stage: Stage,
        status: SessionStatus,
        payload_summary: String,
        terminal: bool,
        error: Option<ErrorRecord>,
    ) -> Arc<Transition> {
        let transition = {
            let mut entries = self.entries.write().expect("transition log poisoned");
            let transition = Arc::new(Transition {
                session_id: self.session_id.clone(),
                stage,
                sequence_number: entries.len() as u64 + 1,
                payload_summary,
                timestamp: Utc::now(),
                status,
                terminal,
                error,
            });
            entries.push(Arc::clone(&transition));
            transition
        };
        let _ = self.tx.send(Arc::clone(&transition));
        transition
    }

    /// Point-read of the full log (pull path).
    pub fn snapshot(&self) -> Vec<Arc<Transition>> {
        self.entries.read().expect("transition log poisoned").clone()
    }

    pub fn last(&self) -> Option<Arc<Transition>> {
        self.entries.read().expect("transition log poisoned").last().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("transition log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tail-follow read (push path). Replays logged transitions with
    /// `sequence_number > after`, then follows live appends. Without an
    /// acknowledged sequence number the stream starts at the current tail;
    /// a caller wanting the full history passes `Some(0)`. Subscribing
    /// before reading the backlog means the overlap window is covered twice;
    /// [`Subscription::recv`] de-duplicates by sequence number, so the
    /// caller sees a gap-free, strictly increasing stream.
    pub fn subscribe(&self, after: Option<u64>) -> Subscription {
        let rx = self.tx.subscribe();
        let entries = self.entries.read().expect("transition log poisoned");
        let after = after.unwrap_or(entries.len() as u64);
        let backlog: VecDeque<Arc<Transition>> = entries
            .iter()
            .filter(|t| t.sequence_number > after)
            .cloned()
            .collect();
        drop(entries);
        Subscription { entries: Arc::clone(&self.entries), rx, backlog, next_seq: after + 1 }
    }
}

/// A live, replayable view of one session's transition log.
pub struct Subscription {
    entries: Arc<RwLock<Vec<Arc<Transition>>>>,
    rx: broadcast::Receiver<Arc<Transition>>,
    backlog: VecDeque<Arc<Transition>>,
    next_seq: u64,
}

impl Subscription {
    /// Next transition in sequence order. Replayed entries come first, then
    /// live ones; duplicates from the subscribe/replay overlap are skipped.
    /// A lagged receiver is re-synced from the log, so observers that fall
    /// behind lose nothing — they just catch up in a burst.
    ///
    /// Callers should stop after a transition with `terminal == true`;
    /// nothing is ever appended past it.
    pub async fn recv(&mut self) -> Result<Arc<Transition>, TransportError> {
        loop {
            if let Some(t) = self.backlog.pop_front() {
                self.next_seq = t.sequence_number + 1;
                return Ok(t);
            }
            match self.rx.recv().await {
                Ok(t) if t.sequence_number >= self.next_seq => {
                    self.next_seq = t.sequence_number + 1;
                    return Ok(t);
                }
                // Already delivered during replay.
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    self.backlog = self
                        .entries
                        .read()
                        .expect("transition log poisoned")
                        .iter()
                        .filter(|t| t.sequence_number >= self.next_seq)
                        .cloned()
                        .collect();
                }
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }
}

// ── Artifact store ────────────────────────────────────────────────────

/// Per-session mapping from stage to its produced artifact. Writes are owned
/// by the session's worker; readers get a copy-on-write view.
pub struct ArtifactStore {
    artifacts: RwLock<HashMap<Stage, Arc<Artifact>>>,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self { artifacts: RwLock::new(HashMap::new()) }
    }

    /// Write a stage's artifact. Under normal flow each stage writes once;
    /// an override re-run overwrites.
    pub fn insert(&self, artifact: Artifact) -> Arc<Artifact> {
        let artifact = Arc::new(artifact);
        self.artifacts
            .write()
            .expect("artifact store poisoned")
            .insert(artifact.stage(), Arc::clone(&artifact));
        artifact
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<Artifact>> {
        self.artifacts.read().expect("artifact store poisoned").get(&stage).cloned()
    }

    /// Remove `stage`'s artifact and every later stage's. Called before an
    /// override re-run so no later stage can leak stale data.
    pub fn invalidate_from(&self, stage: Stage) {
        let cutoff = stage.index();
        self.artifacts
            .write()
            .expect("artifact store poisoned")
            .retain(|s, _| s.index() < cutoff);
    }

    /// Immutable snapshot of the current artifact set, handed to executors
    /// and the gate so they never observe a mid-write state.
    pub fn view(&self) -> ArtifactView {
        ArtifactView {
            artifacts: self.artifacts.read().expect("artifact store poisoned").clone(),
        }
    }
}

/// A point-in-time copy of a session's artifacts with typed accessors.
#[derive(Clone)]
pub struct ArtifactView {
    artifacts: HashMap<Stage, Arc<Artifact>>,
}

impl ArtifactView {
    pub fn get(&self, stage: Stage) -> Option<&Artifact> {
        self.artifacts.get(&stage).map(Arc::as_ref)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.artifacts.contains_key(&stage)
    }

    pub fn source_snapshot(&self) -> Option<&crate::models::SourceSnapshot> {
        match self.get(Stage::Ingest)? {
            Artifact::SourceSnapshot(s) => Some(s),
            _ => None,
        }
    }

    pub fn workflow_graph(&self) -> Option<&crate::models::WorkflowGraph> {
        match self.get(Stage::WorkflowMining)? {
            Artifact::WorkflowGraph(g) => Some(g),
            _ => None,
        }
    }

    pub fn test_suite(&self) -> Option<&crate::models::TestSuite> {
        match self.get(Stage::TestGeneration)? {
            Artifact::TestSuite(t) => Some(t),
            _ => None,
        }
    }

    pub fn baseline(&self) -> Option<&crate::models::BaselineRun> {
        match self.get(Stage::BaselineExecution)? {
            Artifact::BaselineRun(b) => Some(b),
            _ => None,
        }
    }

    pub fn risk_assessment(&self) -> Option<&crate::models::RiskAssessment> {
        match self.get(Stage::RiskAssessment)? {
            Artifact::RiskAssessment(a) => Some(a),
            _ => None,
        }
    }

    pub fn validation(&self) -> Option<&crate::models::ValidationReport> {
        match self.get(Stage::Validation)? {
            Artifact::ValidationReport(v) => Some(v),
            _ => None,
        }
    }
}
