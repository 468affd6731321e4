//! Append-only journal entries and case replay.
//!
//! The journal is the source of truth for every case; the in-memory
//! [`Case`] is a projection rebuilt by [`Replay`]. Appends are write-once
//! and per-case `seq` increases by exactly one per entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{ActivityErrorKind, JournalError};
use crate::domain::models::case::{
    Case, CaseState, FailReason, Phase, ProofOutcome, TestOutcome,
};
use crate::domain::models::collaborators::{
    Diagnosis, MergeOutcome, PatchOutcome, ProofReport, TestReport, TestVerdict,
};
use crate::domain::models::events::EventType;
use crate::domain::models::failure_event::{CaseId, FailureEvent};

/// Prover result plus the engine's aggregate over the required invariants.
///
/// The aggregate is computed before journaling so replay never needs the
/// criticality configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofEvaluation {
    pub report: ProofReport,
    pub outcome: ProofOutcome,
}

/// Result payload of a journaled activity call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "activity", rename_all = "snake_case")]
pub enum ActivityOutcome {
    Diagnosed(Diagnosis),
    Patched(PatchOutcome),
    Tested(TestReport),
    Proved(ProofEvaluation),
    Merged(MergeOutcome),
    Failed {
        kind: ActivityErrorKind,
        message: String,
    },
}

impl From<Diagnosis> for ActivityOutcome {
    fn from(d: Diagnosis) -> Self {
        Self::Diagnosed(d)
    }
}

impl From<PatchOutcome> for ActivityOutcome {
    fn from(p: PatchOutcome) -> Self {
        Self::Patched(p)
    }
}

impl From<TestReport> for ActivityOutcome {
    fn from(r: TestReport) -> Self {
        Self::Tested(r)
    }
}

impl From<ProofEvaluation> for ActivityOutcome {
    fn from(e: ProofEvaluation) -> Self {
        Self::Proved(e)
    }
}

impl From<MergeOutcome> for ActivityOutcome {
    fn from(m: MergeOutcome) -> Self {
        Self::Merged(m)
    }
}

impl ActivityOutcome {
    /// Fold this result into the case projection.
    ///
    /// Both the live dispatcher and journal replay go through here, so a
    /// replayed projection is identical to the one the worker held.
    pub fn apply_to(&self, case: &mut Case, phase: Phase, attempt: u32) {
        match self {
            Self::Diagnosed(d) => {
                case.diagnosis = Some(d.clone());
                case.root_cause = Some(d.root_cause);
            }
            Self::Patched(p) => {
                case.patch_ref = Some(p.patch_ref.clone());
                case.files_changed = p.files_changed.clone();
            }
            Self::Tested(r) => {
                case.test_outcome = Some(TestOutcome::from(r));
                if r.verdict == TestVerdict::Fail {
                    let detail = r
                        .trace
                        .clone()
                        .unwrap_or_else(|| "test suite failed".to_string());
                    case.note_prior_attempt(phase, attempt, detail);
                }
            }
            Self::Proved(e) => {
                case.proof_outcome = Some(e.outcome.clone());
            }
            Self::Merged(m) => {
                case.merge_outcome = Some(m.clone());
            }
            Self::Failed {
                kind: ActivityErrorKind::CompilationFailed,
                message,
            } => {
                case.note_prior_attempt(phase, attempt, message.clone());
            }
            Self::Failed { .. } => {}
        }
    }
}

/// Payload of one journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalKind {
    /// A state transition. The admission entry has `from = None` and
    /// carries the originating event and computed deadline so recovery is
    /// self-contained.
    StateTransition {
        from: Option<CaseState>,
        to: CaseState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<FailReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<FailureEvent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },
    /// Written before every network call to a collaborator. `attempt` is
    /// the phase-level invocation, `call` the network attempt within it.
    ActivityAttempt { phase: Phase, attempt: u32, call: u32 },
    /// Written after the call returns or is classified as failed.
    ActivityResult {
        phase: Phase,
        attempt: u32,
        call: u32,
        outcome: ActivityOutcome,
    },
    /// Terminal event flushed to the sink while sealing the case.
    Emitted { event_type: EventType },
    /// Unexpected engine error observed while driving the case.
    Error { message: String },
}

/// One append-only record in a case's journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub case_id: CaseId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: JournalKind,
}

/// Optional acceleration: a projection checkpoint. Recovery loads the
/// latest snapshot and replays only the tail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub case_id: CaseId,
    /// Next sequence number at the time the snapshot was taken.
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    pub case: Case,
}

/// An activity call whose result never made it into the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dangling {
    pub phase: Phase,
    pub attempt: u32,
    /// Network calls already journaled for this invocation.
    pub calls: u32,
}

/// Outcome of replaying a case's journal.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub case: Case,
    /// Set when the last activity call has no matching result; the
    /// activity is retried at most once more on resume.
    pub dangling: Option<Dangling>,
    /// Whether a terminal event was already flushed.
    pub sealed: bool,
}

impl Replay {
    /// Rebuild a case from its full journal.
    pub fn from_entries(entries: &[JournalEntry]) -> Result<Self, JournalError> {
        let first = entries.first().ok_or_else(|| JournalError::Read(
            "cannot replay an empty journal".to_string(),
        ))?;
        let case_id = first.case_id;
        let case = match &first.kind {
            JournalKind::StateTransition {
                from: None,
                to: CaseState::New,
                event: Some(event),
                deadline: Some(deadline),
                ..
            } => {
                let mut case = Case::admit(event, first.timestamp, *deadline);
                case.seq = first.seq + 1;
                case
            }
            _ => {
                return Err(JournalError::Replay {
                    case_id,
                    reason: "journal does not start with an admission entry".to_string(),
                })
            }
        };
        if first.seq != 0 {
            return Err(JournalError::SequenceGap {
                case_id,
                expected: 0,
                got: first.seq,
            });
        }
        Self::fold(case, &entries[1..])
    }

    /// Rebuild a case from a snapshot plus the journal tail past it.
    pub fn from_snapshot(snapshot: Snapshot, tail: &[JournalEntry]) -> Result<Self, JournalError> {
        let mut case = snapshot.case;
        case.seq = snapshot.seq;
        Self::fold(case, tail)
    }

    fn fold(mut case: Case, entries: &[JournalEntry]) -> Result<Self, JournalError> {
        let mut dangling: Option<Dangling> = None;
        let mut sealed = false;

        for entry in entries {
            if entry.seq != case.seq {
                return Err(JournalError::SequenceGap {
                    case_id: case.id,
                    expected: case.seq,
                    got: entry.seq,
                });
            }
            case.seq = entry.seq + 1;

            match &entry.kind {
                JournalKind::StateTransition {
                    from: Some(from),
                    to,
                    reason,
                    ..
                } => {
                    if *from != case.state {
                        return Err(JournalError::Replay {
                            case_id: case.id,
                            reason: format!(
                                "transition from {} recorded while projection is {}",
                                from, case.state
                            ),
                        });
                    }
                    case.apply_transition(*to, *reason, entry.timestamp)
                        .map_err(|e| JournalError::Replay {
                            case_id: case.id,
                            reason: e.to_string(),
                        })?;
                }
                JournalKind::StateTransition { from: None, .. } => {
                    return Err(JournalError::Replay {
                        case_id: case.id,
                        reason: "admission entry found past the head of the journal".to_string(),
                    });
                }
                JournalKind::ActivityAttempt {
                    phase,
                    attempt,
                    call,
                } => {
                    case.attempts.observe(*phase, *attempt);
                    dangling = Some(Dangling {
                        phase: *phase,
                        attempt: *attempt,
                        calls: *call,
                    });
                }
                JournalKind::ActivityResult {
                    phase,
                    attempt,
                    outcome,
                    ..
                } => {
                    dangling = None;
                    outcome.apply_to(&mut case, *phase, *attempt);
                }
                JournalKind::Emitted { .. } => {
                    if case.is_terminal() {
                        sealed = true;
                    }
                }
                JournalKind::Error { .. } => {}
            }
        }

        if case.is_terminal() {
            dangling = None;
        }
        Ok(Self {
            case,
            dangling,
            sealed,
        })
    }
}

impl Case {
    /// Build the next journal entry for this case at an explicit timestamp.
    ///
    /// The same timestamp must be used when mutating the projection so
    /// replay reconstructs it byte-for-byte.
    pub fn next_entry_at(&mut self, at: DateTime<Utc>, kind: JournalKind) -> JournalEntry {
        let entry = JournalEntry {
            case_id: self.id,
            seq: self.seq,
            timestamp: at,
            kind,
        };
        self.seq += 1;
        entry
    }

    pub fn next_entry(&mut self, kind: JournalKind) -> JournalEntry {
        self.next_entry_at(Utc::now(), kind)
    }

    /// The first journal entry of a freshly admitted case.
    pub fn admission_entry(&mut self, event: &FailureEvent) -> JournalEntry {
        let at = self.started_at;
        let deadline = self.deadline;
        self.next_entry_at(
            at,
            JournalKind::StateTransition {
                from: None,
                to: CaseState::New,
                reason: None,
                event: Some(event.clone()),
                deadline: Some(deadline),
            },
        )
    }
}
