//! Typed lifecycle events published to the event sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::case::{Case, CaseState};
use crate::domain::models::failure_event::CaseId;

/// Closed set of event types the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateNew,
    StateDiagnose,
    StatePatch,
    StateTest,
    StateProve,
    StateMerge,
    StateDone,
    StateFailed,
    ActivityAttempt,
    ActivityResult,
    DedupHit,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateNew => "state.new",
            Self::StateDiagnose => "state.diagnose",
            Self::StatePatch => "state.patch",
            Self::StateTest => "state.test",
            Self::StateProve => "state.prove",
            Self::StateMerge => "state.merge",
            Self::StateDone => "state.done",
            Self::StateFailed => "state.failed",
            Self::ActivityAttempt => "activity.attempt",
            Self::ActivityResult => "activity.result",
            Self::DedupHit => "dedup.hit",
        }
    }

    /// The event announcing entry into a state.
    pub fn for_state(state: CaseState) -> Self {
        match state {
            CaseState::New => Self::StateNew,
            CaseState::Diagnose => Self::StateDiagnose,
            CaseState::Patch => Self::StatePatch,
            CaseState::Test => Self::StateTest,
            CaseState::Prove => Self::StateProve,
            CaseState::Merge => Self::StateMerge,
            CaseState::Done => Self::StateDone,
            CaseState::Failed => Self::StateFailed,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Envelope published for every transition and activity attempt/result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseEvent {
    pub event_type: EventType,
    pub case_id: CaseId,
    pub repository: String,
    pub run_id: u64,
    pub head_sha: String,
    /// Absent for `dedup.hit`, where no live projection exists.
    pub state: Option<CaseState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl CaseEvent {
    /// Envelope pre-filled from a case projection.
    pub fn for_case(event_type: EventType, case: &Case) -> Self {
        Self {
            event_type,
            case_id: case.id,
            repository: case.repository.clone(),
            run_id: case.run_id,
            head_sha: case.head_sha.clone(),
            state: Some(case.state),
            attempt: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
