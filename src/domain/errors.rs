//! Error taxonomy for the engine and its collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::{CaseId, CaseState};

/// Engine-level errors surfaced to callers of the admitter, scheduler,
/// and recovery paths.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Event rejected: {0}")]
    IngressRejected(String),

    #[error("Event is stale: age {age_ms}ms exceeds cutoff {cutoff_ms}ms")]
    IngressStale { age_ms: i64, cutoff_ms: u64 },

    #[error("Admission queue is full")]
    Backpressure,

    #[error("Case not found: {0}")]
    CaseNotFound(CaseId),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: CaseState, to: CaseState },

    #[error("Case {0} is already leased by another worker")]
    LeaseHeld(CaseId),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Dedup index error: {0}")]
    Dedup(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal engine error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<crate::domain::ports::DedupError> for EngineError {
    fn from(err: crate::domain::ports::DedupError) -> Self {
        EngineError::Dedup(err.to_string())
    }
}

/// Errors from the durable journal.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Append failed: {0}")]
    Append(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Non-contiguous sequence for case {case_id}: expected {expected}, got {got}")]
    SequenceGap {
        case_id: CaseId,
        expected: u64,
        got: u64,
    },

    #[error("Replay failed for case {case_id}: {reason}")]
    Replay { case_id: CaseId, reason: String },
}

/// Classified collaborator failure, produced by the activity dispatcher.
///
/// The engine never inspects raw transport errors; it only sees one of
/// these. `Transient`, `RateLimited`, and `Timeout` are retryable within
/// the per-activity attempt budget; everything else is terminal for the
/// invocation.
#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited by collaborator")]
    RateLimited,

    #[error("attempt timed out")]
    Timeout,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("patch failed to compile ({} errors)", errors.len())]
    CompilationFailed { errors: Vec<String> },

    #[error("patch could not be applied: {0}")]
    PatchInvalid(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal collaborator error: {0}")]
    Internal(String),
}

impl ActivityError {
    /// Whether the dispatcher may retry this error within the attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited | Self::Timeout
        )
    }

    pub fn kind(&self) -> ActivityErrorKind {
        match self {
            Self::Transient(_) => ActivityErrorKind::Transient,
            Self::RateLimited => ActivityErrorKind::RateLimited,
            Self::Timeout => ActivityErrorKind::Timeout,
            Self::InvalidInput(_) => ActivityErrorKind::InvalidInput,
            Self::CompilationFailed { .. } => ActivityErrorKind::CompilationFailed,
            Self::PatchInvalid(_) => ActivityErrorKind::PatchInvalid,
            Self::Cancelled => ActivityErrorKind::Cancelled,
            Self::Internal(_) => ActivityErrorKind::Internal,
        }
    }
}

/// Journal-safe classification of an [`ActivityError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityErrorKind {
    Transient,
    RateLimited,
    Timeout,
    InvalidInput,
    CompilationFailed,
    PatchInvalid,
    Cancelled,
    Internal,
}

impl ActivityErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::InvalidInput => "invalid_input",
            Self::CompilationFailed => "compilation_failed",
            Self::PatchInvalid => "patch_invalid",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ActivityErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ActivityError::Transient("503".into()).is_transient());
        assert!(ActivityError::RateLimited.is_transient());
        assert!(ActivityError::Timeout.is_transient());
        assert!(!ActivityError::InvalidInput("bad shape".into()).is_transient());
        assert!(!ActivityError::CompilationFailed { errors: vec![] }.is_transient());
        assert!(!ActivityError::Cancelled.is_transient());
        assert!(!ActivityError::Internal("boom".into()).is_transient());
    }

    #[test]
    fn test_kind_round_trip_names() {
        assert_eq!(ActivityError::RateLimited.kind().as_str(), "rate_limited");
        assert_eq!(
            ActivityError::PatchInvalid("x".into()).kind().as_str(),
            "patch_invalid"
        );
    }
}
