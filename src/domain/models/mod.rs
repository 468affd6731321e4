//! Domain models for the self-healing workflow engine.

pub mod case;
pub mod collaborators;
pub mod events;
pub mod failure_event;
pub mod journal;
pub mod report;

pub use case::{
    Case, CaseState, FailReason, Phase, PhaseAttempts, ProofOutcome, RootCause, TestOutcome,
};
pub use collaborators::{
    CorrelationKey, Criticality, Diagnosis, DiagnosisRequest, InvariantSpec, MergeOutcome,
    MergeRequest, PatchOutcome, PatchRequest, ProofReport, ProofRequest, ProofSummary, RetryRun,
    TestReport, TestRequest, TestVerdict, TheoremResult, TheoremVerdict,
};
pub use events::{CaseEvent, EventType};
pub use failure_event::{CaseId, DedupKey, FailureEvent};
pub use journal::{
    ActivityOutcome, Dangling, JournalEntry, JournalKind, ProofEvaluation, Replay, Snapshot,
};
pub use report::{FailureReport, PriorAttempt, RawFailureContext};
