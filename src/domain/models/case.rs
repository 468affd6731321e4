//! Case domain model.
//!
//! A `Case` is one self-healing attempt for a failing CI run. It moves
//! through a fixed phase graph; the two feedback edges (`Patch → Diagnose`,
//! `Test → Diagnose`) re-enter diagnosis with enriched context and are the
//! only backward transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::collaborators::{Diagnosis, MergeOutcome, TestReport, TestVerdict};
use crate::domain::models::failure_event::{CaseId, FailureEvent};
use crate::domain::models::report::PriorAttempt;

/// Phase of a case in the healing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    /// Admitted, nothing has run yet
    New,
    /// Waiting on the diagnoser
    Diagnose,
    /// Waiting on the patcher
    Patch,
    /// Waiting on the sandbox test runner
    Test,
    /// Waiting on the theorem prover
    Prove,
    /// Waiting on the merger
    Merge,
    /// Fix merged; healed
    Done,
    /// Gave up; see the fail reason
    Failed,
}

impl Default for CaseState {
    fn default() -> Self {
        Self::New
    }
}

impl CaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Diagnose => "diagnose",
            Self::Patch => "patch",
            Self::Test => "test",
            Self::Prove => "prove",
            Self::Merge => "merge",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Check if this is a terminal (absorbing) state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The collaborator phase driven while in this state, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Diagnose => Some(Phase::Diagnose),
            Self::Patch => Some(Phase::Patch),
            Self::Test => Some(Phase::Test),
            Self::Prove => Some(Phase::Prove),
            Self::Merge => Some(Phase::Merge),
            _ => None,
        }
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(&self) -> Vec<CaseState> {
        match self {
            Self::New => vec![Self::Diagnose, Self::Failed],
            Self::Diagnose => vec![Self::Patch, Self::Test, Self::Failed],
            Self::Patch => vec![Self::Test, Self::Diagnose, Self::Failed],
            Self::Test => vec![Self::Prove, Self::Diagnose, Self::Failed],
            Self::Prove => vec![Self::Merge, Self::Failed],
            Self::Merge => vec![Self::Done, Self::Failed],
            Self::Done => vec![],
            Self::Failed => vec![],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for CaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Collaborator phases, used for attempt counters and correlation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Diagnose,
    Patch,
    Test,
    Prove,
    Merge,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnose => "diagnose",
            Self::Patch => "patch",
            Self::Test => "test",
            Self::Prove => "prove",
            Self::Merge => "merge",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Categorical diagnosis of the failure; drives the patch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    DepUpgrade,
    ApiChange,
    FlakyTest,
    ConfigError,
    EnvIssue,
    PermissionError,
    Timeout,
    Unknown,
}

impl RootCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DepUpgrade => "dep_upgrade",
            Self::ApiChange => "api_change",
            Self::FlakyTest => "flaky_test",
            Self::ConfigError => "config_error",
            Self::EnvIssue => "env_issue",
            Self::PermissionError => "permission_error",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RootCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a case ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    PatchExhausted,
    TestFailed,
    ProofFailed,
    MergeBlocked,
    Timeout,
    Cancelled,
    Contract,
    Internal,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatchExhausted => "patch_exhausted",
            Self::TestFailed => "test_failed",
            Self::ProofFailed => "proof_failed",
            Self::MergeBlocked => "merge_blocked",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Contract => "contract",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-phase invocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAttempts {
    pub diagnose: u32,
    pub patch: u32,
    pub test: u32,
    pub prove: u32,
    pub merge: u32,
}

impl PhaseAttempts {
    pub fn get(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Diagnose => self.diagnose,
            Phase::Patch => self.patch,
            Phase::Test => self.test,
            Phase::Prove => self.prove,
            Phase::Merge => self.merge,
        }
    }

    /// Increment the counter for a phase and return the new attempt number.
    pub fn bump(&mut self, phase: Phase) -> u32 {
        let slot = match phase {
            Phase::Diagnose => &mut self.diagnose,
            Phase::Patch => &mut self.patch,
            Phase::Test => &mut self.test,
            Phase::Prove => &mut self.prove,
            Phase::Merge => &mut self.merge,
        };
        *slot += 1;
        *slot
    }

    /// Raise a counter to at least `attempt`. Used during journal replay.
    pub fn observe(&mut self, phase: Phase, attempt: u32) {
        let slot = match phase {
            Phase::Diagnose => &mut self.diagnose,
            Phase::Patch => &mut self.patch,
            Phase::Test => &mut self.test,
            Phase::Prove => &mut self.prove,
            Phase::Merge => &mut self.merge,
        };
        *slot = (*slot).max(attempt);
    }
}

/// Accepted test result recorded on the case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub verdict: TestVerdict,
    pub flakiness_score: f64,
    /// The run disagreed with itself; promoted to pass but recorded here.
    pub flaky: bool,
    pub trace: Option<String>,
}

impl From<&TestReport> for TestOutcome {
    fn from(report: &TestReport) -> Self {
        Self {
            verdict: report.verdict,
            flakiness_score: report.flakiness_score,
            flaky: report.verdict == TestVerdict::Flaky,
            trace: report.trace.clone(),
        }
    }
}

/// Aggregate proof verdict over the required invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOutcome {
    pub passed: bool,
    pub failed_invariants: Vec<String>,
}

/// One self-healing attempt, owned exclusively by a single worker.
///
/// The journal is authoritative; this struct is the projection the worker
/// mutates between appends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub repository: String,
    pub run_id: u64,
    pub head_sha: String,
    pub branch: String,
    pub workflow: String,
    pub state: CaseState,
    pub root_cause: Option<RootCause>,
    pub fail_reason: Option<FailReason>,
    pub attempts: PhaseAttempts,
    pub diagnosis: Option<Diagnosis>,
    pub patch_ref: Option<String>,
    pub files_changed: Vec<String>,
    pub test_outcome: Option<TestOutcome>,
    pub proof_outcome: Option<ProofOutcome>,
    pub merge_outcome: Option<MergeOutcome>,
    /// Context carried into re-diagnosis by the feedback edges.
    pub prior_attempts: Vec<PriorAttempt>,
    pub started_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Next journal sequence number for this case.
    pub seq: u64,
}

impl Case {
    /// Build a fresh case from an admitted event.
    pub fn admit(event: &FailureEvent, now: DateTime<Utc>, deadline: DateTime<Utc>) -> Self {
        Self {
            id: event.case_id(),
            repository: event.repository.clone(),
            run_id: event.run_id,
            head_sha: event.head_sha.clone(),
            branch: event.branch.clone(),
            workflow: event.workflow.clone(),
            state: CaseState::New,
            root_cause: None,
            fail_reason: None,
            attempts: PhaseAttempts::default(),
            diagnosis: None,
            patch_ref: None,
            files_changed: Vec::new(),
            test_outcome: None,
            proof_outcome: None,
            merge_outcome: None,
            prior_attempts: Vec::new(),
            started_at: now,
            last_transition_at: now,
            deadline,
            seq: 0,
        }
    }

    pub fn can_transition_to(&self, next: CaseState) -> bool {
        self.state.can_transition_to(next)
    }

    /// Apply a validated transition to the projection.
    ///
    /// Callers must have appended the matching journal entry first; `at` is
    /// the entry timestamp so that live and replayed projections agree.
    pub fn apply_transition(
        &mut self,
        next: CaseState,
        reason: Option<FailReason>,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        if !self.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_transition_at = at;
        if next == CaseState::Failed {
            self.fail_reason = reason;
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the case-level deadline has elapsed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Record feedback context for the next diagnosis round.
    pub fn note_prior_attempt(&mut self, phase: Phase, attempt: u32, error: impl Into<String>) {
        self.prior_attempts.push(PriorAttempt {
            phase,
            attempt,
            error: error.into(),
            duration_ms: 0,
        });
    }
}
