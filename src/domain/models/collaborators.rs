//! Request/response records for the external analyzer collaborators.
//!
//! These are the strict typed boundaries of the engine: loosely shaped
//! payloads from heterogeneous services are decoded into these records (or
//! rejected with `InvalidInput`) before any business logic sees them.

use serde::{Deserialize, Serialize};

use crate::domain::models::case::{Phase, RootCause};
use crate::domain::models::failure_event::CaseId;
use crate::domain::models::report::{FailureReport, PriorAttempt};

/// Idempotency key forwarded with every collaborator call so the remote
/// side can deduplicate crash-recovery re-invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub case_id: CaseId,
    pub phase: Phase,
    pub attempt: u32,
}

// --- Diagnoser -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisRequest {
    pub correlation: CorrelationKey,
    pub report: FailureReport,
    pub prior_attempts: Vec<PriorAttempt>,
}

/// Diagnoser verdict. `root_cause` is already confidence-gated by the
/// engine before it is recorded anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: RootCause,
    pub confidence: f64,
    /// Unified diff to hand to the patcher, when the diagnoser has one.
    pub patch: Option<String>,
    pub explanation: String,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_fix_minutes: Option<u32>,
}

// --- Patcher ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRequest {
    pub correlation: CorrelationKey,
    pub repository: String,
    pub head_sha: String,
    pub branch: String,
    pub patch: String,
    pub root_cause: RootCause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOutcome {
    /// Opaque handle identifying the applied change set.
    pub patch_ref: String,
    pub files_changed: Vec<String>,
}

// --- Test runner -----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub correlation: CorrelationKey,
    pub repository: String,
    pub head_sha: String,
    /// Absent when confirming reproducibility of the unpatched head.
    pub patch_ref: Option<String>,
    pub suite: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Pass,
    Fail,
    Flaky,
}

impl TestVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Flaky => "flaky",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRun {
    pub attempt: u32,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runner verdict over N repeated executions.
///
/// `flakiness_score = 1 − |2·(successes/N) − 1|`: 0 is deterministic,
/// 1 is a coin flip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub verdict: TestVerdict,
    pub flakiness_score: f64,
    #[serde(default)]
    pub retry_outcomes: Vec<RetryRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

// --- Prover ----------------------------------------------------------------

/// Severity of an invariant. Only invariants at or above the configured
/// threshold block merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A declaratively stated property over the program surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantSpec {
    pub name: String,
    pub predicate: String,
    pub criticality: Criticality,
    /// Path prefix the invariant applies to; `*` matches everything.
    pub scope: String,
}

impl InvariantSpec {
    /// Whether this invariant covers any of the changed files. An empty
    /// change set selects every invariant.
    pub fn applies_to(&self, files_changed: &[String]) -> bool {
        if self.scope == "*" || files_changed.is_empty() {
            return true;
        }
        let prefix = self
            .scope
            .trim_end_matches("/**")
            .trim_end_matches("/*")
            .trim_end_matches('/');
        files_changed.iter().any(|f| f.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofRequest {
    pub correlation: CorrelationKey,
    pub repository: String,
    pub head_sha: String,
    pub invariants: Vec<InvariantSpec>,
    pub per_theorem_budget_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TheoremVerdict {
    Proven,
    Unproven,
    Sorry,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TheoremResult {
    pub name: String,
    pub verdict: TheoremVerdict,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSummary {
    pub total: u32,
    pub proven: u32,
    pub unproven: u32,
    pub sorry: u32,
    pub error: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofReport {
    pub theorems: Vec<TheoremResult>,
    pub summary: ProofSummary,
}

// --- Merger ----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub correlation: CorrelationKey,
    pub repository: String,
    pub base_branch: String,
    /// Absent when the case reached merge without producing a patch.
    pub patch_ref: Option<String>,
    pub title: String,
    pub body: String,
    pub root_cause: RootCause,
    pub proof_passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
