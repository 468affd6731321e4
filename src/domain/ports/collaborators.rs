//! Ports for the four analyzers and the merger.
//!
//! Each is an opaque RPC endpoint. Implementations classify their own
//! transport failures into [`ActivityError`] kinds; the engine only ever
//! sees the classified form. Every request carries a correlation key so
//! the remote side can deduplicate crash-recovery re-invocations.

use async_trait::async_trait;

use crate::domain::errors::ActivityError;
use crate::domain::models::{
    Diagnosis, DiagnosisRequest, MergeOutcome, MergeRequest, PatchOutcome, PatchRequest,
    ProofReport, ProofRequest, TestReport, TestRequest,
};

/// LLM-backed failure diagnoser.
#[async_trait]
pub trait Diagnoser: Send + Sync {
    async fn diagnose(&self, request: DiagnosisRequest) -> Result<Diagnosis, ActivityError>;
}

/// Applies a unified diff and compiles the result.
///
/// A diff that applies but does not compile is
/// [`ActivityError::CompilationFailed`]; one that does not apply at all is
/// [`ActivityError::PatchInvalid`].
#[async_trait]
pub trait Patcher: Send + Sync {
    async fn apply(&self, request: PatchRequest) -> Result<PatchOutcome, ActivityError>;
}

/// Deterministic sandbox test runner. Repeats the suite N times and
/// reports a verdict plus flakiness score.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, request: TestRequest) -> Result<TestReport, ActivityError>;
}

/// Theorem prover for the critical invariants of the changed surface.
#[async_trait]
pub trait Prover: Send + Sync {
    async fn prove(&self, request: ProofRequest) -> Result<ProofReport, ActivityError>;
}

/// Opens and merges the patch-branch pull request on the source forge.
#[async_trait]
pub trait Merger: Send + Sync {
    async fn merge(&self, request: MergeRequest) -> Result<MergeOutcome, ActivityError>;
}
