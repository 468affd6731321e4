//! Shared test harness: scripted collaborators and engine fixtures.
//!
//! Each fake collaborator pops pre-loaded responses in order and records
//! every request it receives, so tests can assert both the flow a case
//! took and the payloads the engine sent. All fakes tolerate duplicate
//! calls, matching the idempotence the engine assumes of real ones.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use mender::adapters::memory::{InMemoryEventSink, InMemoryJournal};
use mender::domain::errors::ActivityError;
use mender::domain::models::{
    Case, Diagnosis, DiagnosisRequest, FailureEvent, MergeOutcome, MergeRequest, PatchOutcome,
    PatchRequest, ProofReport, ProofRequest, ProofSummary, RawFailureContext, RetryRun, RootCause,
    TestReport, TestRequest, TestVerdict, TheoremResult, TheoremVerdict,
};
use mender::domain::ports::{
    Diagnoser, FailureContextSource, Journal, Merger, Patcher, Prover, TestRunner,
};
use mender::services::{CaseEngine, Collaborators, EngineConfig};

/// A collaborator that replays a script of responses and records requests.
pub struct Scripted<Req, Res> {
    responses: Mutex<VecDeque<Result<Res, ActivityError>>>,
    requests: Mutex<Vec<Req>>,
}

impl<Req, Res> Scripted<Req, Res> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub async fn enqueue(&self, response: Result<Res, ActivityError>) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn enqueue_ok(&self, response: Res) {
        self.enqueue(Ok(response)).await;
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    async fn next(&self, request: Req) -> Result<Res, ActivityError> {
        self.requests.lock().await.push(request);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(ActivityError::Internal("script exhausted".to_string())))
    }
}

impl<Req, Res: Clone> Scripted<Req, Res> {
    /// Load the same response n times.
    pub async fn enqueue_repeat(&self, response: Result<Res, ActivityError>, n: usize) {
        for _ in 0..n {
            self.enqueue(response.clone()).await;
        }
    }
}

impl<Req: Clone, Res> Scripted<Req, Res> {
    pub async fn requests(&self) -> Vec<Req> {
        self.requests.lock().await.clone()
    }
}

pub type ScriptedDiagnoser = Scripted<DiagnosisRequest, Diagnosis>;
pub type ScriptedPatcher = Scripted<PatchRequest, PatchOutcome>;
pub type ScriptedTestRunner = Scripted<TestRequest, TestReport>;
pub type ScriptedProver = Scripted<ProofRequest, ProofReport>;
pub type ScriptedMerger = Scripted<MergeRequest, MergeOutcome>;

#[async_trait]
impl Diagnoser for ScriptedDiagnoser {
    async fn diagnose(&self, request: DiagnosisRequest) -> Result<Diagnosis, ActivityError> {
        self.next(request).await
    }
}

#[async_trait]
impl Patcher for ScriptedPatcher {
    async fn apply(&self, request: PatchRequest) -> Result<PatchOutcome, ActivityError> {
        self.next(request).await
    }
}

#[async_trait]
impl TestRunner for ScriptedTestRunner {
    async fn run(&self, request: TestRequest) -> Result<TestReport, ActivityError> {
        self.next(request).await
    }
}

#[async_trait]
impl Prover for ScriptedProver {
    async fn prove(&self, request: ProofRequest) -> Result<ProofReport, ActivityError> {
        self.next(request).await
    }
}

#[async_trait]
impl Merger for ScriptedMerger {
    async fn merge(&self, request: MergeRequest) -> Result<MergeOutcome, ActivityError> {
        self.next(request).await
    }
}

/// Context source serving a fixed raw payload.
pub struct StaticContext {
    pub raw: RawFailureContext,
}

impl StaticContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            raw: RawFailureContext {
                failure_message: "job `build` failed: exit code 1".to_string(),
                error_logs: "error[E0308]: mismatched types".to_string(),
                test_logs: "test result: FAILED. 1 failed".to_string(),
                diff: "--- a/src/lib.rs\n+++ b/src/lib.rs".to_string(),
                changed_files: vec!["src/lib.rs".to_string()],
                failed_tests: vec!["tests::parses_config".to_string()],
                environment: Default::default(),
            },
        })
    }
}

#[async_trait]
impl FailureContextSource for StaticContext {
    async fn fetch(
        &self,
        _repository: &str,
        _run_id: u64,
        _head_sha: &str,
    ) -> Result<RawFailureContext, ActivityError> {
        Ok(self.raw.clone())
    }
}

/// Engine plus every fake it talks to.
pub struct Harness {
    pub config: Arc<EngineConfig>,
    pub journal: Arc<InMemoryJournal>,
    pub sink: Arc<InMemoryEventSink>,
    pub diagnoser: Arc<ScriptedDiagnoser>,
    pub patcher: Arc<ScriptedPatcher>,
    pub test_runner: Arc<ScriptedTestRunner>,
    pub prover: Arc<ScriptedProver>,
    pub merger: Arc<ScriptedMerger>,
    pub engine: Arc<CaseEngine>,
}

/// Opt-in log output for debugging test runs (`RUST_LOG=debug`).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        init_tracing();
        let config = Arc::new(config);
        let journal = Arc::new(InMemoryJournal::new());
        let sink = Arc::new(InMemoryEventSink::new());
        let diagnoser = ScriptedDiagnoser::new();
        let patcher = ScriptedPatcher::new();
        let test_runner = ScriptedTestRunner::new();
        let prover = ScriptedProver::new();
        let merger = ScriptedMerger::new();

        let collaborators = Collaborators {
            diagnoser: diagnoser.clone(),
            patcher: patcher.clone(),
            test_runner: test_runner.clone(),
            prover: prover.clone(),
            merger: merger.clone(),
            context: StaticContext::new(),
        };
        let engine = Arc::new(
            CaseEngine::new(config.clone(), journal.clone(), sink.clone(), collaborators)
                .expect("engine construction"),
        );

        Self {
            config,
            journal,
            sink,
            diagnoser,
            patcher,
            test_runner,
            prover,
            merger,
            engine,
        }
    }

    /// Admit a case the way the admitter would, without a queue.
    pub async fn admit_case(&self, event: &FailureEvent) -> Case {
        let now = Utc::now();
        let mut case = Case::admit(event, now, now + self.config.global_deadline());
        self.journal
            .append(case.admission_entry(event))
            .await
            .expect("admission entry");
        case
    }
}

// --- Payload builders -------------------------------------------------------

pub fn event(run_id: u64) -> FailureEvent {
    FailureEvent {
        repository: "acme/app".to_string(),
        run_id,
        head_sha: "abc123".to_string(),
        branch: "main".to_string(),
        workflow: "ci".to_string(),
        actor: "octocat".to_string(),
        installation_id: 7,
        received_at: Utc::now(),
    }
}

pub fn diagnosis(root_cause: RootCause, confidence: f64, patch: Option<&str>) -> Diagnosis {
    Diagnosis {
        root_cause,
        confidence,
        patch: patch.map(str::to_string),
        explanation: format!("classified as {root_cause}"),
        suggested_actions: vec![],
        estimated_fix_minutes: None,
    }
}

pub fn patched(patch_ref: &str, files: &[&str]) -> PatchOutcome {
    PatchOutcome {
        patch_ref: patch_ref.to_string(),
        files_changed: files.iter().map(|f| f.to_string()).collect(),
    }
}

pub fn test_pass() -> TestReport {
    TestReport {
        verdict: TestVerdict::Pass,
        flakiness_score: 0.0,
        retry_outcomes: runs(&[true, true, true]),
        trace: None,
    }
}

pub fn test_fail(trace: &str) -> TestReport {
    TestReport {
        verdict: TestVerdict::Fail,
        flakiness_score: 0.0,
        retry_outcomes: runs(&[false, false, false]),
        trace: Some(trace.to_string()),
    }
}

pub fn test_flaky(score: f64) -> TestReport {
    TestReport {
        verdict: TestVerdict::Flaky,
        flakiness_score: score,
        retry_outcomes: runs(&[true, false, true]),
        trace: None,
    }
}

fn runs(outcomes: &[bool]) -> Vec<RetryRun> {
    outcomes
        .iter()
        .enumerate()
        .map(|(i, success)| RetryRun {
            attempt: i as u32 + 1,
            success: *success,
            duration_ms: 1200,
            error: (!success).then(|| "assertion failed".to_string()),
        })
        .collect()
}

pub fn proof_report(verdicts: &[(&str, TheoremVerdict)]) -> ProofReport {
    let theorems: Vec<TheoremResult> = verdicts
        .iter()
        .map(|(name, verdict)| TheoremResult {
            name: name.to_string(),
            verdict: *verdict,
            duration_ms: 150,
            error: None,
        })
        .collect();
    let count = |v: TheoremVerdict| theorems.iter().filter(|t| t.verdict == v).count() as u32;
    let summary = ProofSummary {
        total: theorems.len() as u32,
        proven: count(TheoremVerdict::Proven),
        unproven: count(TheoremVerdict::Unproven),
        sorry: count(TheoremVerdict::Sorry),
        error: count(TheoremVerdict::Error),
    };
    ProofReport { theorems, summary }
}

pub fn merged(pr_number: u64) -> MergeOutcome {
    MergeOutcome {
        merged: true,
        merge_sha: Some("fedcba9".to_string()),
        pr_number: Some(pr_number),
        reason: None,
    }
}

pub fn merge_blocked(reason: &str) -> MergeOutcome {
    MergeOutcome {
        merged: false,
        merge_sha: None,
        pr_number: None,
        reason: Some(reason.to_string()),
    }
}

// --- Journal scripting ------------------------------------------------------
//
// Helpers that write journal entries the way the live engine would, for
// building crash scenarios that recovery then has to finish.

pub async fn script_transition(
    journal: &InMemoryJournal,
    case: &mut Case,
    to: mender::domain::models::CaseState,
) {
    use mender::domain::models::JournalKind;
    use mender::domain::ports::Journal;

    let at = Utc::now();
    let entry = case.next_entry_at(
        at,
        JournalKind::StateTransition {
            from: Some(case.state),
            to,
            reason: None,
            event: None,
            deadline: None,
        },
    );
    journal.append(entry).await.expect("scripted transition");
    case.apply_transition(to, None, at).expect("valid transition");
}

pub async fn script_activity(
    journal: &InMemoryJournal,
    case: &mut Case,
    phase: mender::domain::models::Phase,
    outcome: mender::domain::models::ActivityOutcome,
) {
    use mender::domain::models::JournalKind;
    use mender::domain::ports::Journal;

    let attempt = case.attempts.bump(phase);
    journal
        .append(case.next_entry(JournalKind::ActivityAttempt {
            phase,
            attempt,
            call: 1,
        }))
        .await
        .expect("scripted attempt");
    journal
        .append(case.next_entry(JournalKind::ActivityResult {
            phase,
            attempt,
            call: 1,
            outcome: outcome.clone(),
        }))
        .await
        .expect("scripted result");
    outcome.apply_to(case, phase, attempt);
}

/// Journal an attempt with no result: the crash point recovery must handle.
pub async fn script_dangling_attempt(
    journal: &InMemoryJournal,
    case: &mut Case,
    phase: mender::domain::models::Phase,
) {
    use mender::domain::models::JournalKind;
    use mender::domain::ports::Journal;

    let attempt = case.attempts.bump(phase);
    journal
        .append(case.next_entry(JournalKind::ActivityAttempt {
            phase,
            attempt,
            call: 1,
        }))
        .await
        .expect("scripted dangling attempt");
}

/// Config with one critical invariant so the prover actually runs.
pub fn config_with_invariant() -> EngineConfig {
    use mender::domain::models::{Criticality, InvariantSpec};
    let mut config = EngineConfig::default();
    config.proof.invariants = vec![InvariantSpec {
        name: "no_data_loss".to_string(),
        predicate: "forall w, durable(w)".to_string(),
        criticality: Criticality::High,
        scope: "*".to_string(),
    }];
    config
}
