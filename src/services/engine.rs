//! Deterministic case state machine.
//!
//! The `CaseEngine` drives a case through
//! `new → diagnose → patch → test → prove → merge → done`, applying the
//! retry and compensation policy. It is purely mechanical; the analyzers
//! behind the ports do the actual diagnosing, patching, testing, and
//! proving. Every transition is appended to the journal before the
//! in-memory projection advances, so a crashed worker can be resumed by
//! replaying the journal.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::errors::{ActivityError, EngineError, EngineResult};
use crate::domain::models::{
    Case, CaseId, CaseState, Dangling, DiagnosisRequest, EventType, FailReason, JournalEntry,
    JournalKind, MergeRequest, PatchRequest, Phase, ProofEvaluation, ProofOutcome, ProofRequest,
    Replay, RootCause, Snapshot, TestRequest, TestVerdict, TheoremVerdict,
};
use crate::domain::ports::{
    Diagnoser, EventSink, FailureContextSource, Journal, Merger, Patcher, Prover, TestRunner,
};
use crate::services::breaker::CircuitBreakerService;
use crate::services::config::EngineConfig;
use crate::services::dispatcher::{ActivityDispatcher, CallWindow};
use crate::services::emitter::EventEmitter;
use crate::services::redaction::SecretRedactor;
use crate::services::report::ReportAssembler;

/// The five collaborator endpoints plus the forge context source.
#[derive(Clone)]
pub struct Collaborators {
    pub diagnoser: Arc<dyn Diagnoser>,
    pub patcher: Arc<dyn Patcher>,
    pub test_runner: Arc<dyn TestRunner>,
    pub prover: Arc<dyn Prover>,
    pub merger: Arc<dyn Merger>,
    pub context: Arc<dyn FailureContextSource>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish()
    }
}

/// Phase invocation bookkeeping: a fresh invocation bumps the phase
/// counter and gets the full network budget; a resumed one (dangling
/// attempt found in the journal) keeps its counter and gets exactly one
/// more call.
fn invocation(
    case: &mut Case,
    phase: Phase,
    resume: Option<Dangling>,
    max_calls: u32,
) -> (u32, CallWindow) {
    match resume {
        Some(d) if d.phase == phase => (d.attempt, CallWindow::resumed(d.calls)),
        _ => (case.attempts.bump(phase), CallWindow::fresh(max_calls)),
    }
}

pub struct CaseEngine {
    config: Arc<EngineConfig>,
    journal: Arc<dyn Journal>,
    emitter: EventEmitter,
    dispatcher: ActivityDispatcher,
    collaborators: Collaborators,
    assembler: ReportAssembler,
}

impl std::fmt::Debug for CaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseEngine").finish()
    }
}

impl CaseEngine {
    pub fn new(
        config: Arc<EngineConfig>,
        journal: Arc<dyn Journal>,
        sink: Arc<dyn EventSink>,
        collaborators: Collaborators,
    ) -> EngineResult<Self> {
        let redactor = SecretRedactor::new(&config.redaction)
            .map_err(|e| EngineError::Internal(format!("invalid redaction pattern: {e}")))?;
        let emitter = EventEmitter::new(sink);
        let breakers = Arc::new(CircuitBreakerService::new(config.breaker.clone()));
        let dispatcher = ActivityDispatcher::new(
            config.clone(),
            journal.clone(),
            emitter.clone(),
            breakers,
            redactor.clone(),
        );
        let assembler = ReportAssembler::new(redactor, &config.diagnosis);
        Ok(Self {
            config,
            journal,
            emitter,
            dispatcher,
            collaborators,
            assembler,
        })
    }

    /// Drive a case until it reaches a terminal state.
    pub async fn drive(
        &self,
        case: &mut Case,
        cancel: &CancellationToken,
    ) -> EngineResult<CaseState> {
        self.drive_with(case, None, cancel).await
    }

    /// Rebuild a case from its journal and continue driving it.
    ///
    /// A dangling activity attempt (crash between attempt and result) is
    /// re-invoked at most once more; the collaborator deduplicates via the
    /// correlation key.
    pub async fn resume(
        &self,
        case_id: CaseId,
        cancel: &CancellationToken,
    ) -> EngineResult<Case> {
        let entries = self.journal.read_all(case_id).await?;
        let replay = match self.journal.latest_snapshot(case_id).await? {
            Some(snapshot) => {
                let tail: Vec<JournalEntry> = entries
                    .into_iter()
                    .filter(|e| e.seq >= snapshot.seq)
                    .collect();
                Replay::from_snapshot(snapshot, &tail)?
            }
            None => {
                if entries.is_empty() {
                    return Err(EngineError::CaseNotFound(case_id));
                }
                Replay::from_entries(&entries)?
            }
        };

        let mut case = replay.case;
        if case.is_terminal() {
            return Ok(case);
        }
        info!(
            case_id = %case.id,
            state = %case.state,
            dangling = replay.dangling.is_some(),
            "Resuming case from journal"
        );
        self.drive_with(&mut case, replay.dangling, cancel).await?;
        Ok(case)
    }

    /// Last-resort path for unexpected engine errors: journal the error,
    /// force the case to `failed(internal)`, and seal it. Best-effort.
    pub async fn quarantine(&self, case: &mut Case, message: &str) {
        let entry = case.next_entry(JournalKind::Error {
            message: message.to_string(),
        });
        if let Err(e) = self.journal.append(entry).await {
            error!(case_id = %case.id, error = %e, "Failed to journal engine error");
            return;
        }
        if case.is_terminal() {
            return;
        }
        if let Err(e) = self.fail(case, FailReason::Internal).await {
            error!(case_id = %case.id, error = %e, "Failed to fail case after engine error");
            return;
        }
        if let Err(e) = self.seal(case).await {
            error!(case_id = %case.id, error = %e, "Failed to seal quarantined case");
        }
    }

    async fn drive_with(
        &self,
        case: &mut Case,
        mut dangling: Option<Dangling>,
        cancel: &CancellationToken,
    ) -> EngineResult<CaseState> {
        loop {
            if case.is_terminal() {
                self.seal(case).await?;
                return Ok(case.state);
            }
            if cancel.is_cancelled() {
                self.fail(case, FailReason::Cancelled).await?;
                continue;
            }
            if case.is_overdue(Utc::now()) {
                warn!(case_id = %case.id, state = %case.state, "Case deadline elapsed");
                self.fail(case, FailReason::Timeout).await?;
                continue;
            }

            let resume = match (case.state.phase(), dangling) {
                (Some(phase), Some(d)) if d.phase == phase => {
                    dangling = None;
                    Some(d)
                }
                _ => None,
            };

            match case.state {
                CaseState::New => {
                    self.emitter.emit_state(case).await;
                    self.transition(case, CaseState::Diagnose, None).await?;
                }
                CaseState::Diagnose => self.step_diagnose(case, resume, cancel).await?,
                CaseState::Patch => self.step_patch(case, resume, cancel).await?,
                CaseState::Test => self.step_test(case, resume, cancel).await?,
                CaseState::Prove => self.step_prove(case, resume, cancel).await?,
                CaseState::Merge => self.step_merge(case, resume, cancel).await?,
                CaseState::Done | CaseState::Failed => {}
            }
        }
    }

    // ========================================================================
    // Per-state steps
    // ========================================================================

    async fn step_diagnose(
        &self,
        case: &mut Case,
        resume: Option<Dangling>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let raw = match self
            .collaborators
            .context
            .fetch(&case.repository, case.run_id, &case.head_sha)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(case_id = %case.id, error = %err, "Failed to fetch failure context");
                return self.fail_for_activity(case, err).await;
            }
        };
        let report = self.assembler.assemble(case, raw);
        let prior_attempts = report.previous_attempts.clone();

        let max_calls = self.config.activity(Phase::Diagnose).max_attempts;
        let (attempt, window) = invocation(case, Phase::Diagnose, resume, max_calls);

        let diagnoser = self.collaborators.diagnoser.clone();
        let min_confidence = self.config.diagnosis.min_confidence;
        let result = self
            .dispatcher
            .call(case, Phase::Diagnose, attempt, window, cancel, move |correlation| {
                let diagnoser = diagnoser.clone();
                let request = DiagnosisRequest {
                    correlation,
                    report: report.clone(),
                    prior_attempts: prior_attempts.clone(),
                };
                async move {
                    let mut diagnosis = diagnoser.diagnose(request).await?;
                    // Tie-break at the threshold: >= is accepted.
                    if diagnosis.confidence < min_confidence {
                        diagnosis.root_cause = RootCause::Unknown;
                    }
                    Ok(diagnosis)
                }
            })
            .await;

        match result {
            Ok(diagnosis) => {
                if diagnosis.root_cause == RootCause::Unknown && diagnosis.patch.is_none() {
                    // Nothing to apply; confirm the failure reproduces.
                    self.transition(case, CaseState::Test, None).await
                } else {
                    self.transition(case, CaseState::Patch, None).await
                }
            }
            Err(err) => self.fail_for_activity(case, err).await,
        }
    }

    async fn step_patch(
        &self,
        case: &mut Case,
        resume: Option<Dangling>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let Some(patch) = case.diagnosis.as_ref().and_then(|d| d.patch.clone()) else {
            return self.transition(case, CaseState::Test, None).await;
        };
        let root_cause = case.root_cause.unwrap_or(RootCause::Unknown);

        let max_calls = self.config.activity(Phase::Patch).max_attempts;
        let (attempt, window) = invocation(case, Phase::Patch, resume, max_calls);

        let patcher = self.collaborators.patcher.clone();
        let repository = case.repository.clone();
        let head_sha = case.head_sha.clone();
        let branch = case.branch.clone();
        let result = self
            .dispatcher
            .call(case, Phase::Patch, attempt, window, cancel, move |correlation| {
                let patcher = patcher.clone();
                let request = PatchRequest {
                    correlation,
                    repository: repository.clone(),
                    head_sha: head_sha.clone(),
                    branch: branch.clone(),
                    patch: patch.clone(),
                    root_cause,
                };
                async move { patcher.apply(request).await }
            })
            .await;

        match result {
            Ok(_) => self.transition(case, CaseState::Test, None).await,
            Err(ActivityError::CompilationFailed { .. }) => {
                // Feedback edge, not a retry: the next diagnosis sees the
                // compiler output in its prior attempts.
                if attempt <= self.config.retries.patch {
                    info!(
                        case_id = %case.id,
                        attempt,
                        "Patch did not compile, re-entering diagnosis"
                    );
                    self.transition(case, CaseState::Diagnose, None).await
                } else {
                    self.fail(case, FailReason::PatchExhausted).await
                }
            }
            Err(err) => self.fail_for_activity(case, err).await,
        }
    }

    async fn step_test(
        &self,
        case: &mut Case,
        resume: Option<Dangling>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let max_calls = self.config.activity(Phase::Test).max_attempts;
        let (attempt, window) = invocation(case, Phase::Test, resume, max_calls);

        let runner = self.collaborators.test_runner.clone();
        let repository = case.repository.clone();
        let head_sha = case.head_sha.clone();
        let patch_ref = case.patch_ref.clone();
        let suite = self.config.test.suite.clone();
        let timeout_ms = self.config.test.timeout_ms;
        let flaky_threshold = self.config.test.flaky_threshold;
        let result = self
            .dispatcher
            .call(case, Phase::Test, attempt, window, cancel, move |correlation| {
                let runner = runner.clone();
                let request = TestRequest {
                    correlation,
                    repository: repository.clone(),
                    head_sha: head_sha.clone(),
                    patch_ref: patch_ref.clone(),
                    suite: suite.clone(),
                    seed: None,
                    timeout_ms,
                };
                async move {
                    let mut report = runner.run(request).await?;
                    if report.verdict == TestVerdict::Pass
                        && report.flakiness_score > flaky_threshold
                    {
                        report.verdict = TestVerdict::Flaky;
                    }
                    Ok(report)
                }
            })
            .await;

        match result {
            Ok(report) => match report.verdict {
                // Flaky is promoted to pass; the flakiness stays on the case.
                TestVerdict::Pass | TestVerdict::Flaky => {
                    self.transition(case, CaseState::Prove, None).await
                }
                TestVerdict::Fail => {
                    if attempt <= self.config.retries.test {
                        info!(
                            case_id = %case.id,
                            attempt,
                            "Tests still failing, re-entering diagnosis"
                        );
                        self.transition(case, CaseState::Diagnose, None).await
                    } else {
                        self.fail(case, FailReason::TestFailed).await
                    }
                }
            },
            Err(err) => self.fail_for_activity(case, err).await,
        }
    }

    async fn step_prove(
        &self,
        case: &mut Case,
        resume: Option<Dangling>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let selected: Vec<_> = self
            .config
            .proof
            .select(&case.files_changed)
            .into_iter()
            .cloned()
            .collect();
        if selected.is_empty() {
            // No declared invariants cover the changed surface.
            return self.transition(case, CaseState::Merge, None).await;
        }
        let required: Vec<String> = self
            .config
            .proof
            .required(&case.files_changed)
            .iter()
            .map(|inv| inv.name.clone())
            .collect();

        let max_calls = self.config.activity(Phase::Prove).max_attempts;
        let (attempt, window) = invocation(case, Phase::Prove, resume, max_calls);

        let prover = self.collaborators.prover.clone();
        let repository = case.repository.clone();
        let head_sha = case.head_sha.clone();
        let budget = self.config.proof.per_theorem_budget_ms;
        let result = self
            .dispatcher
            .call(case, Phase::Prove, attempt, window, cancel, move |correlation| {
                let prover = prover.clone();
                let required = required.clone();
                let request = ProofRequest {
                    correlation,
                    repository: repository.clone(),
                    head_sha: head_sha.clone(),
                    invariants: selected.clone(),
                    per_theorem_budget_ms: budget,
                };
                async move {
                    let report = prover.prove(request).await?;
                    // Pass iff every required invariant proves within its
                    // per-theorem budget. Verdicts on invariants below the
                    // criticality threshold never block.
                    let mut failed = Vec::new();
                    for name in &required {
                        let proven = report.theorems.iter().any(|t| {
                            t.name == *name
                                && t.verdict == TheoremVerdict::Proven
                                && t.duration_ms <= budget
                        });
                        if !proven {
                            failed.push(name.clone());
                        }
                    }
                    Ok(ProofEvaluation {
                        report,
                        outcome: ProofOutcome {
                            passed: failed.is_empty(),
                            failed_invariants: failed,
                        },
                    })
                }
            })
            .await;

        match result {
            Ok(evaluation) if evaluation.outcome.passed => {
                self.transition(case, CaseState::Merge, None).await
            }
            Ok(_) => self.fail(case, FailReason::ProofFailed).await,
            Err(err) => self.fail_for_activity(case, err).await,
        }
    }

    async fn step_merge(
        &self,
        case: &mut Case,
        resume: Option<Dangling>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let max_calls = self.config.activity(Phase::Merge).max_attempts;
        let (attempt, window) = invocation(case, Phase::Merge, resume, max_calls);

        let root_cause = case.root_cause.unwrap_or(RootCause::Unknown);
        let explanation = case
            .diagnosis
            .as_ref()
            .map(|d| d.explanation.clone())
            .unwrap_or_default();

        let merger = self.collaborators.merger.clone();
        let repository = case.repository.clone();
        let base_branch = case.branch.clone();
        let patch_ref = case.patch_ref.clone();
        let title = format!("fix({}): self-heal CI run {}", root_cause, case.run_id);
        let body = format!(
            "Automated fix for failing CI run {run} on `{branch}` ({head}).\n\n{explanation}",
            run = case.run_id,
            branch = case.branch,
            head = case.head_sha,
            explanation = explanation,
        );
        let proof_passed = case.proof_outcome.as_ref().map(|o| o.passed).unwrap_or(true);
        let result = self
            .dispatcher
            .call(case, Phase::Merge, attempt, window, cancel, move |correlation| {
                let merger = merger.clone();
                let request = MergeRequest {
                    correlation,
                    repository: repository.clone(),
                    base_branch: base_branch.clone(),
                    patch_ref: patch_ref.clone(),
                    title: title.clone(),
                    body: body.clone(),
                    root_cause,
                    proof_passed,
                };
                async move { merger.merge(request).await }
            })
            .await;

        match result {
            Ok(outcome) if outcome.merged => self.transition(case, CaseState::Done, None).await,
            Ok(outcome) => {
                warn!(
                    case_id = %case.id,
                    reason = outcome.reason.as_deref().unwrap_or("unspecified"),
                    "Merge blocked"
                );
                self.fail(case, FailReason::MergeBlocked).await
            }
            Err(err) => self.fail_for_activity(case, err).await,
        }
    }

    // ========================================================================
    // Transition plumbing
    // ========================================================================

    /// Journal the transition, then advance the projection, then emit.
    async fn transition(
        &self,
        case: &mut Case,
        to: CaseState,
        reason: Option<FailReason>,
    ) -> EngineResult<()> {
        if !case.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: case.state,
                to,
            });
        }
        let at = Utc::now();
        let entry = case.next_entry_at(
            at,
            JournalKind::StateTransition {
                from: Some(case.state),
                to,
                reason,
                event: None,
                deadline: None,
            },
        );
        self.journal.append(entry).await?;
        case.apply_transition(to, reason, at)?;
        self.emitter.emit_state(case).await;
        info!(case_id = %case.id, state = %case.state, "Case transitioned");
        Ok(())
    }

    async fn fail(&self, case: &mut Case, reason: FailReason) -> EngineResult<()> {
        self.transition(case, CaseState::Failed, Some(reason)).await
    }

    async fn fail_for_activity(&self, case: &mut Case, err: ActivityError) -> EngineResult<()> {
        let reason = match err {
            ActivityError::Cancelled => FailReason::Cancelled,
            ActivityError::InvalidInput(_) | ActivityError::PatchInvalid(_) => FailReason::Contract,
            _ => FailReason::Internal,
        };
        self.fail(case, reason).await
    }

    /// Flush the terminal event into the journal and checkpoint the
    /// projection.
    async fn seal(&self, case: &mut Case) -> EngineResult<()> {
        let entry = case.next_entry(JournalKind::Emitted {
            event_type: EventType::for_state(case.state),
        });
        self.journal.append(entry).await?;
        self.journal
            .snapshot(Snapshot {
                case_id: case.id,
                seq: case.seq,
                taken_at: Utc::now(),
                case: case.clone(),
            })
            .await?;
        info!(case_id = %case.id, state = %case.state, "Case sealed");
        Ok(())
    }
}
