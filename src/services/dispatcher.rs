//! Uniform activity invocation for the engine.
//!
//! Every collaborator call goes through [`ActivityDispatcher::call`]:
//! the attempt is journaled before the network call, the classified result
//! after it, transient errors retry with jittered exponential backoff, and
//! the correlation key `(case_id, phase, attempt)` rides along so the
//! collaborator can deduplicate crash-recovery re-invocations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::ActivityError;
use crate::domain::models::{
    ActivityOutcome, Case, CorrelationKey, JournalKind, Phase,
};
use crate::domain::ports::Journal;
use crate::services::breaker::CircuitBreakerService;
use crate::services::config::EngineConfig;
use crate::services::emitter::EventEmitter;
use crate::services::redaction::SecretRedactor;

/// Which network calls a phase invocation may make.
///
/// A fresh invocation starts at call 1 with the full per-activity budget.
/// A resumed invocation (crash recovery found a dangling attempt)
/// continues the numbering and gets exactly one more call.
#[derive(Debug, Clone, Copy)]
pub struct CallWindow {
    pub first_call: u32,
    pub max_calls: u32,
}

impl CallWindow {
    pub fn fresh(max_calls: u32) -> Self {
        Self {
            first_call: 1,
            max_calls: max_calls.max(1),
        }
    }

    pub fn resumed(calls_already_made: u32) -> Self {
        Self {
            first_call: calls_already_made + 1,
            max_calls: 1,
        }
    }
}

pub struct ActivityDispatcher {
    config: Arc<EngineConfig>,
    journal: Arc<dyn Journal>,
    emitter: EventEmitter,
    breakers: Arc<CircuitBreakerService>,
    redactor: SecretRedactor,
}

impl std::fmt::Debug for ActivityDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDispatcher").finish()
    }
}

impl ActivityDispatcher {
    pub fn new(
        config: Arc<EngineConfig>,
        journal: Arc<dyn Journal>,
        emitter: EventEmitter,
        breakers: Arc<CircuitBreakerService>,
        redactor: SecretRedactor,
    ) -> Self {
        Self {
            config,
            journal,
            emitter,
            breakers,
            redactor,
        }
    }

    /// Invoke one collaborator activity for a case.
    ///
    /// `op` is called once per network attempt with the correlation key.
    /// Returns the typed result, or the classified error after the window
    /// is exhausted. Wall-clock spent here counts against the case
    /// deadline, which the engine checks between activities.
    pub async fn call<T, F, Fut>(
        &self,
        case: &mut Case,
        phase: Phase,
        attempt: u32,
        window: CallWindow,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ActivityError>
    where
        T: Clone + Into<ActivityOutcome>,
        F: FnMut(CorrelationKey) -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let activity = self.config.activity(phase).clone();
        let timeout = Duration::from_millis(activity.timeout_ms);
        let last_call = window.first_call + window.max_calls - 1;
        let mut call_no = window.first_call;

        loop {
            if cancel.is_cancelled() {
                return Err(ActivityError::Cancelled);
            }

            if !self.breakers.allow(phase).await {
                let err = ActivityError::Transient(format!("circuit open for {phase}"));
                if call_no < last_call {
                    self.sleep_backoff(call_no - window.first_call, cancel).await?;
                    call_no += 1;
                    continue;
                }
                return Err(err);
            }

            let entry = case.next_entry(JournalKind::ActivityAttempt {
                phase,
                attempt,
                call: call_no,
            });
            self.journal
                .append(entry)
                .await
                .map_err(|e| ActivityError::Internal(e.to_string()))?;
            self.emitter
                .emit_activity_attempt(case, phase, attempt, call_no)
                .await;

            let correlation = CorrelationKey {
                case_id: case.id,
                phase,
                attempt,
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ActivityError::Cancelled),
                outcome = tokio::time::timeout(timeout, op(correlation)) => {
                    outcome.unwrap_or(Err(ActivityError::Timeout))
                }
            };

            match result {
                Ok(value) => {
                    self.breakers.record_success(phase).await;
                    let outcome: ActivityOutcome = value.clone().into();
                    self.record_result(case, phase, attempt, call_no, outcome, "ok")
                        .await?;
                    if call_no > window.first_call {
                        debug!(
                            case_id = %case.id,
                            phase = %phase,
                            calls = call_no - window.first_call + 1,
                            "Activity succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !matches!(err, ActivityError::Cancelled) {
                        self.breakers.record_failure(phase).await;
                    }
                    let message = match &err {
                        ActivityError::CompilationFailed { errors } => errors.join("\n"),
                        other => other.to_string(),
                    };
                    let outcome = ActivityOutcome::Failed {
                        kind: err.kind(),
                        message: self.redactor.scrub(&message).text,
                    };
                    self.record_result(case, phase, attempt, call_no, outcome, err.kind().as_str())
                        .await?;

                    if err.is_transient() && call_no < last_call {
                        warn!(
                            case_id = %case.id,
                            phase = %phase,
                            call = call_no,
                            error = %err,
                            "Transient activity failure, backing off"
                        );
                        self.sleep_backoff(call_no - window.first_call, cancel).await?;
                        call_no += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn record_result(
        &self,
        case: &mut Case,
        phase: Phase,
        attempt: u32,
        call: u32,
        outcome: ActivityOutcome,
        label: &str,
    ) -> Result<(), ActivityError> {
        let entry = case.next_entry(JournalKind::ActivityResult {
            phase,
            attempt,
            call,
            outcome: outcome.clone(),
        });
        self.journal
            .append(entry)
            .await
            .map_err(|e| ActivityError::Internal(e.to_string()))?;
        outcome.apply_to(case, phase, attempt);
        self.emitter
            .emit_activity_result(case, phase, attempt, call, label)
            .await;
        Ok(())
    }

    /// `min(cap, base · 2^exp · (1 ± 0.25))`, jitter from the clock's
    /// sub-second nanoseconds.
    fn backoff_delay(&self, exp: u32) -> Duration {
        let base = self.config.backoff.base_ms;
        let cap = self.config.backoff.cap_ms;
        let raw = base.saturating_mul(2u64.saturating_pow(exp)) as f64;
        let nanos = chrono::Utc::now().timestamp_subsec_nanos() as u64;
        let factor = 0.75 + ((nanos % 1000) as f64 / 1000.0) * 0.5;
        let ms = (raw * factor).min(cap as f64) as u64;
        Duration::from_millis(ms.max(1))
    }

    async fn sleep_backoff(
        &self,
        exp: u32,
        cancel: &CancellationToken,
    ) -> Result<(), ActivityError> {
        let delay = self.backoff_delay(exp);
        tokio::select! {
            _ = cancel.cancelled() => Err(ActivityError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
