//! Lifecycle event emission.
//!
//! One typed event per state transition and per activity attempt/result.
//! Emission is fire-and-forget: a failing sink is logged and ignored so
//! observability can never stall a case.

use std::sync::Arc;

use serde_json::json;

use crate::domain::models::{
    Case, CaseEvent, CaseState, EventType, FailureEvent, Phase,
};
use crate::domain::ports::EventSink;

#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish()
    }
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    async fn publish(&self, event: CaseEvent) {
        if let Err(e) = self.sink.publish(event).await {
            tracing::warn!(error = %e, "Failed to publish lifecycle event");
        }
    }

    /// Announce entry into the case's current state.
    pub async fn emit_state(&self, case: &Case) {
        let mut data = json!({});
        if let Some(root_cause) = case.root_cause {
            data["root_cause"] = json!(root_cause.as_str());
        }
        if case.state == CaseState::Failed {
            if let Some(reason) = case.fail_reason {
                data["reason"] = json!(reason.as_str());
            }
        }
        if let Some(outcome) = &case.test_outcome {
            if outcome.flaky {
                data["flaky"] = json!(true);
            }
        }
        self.publish(
            CaseEvent::for_case(EventType::for_state(case.state), case).with_data(data),
        )
        .await;
    }

    pub async fn emit_activity_attempt(&self, case: &Case, phase: Phase, attempt: u32, call: u32) {
        self.publish(
            CaseEvent::for_case(EventType::ActivityAttempt, case)
                .with_attempt(attempt)
                .with_data(json!({ "phase": phase.as_str(), "call": call })),
        )
        .await;
    }

    pub async fn emit_activity_result(
        &self,
        case: &Case,
        phase: Phase,
        attempt: u32,
        call: u32,
        outcome: &str,
    ) {
        self.publish(
            CaseEvent::for_case(EventType::ActivityResult, case)
                .with_attempt(attempt)
                .with_data(json!({
                    "phase": phase.as_str(),
                    "call": call,
                    "outcome": outcome,
                })),
        )
        .await;
    }

    /// A duplicate event arrived inside the dedup TTL window.
    pub async fn emit_dedup_hit(&self, event: &FailureEvent) {
        self.publish(CaseEvent {
            event_type: EventType::DedupHit,
            case_id: event.case_id(),
            repository: event.repository.clone(),
            run_id: event.run_id,
            head_sha: event.head_sha.clone(),
            state: None,
            attempt: None,
            timestamp: chrono::Utc::now(),
            data: json!({ "workflow": event.workflow }),
        })
        .await;
    }
}
