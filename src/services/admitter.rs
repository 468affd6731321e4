//! Admission of failure events into the engine.
//!
//! Validates the event, enforces the staleness cutoff, consults the
//! deduplication index, writes the first journal entry, and enqueues the
//! case for the worker pool. Re-submission of an identical event within
//! the dedup TTL is a no-op apart from a `dedup.hit` event.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{Case, CaseId, FailureEvent};
use crate::domain::ports::{Admission, DedupIndex, EventSink, Journal};
use crate::services::config::EngineConfig;
use crate::services::emitter::EventEmitter;
use crate::services::scheduler::QueueDepth;

/// What happened to an admitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A fresh case was created and queued.
    Enqueued(CaseId),
    /// The failure triple is already being worked; event discarded.
    Duplicate(CaseId),
}

pub struct Admitter {
    config: Arc<EngineConfig>,
    dedup: Arc<dyn DedupIndex>,
    journal: Arc<dyn Journal>,
    emitter: EventEmitter,
    queue: mpsc::Sender<Case>,
    queue_depth: QueueDepth,
}

impl std::fmt::Debug for Admitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admitter").finish()
    }
}

impl Admitter {
    pub fn new(
        config: Arc<EngineConfig>,
        dedup: Arc<dyn DedupIndex>,
        journal: Arc<dyn Journal>,
        sink: Arc<dyn EventSink>,
        queue: mpsc::Sender<Case>,
        queue_depth: QueueDepth,
    ) -> Self {
        Self {
            config,
            dedup,
            journal,
            emitter: EventEmitter::new(sink),
            queue,
            queue_depth,
        }
    }

    /// Admit one failure event.
    ///
    /// Errors: `IngressRejected` for malformed or unsupported events,
    /// `IngressStale` past the cutoff, `Backpressure` when the ready
    /// queue is full (the caller is expected to retry later).
    pub async fn admit(&self, event: FailureEvent) -> EngineResult<AdmitOutcome> {
        self.validate(&event)?;

        let age = event.age(Utc::now());
        if age > self.config.stale_cutoff() {
            return Err(EngineError::IngressStale {
                age_ms: age.num_milliseconds(),
                cutoff_ms: self.config.limits.stale_cutoff_ms,
            });
        }

        // Reserve the queue slot before touching the dedup index, so a
        // saturated pool does not burn the admission key.
        let permit = self
            .queue
            .try_reserve()
            .map_err(|_| EngineError::Backpressure)?;

        match self
            .dedup
            .try_admit(event.dedup_key(), self.config.dedup_ttl())
            .await?
        {
            Admission::Duplicate => {
                debug!(
                    repository = %event.repository,
                    run_id = event.run_id,
                    head_sha = %event.head_sha,
                    "Duplicate failure event discarded"
                );
                self.emitter.emit_dedup_hit(&event).await;
                Ok(AdmitOutcome::Duplicate(event.case_id()))
            }
            Admission::Admitted => {
                let now = Utc::now();
                let mut case = Case::admit(&event, now, now + self.config.global_deadline());
                let entry = case.admission_entry(&event);
                self.journal.append(entry).await?;

                let case_id = case.id;
                info!(
                    case_id = %case_id,
                    repository = %event.repository,
                    run_id = event.run_id,
                    "Case admitted"
                );
                permit.send(case);
                self.queue_depth.incr();
                Ok(AdmitOutcome::Enqueued(case_id))
            }
        }
    }

    fn validate(&self, event: &FailureEvent) -> EngineResult<()> {
        if event.repository.is_empty() || !event.repository.contains('/') {
            return Err(EngineError::IngressRejected(format!(
                "malformed repository {:?}",
                event.repository
            )));
        }
        if event.head_sha.is_empty() {
            return Err(EngineError::IngressRejected("empty head sha".to_string()));
        }
        if event.run_id == 0 {
            return Err(EngineError::IngressRejected("missing run id".to_string()));
        }
        let allowed = &self.config.allowed_workflows;
        if !allowed.is_empty() && !allowed.contains(&event.workflow) {
            return Err(EngineError::IngressRejected(format!(
                "workflow {:?} is not eligible for self-healing",
                event.workflow
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::adapters::memory::{InMemoryDedupIndex, InMemoryEventSink, InMemoryJournal};
    use crate::domain::models::EventType;

    fn event() -> FailureEvent {
        FailureEvent {
            repository: "acme/app".to_string(),
            run_id: 42,
            head_sha: "abc123".to_string(),
            branch: "main".to_string(),
            workflow: "ci".to_string(),
            actor: "octocat".to_string(),
            installation_id: 1,
            received_at: Utc::now(),
        }
    }

    fn fixture(
        config: EngineConfig,
        buffer: usize,
    ) -> (
        Admitter,
        Arc<InMemoryEventSink>,
        Arc<InMemoryJournal>,
        mpsc::Receiver<Case>,
        QueueDepth,
    ) {
        let sink = Arc::new(InMemoryEventSink::new());
        let journal = Arc::new(InMemoryJournal::new());
        let (tx, rx) = mpsc::channel(buffer);
        let depth = QueueDepth::default();
        let admitter = Admitter::new(
            Arc::new(config),
            Arc::new(InMemoryDedupIndex::new()),
            journal.clone(),
            sink.clone(),
            tx,
            depth.clone(),
        );
        (admitter, sink, journal, rx, depth)
    }

    #[tokio::test]
    async fn test_admits_and_enqueues_fresh_event() {
        let (admitter, _, journal, mut rx, depth) = fixture(EngineConfig::default(), 8);
        let outcome = admitter.admit(event()).await.unwrap();
        assert!(matches!(outcome, AdmitOutcome::Enqueued(_)));
        assert_eq!(depth.len(), 1);

        let case = rx.recv().await.unwrap();
        assert_eq!(case.repository, "acme/app");
        assert_eq!(journal.len(case.id).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_ttl_is_discarded() {
        let (admitter, sink, journal, mut rx, depth) = fixture(EngineConfig::default(), 8);
        admitter.admit(event()).await.unwrap();
        let outcome = admitter.admit(event()).await.unwrap();
        assert!(matches!(outcome, AdmitOutcome::Duplicate(_)));

        // One queued case, one journal entry, one dedup.hit event; the
        // discarded duplicate never touched the depth gauge.
        assert_eq!(depth.len(), 1);
        let case = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(journal.len(case.id).await, 1);
        assert_eq!(sink.count_of(EventType::DedupHit).await, 1);
    }

    #[tokio::test]
    async fn test_rejects_malformed_events() {
        let (admitter, _, _, _rx, _) = fixture(EngineConfig::default(), 8);

        let mut no_repo = event();
        no_repo.repository = "not-a-repo".to_string();
        assert!(matches!(
            admitter.admit(no_repo).await,
            Err(EngineError::IngressRejected(_))
        ));

        let mut no_sha = event();
        no_sha.head_sha = String::new();
        assert!(matches!(
            admitter.admit(no_sha).await,
            Err(EngineError::IngressRejected(_))
        ));

        let mut no_run = event();
        no_run.run_id = 0;
        assert!(matches!(
            admitter.admit(no_run).await,
            Err(EngineError::IngressRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_unsupported_workflow() {
        let mut config = EngineConfig::default();
        config.allowed_workflows = vec!["ci".to_string()];
        let (admitter, _, _, _rx, _) = fixture(config, 8);

        assert!(admitter.admit(event()).await.is_ok());

        let mut other = event();
        other.workflow = "docs".to_string();
        other.run_id = 43;
        assert!(matches!(
            admitter.admit(other).await,
            Err(EngineError::IngressRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_stale_event() {
        let (admitter, _, _, _rx, _) = fixture(EngineConfig::default(), 8);
        let mut old = event();
        old.received_at = Utc::now() - chrono::Duration::hours(25);
        assert!(matches!(
            admitter.admit(old).await,
            Err(EngineError::IngressStale { .. })
        ));
    }

    #[tokio::test]
    async fn test_backpressure_when_queue_full() {
        let (admitter, _, _, _rx, depth) = fixture(EngineConfig::default(), 1);
        admitter.admit(event()).await.unwrap();

        let mut second = event();
        second.run_id = 43;
        assert!(matches!(
            admitter.admit(second).await,
            Err(EngineError::Backpressure)
        ));
        assert_eq!(depth.len(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_does_not_consume_dedup_key() {
        let (admitter, _, _, mut rx, _) = fixture(EngineConfig::default(), 1);
        admitter.admit(event()).await.unwrap();

        let mut second = event();
        second.run_id = 43;
        assert!(admitter.admit(second.clone()).await.is_err());

        // Drain the queue; the rejected event must still be admittable.
        rx.recv().await.unwrap();
        assert!(matches!(
            admitter.admit(second).await.unwrap(),
            AdmitOutcome::Enqueued(_)
        ));
    }
}
