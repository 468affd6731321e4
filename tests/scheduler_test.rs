//! Worker pool behavior: bounded concurrency, graceful cancellation,
//! and terminal accounting.

mod common;

use common::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mender::adapters::memory::InMemoryDedupIndex;
use mender::domain::errors::ActivityError;
use mender::domain::models::{FailReason, RootCause, TestReport, TestRequest};
use mender::domain::ports::TestRunner;
use mender::services::{
    ready_queue, Admitter, CaseEngine, Collaborators, EngineConfig, WorkerPool,
};

/// Test runner that sleeps and tracks how many cases run it at once.
struct SlowRunner {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    delay: Duration,
}

impl SlowRunner {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait]
impl TestRunner for SlowRunner {
    async fn run(&self, _request: TestRequest) -> Result<TestReport, ActivityError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(test_pass())
    }
}

struct Fixture {
    harness: Harness,
    runner: Arc<SlowRunner>,
    engine: Arc<CaseEngine>,
}

/// Harness variant whose test runner is the slow concurrency probe.
fn fixture(config: EngineConfig, delay: Duration) -> Fixture {
    let harness = Harness::new(config);
    let runner = SlowRunner::new(delay);
    let collaborators = Collaborators {
        diagnoser: harness.diagnoser.clone(),
        patcher: harness.patcher.clone(),
        test_runner: runner.clone(),
        prover: harness.prover.clone(),
        merger: harness.merger.clone(),
        context: StaticContext::new(),
    };
    let engine = Arc::new(
        CaseEngine::new(
            harness.config.clone(),
            harness.journal.clone(),
            harness.sink.clone(),
            collaborators,
        )
        .unwrap(),
    );
    Fixture {
        harness,
        runner,
        engine,
    }
}

#[tokio::test]
async fn pool_heals_many_cases_within_the_concurrency_bound() {
    let mut config = EngineConfig::default();
    config.limits.max_concurrent_cases = 2;
    let fx = fixture(config, Duration::from_millis(30));
    let h = &fx.harness;

    let total = 6;
    // Unknown root cause with no patch: diagnose → test → merge.
    h.diagnoser
        .enqueue_repeat(Ok(diagnosis(RootCause::Unknown, 0.9, None)), total)
        .await;
    h.merger.enqueue_repeat(Ok(merged(1)), total).await;

    let cancel = CancellationToken::new();
    let (tx, rx, depth) = ready_queue(h.config.limits.queue_buffer);
    let pool = Arc::new(WorkerPool::new(
        fx.engine.clone(),
        &h.config,
        depth.clone(),
        cancel.clone(),
    ));
    let admitter = Admitter::new(
        h.config.clone(),
        Arc::new(InMemoryDedupIndex::new()),
        h.journal.clone(),
        h.sink.clone(),
        tx,
        depth,
    );

    for run_id in 1..=total as u64 {
        admitter.admit(event(run_id)).await.unwrap();
    }
    drop(admitter); // closes the queue once drained

    pool.run(rx).await;

    let stats = pool.stats();
    assert_eq!(stats.done, total as u64);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 0);
    assert!(fx.runner.max_seen.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn cancellation_drains_workers_and_records_cancelled_cases() {
    let config = EngineConfig::default();
    let fx = fixture(config, Duration::from_secs(30));
    let h = &fx.harness;

    h.diagnoser
        .enqueue_repeat(Ok(diagnosis(RootCause::Unknown, 0.9, None)), 2)
        .await;

    let cancel = CancellationToken::new();
    let (tx, rx, depth) = ready_queue(h.config.limits.queue_buffer);
    let pool = Arc::new(WorkerPool::new(
        fx.engine.clone(),
        &h.config,
        depth.clone(),
        cancel.clone(),
    ));
    let admitter = Admitter::new(
        h.config.clone(),
        Arc::new(InMemoryDedupIndex::new()),
        h.journal.clone(),
        h.sink.clone(),
        tx,
        depth,
    );

    admitter.admit(event(1)).await.unwrap();
    admitter.admit(event(2)).await.unwrap();

    let pool_task = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run(rx).await })
    };

    // Let the workers reach the slow test-runner call, then pull the plug.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    pool_task.await.unwrap();

    let stats = pool.stats();
    // Cancelled cases still count as failed; cancelled is the subset.
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 0);

    // The cancelled cases are terminal in the journal, not abandoned.
    let resumed = fx
        .engine
        .resume(event(1).case_id(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.fail_reason, Some(FailReason::Cancelled));
}

#[tokio::test]
async fn quarantine_accounts_engine_errors_as_failures() {
    // A diagnoser script that never answers produces an internal activity
    // error, which the engine turns into failed(internal) on its own; the
    // pool counts it as failed.
    let fx = fixture(EngineConfig::default(), Duration::from_millis(1));
    let h = &fx.harness;

    let cancel = CancellationToken::new();
    let (tx, rx, depth) = ready_queue(h.config.limits.queue_buffer);
    let pool = Arc::new(WorkerPool::new(
        fx.engine.clone(),
        &h.config,
        depth.clone(),
        cancel.clone(),
    ));
    let admitter = Admitter::new(
        h.config.clone(),
        Arc::new(InMemoryDedupIndex::new()),
        h.journal.clone(),
        h.sink.clone(),
        tx,
        depth,
    );
    admitter.admit(event(1)).await.unwrap();
    drop(admitter);

    pool.run(rx).await;

    let stats = pool.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.cancelled, 0);
    assert_eq!(stats.done, 0);

    let resumed = fx
        .engine
        .resume(event(1).case_id(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.fail_reason, Some(FailReason::Internal));
}
