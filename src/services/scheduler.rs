//! Worker pool over the ready-case queue.
//!
//! FIFO among ready cases, bounded by `max_concurrent_cases` permits.
//! Each case is owned by exactly one worker through an exclusive lease
//! held from pickup to terminal state. A process-level cancellation
//! cascades into every in-flight activity; workers then record
//! `failed(cancelled)` and release their leases.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::models::{Case, CaseId, CaseState, FailReason};
use crate::services::config::EngineConfig;
use crate::services::engine::CaseEngine;

/// Build the bounded ready queue shared by admitter and pool, plus the
/// depth gauge both sides report through.
pub fn ready_queue(buffer: usize) -> (mpsc::Sender<Case>, mpsc::Receiver<Case>, QueueDepth) {
    let (sender, receiver) = mpsc::channel(buffer);
    (sender, receiver, QueueDepth::default())
}

/// Shared gauge of cases waiting in the ready queue.
///
/// The admitter increments on enqueue, the pool decrements on pickup;
/// `PoolStats::queued` reads it.
#[derive(Debug, Clone, Default)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn len(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decr(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive per-case ownership marker.
#[derive(Debug, Default)]
struct LeaseMap {
    held: Mutex<HashSet<CaseId>>,
}

impl LeaseMap {
    fn acquire(&self, case_id: CaseId) -> bool {
        self.held.lock().expect("lease map poisoned").insert(case_id)
    }

    fn release(&self, case_id: CaseId) {
        self.held.lock().expect("lease map poisoned").remove(&case_id);
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    in_flight: AtomicUsize,
    done: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time view of pool activity.
///
/// `failed` counts every case that ended in the failed state, whatever
/// the reason; `cancelled` is the subset of those that failed with
/// `cancelled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub in_flight: usize,
    pub done: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct WorkerPool {
    engine: Arc<CaseEngine>,
    semaphore: Arc<Semaphore>,
    leases: Arc<LeaseMap>,
    counters: Arc<PoolCounters>,
    queue_depth: QueueDepth,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish()
    }
}

impl WorkerPool {
    pub fn new(
        engine: Arc<CaseEngine>,
        config: &EngineConfig,
        queue_depth: QueueDepth,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(config.limits.max_concurrent_cases)),
            leases: Arc::new(LeaseMap::default()),
            counters: Arc::new(PoolCounters::default()),
            queue_depth,
            cancel,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.queue_depth.len(),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            done: self.counters.done.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            cancelled: self.counters.cancelled.load(Ordering::SeqCst),
        }
    }

    /// Consume the ready queue until it closes or the pool is cancelled,
    /// then wait for in-flight workers to wind down.
    pub async fn run(&self, mut queue: mpsc::Receiver<Case>) {
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Worker pool cancelled, draining in-flight cases");
                    break;
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
                next = queue.recv() => {
                    let Some(case) = next else {
                        info!("Ready queue closed, draining in-flight cases");
                        break;
                    };
                    self.queue_depth.decr();
                    let permit = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        permit = self.semaphore.clone().acquire_owned() => {
                            match permit {
                                Ok(permit) => permit,
                                Err(_) => break,
                            }
                        }
                    };
                    if !self.leases.acquire(case.id) {
                        warn!(case_id = %case.id, "Case already leased, dropping duplicate pickup");
                        continue;
                    }
                    self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
                    let engine = self.engine.clone();
                    let leases = self.leases.clone();
                    let counters = self.counters.clone();
                    let cancel = self.cancel.clone();
                    workers.spawn(async move {
                        let mut case = case;
                        match engine.drive(&mut case, &cancel).await {
                            Ok(CaseState::Done) => {
                                counters.done.fetch_add(1, Ordering::SeqCst);
                            }
                            Ok(_) => {
                                counters.failed.fetch_add(1, Ordering::SeqCst);
                                if case.fail_reason == Some(FailReason::Cancelled) {
                                    counters.cancelled.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            Err(e) => {
                                warn!(case_id = %case.id, error = %e, "Engine error, quarantining case");
                                engine.quarantine(&mut case, &e.to_string()).await;
                                counters.failed.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                        leases.release(case.id);
                        drop(permit);
                    });
                }
            }
        }

        while workers.join_next().await.is_some() {}
    }
}
