use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::DedupKey;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Dedup store failure: {0}")]
    Storage(String),
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Key was not present; it is now held for the TTL window.
    Admitted,
    /// Key already held; the event must be discarded.
    Duplicate,
}

/// Process-wide at-most-once admission index.
///
/// `try_admit` must be atomic (compare-and-set) across all workers: for a
/// given key at most one caller observes [`Admission::Admitted`] per TTL
/// window. Entries expire on their own; `evict_expired` only reclaims
/// memory eagerly.
#[async_trait]
pub trait DedupIndex: Send + Sync {
    async fn try_admit(&self, key: DedupKey, ttl: Duration) -> Result<Admission, DedupError>;

    /// Drop expired entries, returning how many were removed.
    async fn evict_expired(&self) -> Result<usize, DedupError>;
}
