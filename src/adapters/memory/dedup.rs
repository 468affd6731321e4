//! In-memory deduplication index.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::models::DedupKey;
use crate::domain::ports::{Admission, DedupError, DedupIndex};

/// Mutex-guarded compare-and-set map with per-entry expiry.
///
/// The lock serializes concurrent `try_admit` calls, which is exactly the
/// semantics the port requires from any distributed implementation.
#[derive(Debug, Default)]
pub struct InMemoryDedupIndex {
    entries: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
}

impl InMemoryDedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl DedupIndex for InMemoryDedupIndex {
    async fn try_admit(&self, key: DedupKey, ttl: Duration) -> Result<Admission, DedupError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DedupError::Storage(format!("ttl out of range: {e}")))?;
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(expires_at) if *expires_at > now => Ok(Admission::Duplicate),
            _ => {
                entries.insert(key, now + ttl);
                Ok(Admission::Admitted)
            }
        }
    }

    async fn evict_expired(&self) -> Result<usize, DedupError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        Ok(before - entries.len())
    }
}
