//! In-memory journal for tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::errors::JournalError;
use crate::domain::models::{CaseId, JournalEntry, Snapshot};
use crate::domain::ports::Journal;

#[derive(Debug, Default)]
struct CaseLog {
    /// Sequence number of the first retained entry.
    base_seq: u64,
    entries: Vec<JournalEntry>,
    snapshot: Option<Snapshot>,
}

impl CaseLog {
    fn next_seq(&self) -> u64 {
        self.base_seq + self.entries.len() as u64
    }
}

/// Journal keeping every case's log in process memory.
///
/// Enforces the port invariants (write-once, contiguous `seq`) so tests
/// exercise the same discipline a durable store would.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    logs: RwLock<HashMap<CaseId, CaseLog>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained entries for a case. Test helper.
    pub async fn len(&self, case_id: CaseId) -> usize {
        let logs = self.logs.read().await;
        logs.get(&case_id).map(|l| l.entries.len()).unwrap_or(0)
    }

    pub async fn is_empty(&self, case_id: CaseId) -> bool {
        self.len(case_id).await == 0
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(&self, entry: JournalEntry) -> Result<(), JournalError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(entry.case_id).or_default();
        let expected = log.next_seq();
        if entry.seq != expected {
            return Err(JournalError::SequenceGap {
                case_id: entry.case_id,
                expected,
                got: entry.seq,
            });
        }
        log.entries.push(entry);
        Ok(())
    }

    async fn read_all(&self, case_id: CaseId) -> Result<Vec<JournalEntry>, JournalError> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(&case_id)
            .map(|l| l.entries.clone())
            .unwrap_or_default())
    }

    async fn snapshot(&self, snapshot: Snapshot) -> Result<(), JournalError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(snapshot.case_id).or_default();
        log.snapshot = Some(snapshot);
        Ok(())
    }

    async fn latest_snapshot(&self, case_id: CaseId) -> Result<Option<Snapshot>, JournalError> {
        let logs = self.logs.read().await;
        Ok(logs.get(&case_id).and_then(|l| l.snapshot.clone()))
    }

    async fn compact(&self, case_id: CaseId) -> Result<u64, JournalError> {
        let mut logs = self.logs.write().await;
        let Some(log) = logs.get_mut(&case_id) else {
            return Ok(0);
        };
        let Some(upto) = log.snapshot.as_ref().map(|s| s.seq) else {
            return Ok(0);
        };
        let before = log.entries.len();
        log.entries.retain(|e| e.seq >= upto);
        log.base_seq = upto.max(log.base_seq);
        Ok((before - log.entries.len()) as u64)
    }
}
