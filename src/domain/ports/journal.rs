use async_trait::async_trait;

use crate::domain::errors::JournalError;
use crate::domain::models::{CaseId, JournalEntry, Snapshot};

/// Durable per-case append-only log.
///
/// Any store supporting ordered per-key appends can implement this port.
/// The journal is the authoritative record of a case; workers refuse to
/// advance a projection until the corresponding append has completed.
///
/// # Invariants
/// - Entries are write-once; implementations must reject re-appends.
/// - Per-case `seq` increases by exactly one per append; a gap or
///   duplicate is a [`JournalError::SequenceGap`].
/// - Appends within one case are serialized; different cases are
///   independent partitions.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append one entry. `entry.seq` must equal the next expected
    /// sequence number for `entry.case_id`.
    async fn append(&self, entry: JournalEntry) -> Result<(), JournalError>;

    /// Read every retained entry for a case, ordered by `seq`. After
    /// compaction this is the tail past the latest snapshot.
    async fn read_all(&self, case_id: CaseId) -> Result<Vec<JournalEntry>, JournalError>;

    /// Store a projection checkpoint. Replaces any earlier snapshot.
    async fn snapshot(&self, snapshot: Snapshot) -> Result<(), JournalError>;

    /// Latest stored checkpoint for a case, if any.
    async fn latest_snapshot(&self, case_id: CaseId) -> Result<Option<Snapshot>, JournalError>;

    /// Drop entries already covered by the latest snapshot. Returns the
    /// number of entries removed.
    async fn compact(&self, case_id: CaseId) -> Result<u64, JournalError>;
}
