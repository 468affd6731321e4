//! Ingress record for a failing CI run.
//!
//! A `FailureEvent` is produced by webhook ingestion (out of process) and is
//! immutable once received. Its `(repository, run_id, head_sha)` triple
//! derives both the stable case id and the dedup key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic case/dedup ids.
const CASE_NAMESPACE: Uuid = Uuid::from_u128(0x6d656e_6465_7263_6173_650000000001);

/// Stable identifier of a case, derived from the failure triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseId(pub Uuid);

impl std::fmt::Display for CaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key for the deduplication index. Same derivation as [`CaseId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(pub Uuid);

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A normalized failing-run notification from the source forge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    /// Repository in `owner/name` form.
    pub repository: String,
    /// Forge-assigned workflow run id.
    pub run_id: u64,
    /// Commit the run executed against.
    pub head_sha: String,
    /// Branch the run belongs to.
    pub branch: String,
    /// Workflow name, checked against the supported-workflow allowlist.
    pub workflow: String,
    /// Actor that triggered the run.
    pub actor: String,
    /// Forge app installation the event arrived through.
    pub installation_id: u64,
    /// When ingestion handed the event to the engine.
    pub received_at: DateTime<Utc>,
}

impl FailureEvent {
    fn identity(&self) -> String {
        format!("{}\n{}\n{}", self.repository, self.run_id, self.head_sha)
    }

    /// Deterministic case id, stable across restarts.
    pub fn case_id(&self) -> CaseId {
        CaseId(Uuid::new_v5(&CASE_NAMESPACE, self.identity().as_bytes()))
    }

    /// Dedup key for at-most-once admission.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey(Uuid::new_v5(&CASE_NAMESPACE, self.identity().as_bytes()))
    }

    /// Age of the event relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.received_at
    }
}
