//! Failure report handed to the diagnoser.
//!
//! Assembled from forge logs by the report assembler; every text field is
//! redacted before the report is journaled or leaves the process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::models::case::Phase;

/// One earlier attempt at healing this case, carried into re-diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAttempt {
    pub phase: Phase,
    pub attempt: u32,
    /// Redacted error detail (compiler output, test trace, ...).
    pub error: String,
    pub duration_ms: u64,
}

/// Everything the diagnoser gets to see about a failing run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub repository: String,
    pub run_id: u64,
    pub head_sha: String,
    pub branch: String,
    pub failure_message: String,
    pub error_logs: String,
    pub test_logs: String,
    pub diff: String,
    pub failed_tests: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub previous_attempts: Vec<PriorAttempt>,
    /// How many secrets were replaced during assembly. Audit only; the
    /// redacted content itself is never recorded.
    pub redactions: u32,
}

/// Raw material pulled from the source-forge adapter before redaction
/// and truncation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFailureContext {
    pub failure_message: String,
    pub error_logs: String,
    pub test_logs: String,
    pub diff: String,
    pub changed_files: Vec<String>,
    pub failed_tests: Vec<String>,
    pub environment: BTreeMap<String, String>,
}
