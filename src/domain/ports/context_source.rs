use async_trait::async_trait;

use crate::domain::errors::ActivityError;
use crate::domain::models::RawFailureContext;

/// Thin slice of the source-forge adapter the report assembler pulls
/// from: workflow logs, per-job logs, the diff against the merge base,
/// changed files, test output, and environment metadata.
#[async_trait]
pub trait FailureContextSource: Send + Sync {
    async fn fetch(
        &self,
        repository: &str,
        run_id: u64,
        head_sha: &str,
    ) -> Result<RawFailureContext, ActivityError>;
}
