use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::CaseEvent;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Event sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for lifecycle events.
///
/// Delivery is at-least-once and best-effort: the emitter logs and drops
/// failures, so implementations must never block the engine for long.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: CaseEvent) -> Result<(), SinkError>;
}
