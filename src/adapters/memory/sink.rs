//! In-memory event sinks: a collecting sink for assertions and a
//! broadcast sink for live subscribers.

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::domain::models::{CaseEvent, EventType};
use crate::domain::ports::{EventSink, SinkError};

/// Collects every published event; used by tests.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: RwLock<Vec<CaseEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<CaseEvent> {
        self.events.read().await.clone()
    }

    /// Event types in publish order, handy for asserting lifecycles.
    pub async fn event_types(&self) -> Vec<EventType> {
        self.events.read().await.iter().map(|e| e.event_type).collect()
    }

    pub async fn count_of(&self, event_type: EventType) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn publish(&self, event: CaseEvent) -> Result<(), SinkError> {
        self.events.write().await.push(event);
        Ok(())
    }
}

/// Fans events out to broadcast subscribers. Lagging receivers drop
/// events; the sink itself never blocks.
#[derive(Debug)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<CaseEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaseEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, event: CaseEvent) -> Result<(), SinkError> {
        // Send errors only mean there are no subscribers.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::domain::models::{CaseId, CaseState};

    fn sample(event_type: EventType) -> CaseEvent {
        CaseEvent {
            event_type,
            case_id: CaseId(Uuid::from_u128(1)),
            repository: "acme/app".to_string(),
            run_id: 1,
            head_sha: "deadbeef".to_string(),
            state: Some(CaseState::New),
            attempt: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_collecting_sink_records_in_order() {
        let sink = InMemoryEventSink::new();
        sink.publish(sample(EventType::StateNew)).await.unwrap();
        sink.publish(sample(EventType::StateDiagnose)).await.unwrap();
        assert_eq!(
            sink.event_types().await,
            vec![EventType::StateNew, EventType::StateDiagnose]
        );
        assert_eq!(sink.count_of(EventType::StateNew).await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(16);
        let mut rx = sink.subscribe();
        sink.publish(sample(EventType::StateDone)).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::StateDone);
    }

    #[tokio::test]
    async fn test_broadcast_sink_without_subscribers_is_fine() {
        let sink = BroadcastEventSink::new(4);
        assert!(sink.publish(sample(EventType::StateNew)).await.is_ok());
    }
}
