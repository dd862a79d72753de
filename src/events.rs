//! Domain events and the in-process event bus
//!
//! Every domain mutation emits a structured [`DomainEvent`]. Events are
//! buffered inside the unit-of-work and published onto the bus only after
//! the surrounding transaction commits; a rollback drops the buffer.
//! Delivery is at-least-once, so subscribers (audit writer, search-index
//! refresher) must be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event type names, kept as constants so subscribers can match on them
/// without string drift.
pub mod event_types {
    pub const DATASET_CREATED: &str = "DatasetCreated";
    pub const DATASET_UPDATED: &str = "DatasetUpdated";
    pub const DATASET_DELETED: &str = "DatasetDeleted";
    pub const DATASET_COMMITTED: &str = "DatasetCommitted";
    pub const REF_CREATED: &str = "RefCreated";
    pub const REF_DELETED: &str = "RefDeleted";
    pub const PERMISSION_GRANTED: &str = "PermissionGranted";
    pub const PERMISSION_REVOKED: &str = "PermissionRevoked";
    pub const JOB_COMPLETED: &str = "JobCompleted";
    pub const JOB_FAILED: &str = "JobFailed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub user_id: Option<Uuid>,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
}

impl DomainEvent {
    pub fn new(
        event_type: &str,
        aggregate_type: &str,
        aggregate_id: impl ToString,
        user_id: Option<Uuid>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            user_id,
            payload,
            occurred_at: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Broadcast-backed in-process bus. Cloning is cheap; every subscriber gets
/// its own receiver cursor.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish one event. Lagging or absent subscribers are not an error;
    /// the audit log is written by its own subscriber task.
    pub fn publish(&self, event: DomainEvent) {
        let receivers = self.sender.receiver_count();
        if receivers == 0 {
            tracing::debug!(event_type = %event.event_type, "no subscribers for event");
            return;
        }
        if let Err(e) = self.sender.send(event) {
            tracing::warn!(error = %e, "event publish failed");
        }
    }

    pub fn publish_all(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::new(
            event_types::DATASET_CREATED,
            "dataset",
            Uuid::from_u128(1),
            Some(Uuid::from_u128(2)),
            json!({"name": "trades"}),
        ));

        let got = rx.recv().await.expect("event should arrive");
        assert_eq!(got.event_type, event_types::DATASET_CREATED);
        assert_eq!(got.aggregate_type, "dataset");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        // Must not panic or error.
        bus.publish(DomainEvent::new(
            event_types::DATASET_DELETED,
            "dataset",
            Uuid::from_u128(3),
            None,
            json!({}),
        ));
    }
}
