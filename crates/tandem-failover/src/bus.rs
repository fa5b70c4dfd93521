//! Typed event bus for failover notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandem_types::{DisabledReasons, HaStatus};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events published by the failover engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FailoverEvent {
    StatusChanged {
        status: HaStatus,
    },
    DisabledReasonsChanged {
        disabled_reasons: DisabledReasons,
    },
    /// First-time pairing finished.
    SetupAdded,
    UpgradePendingAdded {
        pending: bool,
    },
    /// A failover event moved this node to a new role.
    RoleChanged {
        from: HaStatus,
        to: HaStatus,
        interface: Option<String>,
    },
}

impl FailoverEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            FailoverEvent::StatusChanged { .. } => "failover.status",
            FailoverEvent::DisabledReasonsChanged { .. } => "failover.disabled_reasons",
            FailoverEvent::SetupAdded => "failover.setup",
            FailoverEvent::UpgradePendingAdded { .. } => "failover.upgrade_pending",
            FailoverEvent::RoleChanged { .. } => "failover.role",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FailoverEvent::StatusChanged { .. }
            | FailoverEvent::DisabledReasonsChanged { .. }
            | FailoverEvent::RoleChanged { .. } => "CHANGED",
            FailoverEvent::SetupAdded | FailoverEvent::UpgradePendingAdded { .. } => "ADDED",
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub event: FailoverEvent,
}

/// Broadcasts failover events to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer_size.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: FailoverEvent) -> usize {
        tracing::debug!(topic = event.topic(), kind = event.kind(), "publishing event");
        self.tx
            .send(BusMessage {
                id: Uuid::new_v4(),
                at: Utc::now(),
                event,
            })
            .unwrap_or_default()
    }

    /// Events published before subscribing are not delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(FailoverEvent::SetupAdded), 0);
    }

    #[test]
    fn test_subscriber_receives_event() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(FailoverEvent::StatusChanged {
            status: HaStatus::Master,
        });
        let message = rx.try_recv().unwrap();
        assert_eq!(message.event.topic(), "failover.status");
        assert_eq!(message.event.kind(), "CHANGED");
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(FailoverEvent::UpgradePendingAdded { pending: true }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "upgradePendingAdded", "pending": true}));
    }
}
