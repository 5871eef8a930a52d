use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::events::PlayEvent;

/// Message fanned out on `play:{session_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RealtimeMessage {
    /// Event wire name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event-specific payload.
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    /// Per-session sequence number.
    pub seq: u64,
    /// Set when `seq` is a wall-clock fallback rather than gateway-assigned.
    pub degraded: bool,
}

impl RealtimeMessage {
    /// Wrap a committed event with its sequence.
    pub fn from_event(event: &PlayEvent, seq: u64, degraded: bool) -> Self {
        Self {
            kind: event.kind().to_owned(),
            payload: event.payload(),
            seq,
            degraded,
        }
    }

    /// Control message telling a lagging client to refetch its snapshot.
    pub fn resync_required(last_seq: Option<u64>) -> Self {
        Self {
            kind: "resync_required".to_owned(),
            payload: serde_json::json!({ "last_seq": last_seq }),
            seq: last_seq.unwrap_or(0),
            degraded: false,
        }
    }
}

/// Broadcast hub of one session channel.
pub struct RealtimeHub {
    sender: broadcast::Sender<RealtimeMessage>,
}

impl RealtimeHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent messages.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeMessage> {
        self.sender.subscribe()
    }

    /// Send a message to current subscribers; returns how many received it.
    pub fn broadcast(&self, message: RealtimeMessage) -> usize {
        self.sender.send(message).unwrap_or(0)
    }
}

/// Open session channels keyed by session id.
///
/// A channel exists only while its session is in a live status; teardown drops the hub so
/// every subscriber observes the channel closing.
pub struct ChannelRegistry {
    capacity: usize,
    hubs: DashMap<Uuid, Arc<RealtimeHub>>,
}

impl ChannelRegistry {
    /// Create an empty registry whose hubs buffer `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            hubs: DashMap::new(),
        }
    }

    /// Open the channel for a session, returning the existing one when already open.
    pub fn open(&self, session_id: Uuid) -> Arc<RealtimeHub> {
        self.hubs
            .entry(session_id)
            .or_insert_with(|| Arc::new(RealtimeHub::new(self.capacity)))
            .clone()
    }

    /// Channel of a session, if open.
    pub fn get(&self, session_id: Uuid) -> Option<Arc<RealtimeHub>> {
        self.hubs.get(&session_id).map(|hub| hub.clone())
    }

    /// Whether a channel is open for the session.
    pub fn is_open(&self, session_id: Uuid) -> bool {
        self.hubs.contains_key(&session_id)
    }

    /// Close the session channel; `false` when none was open.
    pub fn teardown(&self, session_id: Uuid) -> bool {
        self.hubs.remove(&session_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn open_is_idempotent() {
        let registry = ChannelRegistry::new(4);
        let id = Uuid::new_v4();
        let first = registry.open(id);
        let second = registry.open(id);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn teardown_closes_subscribers() {
        let registry = ChannelRegistry::new(4);
        let id = Uuid::new_v4();
        let mut receiver = registry.open(id).subscribe();

        assert!(registry.teardown(id));
        assert!(!registry.is_open(id));
        assert!(matches!(receiver.recv().await, Err(RecvError::Closed)));
    }

    #[test]
    fn message_carries_event_kind_and_payload() {
        let message = RealtimeMessage::from_event(&PlayEvent::StepChanged { from: 1, to: 2 }, 7, false);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "step_changed");
        assert_eq!(json["payload"]["to"], 2);
        assert_eq!(json["seq"], 7);
        assert_eq!(json["degraded"], false);
    }
}
