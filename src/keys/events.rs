//! Session key lifecycle events.
//!
//! Subscribers receive events over a tokio broadcast channel. Publishing is
//! fire-and-forget: a send with no receivers, or a lagging receiver, never
//! fails the operation that produced the event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::UserId;

/// Buffered events per subscriber before it starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to a user's session keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyEvent {
    /// A device key was created, possibly replacing the previous key of
    /// the same category
    SessionKeyCreated {
        user_id: UserId,
        key_id: String,
        device_category: String,
        replaced_key_id: Option<String>,
        at: DateTime<Utc>,
    },

    /// A device key was deleted
    SessionKeyDeleted {
        user_id: UserId,
        key_id: String,
        /// Whether the keyset became empty and its row was removed
        keyset_removed: bool,
        at: DateTime<Utc>,
    },

    /// A user's cache entries were reloaded from the store
    CachePrimed {
        user_id: UserId,
        key_count: usize,
        at: DateTime<Utc>,
    },
}

impl KeyEvent {
    pub fn user_id(&self) -> UserId {
        match self {
            Self::SessionKeyCreated { user_id, .. }
            | Self::SessionKeyDeleted { user_id, .. }
            | Self::CachePrimed { user_id, .. } => *user_id,
        }
    }
}

/// Broadcasts [`KeyEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct KeyEventPublisher {
    sender: broadcast::Sender<KeyEvent>,
}

impl KeyEventPublisher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: KeyEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for KeyEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = KeyEventPublisher::new();
        publisher.publish(KeyEvent::CachePrimed {
            user_id: 1,
            key_count: 0,
            at: Utc::now(),
        });
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let publisher = KeyEventPublisher::new();
        let mut rx = publisher.subscribe();

        publisher.publish(KeyEvent::SessionKeyDeleted {
            user_id: 5,
            key_id: "web-5-abc".into(),
            keyset_removed: true,
            at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id(), 5);
        assert!(matches!(
            event,
            KeyEvent::SessionKeyDeleted { keyset_removed: true, .. }
        ));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = KeyEvent::CachePrimed {
            user_id: 2,
            key_count: 3,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cache_primed");
        assert_eq!(json["key_count"], 3);
    }
}
