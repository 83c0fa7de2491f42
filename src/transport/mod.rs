//! Conversation-scoped real-time delivery.
//!
//! The pipeline only needs [`Broadcaster::broadcast`]; [`EventBus`] is the
//! in-process implementation used by the CLI and tests. A websocket or SSE
//! front end would implement the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::conversation::Message;

/// Something the pipeline tells clients watching a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// A piece of the answer, in generation order within `turn_id`.
    Chunk {
        turn_id: String,
        seq: u64,
        text: String,
    },
    /// The stored assistant message that ends a turn.
    FinalMessage { turn_id: String, message: Message, cached: bool },
    /// The turn ended without a complete answer.
    Error { turn_id: String, message: String },
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver `event` to everyone watching `conversation_id`. Delivery is
    /// best effort: no subscribers is not an error.
    async fn broadcast(&self, conversation_id: &str, event: ConversationEvent);
}

/// One broadcast channel per conversation, created on first subscribe.
pub struct EventBus {
    capacity: usize,
    channels: DashMap<String, broadcast::Sender<ConversationEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ConversationEvent> {
        self.channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn receiver_count(&self, conversation_id: &str) -> usize {
        self.channels
            .get(conversation_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop channels nobody listens to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

#[async_trait]
impl Broadcaster for EventBus {
    async fn broadcast(&self, conversation_id: &str, event: ConversationEvent) {
        let Some(tx) = self.channels.get(conversation_id) else {
            trace!(conversation_id, "No subscribers, dropping event");
            return;
        };
        let _ = tx.send(event);
    }
}
