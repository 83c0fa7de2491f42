//! At most one in-flight turn per conversation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ParleyError, Result};

/// Conversations with a turn currently running, each with the token that
/// cancels it.
#[derive(Default)]
pub struct ActiveTurns {
    active: DashMap<String, CancellationToken>,
}

impl ActiveTurns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `conversation_id` for a turn. Fails with `TurnInProgress` when
    /// another turn holds it. The claim is released when the permit drops.
    pub fn begin(&self, conversation_id: &str, cancel: CancellationToken) -> Result<TurnPermit<'_>> {
        match self.active.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => Err(ParleyError::TurnInProgress(conversation_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(cancel);
                Ok(TurnPermit {
                    turns: self,
                    conversation_id: conversation_id.to_string(),
                })
            }
        }
    }

    /// Cancel the running turn of `conversation_id`, if any.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        match self.active.get(conversation_id) {
            Some(token) => {
                token.cancel();
                debug!(conversation_id, "Turn cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active.contains_key(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

pub struct TurnPermit<'a> {
    turns: &'a ActiveTurns,
    conversation_id: String,
}

impl Drop for TurnPermit<'_> {
    fn drop(&mut self) {
        self.turns.active.remove(&self.conversation_id);
    }
}
