//! Durable conversation storage interface.
//!
//! The relational schema lives outside this crate; the pipeline only needs
//! the operations below. [`MemoryConversationStore`] backs the CLI and tests,
//! optionally mirrored to a JSON file so conversations survive restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ParleyError, Result};

use super::{ConversationSession, Message, ReportInfo};

/// Partial update of conversation metadata. `None` fields are left as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: Option<usize>,
    pub is_context_full: Option<bool>,
}

impl MetadataPatch {
    /// Patch carrying the counters of `session` after a turn.
    pub fn counters_of(session: &ConversationSession) -> Self {
        Self {
            title: None,
            last_message_at: Some(session.last_message_at),
            message_count: Some(session.message_count),
            is_context_full: Some(session.is_context_full),
        }
    }
}

/// Partial update of a message's mutable flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFlagsPatch {
    pub starred: Option<bool>,
    pub reported: Option<ReportInfo>,
}

/// Durable source of truth for conversations.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist a newly created (empty) conversation.
    async fn create_conversation(&self, session: &ConversationSession) -> Result<()>;

    /// Fetch a conversation with its messages, only if `user_id` owns it.
    async fn get_conversation(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationSession>>;

    /// Append messages atomically: all of them are stored or none.
    async fn append_messages(&self, conversation_id: &str, messages: &[Message]) -> Result<()>;

    /// Append a single message.
    async fn append_message(&self, conversation_id: &str, message: &Message) -> Result<()> {
        self.append_messages(conversation_id, std::slice::from_ref(message))
            .await
    }

    async fn update_metadata(&self, conversation_id: &str, patch: &MetadataPatch) -> Result<()>;

    async fn update_message_flags(
        &self,
        conversation_id: &str,
        message_id: &str,
        patch: &MessageFlagsPatch,
    ) -> Result<()>;

    /// Delete a conversation and, with it, all of its messages.
    async fn delete_conversation(&self, id: &str) -> Result<()>;
}

/// In-process store keyed by conversation id.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<String, ConversationSession>>,
    /// JSON file rewritten after every change, when set.
    persist_path: Option<PathBuf>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store mirrored to the JSON file at `path`. A missing file starts
    /// empty; an unreadable or corrupt one is an error rather than a silent
    /// loss of history.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conversations = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                ParleyError::Store(format!("corrupt conversation file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(ParleyError::Store(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        debug!(path = %path.display(), "Opened conversation store");
        Ok(Self {
            conversations: RwLock::new(conversations),
            persist_path: Some(path),
        })
    }

    /// Write `conversations` out while the caller still holds the write
    /// lock, so saves land in mutation order.
    async fn persist(&self, conversations: &HashMap<String, ConversationSession>) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        save_conversations(path, conversations)
            .await
            .map_err(|e| ParleyError::Store(format!("failed to save {}: {e}", path.display())))
    }

    /// Number of stored conversations.
    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }

    /// Conversations owned by `user_id`, most recent activity first.
    pub async fn list_for_user(&self, user_id: &str) -> Vec<ConversationSession> {
        let guard = self.conversations.read().await;
        let mut list: Vec<ConversationSession> = guard
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        list
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, session: &ConversationSession) -> Result<()> {
        let mut guard = self.conversations.write().await;
        if guard.contains_key(&session.id) {
            return Err(ParleyError::Store(format!(
                "conversation '{}' already exists",
                session.id
            )));
        }
        guard.insert(session.id.clone(), session.clone());
        self.persist(&guard).await
    }

    async fn get_conversation(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationSession>> {
        let guard = self.conversations.read().await;
        Ok(guard.get(id).filter(|c| c.user_id == user_id).cloned())
    }

    async fn append_messages(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        let mut guard = self.conversations.write().await;
        let conversation = guard
            .get_mut(conversation_id)
            .ok_or_else(|| ParleyError::NotFound(format!("conversation '{conversation_id}'")))?;
        if let Some(bad) = messages.iter().find(|m| m.conversation_id != conversation_id) {
            return Err(ParleyError::Store(format!(
                "message '{}' belongs to conversation '{}'",
                bad.id, bad.conversation_id
            )));
        }
        conversation.messages.extend(messages.iter().cloned());
        self.persist(&guard).await
    }

    async fn update_metadata(&self, conversation_id: &str, patch: &MetadataPatch) -> Result<()> {
        let mut guard = self.conversations.write().await;
        let conversation = guard
            .get_mut(conversation_id)
            .ok_or_else(|| ParleyError::NotFound(format!("conversation '{conversation_id}'")))?;
        if let Some(ref title) = patch.title {
            conversation.title = title.clone();
        }
        if let Some(at) = patch.last_message_at {
            conversation.last_message_at = at;
        }
        if let Some(count) = patch.message_count {
            conversation.message_count = count;
        }
        if let Some(full) = patch.is_context_full {
            conversation.is_context_full = full;
        }
        self.persist(&guard).await
    }

    async fn update_message_flags(
        &self,
        conversation_id: &str,
        message_id: &str,
        patch: &MessageFlagsPatch,
    ) -> Result<()> {
        let mut guard = self.conversations.write().await;
        let conversation = guard
            .get_mut(conversation_id)
            .ok_or_else(|| ParleyError::NotFound(format!("conversation '{conversation_id}'")))?;
        let message = conversation
            .message_mut(message_id)
            .ok_or_else(|| ParleyError::NotFound(format!("message '{message_id}'")))?;
        if let Some(starred) = patch.starred {
            message.starred = starred;
        }
        if let Some(ref report) = patch.reported {
            message.reported = Some(report.clone());
        }
        self.persist(&guard).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        let mut guard = self.conversations.write().await;
        if guard.remove(id).is_none() {
            return Ok(());
        }
        self.persist(&guard).await
    }
}

/// Write through a temporary file so a crash mid-write never leaves a
/// truncated store behind.
async fn save_conversations(
    path: &Path,
    conversations: &HashMap<String, ConversationSession>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec(conversations)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}
