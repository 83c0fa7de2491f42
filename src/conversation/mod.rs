//! Conversation domain types.
//!
//! Conversations and messages reference each other by id only: a
//! [`Message`] carries its `conversation_id`, and a [`ConversationSession`]
//! owns a plain `Vec<Message>` snapshot. Nothing points back up the graph.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{ConversationStore, MemoryConversationStore, MessageFlagsPatch, MetadataPatch};

/// Author of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// External resource a conversation is bound to (article, repo, video).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundResource {
    pub url: String,
    pub content: String,
}

/// Why and when a message was reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportInfo {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// One turn's content. Content is immutable once created; only the
/// `starred` / `reported` flags change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub token_count: u32,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub reported: Option<ReportInfo>,
    /// Set when generation stopped early (failure or cancellation).
    #[serde(default)]
    pub truncated: bool,
}

impl Message {
    /// Create a user message with an estimated token count.
    pub fn user(conversation_id: &str, content: &str) -> Self {
        Self::new(
            conversation_id,
            Role::User,
            content,
            estimate_tokens(content),
        )
    }

    /// Create an assistant message with the engine-reported token count.
    pub fn assistant(conversation_id: &str, content: &str, token_count: u32) -> Self {
        Self::new(conversation_id, Role::Assistant, content, token_count)
    }

    fn new(conversation_id: &str, role: Role, content: &str, token_count: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            token_count,
            starred: false,
            reported: None,
            truncated: false,
        }
    }

    /// Mark as an incomplete answer.
    pub fn into_truncated(mut self) -> Self {
        self.truncated = true;
        self
    }
}

/// Heuristic token estimate: `words * 1.3`, at least 1 for non-empty text.
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0;
    }
    ((words as f64 * 1.3) as u32).max(1)
}

/// Live state of one chat: metadata plus its message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: usize,
    pub is_context_full: bool,
    #[serde(default)]
    pub resource: Option<BoundResource>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ConversationSession {
    /// Start a new, empty conversation owned by `user_id`.
    pub fn new(user_id: &str, resource: Option<BoundResource>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: String::new(),
            created_at: now,
            last_message_at: now,
            message_count: 0,
            is_context_full: false,
            resource,
            messages: Vec::new(),
        }
    }

    /// Append a message and advance the counters.
    ///
    /// `is_context_full` flips once `message_count` reaches `ceiling` and
    /// never flips back.
    pub fn record_message(&mut self, message: Message, ceiling: usize) {
        self.last_message_at = message.created_at;
        self.messages.push(message);
        self.message_count += 1;
        if ceiling > 0 && self.message_count >= ceiling {
            self.is_context_full = true;
        }
    }

    /// Context depth of the next user message: prior messages plus itself.
    pub fn next_depth(&self) -> usize {
        self.message_count + 1
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }
}

/// Derive a title from the first line of the opening message.
pub fn derive_title(content: &str, max_chars: usize) -> String {
    let first_line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first_line.is_empty() {
        return "New conversation".to_string();
    }
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let mut title: String = first_line.chars().take(max_chars).collect();
    title = title.trim_end().to_string();
    title.push('…');
    title
}
