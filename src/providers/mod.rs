//! Generation engine abstraction.
//!
//! The engine streams a turn as a bounded channel of [`StreamEvent`]s. A
//! round ends either with `Done` (final text) or with `ToolCalls`, in which
//! case the caller executes the calls and starts another round with the
//! results appended as [`ChatRole::Tool`] messages.

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ParleyError, Result};

pub use openai::OpenAiEngine;

/// Role of a message sent to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as produced by the engine.
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }
}

/// One entry of the engine context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: ChatRole, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: &str) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    pub fn assistant_with_tools(content: &str, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::plain(ChatRole::Assistant, content)
        }
    }

    pub fn tool_result(call_id: &str, content: &str) -> Self {
        Self {
            tool_call_id: Some(call_id.to_string()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }
}

impl From<&crate::conversation::Message> for ChatMessage {
    fn from(m: &crate::conversation::Message) -> Self {
        match m.role {
            crate::conversation::Role::User => ChatMessage::user(&m.content),
            crate::conversation::Role::Assistant => ChatMessage::assistant(&m.content),
        }
    }
}

/// A tool offered to the engine for this round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Token accounting reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// Event produced while streaming one engine round.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of answer text, in generation order.
    Delta(String),
    /// The round ended requesting these tool calls.
    ToolCalls(Vec<ToolCallRequest>),
    /// The round ended with a final answer.
    Done {
        content: String,
        usage: Option<Usage>,
    },
    /// The engine failed mid-stream.
    Error(String),
}

/// The model backend: streaming generation plus embeddings.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Start one streaming round. The receiver yields events until `Done`,
    /// `ToolCalls` or `Error`, then closes.
    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        options: ChatOptions,
    ) -> Result<mpsc::Receiver<StreamEvent>>;

    /// Embed texts into vectors, one per input.
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(ParleyError::Provider(format!(
            "{} does not support embeddings",
            self.name()
        )))
    }
}
