//! Crate-wide error type.
//!
//! Cache-layer and tool-layer failures are absorbed close to where they
//! happen (see [`crate::cache`] and [`crate::tools`]); the variants for them
//! exist so those layers can log and classify failures uniformly. Ownership,
//! generation and durable-store errors are the ones that reach callers.

use thiserror::Error;

/// Errors produced by the parley library.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem / process I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport or API failure talking to a remote backend (generation
    /// engine or tool server).
    #[error("Provider error: {0}")]
    Provider(String),

    /// The generation engine failed before or during streaming.
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// The caller cancelled the turn.
    #[error("Turn cancelled")]
    Cancelled,

    /// The requesting user does not own the conversation (or it does not exist).
    #[error("User '{user_id}' does not own conversation '{conversation_id}'")]
    OwnershipViolation {
        user_id: String,
        conversation_id: String,
    },

    /// Another turn is already generating for this conversation.
    #[error("A turn is already in flight for conversation '{0}'")]
    TurnInProgress(String),

    /// No provider owns the requested tool.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// The owning provider failed to execute the tool.
    #[error("Tool '{tool}' failed: {reason}")]
    ToolInvocationFailed { tool: String, reason: String },

    /// A single tool provider could not be brought up.
    #[error("Provider '{provider}' failed to initialize: {reason}")]
    ProviderInitFailed { provider: String, reason: String },

    /// Cache, vector index or embedding backend unavailable.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// An administrative index rebuild is running.
    #[error("Index rebuild in progress")]
    IndexRebuildInProgress,

    /// Durable conversation store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl ParleyError {
    /// Whether this error is one the pipeline surfaces to the end user.
    ///
    /// Cache and tool errors are advisory and never fail a turn.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            ParleyError::CacheUnavailable(_)
                | ParleyError::IndexRebuildInProgress
                | ParleyError::ToolNotFound(_)
                | ParleyError::ToolInvocationFailed { .. }
                | ParleyError::ProviderInitFailed { .. }
        )
    }
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_violation_display() {
        let err = ParleyError::OwnershipViolation {
            user_id: "alice".into(),
            conversation_id: "c-1".into(),
        };
        assert_eq!(
            err.to_string(),
            "User 'alice' does not own conversation 'c-1'"
        );
    }

    #[test]
    fn test_cache_and_tool_errors_not_user_visible() {
        assert!(!ParleyError::CacheUnavailable("down".into()).is_user_visible());
        assert!(!ParleyError::IndexRebuildInProgress.is_user_visible());
        assert!(!ParleyError::ToolNotFound("x".into()).is_user_visible());
        assert!(ParleyError::GenerationFailed("boom".into()).is_user_visible());
        assert!(ParleyError::Cancelled.is_user_visible());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ParleyError = io.into();
        assert!(matches!(err, ParleyError::Io(_)));
    }
}
