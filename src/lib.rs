//! parley: the response pipeline of a conversational assistant.
//!
//! A turn flows through [`pipeline::ConversationPipeline`], which checks
//! ownership through the [`session::SessionCache`], consults the hybrid
//! [`cache::ResponseCache`], and otherwise streams a generation from a
//! [`providers::GenerationEngine`] with tools routed by
//! [`tools::ToolRouter`]. Chunks reach clients through a
//! [`transport::Broadcaster`].

pub mod cache;
pub mod config;
pub mod conversation;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod session;
pub mod telemetry;
pub mod tools;
pub mod transport;

pub use cache::ResponseCache;
pub use config::Config;
pub use conversation::{ConversationSession, ConversationStore, MemoryConversationStore, Message};
pub use error::{ParleyError, Result};
pub use pipeline::{ConversationPipeline, TurnOutcome, TurnRequest};
pub use providers::{GenerationEngine, OpenAiEngine};
pub use session::SessionCache;
pub use tools::ToolRouter;
pub use transport::{Broadcaster, ConversationEvent, EventBus};
