//! External tools: provider abstraction, registry, selection policy and the
//! router that puts them together.
//!
//! A provider is anything that can list a catalog and invoke a tool by its
//! bare name. The only concrete provider speaks JSON-RPC (see [`mcp`]); the
//! router itself never looks at the wire.

pub mod mcp;
pub mod registry;
pub mod router;
pub mod sanitize;
pub mod selection;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ToolProviderConfig;
use crate::error::Result;

pub use mcp::McpConnector;
pub use registry::ToolRegistry;
pub use router::{InitReport, ToolRouter};
pub use selection::{ToolSelector, ToolSet};

/// One entry of a provider's catalog, under the provider's own name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Name as the provider knows it, without any prefix.
    pub name: String,
    /// Human-readable summary passed on to the engine.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// Value of the provider's required credential, from its `env` table or the
/// process environment. `None` when the provider declares no credential or
/// the credential is missing or blank.
pub fn provider_credential(config: &ToolProviderConfig) -> Option<String> {
    let var = config.credential_env.as_deref()?;
    config
        .env
        .get(var)
        .cloned()
        .or_else(|| std::env::var(var).ok())
        .filter(|v| !v.trim().is_empty())
}

/// A live connection to one tool provider.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Current catalog, fetched from the provider on every call.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    /// Invoke `tool` (bare name) with JSON `arguments`, returning its text
    /// output.
    async fn invoke(&self, tool: &str, arguments: Value) -> Result<String>;

    /// Dispose of the connection.
    async fn shutdown(&self) -> Result<()>;
}

/// Brings a configured provider up. Separate from [`ToolProvider`] so the
/// router can be driven by in-memory providers in tests.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self, config: &ToolProviderConfig) -> Result<Arc<dyn ToolProvider>>;
}
