//! [`ToolProvider`] over a JSON-RPC client, plus the connector that builds
//! one from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::config::ToolProviderConfig;
use crate::error::{ParleyError, Result};
use crate::tools::{provider_credential, ProviderConnector, ToolProvider, ToolSpec};

use super::client::McpClient;
use super::transport::{HttpTransport, McpTransport, StdioTransport};

const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 30;

pub struct McpToolProvider {
    client: McpClient,
}

impl McpToolProvider {
    pub fn new(client: McpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolProvider for McpToolProvider {
    fn name(&self) -> &str {
        self.client.name()
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let tools = self.client.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|t| ToolSpec {
                description: t.description.unwrap_or_default(),
                name: t.name,
                input_schema: t.input_schema,
            })
            .collect())
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<String> {
        let result = self.client.call_tool(tool, arguments).await?;
        let text = result.text();
        if result.is_error {
            return Err(ParleyError::ToolInvocationFailed {
                tool: tool.to_string(),
                reason: text,
            });
        }
        Ok(text)
    }

    async fn shutdown(&self) -> Result<()> {
        self.client.shutdown().await
    }
}

/// Opens HTTP or stdio connections and performs the handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct McpConnector;

impl McpConnector {
    async fn open(config: &ToolProviderConfig) -> Result<Arc<dyn McpTransport>> {
        let timeout = Duration::from_secs(
            config
                .timeout_secs
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS),
        );
        let credential = provider_credential(config);

        if let Some(ref url) = config.url {
            let transport = HttpTransport::new(url, timeout)?.with_bearer(credential);
            return Ok(Arc::new(transport));
        }
        if let Some(ref command) = config.command {
            let mut env: HashMap<String, String> = config.env.clone();
            if let (Some(var), Some(value)) = (config.credential_env.as_ref(), credential) {
                env.insert(var.clone(), value);
            }
            let transport = StdioTransport::spawn(command, &config.args, &env, timeout).await?;
            return Ok(Arc::new(transport));
        }
        Err(ParleyError::Config(format!(
            "tool provider '{}' has neither url nor command",
            config.name
        )))
    }
}

#[async_trait]
impl ProviderConnector for McpConnector {
    async fn connect(&self, config: &ToolProviderConfig) -> Result<Arc<dyn ToolProvider>> {
        let transport = Self::open(config).await?;
        let kind = transport.kind();
        let client = McpClient::new(&config.name, transport);
        if let Err(e) = client.initialize().await {
            let _ = client.shutdown().await;
            return Err(e);
        }
        info!(provider = %config.name, transport = kind, "Tool provider connected");
        Ok(Arc::new(McpToolProvider::new(client)))
    }
}
