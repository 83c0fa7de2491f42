//! JSON-RPC client for one tool provider, independent of transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ParleyError, Result};

use super::protocol::{CallToolResult, InitializeParams, ListToolsResult, McpRequest, McpTool};
use super::transport::McpTransport;

pub struct McpClient {
    name: String,
    transport: Arc<dyn McpTransport>,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(name: &str, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            name: name.to_string(),
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }

    /// Send `method` and return its `result`, turning JSON-RPC errors and
    /// empty results into errors.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .transport
            .send(&McpRequest::new(id, method, params))
            .await?;
        if let Some(got) = response.id.filter(|got| *got != id) {
            return Err(ParleyError::Provider(format!(
                "{}: {method} got the reply to request {got}, expected {id}",
                self.name
            )));
        }
        if let Some(error) = response.error {
            return Err(ParleyError::Provider(format!(
                "{}: {method} returned error {}: {}",
                self.name, error.code, error.message
            )));
        }
        response.result.ok_or_else(|| {
            ParleyError::Provider(format!("{}: {method} returned no result", self.name))
        })
    }

    /// Protocol handshake. Returns the server's capabilities object.
    pub async fn initialize(&self) -> Result<Value> {
        let params = serde_json::to_value(InitializeParams::default())?;
        self.call("initialize", Some(params)).await
    }

    /// The provider's current catalog. Always a fresh request.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let result = self.call("tools/list", None).await?;
        let parsed: ListToolsResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self.call("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.transport.close().await
    }
}
