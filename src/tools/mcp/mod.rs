//! JSON-RPC tool providers over HTTP or a child process.

pub mod client;
pub mod protocol;
pub mod provider;
pub mod transport;

pub use client::McpClient;
pub use provider::{McpConnector, McpToolProvider};
pub use transport::{HttpTransport, McpTransport, StdioTransport};
