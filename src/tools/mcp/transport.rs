//! Wire transports for tool providers: JSON-RPC over HTTP POST, or
//! newline-delimited JSON-RPC over a child process's stdio.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ParleyError, Result};

use super::protocol::{McpRequest, McpResponse};

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send one request and wait for its response.
    async fn send(&self, request: &McpRequest) -> Result<McpResponse>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self) -> Result<()>;

    /// `"http"` or `"stdio"`.
    fn kind(&self) -> &'static str;
}

fn transport_error(msg: String) -> ParleyError {
    ParleyError::Provider(msg)
}

pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    bearer: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| transport_error(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
            bearer: None,
        })
    }

    /// Send `token` as a bearer credential on every request.
    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, request: &McpRequest) -> Result<McpResponse> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(ref token) = self.bearer {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transport_error(format!("HTTP {status}: {body}")));
        }
        response
            .json::<McpResponse>()
            .await
            .map_err(|e| transport_error(format!("malformed JSON-RPC response: {e}")))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

/// Child-process transport. One request/response exchange at a time: the
/// pipes sit behind a single lock so concurrent callers cannot read each
/// other's replies.
pub struct StdioTransport {
    pipes: Mutex<Pipes>,
    child: Mutex<Child>,
    timeout: Duration,
}

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut child = tokio::process::Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| transport_error(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| transport_error("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport_error("child stdout unavailable".into()))?;

        debug!(command, "Spawned stdio tool provider");
        Ok(Self {
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
            timeout,
        })
    }

    /// Write `line` and read until the reply carrying `id` arrives. Replies
    /// to abandoned requests and server notifications are skipped, so a
    /// timed-out call cannot leave its answer for the next caller.
    async fn exchange(&self, line: &str, id: u64) -> Result<McpResponse> {
        let mut pipes = self.pipes.lock().await;
        pipes.stdin.write_all(line.as_bytes()).await?;
        pipes.stdin.flush().await?;
        let mut reply = String::new();
        loop {
            reply.clear();
            if pipes.stdout.read_line(&mut reply).await? == 0 {
                return Err(transport_error("provider process closed stdout".into()));
            }
            let trimmed = reply.trim();
            if trimmed.is_empty() {
                continue;
            }
            let response: McpResponse = match serde_json::from_str(trimmed) {
                Ok(response) => response,
                Err(e) => {
                    debug!(error = %e, "Skipping non JSON-RPC line from stdio provider");
                    continue;
                }
            };
            match response.id {
                Some(got) if got == id => return Ok(response),
                other => debug!(expected = id, got = ?other, "Skipping unrelated stdio message"),
            }
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, request: &McpRequest) -> Result<McpResponse> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        tokio::time::timeout(self.timeout, self.exchange(&line, request.id))
            .await
            .map_err(|_| {
                transport_error(format!(
                    "no reply within {}s",
                    self.timeout.as_secs_f32()
                ))
            })?
    }

    async fn close(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        child.kill().await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}
