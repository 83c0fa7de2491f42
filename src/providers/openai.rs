//! OpenAI-compatible generation engine.
//!
//! Talks to any `/chat/completions` + `/embeddings` endpoint that follows the
//! OpenAI wire format (OpenAI, OpenRouter, vLLM, llama.cpp server, Ollama's
//! OpenAI shim). Chat responses are streamed as server-sent events; tool-call
//! fragments are assembled by index until the stream finishes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{ParleyError, Result};

use super::{
    ChatMessage, ChatOptions, GenerationEngine, StreamEvent, ToolCallRequest, ToolDefinition,
    Usage,
};

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Streaming engine over the OpenAI chat-completions API.
pub struct OpenAiEngine {
    api_base: String,
    api_key: Option<String>,
    model: String,
    embedding_model: String,
    client: Client,
}

impl std::fmt::Debug for OpenAiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEngine")
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiEngine {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ParleyError::Provider(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Build the streaming chat-completions body.
    pub fn build_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Value {
        let wire_messages: Vec<Value> = messages.iter().map(message_to_wire).collect();
        let mut body = json!({
            "model": options.model.as_deref().unwrap_or(&self.model),
            "messages": wire_messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }
}

fn message_to_wire(message: &ChatMessage) -> Value {
    let mut wire = json!({
        "role": message.role,
        "content": message.content,
    });
    if let Some(ref calls) = message.tool_calls {
        wire["tool_calls"] = Value::Array(
            calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect(),
        );
    }
    if let Some(ref id) = message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

async fn error_from_response(response: reqwest::Response) -> ParleyError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or(text);
    ParleyError::Provider(format!("HTTP {} from engine: {}", status, detail))
}

#[async_trait]
impl GenerationEngine for OpenAiEngine {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        options: ChatOptions,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let body = self.build_body(&messages, &tools, &options);
        debug!(model = %body["model"], tools = tools.len(), "Engine streaming request");

        let request = self.client.post(self.endpoint("chat/completions")).json(&body);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ParleyError::Provider(format!("Engine request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut bytes = Box::pin(response.bytes_stream());

        tokio::spawn(async move {
            let mut acc = SseAccumulator::default();
            let mut pending: Vec<u8> = Vec::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::Error(format!("stream read failed: {}", e)))
                            .await;
                        return;
                    }
                };
                pending.extend_from_slice(&chunk);

                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line_bytes: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes);
                    match acc.feed_line(line.trim()) {
                        SseLine::Delta(text) => {
                            if tx.send(StreamEvent::Delta(text)).await.is_err() {
                                // Receiver dropped (turn cancelled): stop reading.
                                return;
                            }
                        }
                        SseLine::Done => {
                            let _ = tx.send(acc.finish()).await;
                            return;
                        }
                        SseLine::Malformed(err) => {
                            warn!("Skipping malformed SSE payload: {}", err);
                        }
                        SseLine::Nothing => {}
                    }
                }
            }

            // Some servers close without a [DONE] sentinel; a trailing line
            // may also lack its newline.
            let tail = String::from_utf8_lossy(&pending).into_owned();
            if let SseLine::Delta(text) = acc.feed_line(tail.trim()) {
                if tx.send(StreamEvent::Delta(text)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(acc.finish_at_eof()).await;
        });

        Ok(rx)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.embedding_model, "input": texts });
        let request = self.client.post(self.endpoint("embeddings")).json(&body);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ParleyError::Provider(format!("Embedding request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let json: Value = response.json().await.map_err(|e| {
            ParleyError::Provider(format!("Failed to parse embedding response: {}", e))
        })?;
        parse_embeddings(&json, texts.len())
    }
}

/// Extract `data[].embedding`, ordered by `index`.
fn parse_embeddings(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json["data"]
        .as_array()
        .ok_or_else(|| ParleyError::Provider("Embedding response has no data".into()))?;
    let mut indexed: Vec<(usize, Vec<f32>)> = data
        .iter()
        .enumerate()
        .map(|(pos, item)| {
            let index = item["index"].as_u64().map(|i| i as usize).unwrap_or(pos);
            let vector = item["embedding"]
                .as_array()
                .map(|v| v.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
                .unwrap_or_default();
            (index, vector)
        })
        .collect();
    indexed.sort_by_key(|(i, _)| *i);
    if indexed.len() != expected {
        return Err(ParleyError::Provider(format!(
            "Expected {} embeddings, got {}",
            expected,
            indexed.len()
        )));
    }
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Malformed(String),
    Nothing,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates one streamed completion.
#[derive(Debug, Default)]
struct SseAccumulator {
    content: String,
    tool_calls: BTreeMap<u64, PartialToolCall>,
    usage: Option<Usage>,
    /// Set once any choice reports a `finish_reason`.
    finish_reason: Option<String>,
}

impl SseAccumulator {
    fn feed_line(&mut self, line: &str) -> SseLine {
        let Some(data) = line.strip_prefix("data:") else {
            return SseLine::Nothing;
        };
        let data = data.trim();
        if data.is_empty() {
            return SseLine::Nothing;
        }
        if data == "[DONE]" {
            return SseLine::Done;
        }
        let payload: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return SseLine::Malformed(e.to_string()),
        };

        if let Some(usage) = payload.get("usage").filter(|u| u.is_object()) {
            let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
            let completion = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
            self.usage = Some(Usage::new(prompt, completion));
        }

        if let Some(reason) = payload["choices"][0]["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = &payload["choices"][0]["delta"];
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    entry.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    entry.arguments.push_str(args);
                }
            }
        }

        match delta["content"].as_str() {
            Some(text) if !text.is_empty() => {
                self.content.push_str(text);
                SseLine::Delta(text.to_string())
            }
            _ => SseLine::Nothing,
        }
    }

    /// Result for a stream that ended without `[DONE]`. Only a completion
    /// that reported a `finish_reason` counts as whole; anything else is a
    /// cut connection.
    fn finish_at_eof(self) -> StreamEvent {
        if self.finish_reason.is_none() {
            return StreamEvent::Error(
                "stream closed before the completion finished".to_string(),
            );
        }
        self.finish()
    }

    fn finish(self) -> StreamEvent {
        if !self.tool_calls.is_empty() {
            let calls = self
                .tool_calls
                .into_values()
                .enumerate()
                .map(|(i, c)| {
                    let id = if c.id.is_empty() {
                        format!("call_{i}")
                    } else {
                        c.id
                    };
                    let args = if c.arguments.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        c.arguments
                    };
                    ToolCallRequest::new(&id, &c.name, &args)
                })
                .collect();
            return StreamEvent::ToolCalls(calls);
        }
        StreamEvent::Done {
            content: self.content,
            usage: self.usage,
        }
    }
}
