//! Streaming generation with the engine-driven tool loop.
//!
//! Each round streams deltas to the conversation's subscribers as they
//! arrive. A round that ends in tool calls runs them through the router and
//! feeds the results back; tool failures go back to the engine as text, and
//! the engine decides what to do with them.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conversation::estimate_tokens;
use crate::providers::{
    ChatMessage, ChatOptions, GenerationEngine, StreamEvent, ToolCallRequest, ToolDefinition,
};
use crate::tools::sanitize::{sanitize_tool_output, MAX_TOOL_RESULT_BYTES};
use crate::tools::ToolRouter;
use crate::transport::{Broadcaster, ConversationEvent};

/// How a generation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed {
        content: String,
        token_count: u32,
        tool_calls: usize,
    },
    /// The engine failed; `partial` is what had already been delivered.
    Failed {
        partial: String,
        chunks: u64,
        error: String,
    },
    Cancelled {
        partial: String,
        chunks: u64,
    },
}

/// Everything one generation needs, borrowed from the pipeline.
pub(crate) struct Generation<'a> {
    pub engine: &'a Arc<dyn GenerationEngine>,
    pub router: &'a ToolRouter,
    pub broadcaster: &'a Arc<dyn Broadcaster>,
    pub conversation_id: &'a str,
    pub turn_id: &'a str,
    pub cancel: &'a CancellationToken,
    pub max_tool_iterations: usize,
    pub deadline: Instant,
    pub options: ChatOptions,
}

/// Result of one engine round.
enum Round {
    Answer { content: String, completion_tokens: Option<u32> },
    Tools { content: String, calls: Vec<ToolCallRequest> },
    Failed(String),
    Cancelled,
}

impl Generation<'_> {
    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> GenerationOutcome {
        let mut streamed = String::new();
        let mut seq: u64 = 0;
        let mut tool_calls = 0usize;

        for round in 0..=self.max_tool_iterations {
            // Out of tool rounds: offer nothing so the engine has to answer.
            let offered = if round < self.max_tool_iterations {
                tools.clone()
            } else {
                Vec::new()
            };
            match self
                .round(messages.clone(), offered, &mut streamed, &mut seq)
                .await
            {
                Round::Answer {
                    content,
                    completion_tokens,
                } => {
                    if streamed.is_empty() && !content.is_empty() {
                        // Engine sent no deltas; deliver the answer as one chunk.
                        self.emit(&mut seq, &content).await;
                        streamed.push_str(&content);
                    }
                    let token_count =
                        completion_tokens.unwrap_or_else(|| estimate_tokens(&streamed));
                    return GenerationOutcome::Completed {
                        content: streamed,
                        token_count,
                        tool_calls,
                    };
                }
                Round::Tools { content, calls } => {
                    if calls.is_empty() {
                        return self.failed(streamed, seq, "engine sent an empty tool call batch");
                    }
                    if round == self.max_tool_iterations {
                        return self.failed(
                            streamed,
                            seq,
                            "engine kept requesting tools after the iteration limit",
                        );
                    }
                    tool_calls += calls.len();
                    messages.push(ChatMessage::assistant_with_tools(&content, calls.clone()));
                    let results = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            return GenerationOutcome::Cancelled { partial: streamed, chunks: seq };
                        }
                        results = self.run_tools(&calls) => results,
                    };
                    messages.extend(results);
                }
                Round::Failed(error) => return self.failed(streamed, seq, &error),
                Round::Cancelled => {
                    return GenerationOutcome::Cancelled {
                        partial: streamed,
                        chunks: seq,
                    }
                }
            }
        }
        self.failed(streamed, seq, "tool loop exhausted")
    }

    fn failed(&self, partial: String, chunks: u64, error: &str) -> GenerationOutcome {
        warn!(
            conversation_id = self.conversation_id,
            turn_id = self.turn_id,
            chunks,
            error,
            "Generation failed"
        );
        GenerationOutcome::Failed {
            partial,
            chunks,
            error: error.to_string(),
        }
    }

    async fn emit(&self, seq: &mut u64, text: &str) {
        self.broadcaster
            .broadcast(
                self.conversation_id,
                ConversationEvent::Chunk {
                    turn_id: self.turn_id.to_string(),
                    seq: *seq,
                    text: text.to_string(),
                },
            )
            .await;
        *seq += 1;
    }

    async fn round(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        streamed: &mut String,
        seq: &mut u64,
    ) -> Round {
        if self.cancel.is_cancelled() {
            return Round::Cancelled;
        }
        let round_start = streamed.len();
        let start = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Round::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => {
                return Round::Failed("generation timed out".into())
            }
            started = self.engine.chat_stream(messages, tools, self.options.clone()) => started,
        };
        let mut rx = match start {
            Ok(rx) => rx,
            Err(e) => return Round::Failed(e.to_string()),
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Round::Cancelled,
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Round::Failed("generation timed out".into())
                }
                event = rx.recv() => event,
            };
            match event {
                Some(StreamEvent::Delta(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.emit(seq, &text).await;
                    streamed.push_str(&text);
                }
                Some(StreamEvent::ToolCalls(calls)) => {
                    let content = streamed[round_start..].to_string();
                    return Round::Tools { content, calls };
                }
                Some(StreamEvent::Done { content, usage }) => {
                    return Round::Answer {
                        content,
                        completion_tokens: usage.map(|u| u.completion_tokens),
                    };
                }
                Some(StreamEvent::Error(e)) => return Round::Failed(e),
                None => return Round::Failed("engine stream ended without a result".into()),
            }
        }
    }

    /// Run one batch of tool calls concurrently, returning the tool-result
    /// messages in call order.
    async fn run_tools(&self, calls: &[ToolCallRequest]) -> Vec<ChatMessage> {
        let invocations = calls.iter().map(|call| async move {
            let arguments: Value = if call.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&call.arguments).unwrap_or(Value::Null)
            };
            debug!(tool = %call.name, turn_id = self.turn_id, "Tool call requested");
            let output = match self.router.invoke(&call.name, arguments).await {
                Ok(output) => sanitize_tool_output(&output, MAX_TOOL_RESULT_BYTES),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool call failed, reporting to engine");
                    format!("Tool error: {e}")
                }
            };
            ChatMessage::tool_result(&call.id, &output)
        });
        join_all(invocations).await
    }
}
