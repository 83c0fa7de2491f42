//! Per-turn orchestration.
//!
//! [`ConversationPipeline::handle_turn`] walks one user message through
//! ownership check, response-cache lookup, streamed generation (with tool
//! calls routed through [`ToolRouter`]) and write-through persistence:
//!
//! ```text
//! Received → OwnershipCheck → CacheLookup ─┬─ Hit → Persisted
//!                                          └─ Generating → (ToolCall)* → Completed → Persisted
//! ```
//!
//! A turn that fails ownership ends in `Rejected` with nothing written. A
//! generation failure ends in `Failed`; text already streamed is kept as a
//! truncated message but never cached.

pub mod generation;
pub mod guard;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{HitSource, ResponseCache};
use crate::config::{CacheConfig, PipelineConfig, SessionConfig, ToolsConfig};
use crate::conversation::{
    derive_title, BoundResource, ConversationSession, ConversationStore, MemoryConversationStore,
    Message, MessageFlagsPatch, MetadataPatch, ReportInfo,
};
use crate::error::{ParleyError, Result};
use crate::providers::{ChatMessage, ChatOptions, GenerationEngine};
use crate::session::SessionCache;
use crate::tools::sanitize::truncate_on_char_boundary;
use crate::tools::{McpConnector, ToolRouter, ToolSet};
use crate::transport::{Broadcaster, ConversationEvent, EventBus};

pub use generation::GenerationOutcome;
pub use guard::{ActiveTurns, TurnPermit};

use generation::Generation;

/// Largest slice of a bound resource handed to the engine as context.
const RESOURCE_CONTEXT_BYTES: usize = 24_000;

// ---- Turn types ----

/// One user message addressed to the pipeline.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    /// `None` starts a new conversation.
    pub conversation_id: Option<String>,
    pub content: String,
    /// Binds a new conversation to an external resource. Ignored for
    /// existing conversations.
    pub resource: Option<BoundResource>,
}

impl TurnRequest {
    pub fn new(user_id: &str, content: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: None,
            content: content.to_string(),
            resource: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    pub fn with_resource(mut self, url: &str, content: &str) -> Self {
        self.resource = Some(BoundResource {
            url: url.to_string(),
            content: content.to_string(),
        });
        self
    }
}

/// States a turn passes through, recorded in order on the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    OwnershipCheck,
    CacheLookup,
    Hit,
    Generating,
    ToolCall,
    Completed,
    Persisted,
    Rejected,
    Failed,
}

impl TurnState {
    /// Terminal state of a turn that ended with `error`.
    pub fn for_error(error: &ParleyError) -> Option<Self> {
        match error {
            ParleyError::OwnershipViolation { .. } | ParleyError::TurnInProgress(_) => {
                Some(Self::Rejected)
            }
            ParleyError::GenerationFailed(_) | ParleyError::Cancelled => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Where the assistant message of a turn came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSource {
    Cache(HitSource),
    Generated { tool_calls: usize },
}

/// A turn that reached `Persisted`.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Id shared by every event broadcast for this turn.
    pub turn_id: String,
    /// The conversation the turn landed in; freshly minted for a new one.
    pub conversation_id: String,
    /// The persisted user message.
    pub user_message: Message,
    /// The persisted answer, cached or generated.
    pub assistant_message: Message,
    /// Where the answer came from.
    pub source: ResponseSource,
    /// Tool set offered to the engine; `None` when the cache answered.
    pub tool_set: Option<ToolSet>,
    /// Context depth of the user message (prior messages plus one).
    pub depth: usize,
    /// States the turn passed through, in order.
    pub states: Vec<TurnState>,
}

// ---- Pipeline ----

pub struct ConversationPipeline {
    config: PipelineConfig,
    store: Arc<dyn ConversationStore>,
    sessions: SessionCache,
    cache: Arc<ResponseCache>,
    router: Arc<ToolRouter>,
    engine: Arc<dyn GenerationEngine>,
    broadcaster: Arc<dyn Broadcaster>,
    options: ChatOptions,
    turns: ActiveTurns,
}

impl ConversationPipeline {
    pub fn builder() -> ConversationPipelineBuilder {
        ConversationPipelineBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    /// Whether `conversation_id` has a turn in flight.
    pub fn is_turn_active(&self, conversation_id: &str) -> bool {
        self.turns.is_active(conversation_id)
    }

    /// Cancel the in-flight turn of `conversation_id`. Returns `false` when
    /// none is running.
    pub fn cancel_turn(&self, conversation_id: &str) -> bool {
        self.turns.cancel(conversation_id)
    }

    /// Process one user turn.
    ///
    /// Chunks and the final message are broadcast to the conversation as
    /// they happen. Errors returned here are the ones the user sees:
    /// ownership, a concurrent turn, generation failure, cancellation and
    /// durable-store failures. Cache and tool problems never surface.
    pub async fn handle_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let turn_id = uuid::Uuid::new_v4().to_string();
        let mut states = vec![TurnState::Received, TurnState::OwnershipCheck];

        let (mut session, is_new, _permit) = match request.conversation_id.as_deref() {
            Some(id) => {
                self.owned_session(&request.user_id, id).await?;
                let permit = self.turns.begin(id, cancel.clone())?;
                // Reload under the permit: a turn that finished while the
                // ownership check was loading has already moved the log on.
                let session = self.owned_session(&request.user_id, id).await?;
                (session, false, permit)
            }
            None => {
                let session = ConversationSession::new(&request.user_id, request.resource.clone());
                let permit = self.turns.begin(&session.id, cancel.clone())?;
                (session, true, permit)
            }
        };
        if !is_new && request.resource.is_some() && session.resource.is_none() {
            debug!(conversation_id = %session.id, "Resource ignored for existing conversation");
        }

        let depth = session.next_depth();
        info!(
            conversation_id = %session.id,
            turn_id = %turn_id,
            depth,
            new = is_new,
            "Turn received"
        );

        // Only the opening turn of a bound conversation is a resource summary.
        let resource_url = match session.resource {
            Some(ref r) if session.message_count == 0 => Some(r.url.clone()),
            _ => None,
        };

        states.push(TurnState::CacheLookup);
        let hit = match resource_url {
            Some(ref url) => self.cache.get_resource(url).await,
            None => {
                self.cache
                    .lookup(&session.messages, &request.content, depth)
                    .await
            }
        };

        if let Some(hit) = hit {
            states.push(TurnState::Hit);
            let user_message = Message::user(&session.id, &request.content);
            let assistant_message =
                Message::assistant(&session.id, &hit.response, hit.token_count);
            self.broadcast_chunk(&session.id, &turn_id, 0, &hit.response)
                .await;
            self.persist_turn(
                &mut session,
                is_new,
                user_message.clone(),
                assistant_message.clone(),
            )
            .await
            .map_err(|e| self.report_store_error(&session.id, &turn_id, e))?;
            states.push(TurnState::Persisted);
            self.broadcaster
                .broadcast(
                    &session.id,
                    ConversationEvent::FinalMessage {
                        turn_id: turn_id.clone(),
                        message: assistant_message.clone(),
                        cached: true,
                    },
                )
                .await;
            info!(conversation_id = %session.id, source = ?hit.source, "Turn served from cache");
            return Ok(TurnOutcome {
                turn_id,
                conversation_id: session.id,
                user_message,
                assistant_message,
                source: ResponseSource::Cache(hit.source),
                tool_set: None,
                depth,
                states,
            });
        }

        let (tool_set, tools) = self.router.select_tools(&request.content).await;
        states.push(TurnState::Generating);
        let run = Generation {
            engine: &self.engine,
            router: &self.router,
            broadcaster: &self.broadcaster,
            conversation_id: &session.id,
            turn_id: &turn_id,
            cancel: &cancel,
            max_tool_iterations: self.config.max_tool_iterations,
            deadline: tokio::time::Instant::now()
                + Duration::from_secs(self.config.generation_timeout_secs.max(1)),
            options: self.options.clone(),
        };
        let outcome = run
            .run(self.engine_context(&session, &request.content), tools)
            .await;

        let user_message = Message::user(&session.id, &request.content);
        match outcome {
            GenerationOutcome::Completed {
                content,
                token_count,
                tool_calls,
            } => {
                if tool_calls > 0 {
                    states.push(TurnState::ToolCall);
                }
                states.push(TurnState::Completed);
                let context = session.messages.clone();
                let assistant_message = Message::assistant(&session.id, &content, token_count);
                self.persist_turn(
                    &mut session,
                    is_new,
                    user_message.clone(),
                    assistant_message.clone(),
                )
                .await
                .map_err(|e| self.report_store_error(&session.id, &turn_id, e))?;
                states.push(TurnState::Persisted);

                match resource_url {
                    Some(ref url) => {
                        self.cache
                            .store_resource(url, &content, token_count)
                            .await
                    }
                    None => {
                        self.cache
                            .store_turn(&context, &request.content, &content, token_count, depth)
                            .await
                    }
                }

                self.broadcaster
                    .broadcast(
                        &session.id,
                        ConversationEvent::FinalMessage {
                            turn_id: turn_id.clone(),
                            message: assistant_message.clone(),
                            cached: false,
                        },
                    )
                    .await;
                info!(
                    conversation_id = %session.id,
                    tokens = token_count,
                    tool_calls,
                    "Turn completed"
                );
                Ok(TurnOutcome {
                    turn_id,
                    conversation_id: session.id,
                    user_message,
                    assistant_message,
                    source: ResponseSource::Generated { tool_calls },
                    tool_set: Some(tool_set),
                    depth,
                    states,
                })
            }
            GenerationOutcome::Failed {
                partial,
                chunks,
                error,
            } => {
                if chunks > 0 {
                    self.persist_partial(&mut session, is_new, user_message, &partial)
                        .await;
                }
                self.broadcaster
                    .broadcast(
                        &session.id,
                        ConversationEvent::Error {
                            turn_id,
                            message: error.clone(),
                        },
                    )
                    .await;
                Err(ParleyError::GenerationFailed(error))
            }
            GenerationOutcome::Cancelled { partial, chunks } => {
                info!(conversation_id = %session.id, chunks, "Turn cancelled");
                self.persist_partial(&mut session, is_new, user_message, &partial)
                    .await;
                Err(ParleyError::Cancelled)
            }
        }
    }

    /// Engine context: system prompt (with any bound resource), prior
    /// messages, then the new user message.
    fn engine_context(&self, session: &ConversationSession, content: &str) -> Vec<ChatMessage> {
        let mut system = self.config.system_prompt.clone();
        if let Some(ref resource) = session.resource {
            system.push_str(&format!(
                "\n\nThis conversation is about {}. Its content:\n{}",
                resource.url,
                truncate_on_char_boundary(&resource.content, RESOURCE_CONTEXT_BYTES)
            ));
        }
        let mut messages = Vec::with_capacity(session.messages.len() + 2);
        messages.push(ChatMessage::system(&system));
        messages.extend(session.messages.iter().map(ChatMessage::from));
        messages.push(ChatMessage::user(content));
        messages
    }

    /// Append both messages of a turn to the durable store, then refresh the
    /// session cache. A new conversation is created here, so a turn that
    /// never gets this far leaves no trace.
    async fn persist_turn(
        &self,
        session: &mut ConversationSession,
        is_new: bool,
        user_message: Message,
        assistant_message: Message,
    ) -> Result<()> {
        if is_new && session.message_count == 0 {
            session.title = derive_title(&user_message.content, self.config.title_max_chars);
            self.store.create_conversation(session).await?;
        }
        let batch = [user_message, assistant_message];
        self.store.append_messages(&session.id, &batch).await?;

        let ceiling = self.sessions.context_ceiling();
        let was_full = session.is_context_full;
        for message in batch {
            session.record_message(message, ceiling);
        }
        if session.is_context_full && !was_full {
            info!(
                conversation_id = %session.id,
                messages = session.message_count,
                "Conversation reached its context ceiling"
            );
        }
        self.store
            .update_metadata(&session.id, &MetadataPatch::counters_of(session))
            .await?;
        self.sessions
            .put(&session.user_id, &session.id, session.clone(), None)
            .await;
        Ok(())
    }

    /// Keep the text streamed before a failure or cancellation.
    async fn persist_partial(
        &self,
        session: &mut ConversationSession,
        is_new: bool,
        user_message: Message,
        partial: &str,
    ) {
        if !self.config.persist_partial || partial.is_empty() {
            return;
        }
        let assistant_message = Message::assistant(
            &session.id,
            partial,
            crate::conversation::estimate_tokens(partial),
        )
        .into_truncated();
        match self
            .persist_turn(session, is_new, user_message, assistant_message)
            .await
        {
            Ok(()) => debug!(conversation_id = %session.id, "Partial answer persisted"),
            Err(e) => warn!(
                conversation_id = %session.id,
                error = %e,
                "Failed to persist partial answer"
            ),
        }
    }

    fn report_store_error(
        &self,
        conversation_id: &str,
        turn_id: &str,
        e: ParleyError,
    ) -> ParleyError {
        warn!(conversation_id, turn_id, error = %e, "Failed to persist turn");
        e
    }

    async fn broadcast_chunk(&self, conversation_id: &str, turn_id: &str, seq: u64, text: &str) {
        self.broadcaster
            .broadcast(
                conversation_id,
                ConversationEvent::Chunk {
                    turn_id: turn_id.to_string(),
                    seq,
                    text: text.to_string(),
                },
            )
            .await;
    }

    // ---- Conversation management ----

    /// The conversation, if `user_id` owns it. Reads through the session
    /// cache and repairs it from the durable store on a miss.
    async fn owned_session(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationSession> {
        match self
            .sessions
            .get_or_load(self.store.as_ref(), user_id, conversation_id)
            .await?
        {
            Some(session) if session.user_id == user_id => Ok(session),
            _ => {
                warn!(user_id, conversation_id, "Rejected access to conversation");
                Err(ParleyError::OwnershipViolation {
                    user_id: user_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                })
            }
        }
    }

    pub async fn conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationSession> {
        self.owned_session(user_id, conversation_id).await
    }

    pub async fn rename_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
        title: &str,
    ) -> Result<()> {
        self.owned_session(user_id, conversation_id).await?;
        let title = match title.trim() {
            "" => "New conversation",
            t => t,
        };
        self.store
            .update_metadata(
                conversation_id,
                &MetadataPatch {
                    title: Some(title.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.sessions
            .rename_title(user_id, conversation_id, title)
            .await;
        Ok(())
    }

    /// Flip the starred flag of a message. Returns the new value.
    pub async fn toggle_star(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<bool> {
        let session = self.owned_session(user_id, conversation_id).await?;
        let starred = !session
            .message(message_id)
            .ok_or_else(|| ParleyError::NotFound(format!("message '{message_id}'")))?
            .starred;
        self.store
            .update_message_flags(
                conversation_id,
                message_id,
                &MessageFlagsPatch {
                    starred: Some(starred),
                    ..Default::default()
                },
            )
            .await?;
        self.sessions
            .set_star(user_id, conversation_id, message_id, starred)
            .await;
        Ok(starred)
    }

    pub async fn report_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        reason: &str,
    ) -> Result<()> {
        let session = self.owned_session(user_id, conversation_id).await?;
        if session.message(message_id).is_none() {
            return Err(ParleyError::NotFound(format!("message '{message_id}'")));
        }
        let report = ReportInfo {
            reason: reason.to_string(),
            at: chrono::Utc::now(),
        };
        self.store
            .update_message_flags(
                conversation_id,
                message_id,
                &MessageFlagsPatch {
                    reported: Some(report),
                    ..Default::default()
                },
            )
            .await?;
        self.sessions
            .mark_reported(user_id, conversation_id, message_id, reason)
            .await;
        info!(conversation_id, message_id, "Message reported");
        Ok(())
    }

    /// Delete a conversation with its messages, cancelling any turn in
    /// flight on it.
    pub async fn delete_conversation(&self, user_id: &str, conversation_id: &str) -> Result<()> {
        self.owned_session(user_id, conversation_id).await?;
        self.turns.cancel(conversation_id);
        self.store.delete_conversation(conversation_id).await?;
        self.sessions.delete(user_id, conversation_id).await;
        info!(conversation_id, "Conversation deleted");
        Ok(())
    }

    /// Dispose tool providers.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
    }
}

// ---- Builder ----

/// Builder for [`ConversationPipeline`]. Only the engine is required; every
/// other collaborator falls back to an in-process default.
pub struct ConversationPipelineBuilder {
    config: PipelineConfig,
    engine: Option<Arc<dyn GenerationEngine>>,
    store: Option<Arc<dyn ConversationStore>>,
    sessions: Option<SessionCache>,
    cache: Option<Arc<ResponseCache>>,
    router: Option<Arc<ToolRouter>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    options: ChatOptions,
}

impl ConversationPipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            engine: None,
            store: None,
            sessions: None,
            cache: None,
            router: None,
            broadcaster: None,
            options: ChatOptions::default(),
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the generation engine (required).
    pub fn engine(mut self, engine: Arc<dyn GenerationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sessions(mut self, sessions: SessionCache) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn router(mut self, router: Arc<ToolRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns `Err` if no engine was set.
    pub fn build(self) -> Result<ConversationPipeline> {
        let engine = self.engine.ok_or_else(|| {
            ParleyError::Config(
                "ConversationPipeline requires an engine. Call .engine() on the builder.".into(),
            )
        })?;
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(ResponseCache::new(
                CacheConfig::default(),
                Some(Arc::clone(&engine)),
            ))
        });
        let router = self.router.unwrap_or_else(|| {
            Arc::new(ToolRouter::new(ToolsConfig::default(), Arc::new(McpConnector)))
        });
        let chunk_buffer = self.config.chunk_buffer;
        Ok(ConversationPipeline {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryConversationStore::new())),
            sessions: self
                .sessions
                .unwrap_or_else(|| SessionCache::new(&SessionConfig::default())),
            broadcaster: self
                .broadcaster
                .unwrap_or_else(|| Arc::new(EventBus::new(chunk_buffer))),
            config: self.config,
            cache,
            router,
            engine,
            options: self.options,
            turns: ActiveTurns::new(),
        })
    }
}

impl Default for ConversationPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ToolProviderConfig;
    use crate::providers::{ChatRole, StreamEvent, ToolCallRequest, ToolDefinition, Usage};
    use crate::tools::registry::tests::StaticProvider;
    use crate::tools::{ProviderConnector, ToolProvider};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    /// Plays back one scripted event list per engine round.
    pub(crate) struct ScriptedEngine {
        rounds: StdMutex<VecDeque<Vec<StreamEvent>>>,
        /// Keep each stream open after its events until the receiver goes.
        hold_open: bool,
        pub calls: AtomicUsize,
        pub seen: StdMutex<Vec<(Vec<ChatMessage>, Vec<String>)>>,
    }

    impl ScriptedEngine {
        pub(crate) fn new(rounds: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: StdMutex::new(rounds.into()),
                hold_open: false,
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
            })
        }

        pub(crate) fn hanging(rounds: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: StdMutex::new(rounds.into()),
                hold_open: true,
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
            })
        }

        pub(crate) fn answer(text: &str) -> Vec<StreamEvent> {
            vec![
                StreamEvent::Delta(text.to_string()),
                StreamEvent::Done {
                    content: text.to_string(),
                    usage: Some(Usage::new(10, 4)),
                },
            ]
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn tools_seen(&self, round: usize) -> Vec<String> {
            self.seen.lock().unwrap()[round].1.clone()
        }

        fn messages_seen(&self, round: usize) -> Vec<ChatMessage> {
            self.seen.lock().unwrap()[round].0.clone()
        }
    }

    #[async_trait]
    impl GenerationEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat_stream(
            &self,
            messages: Vec<ChatMessage>,
            tools: Vec<ToolDefinition>,
            _options: ChatOptions,
        ) -> Result<mpsc::Receiver<StreamEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((messages, tools.into_iter().map(|t| t.name).collect()));
            let events = self
                .rounds
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ParleyError::Provider("script exhausted".into()))?;
            let hold_open = self.hold_open;
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                if hold_open {
                    tx.closed().await;
                }
            });
            Ok(rx)
        }

        /// Every text lands on the same point, so any two turns are neighbours.
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Records every event with its conversation.
    #[derive(Default)]
    pub(crate) struct RecordingBroadcaster {
        pub events: StdMutex<Vec<(String, ConversationEvent)>>,
    }

    impl RecordingBroadcaster {
        fn all(&self) -> Vec<(String, ConversationEvent)> {
            self.events.lock().unwrap().clone()
        }

        fn chunks(&self) -> Vec<String> {
            self.all()
                .into_iter()
                .filter_map(|(_, e)| match e {
                    ConversationEvent::Chunk { text, .. } => Some(text),
                    _ => None,
                })
                .collect()
        }

        fn count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn broadcast(&self, conversation_id: &str, event: ConversationEvent) {
            self.events
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), event));
        }
    }

    struct StaticConnector(Vec<Arc<StaticProvider>>);

    #[async_trait]
    impl ProviderConnector for StaticConnector {
        async fn connect(&self, config: &ToolProviderConfig) -> Result<Arc<dyn ToolProvider>> {
            self.0
                .iter()
                .find(|p| p.name == config.name)
                .map(|p| p.clone() as Arc<dyn ToolProvider>)
                .ok_or_else(|| ParleyError::Provider(format!("unknown provider {}", config.name)))
        }
    }

    struct Harness {
        pipeline: Arc<ConversationPipeline>,
        engine: Arc<ScriptedEngine>,
        events: Arc<RecordingBroadcaster>,
        store: Arc<MemoryConversationStore>,
    }

    async fn harness(engine: Arc<ScriptedEngine>) -> Harness {
        let tools = ToolsConfig {
            providers: vec![ToolProviderConfig {
                name: "gh".into(),
                url: Some("http://gh.invalid/rpc".into()),
                ..Default::default()
            }],
            trigger_keywords: vec!["github".into(), "repo".into(), "repository".into()],
            essential_tools: vec!["web_search".into()],
            ..ToolsConfig::default()
        };
        let connector =
            StaticConnector(vec![StaticProvider::new("gh", &["web_search", "list_issues"])]);
        let router = Arc::new(ToolRouter::new(tools, Arc::new(connector)));
        router.initialize().await;

        let store = Arc::new(MemoryConversationStore::new());
        let events = Arc::new(RecordingBroadcaster::default());
        let pipeline = ConversationPipeline::builder()
            .engine(engine.clone())
            .store(store.clone())
            .cache(Arc::new(ResponseCache::new(CacheConfig::default(), None)))
            .router(router)
            .broadcaster(events.clone())
            .build()
            .unwrap();
        Harness {
            pipeline: Arc::new(pipeline),
            engine,
            events,
            store,
        }
    }

    /// Pipeline without tool providers, for tests that tune the cache,
    /// session or persistence settings.
    fn custom_pipeline(
        engine: Arc<ScriptedEngine>,
        store: Arc<dyn ConversationStore>,
        config: PipelineConfig,
        session: SessionConfig,
        cache: CacheConfig,
        events: Arc<RecordingBroadcaster>,
    ) -> Arc<ConversationPipeline> {
        let embedder: Arc<dyn GenerationEngine> = engine.clone();
        let pipeline = ConversationPipeline::builder()
            .config(config)
            .engine(engine)
            .store(store)
            .sessions(SessionCache::new(&session))
            .cache(Arc::new(ResponseCache::new(cache, Some(embedder))))
            .broadcaster(events)
            .build()
            .unwrap();
        Arc::new(pipeline)
    }

    fn no_cache() -> CacheConfig {
        CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        }
    }

    /// A stored conversation of `n` alternating question/answer messages.
    fn seeded_session(user: &str, n: usize) -> ConversationSession {
        let mut session = ConversationSession::new(user, None);
        for i in 0..n {
            let id = session.id.clone();
            let msg = if i % 2 == 0 {
                Message::user(&id, &format!("question {i}"))
            } else {
                Message::assistant(&id, &format!("answer {i}"), 2)
            };
            session.record_message(msg, 0);
        }
        session
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_hi_turn_generates_and_caches_for_21_days() {
        let h = harness(ScriptedEngine::new(vec![vec![
            StreamEvent::Delta("Hello".into()),
            StreamEvent::Delta(" there".into()),
            StreamEvent::Done {
                content: "Hello there".into(),
                usage: Some(Usage::new(5, 2)),
            },
        ]]))
        .await;

        let outcome = h
            .pipeline
            .handle_turn(TurnRequest::new("alice", "hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.tool_set, Some(ToolSet::Essential));
        assert_eq!(h.engine.tools_seen(0), vec!["web_search"]);
        assert_eq!(outcome.source, ResponseSource::Generated { tool_calls: 0 });
        assert_eq!(outcome.depth, 1);
        assert_eq!(outcome.assistant_message.content, "Hello there");
        assert_eq!(outcome.assistant_message.token_count, 2);
        assert_eq!(
            outcome.states,
            vec![
                TurnState::Received,
                TurnState::OwnershipCheck,
                TurnState::CacheLookup,
                TurnState::Generating,
                TurnState::Completed,
                TurnState::Persisted,
            ]
        );

        let stats = h.pipeline.cache().stats().await;
        assert_eq!(stats.exact_entries, 1);
        assert_eq!(h.pipeline.cache().ttl_days(outcome.depth), 21.0);

        assert_eq!(h.events.chunks(), vec!["Hello", " there"]);
        let all = h.events.all();
        assert!(matches!(
            all.last().unwrap().1,
            ConversationEvent::FinalMessage { cached: false, .. }
        ));

        let stored = h
            .store
            .get_conversation(&outcome.conversation_id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.message_count, 2);
        assert_eq!(stored.title, "hi");
        let cached = h
            .pipeline
            .sessions()
            .get("alice", &outcome.conversation_id)
            .await
            .unwrap();
        assert_eq!(cached.message_count, 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_generation_but_persists_turn() {
        let h = harness(ScriptedEngine::new(vec![ScriptedEngine::answer("Hi!")])).await;
        h.pipeline
            .handle_turn(TurnRequest::new("alice", "hi"), CancellationToken::new())
            .await
            .unwrap();

        let second = h
            .pipeline
            .handle_turn(TurnRequest::new("alice", "hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.engine.calls(), 1);
        assert_eq!(second.source, ResponseSource::Cache(HitSource::Exact));
        assert_eq!(second.assistant_message.content, "Hi!");
        assert!(second.states.contains(&TurnState::Hit));
        assert!(!second.states.contains(&TurnState::Generating));
        assert_eq!(h.store.len().await, 2);
        let stored = h
            .store
            .get_conversation(&second.conversation_id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert!(h.events.all().iter().any(|(_, e)| matches!(
            e,
            ConversationEvent::FinalMessage { cached: true, .. }
        )));
    }

    #[tokio::test]
    async fn test_ninth_message_always_generates_live() {
        let h = harness(ScriptedEngine::new(vec![ScriptedEngine::answer("fresh")])).await;
        let mut session = ConversationSession::new("alice", None);
        for i in 0..8 {
            let id = session.id.clone();
            let msg = if i % 2 == 0 {
                Message::user(&id, &format!("question {i}"))
            } else {
                Message::assistant(&id, &format!("answer {i}"), 2)
            };
            session.record_message(msg, 50);
        }
        h.store.create_conversation(&session).await.unwrap();
        // An exact entry for this very context would match if it were consulted.
        h.pipeline
            .cache()
            .store_turn(&session.messages, "again", "stale", 1, 9)
            .await;

        let outcome = h
            .pipeline
            .handle_turn(
                TurnRequest::new("alice", "again").in_conversation(&session.id),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.depth, 9);
        assert_eq!(outcome.source, ResponseSource::Generated { tool_calls: 0 });
        assert_eq!(outcome.assistant_message.content, "fresh");
        assert_eq!(h.engine.calls(), 1);
        assert_eq!(h.engine.messages_seen(0).len(), 10);
    }

    #[tokio::test]
    async fn test_repository_offers_full_catalog() {
        let h = harness(ScriptedEngine::new(vec![ScriptedEngine::answer("ok")])).await;
        let outcome = h
            .pipeline
            .handle_turn(
                TurnRequest::new("alice", "What is in this repository?"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.tool_set, Some(ToolSet::Full));
        let mut tools = h.engine.tools_seen(0);
        tools.sort();
        assert_eq!(tools, vec!["list_issues", "web_search"]);
    }

    #[tokio::test]
    async fn test_foreign_user_is_rejected_without_mutation() {
        let h = harness(ScriptedEngine::new(vec![ScriptedEngine::answer("mine")])).await;
        let first = h
            .pipeline
            .handle_turn(TurnRequest::new("alice", "hello"), CancellationToken::new())
            .await
            .unwrap();
        let events_before = h.events.count();

        let err = h
            .pipeline
            .handle_turn(
                TurnRequest::new("mallory", "hello").in_conversation(&first.conversation_id),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::OwnershipViolation { .. }));
        assert_eq!(h.events.count(), events_before);
        assert_eq!(h.engine.calls(), 1);
        assert!(h
            .pipeline
            .sessions()
            .get("mallory", &first.conversation_id)
            .await
            .is_none());
        let stored = h
            .store
            .get_conversation(&first.conversation_id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert!(h
            .pipeline
            .rename_conversation("mallory", &first.conversation_id, "mine now")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_tool_calls_and_tool_errors_go_back_to_engine() {
        let h = harness(ScriptedEngine::new(vec![
            vec![StreamEvent::ToolCalls(vec![
                ToolCallRequest::new("c1", "web_search", r#"{"q":"rust"}"#),
                ToolCallRequest::new("c2", "no_such_tool", "{}"),
            ])],
            ScriptedEngine::answer("Found it."),
        ]))
        .await;

        let outcome = h
            .pipeline
            .handle_turn(TurnRequest::new("alice", "search rust"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.source, ResponseSource::Generated { tool_calls: 2 });
        assert!(outcome.states.contains(&TurnState::ToolCall));
        assert_eq!(outcome.assistant_message.content, "Found it.");

        let second_round = h.engine.messages_seen(1);
        let results: Vec<&ChatMessage> = second_round
            .iter()
            .filter(|m| m.role == ChatRole::Tool)
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(results[0].content, r#"gh:web_search:{"q":"rust"}"#);
        assert!(results[1].content.starts_with("Tool error:"));
        assert!(results[1].content.contains("no_such_tool"));
    }

    #[tokio::test]
    async fn test_failure_after_chunks_keeps_truncated_answer_uncached() {
        let h = harness(ScriptedEngine::new(vec![vec![
            StreamEvent::Delta("partial ".into()),
            StreamEvent::Error("upstream reset".into()),
        ]]))
        .await;

        let err = h
            .pipeline
            .handle_turn(TurnRequest::new("alice", "tell me"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::GenerationFailed(ref m) if m.contains("upstream reset")));

        let stored = h.store.list_for_user("alice").await;
        assert_eq!(stored.len(), 1);
        let assistant = &stored[0].messages[1];
        assert!(assistant.truncated);
        assert_eq!(assistant.content, "partial ");
        assert_eq!(h.pipeline.cache().stats().await.exact_entries, 0);
        assert!(matches!(
            h.events.all().last().unwrap().1,
            ConversationEvent::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_failure_before_any_chunk_writes_nothing() {
        let h = harness(ScriptedEngine::new(vec![vec![StreamEvent::Error("boom".into())]])).await;
        let err = h
            .pipeline
            .handle_turn(TurnRequest::new("alice", "hi"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::GenerationFailed(_)));
        assert!(h.store.is_empty().await);
        assert_eq!(h.events.count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_forwarding_and_skips_cache() {
        let h = harness(ScriptedEngine::hanging(vec![vec![StreamEvent::Delta(
            "first".into(),
        )]]))
        .await;
        let token = CancellationToken::new();
        let pipeline = h.pipeline.clone();
        let turn_token = token.clone();
        let turn = tokio::spawn(async move {
            pipeline
                .handle_turn(TurnRequest::new("alice", "long story"), turn_token)
                .await
        });

        let events = h.events.clone();
        wait_until(|| events.count() == 1).await;
        token.cancel();
        let result = turn.await.unwrap();
        assert!(matches!(result, Err(ParleyError::Cancelled)));

        assert_eq!(h.events.chunks(), vec!["first"]);
        assert_eq!(h.events.count(), 1);
        assert_eq!(h.pipeline.cache().stats().await.exact_entries, 0);
        let stored = h.store.list_for_user("alice").await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].messages[1].truncated);
        assert_eq!(stored[0].messages[1].content, "first");
    }

    #[tokio::test]
    async fn test_second_turn_on_busy_conversation_is_rejected() {
        let h = harness(ScriptedEngine::hanging(vec![
            ScriptedEngine::answer("one"),
            vec![StreamEvent::Delta("two".into())],
        ]))
        .await;
        let first = h
            .pipeline
            .handle_turn(TurnRequest::new("alice", "start"), CancellationToken::new())
            .await
            .unwrap();
        let conversation_id = first.conversation_id.clone();

        let pipeline = h.pipeline.clone();
        let id = conversation_id.clone();
        let running = tokio::spawn(async move {
            pipeline
                .handle_turn(
                    TurnRequest::new("alice", "keep going").in_conversation(&id),
                    CancellationToken::new(),
                )
                .await
        });
        let probe = h.pipeline.clone();
        let id = conversation_id.clone();
        wait_until(move || probe.is_turn_active(&id)).await;

        let err = h
            .pipeline
            .handle_turn(
                TurnRequest::new("alice", "me too").in_conversation(&conversation_id),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::TurnInProgress(_)));

        assert!(h.pipeline.cancel_turn(&conversation_id));
        assert!(matches!(running.await.unwrap(), Err(ParleyError::Cancelled)));
        assert!(!h.pipeline.is_turn_active(&conversation_id));
    }

    #[tokio::test]
    async fn test_resource_summary_is_cached_by_url() {
        let h = harness(ScriptedEngine::new(vec![ScriptedEngine::answer("A short summary.")])).await;
        let url = "https://example.com/post";
        let first = h
            .pipeline
            .handle_turn(
                TurnRequest::new("alice", "summarize this").with_resource(url, "Long article body"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(first.source, ResponseSource::Generated { tool_calls: 0 });
        let system = &h.engine.messages_seen(0)[0];
        assert_eq!(system.role, ChatRole::System);
        assert!(system.content.contains("Long article body"));

        let second = h
            .pipeline
            .handle_turn(
                TurnRequest::new("bob", "tl;dr please").with_resource(url, "Long article body"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(second.source, ResponseSource::Cache(HitSource::Resource));
        assert_eq!(second.assistant_message.content, "A short summary.");
        assert_eq!(h.engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_management_operations_write_through() {
        let h = harness(ScriptedEngine::new(vec![ScriptedEngine::answer("Sure.")])).await;
        let outcome = h
            .pipeline
            .handle_turn(TurnRequest::new("alice", "hello"), CancellationToken::new())
            .await
            .unwrap();
        let conv = outcome.conversation_id.as_str();
        let msg = outcome.assistant_message.id.as_str();

        h.pipeline
            .rename_conversation("alice", conv, "Greetings")
            .await
            .unwrap();
        assert_eq!(h.pipeline.conversation("alice", conv).await.unwrap().title, "Greetings");

        assert!(h.pipeline.toggle_star("alice", conv, msg).await.unwrap());
        assert!(!h.pipeline.toggle_star("alice", conv, msg).await.unwrap());
        assert!(matches!(
            h.pipeline.toggle_star("alice", conv, "missing").await,
            Err(ParleyError::NotFound(_))
        ));

        h.pipeline
            .report_message("alice", conv, msg, "inaccurate")
            .await
            .unwrap();
        let stored = h.store.get_conversation(conv, "alice").await.unwrap().unwrap();
        assert_eq!(
            stored.messages[1].reported.as_ref().map(|r| r.reason.as_str()),
            Some("inaccurate")
        );
        let cached = h.pipeline.sessions().get("alice", conv).await.unwrap();
        assert!(cached.messages[1].reported.is_some());

        h.pipeline.delete_conversation("alice", conv).await.unwrap();
        assert!(h.store.is_empty().await);
        assert!(h.pipeline.sessions().get("alice", conv).await.is_none());
        assert!(matches!(
            h.pipeline.conversation("alice", conv).await,
            Err(ParleyError::OwnershipViolation { .. })
        ));
    }

    #[test]
    fn test_terminal_state_for_errors() {
        let rejected = ParleyError::OwnershipViolation {
            user_id: "u".into(),
            conversation_id: "c".into(),
        };
        assert_eq!(TurnState::for_error(&rejected), Some(TurnState::Rejected));
        assert_eq!(
            TurnState::for_error(&ParleyError::Cancelled),
            Some(TurnState::Failed)
        );
        assert_eq!(
            TurnState::for_error(&ParleyError::Store("disk".into())),
            None
        );
    }

    #[test]
    fn test_builder_requires_engine() {
        assert!(matches!(
            ConversationPipeline::builder().build(),
            Err(ParleyError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_turn_reloads_session_after_a_slow_ownership_check() {
        use crate::conversation::store::tests::SlowLoadStore;

        let engine = ScriptedEngine::new(vec![
            ScriptedEngine::answer("fast"),
            ScriptedEngine::answer("slow"),
        ]);
        let store = Arc::new(SlowLoadStore::new(Duration::from_millis(300)));
        let session = seeded_session("alice", 2);
        let id = session.id.clone();
        store.inner.create_conversation(&session).await.unwrap();
        let pipeline = custom_pipeline(
            engine,
            store.clone(),
            PipelineConfig::default(),
            SessionConfig::default(),
            no_cache(),
            Arc::new(RecordingBroadcaster::default()),
        );

        store.slow_down_next_load();
        let slow = {
            let pipeline = pipeline.clone();
            let id = id.clone();
            tokio::spawn(async move {
                pipeline
                    .handle_turn(
                        TurnRequest::new("alice", "slow question").in_conversation(&id),
                        CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fast = pipeline
            .handle_turn(
                TurnRequest::new("alice", "fast question").in_conversation(&id),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(fast.depth, 3);

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.depth, 5);

        let stored = store
            .inner
            .get_conversation(&id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages.len(), 6);
        assert_eq!(stored.message_count, 6);
        let cached = pipeline.sessions().get("alice", &id).await.unwrap();
        assert_eq!(cached.messages.len(), 6);
        assert_eq!(cached.message_count, 6);
    }

    #[tokio::test]
    async fn test_semantic_hit_mid_conversation_skips_generation() {
        let engine = ScriptedEngine::new(vec![]);
        let store = Arc::new(MemoryConversationStore::new());
        let session = seeded_session("alice", 4);
        let id = session.id.clone();
        store.create_conversation(&session).await.unwrap();
        let pipeline = custom_pipeline(
            engine.clone(),
            store.clone(),
            PipelineConfig::default(),
            SessionConfig::default(),
            CacheConfig::default(),
            Arc::new(RecordingBroadcaster::default()),
        );
        pipeline
            .cache()
            .store_turn(&session.messages, "how do I bake bread", "Knead it.", 3, 5)
            .await;

        let outcome = pipeline
            .handle_turn(
                TurnRequest::new("alice", "what is the way to bake bread").in_conversation(&id),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.depth, 5);
        assert!(matches!(
            outcome.source,
            ResponseSource::Cache(HitSource::Semantic { .. })
        ));
        assert_eq!(outcome.assistant_message.content, "Knead it.");
        assert_eq!(engine.calls(), 0);
        let stored = store.get_conversation(&id, "alice").await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 6);
    }

    #[tokio::test]
    async fn test_context_full_flag_set_at_message_ceiling() {
        let engine = ScriptedEngine::new(vec![
            ScriptedEngine::answer("one"),
            ScriptedEngine::answer("two"),
        ]);
        let store = Arc::new(MemoryConversationStore::new());
        let pipeline = custom_pipeline(
            engine,
            store.clone(),
            PipelineConfig::default(),
            SessionConfig {
                max_messages_per_conversation: 4,
                ..SessionConfig::default()
            },
            no_cache(),
            Arc::new(RecordingBroadcaster::default()),
        );

        let first = pipeline
            .handle_turn(TurnRequest::new("alice", "first"), CancellationToken::new())
            .await
            .unwrap();
        let id = first.conversation_id;
        let stored = store.get_conversation(&id, "alice").await.unwrap().unwrap();
        assert!(!stored.is_context_full);

        pipeline
            .handle_turn(
                TurnRequest::new("alice", "second").in_conversation(&id),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let stored = store.get_conversation(&id, "alice").await.unwrap().unwrap();
        assert_eq!(stored.message_count, 4);
        assert!(stored.is_context_full);
        assert!(
            pipeline
                .sessions()
                .get("alice", &id)
                .await
                .unwrap()
                .is_context_full
        );
    }

    #[tokio::test]
    async fn test_partial_answers_dropped_when_persistence_disabled() {
        let engine = ScriptedEngine::hanging(vec![
            vec![
                StreamEvent::Delta("partial ".into()),
                StreamEvent::Error("upstream reset".into()),
            ],
            vec![StreamEvent::Delta("first".into())],
        ]);
        let store = Arc::new(MemoryConversationStore::new());
        let events = Arc::new(RecordingBroadcaster::default());
        let pipeline = custom_pipeline(
            engine,
            store.clone(),
            PipelineConfig {
                persist_partial: false,
                ..PipelineConfig::default()
            },
            SessionConfig::default(),
            no_cache(),
            events.clone(),
        );

        let err = pipeline
            .handle_turn(TurnRequest::new("alice", "tell me"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::GenerationFailed(_)));
        assert!(store.is_empty().await);

        let token = CancellationToken::new();
        let turn = {
            let pipeline = pipeline.clone();
            let token = token.clone();
            tokio::spawn(async move {
                pipeline
                    .handle_turn(TurnRequest::new("alice", "long story"), token)
                    .await
            })
        };
        let seen = events.clone();
        wait_until(|| seen.count() == 3).await;
        token.cancel();
        assert!(matches!(turn.await.unwrap(), Err(ParleyError::Cancelled)));
        assert!(store.is_empty().await);
    }
}
