//! Session-state cache fronting the durable conversation store.
//!
//! Entries live for a fixed TTL measured from their last write. Reads never
//! extend the lifetime; every mutator rewrites the whole entry and therefore
//! restarts it. Mutators are read-modify-write without a lock, so two
//! concurrent mutations of the same conversation can lose one update. The
//! durable store stays the source of truth and a miss simply reloads it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use moka::future::Cache;
use moka::Expiry;
use tracing::debug;

use crate::config::SessionConfig;
use crate::conversation::{ConversationSession, ConversationStore, Message, ReportInfo};
use crate::error::Result;

type SessionKey = (String, String);

#[derive(Clone)]
struct CachedSession {
    session: Arc<ConversationSession>,
    ttl: Duration,
}

/// Per-entry expiry: absolute from the last create/update.
struct WriteExpiry;

impl Expiry<SessionKey, CachedSession> for WriteExpiry {
    fn expire_after_create(
        &self,
        _key: &SessionKey,
        value: &CachedSession,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &SessionKey,
        value: &CachedSession,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Write-through cache of active conversation state, keyed by
/// `(user_id, conversation_id)`.
#[derive(Clone)]
pub struct SessionCache {
    cache: Cache<SessionKey, CachedSession>,
    default_ttl: Duration,
    context_ceiling: usize,
}

impl SessionCache {
    pub fn new(config: &SessionConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(WriteExpiry)
            .build();
        Self {
            cache,
            default_ttl: Duration::from_secs(config.ttl_secs),
            context_ceiling: config.max_messages_per_conversation,
        }
    }

    /// Message count at which a conversation is flagged as context-full.
    pub fn context_ceiling(&self) -> usize {
        self.context_ceiling
    }

    fn key(user_id: &str, conversation_id: &str) -> SessionKey {
        (user_id.to_string(), conversation_id.to_string())
    }

    /// Cached state, if present and not expired.
    pub async fn get(&self, user_id: &str, conversation_id: &str) -> Option<ConversationSession> {
        self.cache
            .get(&Self::key(user_id, conversation_id))
            .await
            .map(|entry| (*entry.session).clone())
    }

    /// Store `session` for `ttl` (or the configured default).
    pub async fn put(
        &self,
        user_id: &str,
        conversation_id: &str,
        session: ConversationSession,
        ttl: Option<Duration>,
    ) {
        let entry = CachedSession {
            session: Arc::new(session),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.cache
            .insert(Self::key(user_id, conversation_id), entry)
            .await;
    }

    /// Cached state, falling back to the durable store on a miss and
    /// repopulating the cache from it.
    ///
    /// A store error propagates and nothing is cached.
    pub async fn get_or_load(
        &self,
        store: &dyn ConversationStore,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationSession>> {
        if let Some(session) = self.get(user_id, conversation_id).await {
            return Ok(Some(session));
        }
        debug!(conversation_id, "Session cache miss, loading from store");
        let Some(loaded) = store.get_conversation(conversation_id, user_id).await? else {
            return Ok(None);
        };
        // Insert only if still absent: a write that landed while the store
        // read was in flight is newer than what we loaded.
        let entry = self
            .cache
            .entry(Self::key(user_id, conversation_id))
            .or_insert(CachedSession {
                session: Arc::new(loaded),
                ttl: self.default_ttl,
            })
            .await;
        Ok(Some((*entry.into_value().session).clone()))
    }

    /// Append a message, advancing `last_message_at`, `message_count` and
    /// `is_context_full`. Returns `false` on a cache miss.
    pub async fn append_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message: Message,
    ) -> bool {
        let ceiling = self.context_ceiling;
        self.mutate(user_id, conversation_id, move |s| {
            s.record_message(message, ceiling);
            true
        })
        .await
    }

    pub async fn rename_title(&self, user_id: &str, conversation_id: &str, title: &str) -> bool {
        let title = title.to_string();
        self.mutate(user_id, conversation_id, move |s| {
            s.title = title;
            true
        })
        .await
    }

    pub async fn set_context_full(
        &self,
        user_id: &str,
        conversation_id: &str,
        full: bool,
    ) -> bool {
        self.mutate(user_id, conversation_id, move |s| {
            s.is_context_full = full;
            true
        })
        .await
    }

    /// Flip the `starred` flag. Returns the new value, or `None` if the
    /// session or message is not cached.
    pub async fn toggle_star(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Option<bool> {
        let mut current = self.get(user_id, conversation_id).await?;
        let message = current.message_mut(message_id)?;
        message.starred = !message.starred;
        let starred = message.starred;
        self.put(user_id, conversation_id, current, None).await;
        Some(starred)
    }

    /// Set the starred flag to an explicit value (write-through from the
    /// durable store result).
    pub async fn set_star(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        starred: bool,
    ) -> bool {
        let message_id = message_id.to_string();
        self.mutate(user_id, conversation_id, move |s| {
            match s.message_mut(&message_id) {
                Some(m) => {
                    m.starred = starred;
                    true
                }
                None => false,
            }
        })
        .await
    }

    pub async fn mark_reported(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        reason: &str,
    ) -> bool {
        let message_id = message_id.to_string();
        let report = ReportInfo {
            reason: reason.to_string(),
            at: Utc::now(),
        };
        self.mutate(user_id, conversation_id, move |s| {
            match s.message_mut(&message_id) {
                Some(m) => {
                    m.reported = Some(report);
                    true
                }
                None => false,
            }
        })
        .await
    }

    pub async fn delete(&self, user_id: &str, conversation_id: &str) {
        self.cache
            .invalidate(&Self::key(user_id, conversation_id))
            .await;
    }

    /// Approximate number of live entries.
    pub async fn len(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    /// Fetch, mutate in memory, write the whole entry back.
    ///
    /// The closure returns whether it changed anything; unchanged entries are
    /// not rewritten.
    async fn mutate<F>(&self, user_id: &str, conversation_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ConversationSession) -> bool,
    {
        let Some(mut current) = self.get(user_id, conversation_id).await else {
            debug!(conversation_id, "Session cache miss on mutation, skipping");
            return false;
        };
        if !f(&mut current) {
            return false;
        }
        self.put(user_id, conversation_id, current, None).await;
        true
    }
}
