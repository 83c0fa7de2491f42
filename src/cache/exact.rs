//! Verbatim-match tier: SHA-256 keyed entries with per-entry expiry and LRU
//! eviction.
//!
//! Also backs the resource namespace, which is keyed by URL instead of by a
//! context hash but otherwise behaves the same.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::conversation::{Message, Role};

/// One cached answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactEntry {
    /// The cached assistant answer.
    pub response: String,
    /// Completion tokens the answer cost when it was generated.
    pub token_count: u32,
    /// When the entry was stored.
    pub created_at: DateTime<Utc>,
    /// `created_at` plus the decayed lifetime for its depth.
    pub expires_at: DateTime<Utc>,
    /// Last time a lookup returned this entry; drives LRU eviction.
    pub accessed_at: DateTime<Utc>,
    /// Number of lookups served from this entry.
    pub hit_count: u32,
}

impl ExactEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Build the exact-tier key for `new_message` following `context`.
///
/// Each part is length-prefixed so that no choice of separators inside the
/// messages can make two different windows hash to the same input. Role is
/// part of the key: the same text said by the user or the assistant is a
/// different context.
pub fn exact_key(context: &[Message], new_message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((context.len() as u64).to_le_bytes());
    for message in context {
        let role: &[u8] = match message.role {
            Role::User => b"u",
            Role::Assistant => b"a",
        };
        hasher.update(role);
        hasher.update((message.content.len() as u64).to_le_bytes());
        hasher.update(message.content.as_bytes());
    }
    hasher.update((new_message.len() as u64).to_le_bytes());
    hasher.update(new_message.as_bytes());
    hex::encode(hasher.finalize())
}

/// Map of key → entry with capacity-bounded LRU eviction.
#[derive(Debug)]
pub struct ExactTier {
    entries: HashMap<String, ExactEntry>,
    max_entries: usize,
}

impl ExactTier {
    /// `max_entries` is clamped to at least 1.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Rebuild from a snapshot, dropping anything already expired.
    pub fn from_entries(
        entries: HashMap<String, ExactEntry>,
        max_entries: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut tier = Self::new(max_entries);
        tier.entries = entries;
        tier.evict_expired(now);
        while tier.entries.len() > tier.max_entries {
            tier.evict_lru();
        }
        tier
    }

    /// Response stored under `key`, if present and unexpired. Updates the
    /// LRU timestamp and hit count.
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<&ExactEntry> {
        let expired = self.entries.get(key).map(|e| e.is_expired(now))?;
        if expired {
            debug!(key = %&key[..8.min(key.len())], "Exact entry expired, removing");
            self.entries.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.accessed_at = now;
        entry.hit_count = entry.hit_count.saturating_add(1);
        Some(entry)
    }

    /// Insert or overwrite (last write wins).
    pub fn put(
        &mut self,
        key: String,
        response: String,
        token_count: u32,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) {
        self.evict_expired(now);
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.max_entries {
                self.evict_lru();
            }
        }
        self.entries.insert(
            key,
            ExactEntry {
                response,
                token_count,
                created_at: now,
                expires_at: now + ttl,
                accessed_at: now,
                hit_count: 0,
            },
        );
    }

    pub fn entries(&self) -> &HashMap<String, ExactEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    fn evict_lru(&mut self) {
        if let Some(lru_key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.accessed_at)
            .map(|(k, _)| k.clone())
        {
            debug!(key = %&lru_key[..8.min(lru_key.len())], "Evicting LRU exact entry");
            self.entries.remove(&lru_key);
        }
    }
}
