//! Hybrid response cache: exact tier, semantic tier and resource namespace
//! behind one facade.
//!
//! Nothing here returns an error. Embedding failures, timeouts, a running
//! index rebuild and persistence problems are logged and degrade to a miss
//! (or a skipped write).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::conversation::{Message, Role};
use crate::error::ParleyError;
use crate::providers::GenerationEngine;

use super::exact::{exact_key, ExactEntry, ExactTier};
use super::semantic::{SemanticEntry, SemanticIndex, SemanticMatch};
use super::topics::TopicExtractor;
use super::{days_to_duration, decay_ttl_days, lookup_tier, LookupTier};

/// Which tier served a hit.
#[derive(Debug, Clone, PartialEq)]
pub enum HitSource {
    Exact,
    Semantic { document_id: String, score: f32 },
    Resource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub response: String,
    pub token_count: u32,
    pub source: HitSource,
}

/// Point-in-time counters and sizes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Whether caching is switched on at all.
    pub enabled: bool,
    /// Live entries in the exact tier.
    pub exact_entries: usize,
    /// Live entries across every semantic bucket.
    pub semantic_entries: usize,
    /// Semantic entries per context depth.
    pub semantic_buckets: BTreeMap<usize, usize>,
    /// Cached resource summaries.
    pub resource_entries: usize,
    /// Lookups answered by the exact tier.
    pub exact_hits: u64,
    /// Lookups answered by the semantic tier.
    pub semantic_hits: u64,
    /// Opening turns answered from a resource summary.
    pub resource_hits: u64,
    /// Lookups that found nothing, including bypassed depths.
    pub misses: u64,
    /// Embedding or index failures absorbed as misses.
    pub degraded: u64,
    /// An index rebuild is in progress.
    pub rebuilding: bool,
}

#[derive(Default)]
struct Counters {
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    resource_hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// On-disk form of the whole cache.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    exact: HashMap<String, ExactEntry>,
    #[serde(default)]
    semantic: Vec<SemanticEntry>,
    #[serde(default)]
    resources: HashMap<String, ExactEntry>,
}

/// Arguments of [`ResponseCache::store_semantic`].
#[derive(Debug, Clone)]
pub struct SemanticWrite<'a> {
    pub response: &'a str,
    pub token_count: u32,
    pub embedding: Vec<f32>,
    pub depth: usize,
    pub topics: Vec<String>,
    pub ttl_days: f64,
    /// Prior messages of the conversation at write time.
    pub context: &'a [Message],
    pub new_message: &'a str,
}

/// Clears the rebuild flag even if the rebuilding future is dropped.
struct RebuildFlag<'a>(&'a AtomicBool);

impl<'a> RebuildFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RebuildFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ResponseCache {
    config: CacheConfig,
    embedder: Option<Arc<dyn GenerationEngine>>,
    exact: Mutex<ExactTier>,
    semantic: RwLock<SemanticIndex>,
    resources: Mutex<ExactTier>,
    rebuilding: AtomicBool,
    topics: TopicExtractor,
    counters: Counters,
}

impl ResponseCache {
    /// Build the cache, restoring the snapshot at `config.persist_path` when
    /// one exists. Without an `embedder` the semantic tier stays empty.
    pub fn new(config: CacheConfig, embedder: Option<Arc<dyn GenerationEngine>>) -> Self {
        let snapshot = match (&config.persist_path, config.enabled) {
            (Some(path), true) => load_snapshot(path),
            _ => Snapshot::default(),
        };
        let now = Utc::now();
        let exact = ExactTier::from_entries(snapshot.exact, config.max_exact_entries, now);
        let resources =
            ExactTier::from_entries(snapshot.resources, config.max_exact_entries, now);
        let mut semantic = SemanticIndex::new(config.max_semantic_entries_per_bucket);
        for entry in snapshot.semantic {
            semantic.insert(entry);
        }
        semantic.prune(now);

        debug!(
            exact = exact.len(),
            semantic = semantic.len(),
            resources = resources.len(),
            "Response cache ready"
        );

        Self {
            topics: TopicExtractor::new(config.max_topics),
            config,
            embedder,
            exact: Mutex::new(exact),
            semantic: RwLock::new(semantic),
            resources: Mutex::new(resources),
            rebuilding: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms.max(1))
    }

    /// Lifetime in days of an entry written at `message_count`.
    pub fn ttl_days(&self, message_count: usize) -> f64 {
        decay_ttl_days(
            self.config.base_lifetime_days,
            self.config.decay_factor,
            message_count,
        )
    }

    /// Exact-tier key over the last `exact_max_depth` messages of `context`
    /// plus `new_message`.
    pub fn key_for(&self, context: &[Message], new_message: &str) -> String {
        let start = context.len().saturating_sub(self.config.exact_max_depth);
        exact_key(&context[start..], new_message)
    }

    // ---- Lookups ----

    /// Run the tier policy for a turn at `depth`: exact for shallow
    /// contexts, semantic for the middle band, nothing beyond it.
    pub async fn lookup(
        &self,
        context: &[Message],
        new_message: &str,
        depth: usize,
    ) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let tier = lookup_tier(&self.config, depth);
        let attempt = async {
            match tier {
                LookupTier::Exact => self.get_exact(context, new_message).await,
                LookupTier::Semantic => self
                    .search_semantic(context, new_message, depth)
                    .await
                    .map(|m| CacheHit {
                        response: m.response,
                        token_count: m.token_count,
                        source: HitSource::Semantic {
                            document_id: m.document_id,
                            score: m.score,
                        },
                    }),
                LookupTier::Bypass => None,
            }
        };
        let hit = match tokio::time::timeout(self.deadline(), attempt).await {
            Ok(hit) => hit,
            Err(_) => {
                self.degrade(ParleyError::CacheUnavailable(format!(
                    "lookup exceeded {}ms",
                    self.config.timeout_ms
                )));
                None
            }
        };
        if hit.is_none() {
            Counters::bump(&self.counters.misses);
            debug!(depth, ?tier, "Response cache miss");
        }
        hit
    }

    /// Verbatim match on the short context window.
    pub async fn get_exact(&self, context: &[Message], new_message: &str) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let key = self.key_for(context, new_message);
        let found = {
            let mut tier = self.exact.lock().await;
            tier.get(&key, Utc::now())
                .map(|e| (e.response.clone(), e.token_count))
        };
        let (response, token_count) = found?;
        Counters::bump(&self.counters.exact_hits);
        debug!(key = %&key[..8], "Exact cache hit");
        Some(CacheHit {
            response,
            token_count,
            source: HitSource::Exact,
        })
    }

    /// Nearest neighbour in the `depth` bucket, if it clears the threshold.
    /// Only searched inside the configured semantic depth band.
    pub async fn search_semantic(
        &self,
        context: &[Message],
        new_message: &str,
        depth: usize,
    ) -> Option<SemanticMatch> {
        if !self.config.enabled
            || depth < self.config.semantic_min_depth
            || depth > self.config.semantic_max_depth
        {
            return None;
        }
        if self.rebuilding.load(Ordering::SeqCst) {
            debug!(error = %ParleyError::IndexRebuildInProgress, "Semantic lookup skipped");
            return None;
        }
        let query = self.embed_text(embedding_text(context, new_message)).await?;
        if self.rebuilding.load(Ordering::SeqCst) {
            return None;
        }
        let found = self.semantic.read().await.search(
            &query,
            depth,
            self.config.similarity_threshold,
            Utc::now(),
        )?;
        Counters::bump(&self.counters.semantic_hits);
        debug!(
            depth,
            score = found.score,
            document_id = %found.document_id,
            "Semantic cache hit"
        );
        Some(found)
    }

    /// Cached summary of `url`.
    pub async fn get_resource(&self, url: &str) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let found = {
            let mut tier = self.resources.lock().await;
            tier.get(url, Utc::now())
                .map(|e| (e.response.clone(), e.token_count))
        };
        match found {
            Some((response, token_count)) => {
                Counters::bump(&self.counters.resource_hits);
                debug!(url, "Resource cache hit");
                Some(CacheHit {
                    response,
                    token_count,
                    source: HitSource::Resource,
                })
            }
            None => {
                Counters::bump(&self.counters.misses);
                None
            }
        }
    }

    // ---- Writes ----

    pub async fn store_exact(&self, key: String, response: &str, token_count: u32, ttl_days: f64) {
        if !self.config.enabled {
            return;
        }
        self.insert_exact(key, response, token_count, ttl_days)
            .await;
        self.persist().await;
    }

    pub async fn store_semantic(&self, write: SemanticWrite<'_>) {
        if !self.config.enabled {
            return;
        }
        self.insert_semantic(write).await;
        self.persist().await;
    }

    /// Write-through after a completed generation: exact tier always,
    /// semantic tier when `depth` is within the semantic ceiling.
    pub async fn store_turn(
        &self,
        context: &[Message],
        new_message: &str,
        response: &str,
        token_count: u32,
        depth: usize,
    ) {
        if !self.config.enabled {
            return;
        }
        let ttl_days = self.ttl_days(depth);
        let key = self.key_for(context, new_message);
        self.insert_exact(key, response, token_count, ttl_days)
            .await;

        if depth <= self.config.semantic_max_depth {
            let text = embedding_text(context, new_message);
            if let Some(embedding) = self.embed_text(text).await {
                let topics = self.topics.extract(new_message);
                self.insert_semantic(SemanticWrite {
                    response,
                    token_count,
                    embedding,
                    depth,
                    topics,
                    ttl_days,
                    context,
                    new_message,
                })
                .await;
            }
        }
        debug!(depth, ttl_days, "Stored turn in response cache");
        self.persist().await;
    }

    /// Cache a resource summary under its URL.
    pub async fn store_resource(&self, url: &str, response: &str, token_count: u32) {
        if !self.config.enabled {
            return;
        }
        {
            let mut tier = self.resources.lock().await;
            tier.put(
                url.to_string(),
                response.to_string(),
                token_count,
                days_to_duration(self.config.resource_ttl_days),
                Utc::now(),
            );
        }
        self.persist().await;
    }

    async fn insert_exact(&self, key: String, response: &str, token_count: u32, ttl_days: f64) {
        let mut tier = self.exact.lock().await;
        tier.put(
            key,
            response.to_string(),
            token_count,
            days_to_duration(ttl_days),
            Utc::now(),
        );
    }

    async fn insert_semantic(&self, write: SemanticWrite<'_>) {
        if write.embedding.is_empty() {
            return;
        }
        let now = Utc::now();
        let entry = SemanticEntry {
            id: uuid::Uuid::new_v4().to_string(),
            embedding: write.embedding,
            depth: write.depth,
            topics: write.topics,
            context: write.context.to_vec(),
            new_message: write.new_message.to_string(),
            response: write.response.to_string(),
            token_count: write.token_count,
            created_at: now,
            expires_at: now + days_to_duration(write.ttl_days),
        };
        self.semantic.write().await.insert(entry);
    }

    // ---- Administration ----

    /// Drop the semantic index and start an empty one. Lookups issued while
    /// this runs see a miss.
    pub async fn recreate_index(&self) {
        {
            let _flag = RebuildFlag::raise(&self.rebuilding);
            let mut index = self.semantic.write().await;
            *index = SemanticIndex::new(self.config.max_semantic_entries_per_bucket);
        }
        info!("Semantic index recreated");
        self.persist().await;
    }

    /// Non-destructive maintenance: drop expired and unusable entries from
    /// every namespace. Returns how many entries were removed.
    pub async fn refresh_index(&self) -> usize {
        let now = Utc::now();
        let exact = self.exact.lock().await.evict_expired(now);
        let resources = self.resources.lock().await.evict_expired(now);
        let semantic = self.semantic.write().await.prune(now);
        let removed = exact + resources + semantic;
        info!(exact, semantic, resources, "Response cache refreshed");
        self.persist().await;
        removed
    }

    /// Empty every namespace.
    pub async fn clear_all(&self) {
        self.exact.lock().await.clear();
        self.resources.lock().await.clear();
        {
            let _flag = RebuildFlag::raise(&self.rebuilding);
            let mut index = self.semantic.write().await;
            *index = SemanticIndex::new(self.config.max_semantic_entries_per_bucket);
        }
        info!("Response cache cleared");
        self.persist().await;
    }

    pub async fn stats(&self) -> CacheStats {
        let exact_entries = self.exact.lock().await.len();
        let resource_entries = self.resources.lock().await.len();
        let (semantic_entries, semantic_buckets) = {
            let index = self.semantic.read().await;
            (index.len(), index.bucket_sizes())
        };
        CacheStats {
            enabled: self.config.enabled,
            exact_entries,
            semantic_entries,
            semantic_buckets,
            resource_entries,
            exact_hits: self.counters.exact_hits.load(Ordering::Relaxed),
            semantic_hits: self.counters.semantic_hits.load(Ordering::Relaxed),
            resource_hits: self.counters.resource_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            rebuilding: self.rebuilding.load(Ordering::SeqCst),
        }
    }

    /// Most frequent topics across semantic entries, highest count first.
    pub async fn top_topics(&self, limit: usize) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in self.semantic.read().await.entries() {
            for topic in &entry.topics {
                *counts.entry(topic.clone()).or_default() += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    // ---- Internals ----

    async fn embed_text(&self, text: String) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        let inputs = [text];
        match tokio::time::timeout(self.deadline(), embedder.embed(&inputs)).await {
            Ok(Ok(vectors)) => match vectors.into_iter().next() {
                Some(v) if !v.is_empty() => Some(v),
                _ => {
                    self.degrade(ParleyError::CacheUnavailable(
                        "embedding engine returned no vector".into(),
                    ));
                    None
                }
            },
            Ok(Err(e)) => {
                self.degrade(ParleyError::CacheUnavailable(format!("embedding failed: {e}")));
                None
            }
            Err(_) => {
                self.degrade(ParleyError::CacheUnavailable(format!(
                    "embedding exceeded {}ms",
                    self.config.timeout_ms
                )));
                None
            }
        }
    }

    fn degrade(&self, err: ParleyError) {
        Counters::bump(&self.counters.degraded);
        warn!(error = %err, "Response cache degraded to miss");
    }

    async fn persist(&self) {
        let Some(path) = self.config.persist_path.clone() else {
            return;
        };
        let snapshot = Snapshot {
            exact: self.exact.lock().await.entries().clone(),
            semantic: self.semantic.read().await.entries().cloned().collect(),
            resources: self.resources.lock().await.entries().clone(),
        };
        save_snapshot(&path, &snapshot).await;
    }
}

/// Text embedded for a semantic lookup or write: the prior context and the
/// new user message, one `role: content` line each.
fn embedding_text(context: &[Message], new_message: &str) -> String {
    let mut text = String::new();
    for message in context {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        text.push_str(role);
        text.push_str(": ");
        text.push_str(&message.content);
        text.push('\n');
    }
    text.push_str("user: ");
    text.push_str(new_message);
    text
}

fn load_snapshot(path: &Path) -> Snapshot {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %path.display(), "Response cache snapshot is corrupt, starting empty: {}", e);
                Snapshot::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
        Err(e) => {
            warn!(path = %path.display(), "Failed to read response cache snapshot, starting empty: {}", e);
            Snapshot::default()
        }
    }
}

async fn save_snapshot(path: &Path, snapshot: &Snapshot) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %parent.display(), "Failed to create cache directory: {}", e);
            return;
        }
    }
    match serde_json::to_string(snapshot) {
        Ok(data) => {
            if let Err(e) = tokio::fs::write(path, data).await {
                warn!(path = %path.display(), "Failed to save response cache: {}", e);
            }
        }
        Err(e) => warn!("Failed to serialize response cache: {}", e),
    }
}
