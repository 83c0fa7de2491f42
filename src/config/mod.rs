//! Configuration for parley.
//!
//! Loaded from `~/.parley/config.json` (or the path in `PARLEY_CONFIG`).
//! Every field has a default, so an empty `{}` file is a valid config.
//! Selected keys can be overridden from the environment; see
//! [`Config::apply_env_overrides`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ParleyError, Result};

/// Environment variable naming an alternate config file.
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub tools: ToolsConfig,
    pub pipeline: PipelineConfig,
    pub engine: EngineConfig,
}

/// Session-state cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a cached session, measured from its last write.
    pub ttl_secs: u64,
    /// Maximum number of cached sessions.
    pub max_capacity: u64,
    /// Message count at which a conversation is flagged as context-full.
    pub max_messages_per_conversation: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 2 * 60 * 60,
            max_capacity: 10_000,
            max_messages_per_conversation: 50,
        }
    }
}

/// Hybrid response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Deepest context served from the exact tier.
    pub exact_max_depth: usize,
    /// Shallowest context searched in the semantic tier.
    pub semantic_min_depth: usize,
    /// Deepest context searched in (and written to) the semantic tier.
    pub semantic_max_depth: usize,
    /// Minimum cosine similarity for a semantic hit.
    pub similarity_threshold: f32,
    /// Lifetime of a depth-1 entry, in days.
    pub base_lifetime_days: f64,
    /// Multiplier applied per additional message of depth.
    pub decay_factor: f64,
    pub max_exact_entries: usize,
    pub max_semantic_entries_per_bucket: usize,
    /// Lifetime of resource-summary answers, in days.
    pub resource_ttl_days: f64,
    /// JSON snapshot file; `None` keeps the cache in memory only.
    pub persist_path: Option<PathBuf>,
    /// Deadline for a single cache operation (embedding included).
    pub timeout_ms: u64,
    /// Topics recorded per semantic entry.
    pub max_topics: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exact_max_depth: 2,
            semantic_min_depth: 3,
            semantic_max_depth: 8,
            similarity_threshold: 0.85,
            base_lifetime_days: 21.0,
            decay_factor: 0.7,
            max_exact_entries: 5_000,
            max_semantic_entries_per_bucket: 2_000,
            resource_ttl_days: 7.0,
            persist_path: None,
            timeout_ms: 2_000,
            max_topics: 3,
        }
    }
}

/// Tool router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Words that unlock the full tool catalog for a turn.
    pub trigger_keywords: Vec<String>,
    /// Bare tool names offered when no trigger word is present.
    pub essential_tools: Vec<String>,
    pub call_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub providers: Vec<ToolProviderConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            trigger_keywords: vec!["github".into(), "repo".into(), "repository".into()],
            essential_tools: vec!["web_search".into(), "fetch_url".into()],
            call_timeout_secs: 30,
            probe_timeout_secs: 5,
            providers: Vec::new(),
        }
    }
}

/// One external tool provider (an MCP server).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolProviderConfig {
    pub name: String,
    /// HTTP endpoint; takes precedence over `command`.
    pub url: Option<String>,
    /// Command spawned for stdio transport.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Environment variable that must be set for this provider to start.
    /// Its value is forwarded to stdio servers under the same name.
    pub credential_env: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Per-turn orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Persist text produced before a failure or cancellation.
    pub persist_partial: bool,
    pub max_tool_iterations: usize,
    /// Capacity of the engine → pipeline chunk channel.
    pub chunk_buffer: usize,
    pub generation_timeout_secs: u64,
    pub system_prompt: String,
    pub title_max_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            persist_partial: true,
            max_tool_iterations: 5,
            chunk_buffer: 64,
            generation_timeout_secs: 180,
            system_prompt: "You are a helpful assistant.".into(),
            title_max_chars: 60,
        }
    }
}

/// OpenAI-compatible generation engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub embedding_model: String,
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            embedding_model: "text-embedding-3-small".into(),
            timeout_secs: 120,
        }
    }
}

impl Config {
    /// Base directory for parley state (`~/.parley`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".parley")
    }

    /// Config file path, honouring `PARLEY_CONFIG`.
    pub fn path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::dir().join("config.json"))
    }

    /// Load from the default location. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }
        Self::load_from_path(&path)
    }

    /// Load, apply env overrides and validate a specific file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ParleyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            ParleyError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `PARLEY_*` environment overrides.
    ///
    /// - `PARLEY_API_KEY`, `PARLEY_API_BASE`, `PARLEY_MODEL`
    /// - `PARLEY_CACHE_ENABLED` (`true`/`false`)
    /// - `PARLEY_CACHE_PATH`
    /// - `PARLEY_TRIGGER_KEYWORDS` (comma separated)
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("PARLEY_API_KEY").filter(|v| !v.is_empty()) {
            self.engine.api_key = Some(key);
        }
        if let Some(base) = lookup("PARLEY_API_BASE").filter(|v| !v.is_empty()) {
            self.engine.api_base = base;
        }
        if let Some(model) = lookup("PARLEY_MODEL").filter(|v| !v.is_empty()) {
            self.engine.model = model;
        }
        if let Some(enabled) = lookup("PARLEY_CACHE_ENABLED") {
            match enabled.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.cache.enabled = true,
                "0" | "false" | "no" => self.cache.enabled = false,
                _ => {}
            }
        }
        if let Some(path) = lookup("PARLEY_CACHE_PATH").filter(|v| !v.is_empty()) {
            self.cache.persist_path = Some(PathBuf::from(path));
        }
        if let Some(words) = lookup("PARLEY_TRIGGER_KEYWORDS") {
            let parsed: Vec<String> = words
                .split(',')
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.tools.trigger_keywords = parsed;
            }
        }
    }

    /// Reject values the pipeline cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if !(cache.similarity_threshold > 0.0 && cache.similarity_threshold <= 1.0) {
            return Err(ParleyError::Config(format!(
                "cache.similarity_threshold must be in (0, 1], got {}",
                cache.similarity_threshold
            )));
        }
        if !(cache.decay_factor > 0.0 && cache.decay_factor <= 1.0) {
            return Err(ParleyError::Config(format!(
                "cache.decay_factor must be in (0, 1], got {}",
                cache.decay_factor
            )));
        }
        if cache.base_lifetime_days <= 0.0 {
            return Err(ParleyError::Config(
                "cache.base_lifetime_days must be positive".into(),
            ));
        }
        if cache.semantic_min_depth <= cache.exact_max_depth {
            return Err(ParleyError::Config(format!(
                "cache.semantic_min_depth ({}) must exceed cache.exact_max_depth ({})",
                cache.semantic_min_depth, cache.exact_max_depth
            )));
        }
        if cache.semantic_max_depth < cache.semantic_min_depth {
            return Err(ParleyError::Config(
                "cache.semantic_max_depth must be >= cache.semantic_min_depth".into(),
            ));
        }
        if self.session.ttl_secs == 0 {
            return Err(ParleyError::Config("session.ttl_secs must be > 0".into()));
        }
        if self.pipeline.chunk_buffer == 0 {
            return Err(ParleyError::Config(
                "pipeline.chunk_buffer must be > 0".into(),
            ));
        }
        for provider in &self.tools.providers {
            if provider.name.trim().is_empty() {
                return Err(ParleyError::Config(
                    "tools.providers[].name must not be empty".into(),
                ));
            }
            if provider.url.is_none() && provider.command.is_none() {
                return Err(ParleyError::Config(format!(
                    "tool provider '{}' needs either `url` or `command`",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}
