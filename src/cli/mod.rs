//! CLI command definitions and dispatch.

mod cache;
mod chat;
mod config;
mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use parley::cache::ResponseCache;
use parley::config::Config;
use parley::conversation::{ConversationStore, MemoryConversationStore};
use parley::providers::{GenerationEngine, OpenAiEngine};
use parley::telemetry::LogFormat;
use parley::tools::{McpConnector, ToolRouter};

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Conversational assistant with cached, tool-aware responses", long_about = None)]
pub(crate) struct Cli {
    /// Config file (default: ~/.parley/config.json or $PARLEY_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Interactive chat session
    Chat {
        /// User the conversation belongs to
        #[arg(short, long, default_value = "local")]
        user: String,
        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,
        /// Bind the new conversation to a resource URL
        #[arg(long, requires = "resource_file")]
        resource: Option<String>,
        /// File holding the resource content
        #[arg(long)]
        resource_file: Option<PathBuf>,
    },
    /// Start tool providers and list what they offer
    Tools,
    /// Inspect or maintain the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Entry counts, hit counters and top topics
    Stats {
        /// Number of topics to show
        #[arg(long, default_value = "10")]
        topics: usize,
    },
    /// Remove every cached response
    Clear,
    /// Drop and recreate the semantic index
    Rebuild,
    /// Prune expired entries without dropping anything live
    Refresh,
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Validate the config file
    Check,
    /// Print the effective config (secrets redacted)
    Show,
}

pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    match cli.command {
        Commands::Chat {
            user,
            conversation,
            resource,
            resource_file,
        } => {
            let config = load_config(config_path.as_deref())?;
            chat::cmd_chat(config, user, conversation, resource, resource_file).await
        }
        Commands::Tools => tools::cmd_tools(load_config(config_path.as_deref())?).await,
        Commands::Cache { action } => {
            cache::cmd_cache(load_config(config_path.as_deref())?, action).await
        }
        Commands::Config { action } => config::cmd_config(config_path.as_deref(), action),
    }
}

/// Load config from `path`, or from the default location.
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(p) => Config::load_from_path(p),
        None => Config::load(),
    };
    config.with_context(|| "Failed to load configuration")
}

/// Engine from config; also serves as the cache embedder.
pub(crate) fn build_engine(config: &Config) -> Result<Arc<dyn GenerationEngine>> {
    let engine =
        OpenAiEngine::from_config(&config.engine).with_context(|| "Failed to create engine")?;
    Ok(Arc::new(engine))
}

/// Response cache persisted under `~/.parley` unless the config says
/// otherwise.
pub(crate) fn build_cache(
    config: &Config,
    embedder: Option<Arc<dyn GenerationEngine>>,
) -> Arc<ResponseCache> {
    let mut cache_config = config.cache.clone();
    if cache_config.persist_path.is_none() {
        cache_config.persist_path = Some(Config::dir().join("response_cache.json"));
    }
    Arc::new(ResponseCache::new(cache_config, embedder))
}

/// Conversations kept in `~/.parley/conversations.json` so `--conversation`
/// can pick one up again in a later run.
pub(crate) fn build_store() -> Result<Arc<dyn ConversationStore>> {
    let path = Config::dir().join("conversations.json");
    let store = MemoryConversationStore::open(&path)
        .with_context(|| format!("Failed to open conversation store {}", path.display()))?;
    Ok(Arc::new(store))
}

pub(crate) fn build_router(config: &Config) -> Arc<ToolRouter> {
    Arc::new(ToolRouter::new(config.tools.clone(), Arc::new(McpConnector)))
}
