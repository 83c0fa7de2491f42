//! Response cache maintenance commands.

use anyhow::Result;

use parley::config::Config;

use super::{build_cache, CacheAction};

pub(crate) async fn cmd_cache(config: Config, action: CacheAction) -> Result<()> {
    // Maintenance never embeds, so no engine is needed.
    let cache = build_cache(&config, None);

    match action {
        CacheAction::Stats { topics } => {
            let stats = cache.stats().await;
            let state = if stats.enabled { "enabled" } else { "disabled" };
            println!("Response cache ({})", state);
            println!("  exact entries:    {}", stats.exact_entries);
            println!("  semantic entries: {}", stats.semantic_entries);
            for (depth, count) in &stats.semantic_buckets {
                println!("    depth {:>2}: {}", depth, count);
            }
            println!("  resource entries: {}", stats.resource_entries);

            let top = cache.top_topics(topics).await;
            if !top.is_empty() {
                println!();
                println!("Top topics:");
                for (topic, count) in top {
                    println!("  {:<24} {}", topic, count);
                }
            }
        }
        CacheAction::Clear => {
            cache.clear_all().await;
            println!("Response cache cleared.");
        }
        CacheAction::Rebuild => {
            cache.recreate_index().await;
            println!("Semantic index recreated (empty).");
        }
        CacheAction::Refresh => {
            let removed = cache.refresh_index().await;
            println!("Removed {} expired or unusable cache entries.", removed);
        }
    }
    Ok(())
}
