//! Config inspection commands.

use std::path::Path;

use anyhow::{Context, Result};

use parley::config::Config;

use super::{load_config, ConfigAction};

pub(crate) fn cmd_config(path: Option<&Path>, action: ConfigAction) -> Result<()> {
    let shown_path = path.map(Path::to_path_buf).unwrap_or_else(Config::path);
    match action {
        ConfigAction::Check => {
            let config = load_config(path)?;
            println!("Config OK: {}", shown_path.display());
            println!(
                "  {} tool provider(s), cache {}, engine model {}",
                config.tools.providers.len(),
                if config.cache.enabled { "enabled" } else { "disabled" },
                config.engine.model
            );
        }
        ConfigAction::Show => {
            let mut config = load_config(path)?;
            if config.engine.api_key.is_some() {
                config.engine.api_key = Some("[REDACTED]".into());
            }
            for provider in &mut config.tools.providers {
                for value in provider.env.values_mut() {
                    *value = "[REDACTED]".into();
                }
            }
            let json = serde_json::to_string_pretty(&config)
                .with_context(|| "Failed to serialize config")?;
            println!("{}", json);
        }
    }
    Ok(())
}
