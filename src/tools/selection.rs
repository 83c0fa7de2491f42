//! Per-turn tool-set policy.
//!
//! A message mentioning any trigger word gets the whole catalog; everything
//! else gets the small essential subset. This bounds prompt size, it does not
//! gate correctness: the engine can still answer without tools.

use std::collections::HashSet;

use crate::config::ToolsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSet {
    Full,
    Essential,
}

#[derive(Debug, Clone)]
pub struct ToolSelector {
    triggers: HashSet<String>,
    essential: HashSet<String>,
}

impl ToolSelector {
    pub fn new(trigger_keywords: &[String], essential_tools: &[String]) -> Self {
        Self {
            triggers: trigger_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            essential: essential_tools.iter().cloned().collect(),
        }
    }

    pub fn from_config(config: &ToolsConfig) -> Self {
        Self::new(&config.trigger_keywords, &config.essential_tools)
    }

    /// Whole-word, case-insensitive match of any trigger in `message`.
    pub fn select(&self, message: &str) -> ToolSet {
        let hit = message
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .any(|w| self.triggers.contains(&w.to_lowercase()));
        if hit {
            ToolSet::Full
        } else {
            ToolSet::Essential
        }
    }

    /// Whether a bare tool name belongs to the essential subset.
    pub fn is_essential(&self, tool: &str) -> bool {
        self.essential.contains(tool)
    }
}
