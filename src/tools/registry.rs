//! Name → provider mapping built once at router initialization.
//!
//! Every tool is registered as `{provider}_{tool}`. The bare `{tool}` name
//! is an alias owned by whichever provider registered it first; later
//! providers exposing the same bare name are reachable only through their
//! prefixed key.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::providers::ToolDefinition;

use super::{ToolProvider, ToolSpec};

#[derive(Clone)]
struct RegisteredTool {
    provider: Arc<dyn ToolProvider>,
    spec: ToolSpec,
}

/// Where a resolved tool call goes.
#[derive(Clone)]
pub struct ResolvedTool {
    pub provider: Arc<dyn ToolProvider>,
    /// Name as the provider knows it (prefix stripped).
    pub tool: String,
}

#[derive(Default)]
pub struct ToolRegistry {
    /// Providers in registration order.
    providers: Vec<Arc<dyn ToolProvider>>,
    /// `{provider}_{tool}` → tool.
    prefixed: HashMap<String, RegisteredTool>,
    /// Bare name → prefixed key of its first owner.
    bare: HashMap<String, String>,
    /// Prefixed keys in registration order, for a stable catalog.
    order: Vec<String>,
}

pub fn prefixed_name(provider: &str, tool: &str) -> String {
    format!("{provider}_{tool}")
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` and its catalog. Re-registering a provider that
    /// is already present is ignored.
    pub fn register(&mut self, provider: Arc<dyn ToolProvider>, tools: Vec<ToolSpec>) {
        let provider_name = provider.name().to_string();
        if self.providers.iter().any(|p| p.name() == provider_name) {
            debug!(provider = %provider_name, "Provider already registered, skipping");
            return;
        }
        self.providers.push(Arc::clone(&provider));

        for spec in tools {
            let key = prefixed_name(&provider_name, &spec.name);
            if self.prefixed.contains_key(&key) {
                continue;
            }
            match self.bare.get(&spec.name) {
                Some(owner) => debug!(
                    tool = %spec.name,
                    owner = %owner,
                    provider = %provider_name,
                    "Bare tool name already claimed, keeping prefixed key only"
                ),
                None => {
                    self.bare.insert(spec.name.clone(), key.clone());
                }
            }
            self.order.push(key.clone());
            self.prefixed.insert(
                key,
                RegisteredTool {
                    provider: Arc::clone(&provider),
                    spec,
                },
            );
        }
    }

    /// Resolve a tool name: exact prefixed key first, then the bare alias.
    pub fn resolve(&self, name: &str) -> Option<ResolvedTool> {
        let entry = self
            .prefixed
            .get(name)
            .or_else(|| self.bare.get(name).and_then(|key| self.prefixed.get(key)))?;
        Some(ResolvedTool {
            provider: Arc::clone(&entry.provider),
            tool: entry.spec.name.clone(),
        })
    }

    /// Name under which `key`'s tool is offered to the engine: the bare name
    /// when this provider owns it, otherwise the prefixed key.
    fn offered_name<'a>(&'a self, key: &'a str, tool: &'a RegisteredTool) -> &'a str {
        match self.bare.get(&tool.spec.name) {
            Some(owner) if owner == key => &tool.spec.name,
            _ => key,
        }
    }

    /// One definition per registered tool, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions_where(|_| true)
    }

    /// Definitions whose bare tool name satisfies `keep`.
    pub fn definitions_where(&self, keep: impl Fn(&str) -> bool) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|key| self.prefixed.get(key).map(|tool| (key, tool)))
            .filter(|(_, tool)| keep(&tool.spec.name))
            .map(|(key, tool)| {
                ToolDefinition::new(
                    self.offered_name(key, tool),
                    &tool.spec.description,
                    tool.spec.input_schema.clone(),
                )
            })
            .collect()
    }

    pub fn providers(&self) -> &[Arc<dyn ToolProvider>] {
        &self.providers
    }

    /// Whether `name` is registered under that exact key or alias.
    pub fn contains(&self, name: &str) -> bool {
        self.prefixed.contains_key(name) || self.bare.contains_key(name)
    }

    pub fn tool_count(&self) -> usize {
        self.prefixed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn clear(&mut self) {
        self.providers.clear();
        self.prefixed.clear();
        self.bare.clear();
        self.order.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{ParleyError, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory provider: echoes invocations, can be told to fail.
    pub(crate) struct StaticProvider {
        pub name: String,
        pub tools: Vec<ToolSpec>,
        pub listing_fails: AtomicBool,
        pub invoke_fails: bool,
        pub shutdown_fails: bool,
        pub shutdowns: AtomicUsize,
    }

    impl StaticProvider {
        pub(crate) fn new(name: &str, tools: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tools: tools
                    .iter()
                    .map(|t| ToolSpec::new(t, &format!("{t} via {name}"), serde_json::json!({"type": "object"})))
                    .collect(),
                listing_fails: AtomicBool::new(false),
                invoke_fails: false,
                shutdown_fails: false,
                shutdowns: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ToolProvider for StaticProvider {
        fn name(&self) -> &str {
            &self.name
        }
        async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
            if self.listing_fails.load(Ordering::SeqCst) {
                return Err(ParleyError::Provider(format!("{} unreachable", self.name)));
            }
            Ok(self.tools.clone())
        }
        async fn invoke(&self, tool: &str, arguments: Value) -> Result<String> {
            if self.invoke_fails {
                return Err(ParleyError::Provider("boom".into()));
            }
            Ok(format!("{}:{}:{}", self.name, tool, arguments))
        }
        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.shutdown_fails {
                return Err(ParleyError::Provider("stuck".into()));
            }
            Ok(())
        }
    }

    fn register(registry: &mut ToolRegistry, provider: Arc<StaticProvider>) {
        let tools = provider.tools.clone();
        registry.register(provider, tools);
    }

    #[test]
    fn test_bare_name_collision_first_wins() {
        let mut registry = ToolRegistry::new();
        register(&mut registry, StaticProvider::new("alpha", &["search"]));
        register(&mut registry, StaticProvider::new("beta", &["search"]));

        assert_eq!(registry.tool_count(), 2);
        assert!(registry.contains("alpha_search"));
        assert!(registry.contains("beta_search"));
        assert_eq!(registry.resolve("search").unwrap().provider.name(), "alpha");
        assert_eq!(registry.resolve("beta_search").unwrap().provider.name(), "beta");
    }

    #[test]
    fn test_resolve_strips_prefix() {
        let mut registry = ToolRegistry::new();
        register(&mut registry, StaticProvider::new("github", &["list_issues"]));
        let resolved = registry.resolve("github_list_issues").unwrap();
        assert_eq!(resolved.tool, "list_issues");
        assert_eq!(registry.resolve("list_issues").unwrap().tool, "list_issues");
        assert!(registry.resolve("issues").is_none());
    }

    #[test]
    fn test_definitions_offer_each_tool_once() {
        let mut registry = ToolRegistry::new();
        register(&mut registry, StaticProvider::new("alpha", &["search", "fetch_url"]));
        register(&mut registry, StaticProvider::new("beta", &["search"]));
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["search", "fetch_url", "beta_search"]);

        let essential = registry.definitions_where(|bare| bare == "fetch_url");
        assert_eq!(essential.len(), 1);
        assert_eq!(essential[0].description, "fetch_url via alpha");
    }

    #[test]
    fn test_duplicate_provider_ignored_and_clear() {
        let mut registry = ToolRegistry::new();
        register(&mut registry, StaticProvider::new("alpha", &["a"]));
        register(&mut registry, StaticProvider::new("alpha", &["b"]));
        assert_eq!(registry.providers().len(), 1);
        assert!(!registry.contains("b"));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.resolve("a").is_none());
    }
}
