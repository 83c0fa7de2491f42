//! One catalog and one invocation surface over many tool providers.
//!
//! Failures stay per provider: a provider that cannot start is skipped, a
//! provider whose probe fails is left out of that one liveness report, and
//! a failing invocation only fails that call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{ToolProviderConfig, ToolsConfig};
use crate::error::{ParleyError, Result};
use crate::providers::ToolDefinition;

use super::registry::ToolRegistry;
use super::selection::{ToolSelector, ToolSet};
use super::{provider_credential, ProviderConnector, ToolProvider, ToolSpec};

/// Outcome of [`ToolRouter::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Providers that came up and listed their tools.
    pub connected: Vec<String>,
    /// Providers skipped for a missing credential.
    pub skipped: Vec<String>,
    /// Providers whose bring-up failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// The router was already initialized; nothing was done.
    pub already_ready: bool,
}

pub struct ToolRouter {
    config: ToolsConfig,
    connector: Arc<dyn ProviderConnector>,
    registry: RwLock<ToolRegistry>,
    ready: AtomicBool,
    selector: ToolSelector,
}

impl ToolRouter {
    pub fn new(config: ToolsConfig, connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            selector: ToolSelector::from_config(&config),
            config,
            connector,
            registry: RwLock::new(ToolRegistry::new()),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.call_timeout_secs.max(1))
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.config.probe_timeout_secs.max(1))
    }

    /// Bring up every configured provider and register its tools.
    ///
    /// Providers connect concurrently but register in configuration order,
    /// so bare-name ownership follows the config file. Calling this on a
    /// ready router does nothing.
    pub async fn initialize(&self) -> InitReport {
        if self.is_ready() {
            info!("Tool router already initialized, skipping");
            return InitReport {
                already_ready: true,
                ..Default::default()
            };
        }

        let mut report = InitReport::default();
        let mut candidates: Vec<&ToolProviderConfig> = Vec::new();
        for provider in &self.config.providers {
            match provider.credential_env {
                Some(ref var) if provider_credential(provider).is_none() => {
                    warn!(
                        provider = %provider.name,
                        credential = %var,
                        "Tool provider credential missing, skipping"
                    );
                    report.skipped.push(provider.name.clone());
                }
                _ => candidates.push(provider),
            }
        }

        let outcomes = join_all(candidates.iter().map(|cfg| self.bring_up(cfg))).await;

        let mut registry = self.registry.write().await;
        for (cfg, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                Ok((provider, tools)) => {
                    debug!(provider = %cfg.name, tools = tools.len(), "Registering tools");
                    registry.register(provider, tools);
                    report.connected.push(cfg.name.clone());
                }
                Err(e) => {
                    let err = ParleyError::ProviderInitFailed {
                        provider: cfg.name.clone(),
                        reason: e.to_string(),
                    };
                    warn!(error = %err, "Tool provider unavailable");
                    report.failed.push((cfg.name.clone(), e.to_string()));
                }
            }
        }
        self.ready.store(true, Ordering::SeqCst);
        info!(
            connected = report.connected.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            tools = registry.tool_count(),
            "Tool router initialized"
        );
        report
    }

    async fn bring_up(
        &self,
        cfg: &ToolProviderConfig,
    ) -> Result<(Arc<dyn ToolProvider>, Vec<ToolSpec>)> {
        let provider = self.connector.connect(cfg).await?;
        match tokio::time::timeout(self.call_timeout(), provider.list_tools()).await {
            Ok(Ok(tools)) => Ok((provider, tools)),
            Ok(Err(e)) => {
                let _ = provider.shutdown().await;
                Err(e)
            }
            Err(_) => {
                let _ = provider.shutdown().await;
                Err(ParleyError::Provider("tool listing timed out".into()))
            }
        }
    }

    /// Every registered tool, each offered once.
    pub async fn catalog(&self) -> Vec<ToolDefinition> {
        self.registry.read().await.definitions()
    }

    /// Tool set for a turn whose new user message is `message`.
    pub async fn select_tools(&self, message: &str) -> (ToolSet, Vec<ToolDefinition>) {
        let set = self.selector.select(message);
        let registry = self.registry.read().await;
        let tools = match set {
            ToolSet::Full => registry.definitions(),
            ToolSet::Essential => {
                registry.definitions_where(|bare| self.selector.is_essential(bare))
            }
        };
        debug!(?set, tools = tools.len(), "Selected tools for turn");
        (set, tools)
    }

    /// Invoke `name` (prefixed key or bare alias) with `arguments`.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<String> {
        let resolved = self
            .registry
            .read()
            .await
            .resolve(name)
            .ok_or_else(|| ParleyError::ToolNotFound(name.to_string()))?;

        let provider_name = resolved.provider.name().to_string();
        debug!(tool = name, provider = %provider_name, "Invoking tool");
        let call = resolved.provider.invoke(&resolved.tool, arguments);
        match tokio::time::timeout(self.call_timeout(), call).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(ParleyError::ToolInvocationFailed { reason, .. })) => {
                Err(ParleyError::ToolInvocationFailed {
                    tool: name.to_string(),
                    reason,
                })
            }
            Ok(Err(e)) => Err(ParleyError::ToolInvocationFailed {
                tool: name.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ParleyError::ToolInvocationFailed {
                tool: name.to_string(),
                reason: format!(
                    "{provider_name} did not answer within {}s",
                    self.call_timeout().as_secs()
                ),
            }),
        }
    }

    /// Providers that answer a catalog probe right now. Never cached; a
    /// failed probe only drops the provider from this report.
    pub async fn connected_providers(&self) -> Vec<String> {
        let providers: Vec<Arc<dyn ToolProvider>> =
            self.registry.read().await.providers().to_vec();
        let timeout = self.probe_timeout();
        let probes = providers.iter().map(|p| async move {
            match tokio::time::timeout(timeout, p.list_tools()).await {
                Ok(Ok(_)) => Some(p.name().to_string()),
                Ok(Err(e)) => {
                    debug!(provider = p.name(), error = %e, "Liveness probe failed");
                    None
                }
                Err(_) => {
                    debug!(provider = p.name(), "Liveness probe timed out");
                    None
                }
            }
        });
        join_all(probes).await.into_iter().flatten().collect()
    }

    /// Names of all registered providers, live or not.
    pub async fn provider_names(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .providers()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Dispose every provider concurrently, clear the registry and mark the
    /// router not ready. Disposal errors are logged, never returned.
    pub async fn shutdown(&self) {
        let providers: Vec<Arc<dyn ToolProvider>> = {
            let mut registry = self.registry.write().await;
            let providers = registry.providers().to_vec();
            registry.clear();
            providers
        };
        self.ready.store(false, Ordering::SeqCst);
        if providers.is_empty() {
            debug!("Tool router shutdown: nothing to dispose");
            return;
        }

        let results = join_all(providers.iter().map(|p| p.shutdown())).await;
        for (provider, result) in providers.iter().zip(results) {
            if let Err(e) = result {
                warn!(provider = provider.name(), error = %e, "Tool provider shutdown failed");
            }
        }
        info!(providers = providers.len(), "Tool router shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::tests::StaticProvider;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Hands out pre-built providers by name; unknown names fail.
    struct FakeConnector {
        providers: HashMap<String, Arc<StaticProvider>>,
        connects: AtomicUsize,
    }

    impl FakeConnector {
        fn new(providers: Vec<Arc<StaticProvider>>) -> Arc<Self> {
            Arc::new(Self {
                providers: providers
                    .into_iter()
                    .map(|p| (p.name.clone(), p))
                    .collect(),
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderConnector for FakeConnector {
        async fn connect(&self, config: &ToolProviderConfig) -> Result<Arc<dyn ToolProvider>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.providers.get(&config.name) {
                Some(p) => Ok(p.clone()),
                None => Err(ParleyError::Provider(format!("cannot reach {}", config.name))),
            }
        }
    }

    fn provider_config(name: &str) -> ToolProviderConfig {
        ToolProviderConfig {
            name: name.to_string(),
            url: Some(format!("http://{name}.invalid/rpc")),
            ..Default::default()
        }
    }

    fn tools_config(providers: Vec<ToolProviderConfig>) -> ToolsConfig {
        ToolsConfig {
            providers,
            trigger_keywords: vec!["github".into(), "repo".into(), "repository".into()],
            essential_tools: vec!["web_search".into()],
            ..ToolsConfig::default()
        }
    }

    fn router(providers: Vec<Arc<StaticProvider>>, configs: Vec<ToolProviderConfig>) -> ToolRouter {
        ToolRouter::new(tools_config(configs), FakeConnector::new(providers))
    }

    #[tokio::test]
    async fn test_collision_registers_one_bare_and_two_prefixed() {
        let r = router(
            vec![
                StaticProvider::new("alpha", &["search"]),
                StaticProvider::new("beta", &["search"]),
            ],
            vec![provider_config("alpha"), provider_config("beta")],
        );
        let report = r.initialize().await;
        assert_eq!(report.connected, vec!["alpha", "beta"]);

        assert_eq!(r.invoke("search", Value::Null).await.unwrap(), "alpha:search:null");
        assert_eq!(r.invoke("alpha_search", Value::Null).await.unwrap(), "alpha:search:null");
        assert_eq!(r.invoke("beta_search", Value::Null).await.unwrap(), "beta:search:null");
    }

    #[tokio::test]
    async fn test_missing_credential_skips_provider_only() {
        let mut gated = provider_config("gated");
        gated.credential_env = Some("PARLEY_TEST_CREDENTIAL_THAT_IS_NEVER_SET".into());
        let r = router(
            vec![
                StaticProvider::new("gated", &["secret"]),
                StaticProvider::new("open", &["web_search"]),
            ],
            vec![gated, provider_config("open")],
        );
        let report = r.initialize().await;
        assert_eq!(report.skipped, vec!["gated"]);
        assert_eq!(report.connected, vec!["open"]);
        assert!(r.is_ready());
        assert!(matches!(
            r.invoke("secret", Value::Null).await,
            Err(ParleyError::ToolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_credential_from_env_table_is_accepted() {
        let mut gated = provider_config("gated");
        gated.credential_env = Some("GATED_TOKEN".into());
        gated.env.insert("GATED_TOKEN".into(), "t0ken".into());
        let r = router(vec![StaticProvider::new("gated", &["secret"])], vec![gated]);
        assert_eq!(r.initialize().await.connected, vec!["gated"]);
    }

    #[tokio::test]
    async fn test_failed_bring_up_does_not_block_others() {
        let r = router(
            vec![StaticProvider::new("good", &["fetch_url"])],
            vec![provider_config("broken"), provider_config("good")],
        );
        let report = r.initialize().await;
        assert_eq!(report.connected, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(r.invoke("fetch_url", Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let connector = FakeConnector::new(vec![StaticProvider::new("a", &["x"])]);
        let r = ToolRouter::new(tools_config(vec![provider_config("a")]), connector.clone());
        r.initialize().await;
        let second = r.initialize().await;
        assert!(second.already_ready);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(r.catalog().await.len(), 1);
    }

    #[tokio::test]
    async fn test_selection_full_vs_essential() {
        let r = router(
            vec![StaticProvider::new("gh", &["web_search", "list_issues", "read_file"])],
            vec![provider_config("gh")],
        );
        r.initialize().await;

        let (set, tools) = r.select_tools("hi").await;
        assert_eq!(set, ToolSet::Essential);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "web_search");

        let (set, tools) = r.select_tools("open issues in this repository?").await;
        assert_eq!(set, ToolSet::Full);
        assert_eq!(tools.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_provider_failure() {
        let failing = Arc::new(StaticProvider {
            invoke_fails: true,
            ..Arc::try_unwrap(StaticProvider::new("flaky", &["ping"])).ok().unwrap()
        });
        let r = router(
            vec![failing, StaticProvider::new("steady", &["pong"])],
            vec![provider_config("flaky"), provider_config("steady")],
        );
        r.initialize().await;

        assert!(matches!(
            r.invoke("nope", Value::Null).await,
            Err(ParleyError::ToolNotFound(ref n)) if n == "nope"
        ));
        match r.invoke("flaky_ping", Value::Null).await {
            Err(ParleyError::ToolInvocationFailed { tool, reason }) => {
                assert_eq!(tool, "flaky_ping");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(r.invoke("pong", Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_invocations_run_concurrently() {
        let r = Arc::new(router(
            vec![StaticProvider::new("a", &["x"])],
            vec![provider_config("a")],
        ));
        r.initialize().await;
        let calls = (0..8).map(|i| {
            let r = Arc::clone(&r);
            async move { r.invoke("x", serde_json::json!(i)).await }
        });
        let results = join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_liveness_is_probed_per_call() {
        let flaky = StaticProvider::new("flaky", &["a"]);
        let r = router(
            vec![flaky.clone(), StaticProvider::new("steady", &["b"])],
            vec![provider_config("flaky"), provider_config("steady")],
        );
        r.initialize().await;
        assert_eq!(r.connected_providers().await, vec!["flaky", "steady"]);

        flaky.listing_fails.store(true, Ordering::SeqCst);
        assert_eq!(r.connected_providers().await, vec!["steady"]);

        flaky.listing_fails.store(false, Ordering::SeqCst);
        assert_eq!(r.connected_providers().await, vec!["flaky", "steady"]);
        assert_eq!(r.provider_names().await.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_all_and_is_idempotent() {
        let stuck = Arc::new(StaticProvider {
            shutdown_fails: true,
            ..Arc::try_unwrap(StaticProvider::new("stuck", &["a"])).ok().unwrap()
        });
        let fine = StaticProvider::new("fine", &["b"]);
        let r = router(
            vec![stuck.clone(), fine.clone()],
            vec![provider_config("stuck"), provider_config("fine")],
        );
        r.initialize().await;
        r.shutdown().await;

        assert!(!r.is_ready());
        assert_eq!(stuck.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(fine.shutdowns.load(Ordering::SeqCst), 1);
        assert!(r.catalog().await.is_empty());

        r.shutdown().await;
        assert_eq!(fine.shutdowns.load(Ordering::SeqCst), 1);
    }
}
