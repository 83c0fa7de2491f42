//! Tool provider inspection command.

use anyhow::Result;

use parley::config::Config;

use super::build_router;

/// Bring up every configured provider and print what came up.
pub(crate) async fn cmd_tools(config: Config) -> Result<()> {
    if config.tools.providers.is_empty() {
        println!("No tool providers configured.");
        println!("Add entries under \"tools.providers\" in {}", Config::path().display());
        return Ok(());
    }

    let router = build_router(&config);
    let report = router.initialize().await;

    println!("Providers:");
    for name in &report.connected {
        println!("  [ok]      {}", name);
    }
    for name in &report.skipped {
        println!("  [skipped] {} (credential not set)", name);
    }
    for (name, reason) in &report.failed {
        println!("  [failed]  {}: {}", name, reason);
    }

    let live = router.connected_providers().await;
    println!();
    let live = if live.is_empty() {
        "none".to_string()
    } else {
        live.join(", ")
    };
    println!("Responding now: {}", live);

    let catalog = router.catalog().await;
    println!();
    println!("Tools ({}):", catalog.len());
    for tool in &catalog {
        let summary = tool.description.lines().next().unwrap_or("");
        println!("  {:<32} {}", tool.name, summary);
    }

    router.shutdown().await;
    Ok(())
}
