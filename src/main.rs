//! parley command-line entry point.

mod cli;

use anyhow::Result;
use clap::Parser;

use parley::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = cli::Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    init_tracing(cli.log_format, level);

    cli::run(cli).await
}
