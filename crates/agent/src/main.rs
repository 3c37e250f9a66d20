#![forbid(unsafe_code)]

mod cli;
mod shutdown;
mod startup;

use std::path::Path;

use anyhow::Context;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::parse();

    let config = infrastructure::config::AgentConfig::load(Path::new(&cli.config))
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    let level = cli.log_level.unwrap_or(config.agent.log_level);
    let format = cli.log_format.unwrap_or(config.agent.log_format);
    infrastructure::logging::init_logging(level, format)?;

    info!(
        agent = config.agent.name,
        version = env!("CARGO_PKG_VERSION"),
        "starting flowsentinel agent"
    );

    let token = shutdown::create_shutdown_token();
    startup::run(config, token).await
}
