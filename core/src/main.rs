/// ChatLink terminal client - Main entry point
use chatlink_core::{cli_app, Config};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Starting ChatLink");
    info!("   API: {}", config.api_url);
    info!("   Transport: {}", config.transport_addr);

    cli_app::run(config).await
}
