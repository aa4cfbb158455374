use clap::Parser;
use color_eyre::eyre::Result;
use socks_http_bridge::{start_with_config, BridgeConfig, Cli};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("shbridge=info,socks_http_bridge=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = BridgeConfig::from_cli(&args);

    let handle = start_with_config(&args.rule, config).await?;
    info!("HTTP Proxy listening on {}", handle.url());
    // Printed on stdout so a parent process can pick up the address.
    println!("{}", handle.url());

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.close().await?;
    info!("Server shutdown complete");
    Ok(())
}
