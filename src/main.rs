//! tandem - multiplexed streaming RPC server
//!
//! Serves the `demo.Echo` service over TCP, one RPC node per connection.

use std::sync::Arc;
use tandem_core::ServiceRegistry;
use tandem_server::{echo_service, Config, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // An explicitly named config file must load; otherwise fall back to defaults.
    let config_path = std::env::var("TANDEM_CONFIG").ok();
    let config = match Config::load() {
        Ok(config) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            config
        }
        Err(e) if config_path.is_some() => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            tracing::warn!("Using default configuration: {}", e);
            Config::default()
        }
    };
    config.validate()?;

    tracing::info!("Starting tandem server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Stream start timeout: {}s",
        config.rpc.stream_start_timeout_secs
    );
    tracing::info!(
        "  Session context: {}",
        if config.rpc.session_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    let registry = Arc::new(ServiceRegistry::new());
    registry.register(echo_service()?);

    let mut server = Server::new(ServerConfig::from(&config), registry);
    if config.rpc.session_enabled {
        server = server.with_sessions();
    }
    let server = Arc::new(server);

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
