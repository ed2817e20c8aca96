//! # Realtime Server
//!
//! Entry point: tracing, configuration, then the TCP and HTTP/WebSocket
//! listeners until Ctrl+C.

use anyhow::Result;
use tracing::info;

use realtime_server::config::Settings;
use realtime_server::startup::Application;

#[tokio::main]
async fn main() -> Result<()> {
    realtime_server::telemetry::init_tracing();

    info!("Starting Realtime Server...");

    let settings = Settings::load()?;
    info!(
        http = %settings.server_addr(),
        tcp = %settings.tcp_addr(),
        backend = ?settings.pubsub.backend,
        environment = %settings.environment,
        "Configuration loaded"
    );

    let application = Application::build(settings).await?;

    info!("Server ready to accept connections");
    application.run_until_stopped().await?;

    Ok(())
}
