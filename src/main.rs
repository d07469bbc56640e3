//! ==============================================================================
//! main.rs - weather relay entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the pieces together and owns process concerns: configuration,
//!     logging, credential checks and graceful shutdown.
//!
//! startup order:
//!     1. .env + relay.toml + env overrides
//!     2. logging
//!     3. credentials (missing keys => exit 1, nothing connects)
//!     4. socket.io connector + relay hub task
//!     5. web server until Ctrl-C
//!
//! ==============================================================================

use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use weather_relay::config::RelayConfig;
use weather_relay::hub::RelayHub;
use weather_relay::server::{run_server, ServerState};
use weather_relay::upstream::SocketIoTransport;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        eprintln!("{e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

async fn run() -> Result<()> {
    // a missing .env is normal in production
    dotenv::dotenv().ok();

    let (mut config, source) = RelayConfig::load_or_default()?;
    config.apply_env()?;

    init_logging(&config.logging.level);
    config.log_summary(source.as_deref());

    let credentials = config.credentials()?;

    let transport = SocketIoTransport::spawn(&config.upstream, &credentials.application_key)
        .context("failed to start upstream connector")?;

    let hub = RelayHub::new(credentials.api_key, config.trend.clone())
        .with_reading_log(config.logging.show_readings);
    let (handle, hub_task) = hub.spawn(transport);

    let state = ServerState {
        hub: handle,
        queue_depth: config.subscribers.queue_depth,
    };
    run_server(state, &config.server.static_dir, config.server.port, shutdown_signal()).await?;

    // open websocket tasks may still hold hub handles
    hub_task.abort();
    info!("Server closed");
    Ok(())
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down gracefully...");
}
