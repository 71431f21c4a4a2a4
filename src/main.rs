mod error;
mod api;
mod execution;
mod fees;
mod ledger;
mod settlement;
mod wallet;
mod server;
mod bootstrap;
mod config;

#[cfg(test)]
mod testing;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing::{error, info};

// Initialize logging and tracing
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "info,tower_http=debug,fee_settlement=debug".into()),
    );
    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("🚀 Starting Fee Settlement Worker");

    // Load configuration
    let settings = config::Settings::load().context("loading settings")?;

    let components = bootstrap::initialize(&settings)
        .await
        .context("initializing components")?;

    let shutdown = CancellationToken::new();
    let schedulers = components.scheduler.start(shutdown.clone());
    info!("⏰ Settlement schedulers started");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("🛑 Shutdown requested, finishing in-flight cycles");
        signal.cancel();
    });

    // Create HTTP server
    let app = server::create_app(components.state);

    // Run the Server
    server::run_server(app, &settings.bind_address, shutdown.clone())
        .await
        .context("running ops server")?;

    // Server returns on shutdown; let the schedulers drain
    shutdown.cancel();
    for handle in schedulers {
        if let Err(e) = handle.await {
            error!("❌ Scheduler task panicked: {}", e);
        }
    }

    info!("👋 Fee settlement worker stopped");
    Ok(())
}
