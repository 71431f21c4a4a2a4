use axum::{
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{get_run, health_check, list_wallet_runs, register_wallet, reset_run, AppState},
    error::{AppError, AppResult},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        // Settlement runs
        .route("/wallets/:key/runs", get(list_wallet_runs))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/reset", post(reset_run))
        // Wallet provisioning
        .route("/wallets", post(register_wallet))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

/// Serve until `shutdown` fires
pub async fn run_server(app: Router, bind_address: &str, shutdown: CancellationToken) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Config(format!("cannot bind {}: {}", bind_address, e)))?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Internal(format!("server error: {}", e)))?;
    Ok(())
}
