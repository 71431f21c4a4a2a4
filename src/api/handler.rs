use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    execution::chain::ChainClient,
    ledger::{models::{RunState, SettlementRun}, service::SettlementLedger},
    wallet::{models::{RegisterWalletRequest, WalletEntry}, repository::WalletRegistry},
};

const DEFAULT_RUNS_LIMIT: i64 = 20;
const MAX_RUNS_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub ledger: SettlementLedger,
    pub wallets: Arc<dyn WalletRegistry>,
    pub chain: Arc<dyn ChainClient>,
}

/// GET /health - Health check
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let chain_head = match state.chain.block_number().await {
        Ok(head) => Some(head),
        Err(e) => {
            warn!("⚠️ Chain RPC unreachable during health check: {}", e);
            None
        }
    };

    let awaiting_confirmation = state.ledger.runs_in_state(RunState::Broadcast).await?.len();
    let awaiting_report = state.ledger.collected_unreported().await?.len();

    Ok(Json(HealthResponse {
        status: if chain_head.is_some() {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        timestamp: Utc::now(),
        chain_head,
        awaiting_confirmation,
        awaiting_report,
    }))
}

/// GET /wallets/:key/runs - Settlement history for a wallet, newest first
pub async fn list_wallet_runs(
    State(state): State<AppState>,
    Path(wallet_key): Path<String>,
    Query(query): Query<RunsQuery>,
) -> AppResult<Json<Vec<SettlementRun>>> {
    if state.wallets.get_wallet(&wallet_key).await?.is_none() {
        return Err(AppError::NotFound(format!("Wallet {} not registered", wallet_key)));
    }

    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, MAX_RUNS_LIMIT);
    let runs = state.ledger.runs_for_wallet(&wallet_key, limit).await?;
    Ok(Json(runs))
}

/// GET /runs/:id - One run with its fee events
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> AppResult<Json<RunDetailResponse>> {
    let run = state.ledger.get_run(run_id).await?;
    let events = state.ledger.run_events(run_id).await?;
    Ok(Json(RunDetailResponse { run, events }))
}

/// POST /runs/:id/reset - Return a stuck pre-collection run to Draft
pub async fn reset_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> AppResult<Json<ResetRunResponse>> {
    let previous_state = state.ledger.get_run(run_id).await?.state;
    let run = state.ledger.reset_to_draft(run_id).await?;

    warn!(
        run_id = %run_id,
        wallet = %run.wallet_key,
        "🔁 Run reset from {} to draft by operator",
        previous_state
    );
    Ok(Json(ResetRunResponse { previous_state, run }))
}

/// POST /wallets - Register a provisioned wallet
pub async fn register_wallet(
    State(state): State<AppState>,
    Json(request): Json<RegisterWalletRequest>,
) -> AppResult<(StatusCode, Json<WalletEntry>)> {
    let entry = state
        .wallets
        .register(&request.public_key, &request.address)
        .await?;

    info!("👛 Wallet {} registered ({})", entry.public_key, entry.address);
    Ok((StatusCode::CREATED, Json(entry)))
}
