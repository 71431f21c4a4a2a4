use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fees::models::FeeEvent;
use crate::ledger::models::{RunState, SettlementRun};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Latest block seen by the chain client, `None` when the RPC is unreachable
    pub chain_head: Option<u64>,
    /// Runs broadcast but not yet confirmed
    pub awaiting_confirmation: usize,
    /// Collected runs whose collection the fee ledger has not acknowledged
    pub awaiting_report: usize,
}

#[derive(Debug, Deserialize, Default)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

/// A run with the fee events it carries
#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: SettlementRun,
    pub events: Vec<FeeEvent>,
}

#[derive(Debug, Serialize)]
pub struct ResetRunResponse {
    pub previous_state: RunState,
    pub run: SettlementRun,
}
