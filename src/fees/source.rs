// Fee ledger API client
//
// The fee ledger (verifier) is the system of record for usage fees. This
// client only reads outstanding events and reports collections back; it never
// retries locally, the next orchestrator cycle is the retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::models::{FeeDirection, FeeEvent, FeeId};
use crate::error::{AppError, AppResult, FeeApiError};

/// Read side of the fee ledger plus the collection report
#[async_trait]
pub trait FeeEventSource: Send + Sync {
    /// Fee events for the wallet that are not yet collected. No side effects.
    async fn list_outstanding(&self, wallet_key: &str) -> AppResult<Vec<FeeEvent>>;

    /// Tell the fee ledger these events were folded into a settlement.
    /// Idempotent on the fee ids.
    async fn report_collected(
        &self,
        amount: u64,
        tx_reference: &str,
        network: &str,
        fee_ids: &[FeeId],
    ) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct LedgerApiConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub requests_per_second: u32,
}

pub struct LedgerApiClient {
    config: LedgerApiConfig,
    http: Client,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl LedgerApiClient {
    pub fn new(config: LedgerApiConfig) -> AppResult<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;

        let per_second = NonZeroU32::new(config.requests_per_second.max(1))
            .ok_or_else(|| AppError::Config("requests_per_second must be positive".into()))?;
        let limiter = RateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            config,
            http,
            limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl FeeEventSource for LedgerApiClient {
    #[instrument(skip(self), fields(wallet = %wallet_key))]
    async fn list_outstanding(&self, wallet_key: &str) -> AppResult<Vec<FeeEvent>> {
        self.limiter.until_ready().await;

        let endpoint = format!("/fees/publickey/{}", wallet_key);
        let response = self
            .http
            .get(self.url(&endpoint))
            .bearer_auth(&self.config.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(FeeApiError::WalletNotFound(wallet_key.to_string()).into())
            }
            status => {
                return Err(FeeApiError::UnexpectedStatus {
                    endpoint,
                    status: status.as_u16(),
                }
                .into())
            }
        }

        let body = response.text().await?;
        let events = decode_outstanding(&body, wallet_key)?;

        debug!("Fee ledger returned {} outstanding events", events.len());
        Ok(events)
    }

    #[instrument(skip(self, fee_ids), fields(fees = fee_ids.len()))]
    async fn report_collected(
        &self,
        amount: u64,
        tx_reference: &str,
        network: &str,
        fee_ids: &[FeeId],
    ) -> AppResult<()> {
        self.limiter.until_ready().await;

        let body = CollectedRequest {
            ids: fee_ids,
            tx_hash: tx_reference,
            network,
            amount,
        };

        let response = self
            .http
            .post(self.url("/fees/collected"))
            .bearer_auth(&self.config.token)
            .json(&body)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(FeeApiError::UnexpectedStatus {
                endpoint: "/fees/collected".to_string(),
                status: response.status().as_u16(),
            }
            .into());
        }

        info!("📨 Reported {} collected fees ({}) to fee ledger", fee_ids.len(), amount);
        Ok(())
    }
}

// ========== WIRE FORMAT ==========

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: Option<T>,
    #[serde(default)]
    error: ApiErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, alias = "detailed_response")]
    details: String,
}

#[derive(Debug, Deserialize)]
struct FeeDto {
    id: u64,
    amount: u64,
    #[serde(default)]
    direction: FeeDirection,
    #[serde(default)]
    collected: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CollectedRequest<'a> {
    ids: &'a [FeeId],
    tx_hash: &'a str,
    network: &'a str,
    amount: u64,
}

fn decode_outstanding(body: &str, wallet_key: &str) -> AppResult<Vec<FeeEvent>> {
    let envelope: ApiResponse<Vec<FeeDto>> = serde_json::from_str(body).map_err(|e| {
        AppError::ExternalError(format!("Failed to decode fee ledger response: {}", e))
    })?;

    if !envelope.error.message.is_empty() {
        return Err(FeeApiError::Rejected {
            message: envelope.error.message,
            details: envelope.error.details,
        }
        .into());
    }

    Ok(envelope
        .data
        .unwrap_or_default()
        .into_iter()
        .filter(|fee| !fee.collected)
        .filter_map(|fee| {
            // One unrepresentable id must not hide the wallet's other fees
            let Ok(id) = FeeId::try_from(fee.id) else {
                warn!(wallet = %wallet_key, fee_id = fee.id, "Skipping fee event with out-of-range id");
                return None;
            };
            Some(FeeEvent {
                id,
                wallet_key: wallet_key.to_string(),
                amount: fee.amount,
                direction: fee.direction,
                collected: false,
                created_at: fee.created_at,
            })
        })
        .collect())
}
