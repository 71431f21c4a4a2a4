use std::sync::Arc;
use tracing::debug;

use super::chain::{Address, ChainClient, UnsignedPayload};
use crate::error::{AppError, AppResult};

/// Parse a `0x`-prefixed 20-byte hex address
pub fn parse_address(raw: &str) -> AppResult<Address> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(digits)
        .map_err(|_| AppError::InvalidAddress(format!("not hex: {}", raw)))?;

    Address::try_from(bytes.as_slice())
        .map_err(|_| AppError::InvalidAddress(format!("expected 20 bytes: {}", raw)))
}

/// Turns a net amount and destination into an unsigned transfer.
///
/// Validates its inputs and delegates encoding to the chain client. Build
/// failures are returned as-is; retrying is the next cycle's job.
pub struct TransactionBuilder {
    chain: Arc<dyn ChainClient>,
}

impl TransactionBuilder {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }

    pub async fn build(
        &self,
        from: &str,
        to: &str,
        token_contract: &str,
        amount: u64,
    ) -> AppResult<UnsignedPayload> {
        if amount == 0 {
            return Err(AppError::InvalidAmount("transfer amount must be positive".into()));
        }

        let from = parse_address(from)?;
        let to = parse_address(to)?;
        let contract = parse_address(token_contract)?;
        if from == to {
            return Err(AppError::InvalidAddress(
                "sender and treasury are the same account".into(),
            ));
        }

        let payload = self.chain.build_transfer(&from, &to, &contract, amount).await?;
        debug!("Unsigned transfer of {} built ({} bytes)", amount, payload.bytes.len());

        Ok(payload)
    }
}
