use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;

use crate::error::AppResult;

/// 20-byte account or contract address
pub type Address = [u8; 20];

/// Unsigned transfer ready to be signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedPayload {
    /// Chain-encoded unsigned transaction
    pub bytes: Vec<u8>,
    /// The single digest the signer must sign
    pub message_hash: [u8; 32],
}

impl UnsignedPayload {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }

    pub fn message_hash_hex(&self) -> String {
        hex::encode(self.message_hash)
    }
}

/// ECDSA signature components, recovery id normalized to 0 or 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHandle {
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub success: bool,
    pub status: u64,
    pub block_number: u64,
}

/// Chain SDK collaborator: transaction encoding, submission and receipts.
/// Nonce and gas lookups happen behind this trait.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Network name reported to the fee ledger
    fn network(&self) -> &str;

    /// Encode an unsigned token transfer of `amount` from `from` to `to`
    async fn build_transfer(
        &self,
        from: &Address,
        to: &Address,
        contract: &Address,
        amount: u64,
    ) -> AppResult<UnsignedPayload>;

    /// Attach the signature and submit once
    async fn send(&self, unsigned: &UnsignedPayload, signature: &TxSignature) -> AppResult<TxHandle>;

    /// Block until the transaction is mined or the client's receipt timeout elapses
    async fn wait_mined(&self, handle: &TxHandle) -> AppResult<TxReceipt>;

    /// `None` while the transaction is unknown or pending
    async fn receipt(&self, tx_hash: &str) -> AppResult<Option<TxReceipt>>;

    async fn block_number(&self) -> AppResult<u64>;
}
