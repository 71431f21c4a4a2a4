use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::chain::{ChainClient, TxHandle, TxReceipt, TxSignature, UnsignedPayload};
use crate::error::{AppResult, ChainError, SigningError};

/// Keysign request for a single transaction digest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignRequest {
    /// Threshold wallet's ECDSA public key
    pub public_key: String,
    pub chain: String,
    /// Unique per settlement run so parties join the same session on retry
    pub session_id: String,
    /// Base64 unsigned transaction, for signer-side policy checks
    pub transaction: String,
    /// Hex digests to sign
    pub messages: Vec<String>,
}

/// One signature as returned by the keysign service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeysignResponse {
    pub r: String,
    pub s: String,
    pub recovery_id: String,
}

/// Message digest (hex) → signature
pub type SignatureMap = HashMap<String, KeysignResponse>;

/// Remote threshold-signing protocol
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, request: &SignRequest) -> AppResult<SignatureMap>;
}

// ========== REMOTE SIGNER ==========

#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
}

/// HTTP client for the keysign service
pub struct RemoteSigner {
    config: SignerConfig,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct SignResponseBody {
    #[serde(default)]
    signatures: SignatureMap,
}

impl RemoteSigner {
    pub fn new(config: SignerConfig) -> AppResult<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    #[instrument(skip(self, request), fields(session = %request.session_id))]
    async fn sign(&self, request: &SignRequest) -> AppResult<SignatureMap> {
        let response = self
            .http
            .post(format!("{}/sign", self.config.url.trim_end_matches('/')))
            .bearer_auth(&self.config.token)
            .json(request)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SigningError::Rejected(format!("{}: {}", status, body)).into());
        }

        let body: SignResponseBody = response.json().await?;
        Ok(body.signatures)
    }
}

// ========== SIGNATURE PARSING ==========

fn normalize_hex(raw: &str) -> String {
    raw.trim_start_matches("0x").to_ascii_lowercase()
}

fn decode_scalar(field: &'static str, raw: &str) -> Result<[u8; 32], SigningError> {
    let bytes = hex::decode(normalize_hex(raw)).map_err(|e| SigningError::MalformedSignature {
        field,
        reason: e.to_string(),
    })?;
    if bytes.is_empty() || bytes.len() > 32 {
        return Err(SigningError::MalformedSignature {
            field,
            reason: format!("{} bytes", bytes.len()),
        });
    }

    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// Convert a keysign response into chain signature components.
/// Accepts recovery ids 0/1 and the legacy 27/28 form.
pub fn parse_signature(response: &KeysignResponse) -> Result<TxSignature, SigningError> {
    let r = decode_scalar("r", &response.r)?;
    let s = decode_scalar("s", &response.s)?;

    let recovery = u8::from_str_radix(&normalize_hex(&response.recovery_id), 16).map_err(|e| {
        SigningError::MalformedSignature {
            field: "recovery_id",
            reason: e.to_string(),
        }
    })?;
    let recovery_id = match recovery {
        0 | 1 => recovery,
        27 | 28 => recovery - 27,
        other => {
            return Err(SigningError::MalformedSignature {
                field: "recovery_id",
                reason: format!("out of range: {}", other),
            })
        }
    };

    Ok(TxSignature { r, s, recovery_id })
}

// ========== COORDINATOR ==========

/// Drives the remote signing protocol and submission of the signed transfer
pub struct SigningCoordinator {
    signer: Arc<dyn Signer>,
    chain: Arc<dyn ChainClient>,
    party_prefix: String,
}

impl SigningCoordinator {
    pub fn new(signer: Arc<dyn Signer>, chain: Arc<dyn ChainClient>, party_prefix: String) -> Self {
        Self {
            signer,
            chain,
            party_prefix,
        }
    }

    pub fn sign_request(&self, wallet_key: &str, run_id: Uuid, payload: &UnsignedPayload) -> SignRequest {
        SignRequest {
            public_key: wallet_key.to_string(),
            chain: self.chain.network().to_string(),
            session_id: format!("{}-{}", self.party_prefix, run_id),
            transaction: payload.to_base64(),
            messages: vec![payload.message_hash_hex()],
        }
    }

    /// Sign the payload's single digest. Any signature count other than one,
    /// or a signature for another digest, is a protocol violation.
    #[instrument(skip(self, payload), fields(wallet = %wallet_key, run_id = %run_id))]
    pub async fn sign(
        &self,
        wallet_key: &str,
        run_id: Uuid,
        payload: &UnsignedPayload,
    ) -> AppResult<TxSignature> {
        let request = self.sign_request(wallet_key, run_id, payload);
        let signatures = self.signer.sign(&request).await?;

        if signatures.len() != 1 {
            error!(
                "🚨 Signer returned {} signatures for a single-message request",
                signatures.len()
            );
            return Err(SigningError::SignatureCount(signatures.len()).into());
        }

        let expected = payload.message_hash_hex();
        let (message, response) = signatures
            .iter()
            .next()
            .ok_or(SigningError::SignatureCount(0))?;
        if normalize_hex(message) != expected {
            return Err(SigningError::MessageMismatch(message.clone()).into());
        }

        let signature = parse_signature(response)?;
        info!("✍️ Transfer signed");
        Ok(signature)
    }

    /// Single best-effort submission. Returns the transaction hash.
    pub async fn broadcast(&self, payload: &UnsignedPayload, signature: &TxSignature) -> AppResult<String> {
        let handle = self.chain.send(payload, signature).await?;
        Ok(handle.tx_hash)
    }

    /// Wait for the transaction to be mined. A mined transaction with a failed
    /// status is a [`ChainError::ReceiptFailed`], distinct from a submission failure.
    pub async fn wait_mined(&self, tx_hash: &str) -> AppResult<TxReceipt> {
        let receipt = self
            .chain
            .wait_mined(&TxHandle {
                tx_hash: tx_hash.to_string(),
            })
            .await?;

        if !receipt.success {
            return Err(ChainError::ReceiptFailed {
                tx_hash: receipt.tx_hash,
                status: receipt.status,
            }
            .into());
        }

        Ok(receipt)
    }
}
