// EVM JSON-RPC chain client
//
// Builds legacy (EIP-155) ERC-20 transfer transactions. The unsigned payload is
// the EIP-155 signing list [nonce, gasPrice, gas, to, value, data, chainId, 0, 0];
// its Keccak-256 digest is the message handed to the threshold signer.

use async_trait::async_trait;
use reqwest::Client;
use rlp::{Rlp, RlpStream};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::chain::{Address, ChainClient, TxHandle, TxReceipt, TxSignature, UnsignedPayload};
use crate::error::{AppError, AppResult, ChainError};

/// ERC-20 `transfer(address,uint256)` selector
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub network: String,
    /// Fixed gas limit; estimated per transfer when unset
    pub gas_limit: Option<u64>,
    pub request_timeout: Duration,
    pub receipt_poll: Duration,
    pub receipt_timeout: Duration,
}

impl Default for EvmConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id: 1,
            network: "ethereum".to_string(),
            gas_limit: None,
            request_timeout: Duration::from_secs(15),
            receipt_poll: Duration::from_secs(3),
            receipt_timeout: Duration::from_secs(180),
        }
    }
}

pub struct EvmRpcClient {
    config: EvmConfig,
    http: Client,
    next_id: AtomicU64,
}

impl EvmRpcClient {
    pub fn new(config: EvmConfig) -> AppResult<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            config,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    async fn rpc<T: DeserializeOwned>(&self, method: &str, params: Value) -> AppResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response: RpcResponse = self
            .http
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: format!("{}: {}", method, error.message),
            }
            .into());
        }

        serde_json::from_value(response.result).map_err(|e| {
            ChainError::MalformedPayload(format!("{} returned unexpected result: {}", method, e))
                .into()
        })
    }

    async fn quantity(&self, method: &str, params: Value) -> AppResult<u128> {
        let raw: String = self.rpc(method, params).await?;
        parse_quantity(&raw)
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    fn network(&self) -> &str {
        &self.config.network
    }

    #[instrument(skip(self, from, to, contract), fields(network = %self.config.network))]
    async fn build_transfer(
        &self,
        from: &Address,
        to: &Address,
        contract: &Address,
        amount: u64,
    ) -> AppResult<UnsignedPayload> {
        let from_hex = format!("0x{}", hex::encode(from));
        let contract_hex = format!("0x{}", hex::encode(contract));
        let data = transfer_calldata(to, amount);

        let nonce = self
            .quantity("eth_getTransactionCount", json!([from_hex, "pending"]))
            .await?;
        let gas_price = self.quantity("eth_gasPrice", json!([])).await?;
        let gas_limit = match self.config.gas_limit {
            Some(limit) => u128::from(limit),
            None => {
                let call = json!({
                    "from": from_hex,
                    "to": contract_hex,
                    "data": format!("0x{}", hex::encode(&data)),
                });
                self.quantity("eth_estimateGas", json!([call])).await?
            }
        };

        let tx = LegacyTx {
            nonce,
            gas_price,
            gas_limit,
            to: *contract,
            value: 0,
            data,
            chain_id: self.config.chain_id,
        };
        let payload = tx.unsigned_payload();

        debug!(
            "Built transfer nonce={} gas_price={} gas={} hash={}",
            nonce,
            gas_price,
            gas_limit,
            payload.message_hash_hex()
        );
        Ok(payload)
    }

    async fn send(&self, unsigned: &UnsignedPayload, signature: &TxSignature) -> AppResult<TxHandle> {
        let signed = encode_signed(&unsigned.bytes, signature)?;
        let local_hash = format!("0x{}", hex::encode(keccak(&signed)));

        let tx_hash: String = self
            .rpc(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(&signed))]),
            )
            .await
            .map_err(|e| match e {
                AppError::Chain(ChainError::Rpc { message, .. }) => {
                    AppError::Chain(ChainError::SubmissionFailed(message))
                }
                other => other,
            })?;

        if !tx_hash.eq_ignore_ascii_case(&local_hash) {
            warn!("Node returned hash {} for locally computed {}", tx_hash, local_hash);
        }

        info!("📡 Submitted transaction {}", tx_hash);
        Ok(TxHandle { tx_hash })
    }

    async fn wait_mined(&self, handle: &TxHandle) -> AppResult<TxReceipt> {
        let poll = async {
            loop {
                if let Some(receipt) = self.receipt(&handle.tx_hash).await? {
                    return Ok::<_, AppError>(receipt);
                }
                tokio::time::sleep(self.config.receipt_poll).await;
            }
        };

        match tokio::time::timeout(self.config.receipt_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::ReceiptTimeout(handle.tx_hash.clone()).into()),
        }
    }

    async fn receipt(&self, tx_hash: &str) -> AppResult<Option<TxReceipt>> {
        let receipt: Option<ReceiptDto> = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let status = match receipt.status {
            Some(status) => parse_quantity(&status)?,
            None => 1,
        };
        let status = u64::try_from(status)
            .map_err(|_| ChainError::MalformedPayload(format!("receipt status {}", status)))?;
        let block_number = u64::try_from(parse_quantity(&block_number)?)
            .map_err(|_| ChainError::MalformedPayload("block number overflow".into()))?;

        Ok(Some(TxReceipt {
            tx_hash: receipt.transaction_hash,
            success: status == 1,
            status,
            block_number,
        }))
    }

    async fn block_number(&self) -> AppResult<u64> {
        let number = self.quantity("eth_blockNumber", json!([])).await?;
        u64::try_from(number)
            .map_err(|_| ChainError::MalformedPayload("block number overflow".into()).into())
    }
}

// ========== WIRE FORMAT ==========

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptDto {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
}

// ========== ENCODING ==========

/// Legacy transaction fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u128,
    pub gas_price: u128,
    pub gas_limit: u128,
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTx {
    /// EIP-155 signing list and its Keccak digest
    pub fn unsigned_payload(&self) -> UnsignedPayload {
        let mut stream = RlpStream::new_list(9);
        stream.append(&trimmed_be(self.nonce));
        stream.append(&trimmed_be(self.gas_price));
        stream.append(&trimmed_be(self.gas_limit));
        stream.append(&self.to.to_vec());
        stream.append(&trimmed_be(self.value));
        stream.append(&self.data);
        stream.append(&trimmed_be(u128::from(self.chain_id)));
        stream.append(&Vec::<u8>::new());
        stream.append(&Vec::<u8>::new());

        let bytes = stream.out().to_vec();
        let message_hash = keccak(&bytes);
        UnsignedPayload {
            bytes,
            message_hash,
        }
    }
}

/// Replace the trailing [chainId, 0, 0] of a signing list with [v, r, s]
pub fn encode_signed(unsigned: &[u8], signature: &TxSignature) -> AppResult<Vec<u8>> {
    let rlp = Rlp::new(unsigned);
    if !rlp.is_list() || rlp.item_count()? != 9 {
        return Err(ChainError::MalformedPayload("expected a 9 item signing list".into()).into());
    }
    if signature.recovery_id > 1 {
        return Err(ChainError::MalformedPayload(format!(
            "recovery id {} out of range",
            signature.recovery_id
        ))
        .into());
    }

    let chain_id_bytes: Vec<u8> = rlp.val_at(6)?;
    let chain_id = chain_id_bytes
        .iter()
        .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte));
    let v = chain_id * 2 + 35 + u128::from(signature.recovery_id);

    let mut stream = RlpStream::new_list(9);
    for index in 0..6 {
        stream.append_raw(rlp.at(index)?.as_raw(), 1);
    }
    stream.append(&trimmed_be(v));
    stream.append(&trim_leading_zeros(&signature.r));
    stream.append(&trim_leading_zeros(&signature.s));

    Ok(stream.out().to_vec())
}

/// `transfer(to, amount)` ABI call data
pub fn transfer_calldata(to: &Address, amount: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 + 32);
    data.extend_from_slice(&TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to);
    data.extend_from_slice(&[0u8; 24]);
    data.extend_from_slice(&amount.to_be_bytes());
    data
}

pub fn keccak(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Big-endian bytes without leading zeros; RLP's integer encoding
fn trimmed_be(value: u128) -> Vec<u8> {
    trim_leading_zeros(&value.to_be_bytes())
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// Parse a `0x`-prefixed JSON-RPC quantity
pub fn parse_quantity(raw: &str) -> AppResult<u128> {
    let digits = raw.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|_| ChainError::MalformedPayload(format!("invalid quantity {}", raw)).into())
}
