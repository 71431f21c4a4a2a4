// Collaborator fakes shared by unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult, ChainError, FeeApiError, SigningError};
use crate::execution::chain::{
    Address, ChainClient, TxHandle, TxReceipt, TxSignature, UnsignedPayload,
};
use crate::execution::signing::{KeysignResponse, SignRequest, SignatureMap, Signer};
use crate::fees::models::{FeeEvent, FeeId};
use crate::fees::source::FeeEventSource;

pub const WALLET_ADDRESS: &str = "0x1111111111111111111111111111111111111111";
pub const TREASURY_ADDRESS: &str = "0x2222222222222222222222222222222222222222";
pub const TOKEN_CONTRACT: &str = "0x3333333333333333333333333333333333333333";
pub const FAKE_TX_HASH: &str =
    "0xabababababababababababababababababababababababababababababababab";

// ========== FEE LEDGER ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    pub amount: u64,
    pub reference: String,
    pub network: String,
    pub fee_ids: Vec<FeeId>,
}

/// In-memory fee ledger. Reported fee ids stop being outstanding.
#[derive(Default)]
pub struct FakeFeeSource {
    events: Mutex<Vec<FeeEvent>>,
    failing_wallets: Mutex<HashSet<String>>,
    failing_reports: AtomicBool,
    reports: Mutex<Vec<CollectionReport>>,
}

impl FakeFeeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: FeeEvent) {
        self.events.lock().push(event);
    }

    pub fn fail_wallet(&self, wallet_key: &str) {
        self.failing_wallets.lock().insert(wallet_key.to_string());
    }

    pub fn fail_reports(&self, fail: bool) {
        self.failing_reports.store(fail, Ordering::SeqCst);
    }

    /// Successful collection reports, in order
    pub fn reports(&self) -> Vec<CollectionReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl FeeEventSource for FakeFeeSource {
    async fn list_outstanding(&self, wallet_key: &str) -> AppResult<Vec<FeeEvent>> {
        if self.failing_wallets.lock().contains(wallet_key) {
            return Err(AppError::ExternalError("fee ledger connection refused".into()));
        }

        Ok(self
            .events
            .lock()
            .iter()
            .filter(|event| event.wallet_key == wallet_key && !event.collected)
            .cloned()
            .collect())
    }

    async fn report_collected(
        &self,
        amount: u64,
        tx_reference: &str,
        network: &str,
        fee_ids: &[FeeId],
    ) -> AppResult<()> {
        if self.failing_reports.load(Ordering::SeqCst) {
            return Err(FeeApiError::UnexpectedStatus {
                endpoint: "/fees/collected".to_string(),
                status: 503,
            }
            .into());
        }

        for event in self.events.lock().iter_mut() {
            if fee_ids.contains(&event.id) {
                event.collected = true;
            }
        }
        self.reports.lock().push(CollectionReport {
            amount,
            reference: tx_reference.to_string(),
            network: network.to_string(),
            fee_ids: fee_ids.to_vec(),
        });
        Ok(())
    }
}

// ========== SIGNER ==========

/// Signs whatever single digest it is asked for, or misbehaves on request
#[derive(Default)]
pub struct FakeSigner {
    extra_signatures: usize,
    wrong_message: bool,
    failing: AtomicBool,
    cancel_on_sign: Mutex<Option<CancellationToken>>,
}

impl FakeSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extra_signatures(extra: usize) -> Self {
        Self {
            extra_signatures: extra,
            ..Self::default()
        }
    }

    pub fn signing_wrong_message() -> Self {
        Self {
            wrong_message: true,
            ..Self::default()
        }
    }

    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Cancel `token` during the next signing session, which still succeeds
    pub fn cancel_on_sign(&self, token: CancellationToken) {
        *self.cancel_on_sign.lock() = Some(token);
    }
}

fn fake_signature() -> KeysignResponse {
    KeysignResponse {
        r: "11".repeat(32),
        s: "22".repeat(32),
        recovery_id: "00".to_string(),
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(&self, request: &SignRequest) -> AppResult<SignatureMap> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SigningError::Rejected("keysign session timed out".into()).into());
        }
        if let Some(token) = self.cancel_on_sign.lock().take() {
            token.cancel();
        }

        let mut signatures = SignatureMap::new();
        for message in &request.messages {
            let key = if self.wrong_message {
                "ff".repeat(32)
            } else {
                message.clone()
            };
            signatures.insert(key, fake_signature());
        }
        for i in 0..self.extra_signatures {
            signatures.insert(format!("{:064x}", i + 1), fake_signature());
        }

        Ok(signatures)
    }
}

// ========== CHAIN ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Success,
    Reverted,
    Pending,
}

/// Chain that always builds the same payload and returns [`FAKE_TX_HASH`]
pub struct FakeChain {
    failing_build: AtomicBool,
    failing_send: AtomicBool,
    receipt_mode: Mutex<ReceiptMode>,
    receipt_block: AtomicU64,
    head: AtomicU64,
    built: Mutex<Vec<u64>>,
    sent: AtomicUsize,
    send_delay: Mutex<Option<Duration>>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            failing_build: AtomicBool::new(false),
            failing_send: AtomicBool::new(false),
            receipt_mode: Mutex::new(ReceiptMode::Success),
            receipt_block: AtomicU64::new(100),
            head: AtomicU64::new(100),
            built: Mutex::new(Vec::new()),
            sent: AtomicUsize::new(0),
            send_delay: Mutex::new(None),
        }
    }

    pub fn payload(&self) -> UnsignedPayload {
        UnsignedPayload {
            bytes: b"unsigned-transfer".to_vec(),
            message_hash: [0x48; 32],
        }
    }

    pub fn fail_build(&self, fail: bool) {
        self.failing_build.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.failing_send.store(fail, Ordering::SeqCst);
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        *self.receipt_mode.lock() = mode;
    }

    pub fn set_receipt_block(&self, block: u64) {
        self.receipt_block.store(block, Ordering::SeqCst);
    }

    pub fn set_head(&self, block: u64) {
        self.head.store(block, Ordering::SeqCst);
    }

    /// Accept the transfer at once but answer `send` only after `delay`
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    pub fn built_amounts(&self) -> Vec<u64> {
        self.built.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn network(&self) -> &str {
        "ethereum"
    }

    async fn build_transfer(
        &self,
        _from: &Address,
        _to: &Address,
        _contract: &Address,
        amount: u64,
    ) -> AppResult<UnsignedPayload> {
        if self.failing_build.load(Ordering::SeqCst) {
            return Err(ChainError::BuildFailed("nonce lookup failed".into()).into());
        }
        self.built.lock().push(amount);
        Ok(self.payload())
    }

    async fn send(&self, _unsigned: &UnsignedPayload, _signature: &TxSignature) -> AppResult<TxHandle> {
        if self.failing_send.load(Ordering::SeqCst) {
            return Err(ChainError::SubmissionFailed("replacement transaction underpriced".into()).into());
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(TxHandle {
            tx_hash: FAKE_TX_HASH.to_string(),
        })
    }

    async fn wait_mined(&self, handle: &TxHandle) -> AppResult<TxReceipt> {
        match self.receipt(&handle.tx_hash).await? {
            Some(receipt) => Ok(receipt),
            None => Err(ChainError::ReceiptTimeout(handle.tx_hash.clone()).into()),
        }
    }

    async fn receipt(&self, tx_hash: &str) -> AppResult<Option<TxReceipt>> {
        let block_number = self.receipt_block.load(Ordering::SeqCst);
        let receipt = match *self.receipt_mode.lock() {
            ReceiptMode::Pending => None,
            ReceiptMode::Success => Some(TxReceipt {
                tx_hash: tx_hash.to_string(),
                success: true,
                status: 1,
                block_number,
            }),
            ReceiptMode::Reverted => Some(TxReceipt {
                tx_hash: tx_hash.to_string(),
                success: false,
                status: 0,
                block_number,
            }),
        };
        Ok(receipt)
    }

    async fn block_number(&self) -> AppResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }
}
