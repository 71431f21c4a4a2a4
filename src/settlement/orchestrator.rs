// Settlement orchestrator
//
// Three phases, each run on its own schedule:
// - load:     pull outstanding fee events per wallet into the wallet's Draft run
// - transact: claim Draft runs with a positive net and drive them through
//             build → sign → mark signed → collect → broadcast → confirm
// - post:     confirm Broadcast runs once deep enough, re-send collection
//             reports the fee ledger has not acknowledged
//
// All cross-worker coordination goes through the settlement ledger. A cycle
// fans out over wallets with bounded parallelism and collects per-wallet
// errors instead of stopping at the first one.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use super::concurrency::{ConcurrencyGovernor, FanOut};
use super::netting::NettingEngine;
use crate::error::{AppError, AppResult, ChainError, ErrorClass};
use crate::execution::builder::TransactionBuilder;
use crate::execution::chain::{ChainClient, TxSignature, UnsignedPayload};
use crate::execution::signing::SigningCoordinator;
use crate::fees::models::FeeId;
use crate::fees::source::FeeEventSource;
use crate::ledger::models::{AttachOutcome, RunState, SettlementRun};
use crate::ledger::service::SettlementLedger;
use crate::wallet::models::WalletEntry;
use crate::wallet::repository::WalletRegistry;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Destination of every settlement transfer
    pub treasury_address: String,
    pub token_contract: String,
    /// Largest single settlement, smallest currency unit
    pub max_fee_amount: u64,
    pub load_concurrency: usize,
    pub transact_concurrency: usize,
    pub post_concurrency: usize,
    /// Wait for the transfer to be mined inside the transact phase
    pub wait_mined: bool,
    pub success_confirmations: u64,
    pub cycle_deadline: Duration,
    /// Reset pre-collection claims idle for longer than this back to Draft
    pub stale_claim_after: Option<Duration>,
    /// Transact a wallet right after loading new events into its Draft run
    pub transact_on_load: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            treasury_address: String::new(),
            token_contract: String::new(),
            max_fee_amount: 500_000_000,
            load_concurrency: 10,
            transact_concurrency: 10,
            post_concurrency: 10,
            wait_mined: false,
            success_confirmations: 20,
            cycle_deadline: Duration::from_secs(600),
            stale_claim_after: None,
            transact_on_load: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Load,
    Transact,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Load => write!(f, "load"),
            Phase::Transact => write!(f, "transact"),
            Phase::Post => write!(f, "post"),
        }
    }
}

// ========== OUTCOMES ==========

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub attached: usize,
    pub already_attached: usize,
    /// The wallet had a run in flight; events wait for the next load
    pub deferred: bool,
    pub settlement: Option<WalletSettlement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalletSettlement {
    NoDraft,
    /// Debits do not exceed credits; the Draft run keeps collecting events
    CarriedForward { run_id: Uuid, debt: i128 },
    /// Another pipeline owns the wallet's run
    Busy { run_id: Uuid, state: RunState },
    Settled { run_id: Uuid, outcome: RunOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Net was not positive once claimed; the run was failed with no side effects
    NothingOwed,
    Broadcast { tx_hash: String },
    Confirmed { tx_hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostOutcome {
    Pending,
    Confirmed,
    Reverted,
    Reported,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletFailure {
    pub wallet_key: String,
    pub class: ErrorClass,
    pub error: String,
}

/// Aggregate result of one phase cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub phase: Phase,
    pub succeeded: usize,
    /// Wallets that had nothing to do this cycle
    pub skipped: usize,
    pub not_started: usize,
    pub failures: Vec<WalletFailure>,
}

impl CycleReport {
    fn from_fan_out<T>(phase: Phase, outcome: FanOut<T>, is_skip: impl Fn(&T) -> bool) -> Self {
        let skipped = outcome.completed.iter().filter(|(_, v)| is_skip(v)).count();
        let failures = outcome
            .failed
            .into_iter()
            .map(|(wallet_key, error)| {
                log_failure(phase, &wallet_key, &error);
                WalletFailure {
                    wallet_key,
                    class: error.class(),
                    error: error.to_string(),
                }
            })
            .collect();

        Self {
            phase,
            succeeded: outcome.completed.len() - skipped,
            skipped,
            not_started: outcome.not_started.len(),
            failures,
        }
    }

    fn merge(mut self, other: CycleReport) -> Self {
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.not_started += other.not_started;
        self.failures.extend(other.failures);
        self
    }
}

fn log_failure(phase: Phase, wallet_key: &str, error: &AppError) {
    match error.class() {
        ErrorClass::Transient => {
            warn!(phase = %phase, wallet = %wallet_key, "⚠️ Transient failure, next cycle retries: {}", error)
        }
        ErrorClass::Cancelled => {
            info!(phase = %phase, wallet = %wallet_key, "Pipeline stopped by shutdown")
        }
        class => {
            error!(phase = %phase, wallet = %wallet_key, class = ?class, "❌ {}", error)
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> AppResult<()> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    Ok(())
}

// ========== ORCHESTRATOR ==========

pub struct SettlementOrchestrator {
    wallets: Arc<dyn WalletRegistry>,
    fees: Arc<dyn FeeEventSource>,
    ledger: SettlementLedger,
    chain: Arc<dyn ChainClient>,
    builder: TransactionBuilder,
    signing: SigningCoordinator,
    load_governor: ConcurrencyGovernor,
    transact_governor: ConcurrencyGovernor,
    post_governor: ConcurrencyGovernor,
    config: OrchestratorConfig,
}

impl SettlementOrchestrator {
    pub fn new(
        wallets: Arc<dyn WalletRegistry>,
        fees: Arc<dyn FeeEventSource>,
        ledger: SettlementLedger,
        chain: Arc<dyn ChainClient>,
        signing: SigningCoordinator,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            wallets,
            fees,
            ledger,
            builder: TransactionBuilder::new(chain.clone()),
            chain,
            signing,
            load_governor: ConcurrencyGovernor::new(config.load_concurrency),
            transact_governor: ConcurrencyGovernor::new(config.transact_concurrency),
            post_governor: ConcurrencyGovernor::new(config.post_concurrency),
            config,
        }
    }

    pub fn ledger(&self) -> &SettlementLedger {
        &self.ledger
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.cycle_deadline
    }

    async fn keyed_wallets(&self) -> AppResult<Vec<(String, WalletEntry)>> {
        let wallets = self.wallets.list_wallets().await?;
        Ok(wallets
            .into_iter()
            .map(|wallet| (wallet.public_key.clone(), wallet))
            .collect())
    }

    // ========== LOAD PHASE ==========

    /// Attach every wallet's outstanding fee events to its Draft run.
    /// Fails only when the wallet list itself cannot be read.
    #[instrument(skip_all)]
    pub async fn run_load_cycle(self: &Arc<Self>, cancel: &CancellationToken) -> AppResult<CycleReport> {
        let wallets = self.keyed_wallets().await?;
        info!("📥 Load cycle over {} wallets", wallets.len());

        let this = self.clone();
        let token = cancel.clone();
        let mut outcome = self
            .load_governor
            .fan_out(wallets, cancel, self.deadline(), move |wallet| {
                let this = this.clone();
                let token = token.clone();
                async move { this.load_wallet(&wallet, &token).await }
            })
            .await;
        if self.config.transact_on_load {
            self.escalate_collected_timeouts(&mut outcome.failed).await;
        }

        let report = CycleReport::from_fan_out(Phase::Load, outcome, |summary| {
            summary.attached == 0 && summary.settlement.is_none()
        });
        info!(
            "✓ Load cycle done: {} loaded, {} idle, {} failed",
            report.succeeded,
            report.skipped,
            report.failures.len()
        );
        Ok(report)
    }

    #[instrument(skip(self, wallet, cancel), fields(wallet = %wallet.public_key))]
    pub async fn load_wallet(
        self: &Arc<Self>,
        wallet: &WalletEntry,
        cancel: &CancellationToken,
    ) -> AppResult<LoadSummary> {
        let events = self.fees.list_outstanding(&wallet.public_key).await?;
        let mut summary = LoadSummary::default();

        for event in &events {
            checkpoint(cancel)?;
            match self.ledger.attach_event(&wallet.public_key, event).await? {
                AttachOutcome::Attached { .. } => summary.attached += 1,
                AttachOutcome::AlreadyAttached { .. } => summary.already_attached += 1,
                AttachOutcome::Deferred { run_id, state } => {
                    debug!(run_id = %run_id, state = %state, "Run in flight, deferring fee loading");
                    summary.deferred = true;
                    break;
                }
            }
        }

        if summary.attached > 0 {
            info!("📝 Attached {} new fee events", summary.attached);
            if self.config.transact_on_load {
                checkpoint(cancel)?;
                summary.settlement = Some(self.transact_wallet(wallet, cancel).await?);
            }
        }

        Ok(summary)
    }

    // ========== TRANSACT PHASE ==========

    /// Settle every wallet whose Draft run nets to a positive amount
    #[instrument(skip_all)]
    pub async fn run_transact_cycle(self: &Arc<Self>, cancel: &CancellationToken) -> AppResult<CycleReport> {
        if let Some(stale_after) = self.config.stale_claim_after {
            if let Err(e) = self.reclaim_stale(stale_after).await {
                warn!("Stale claim recovery failed: {}", e);
            }
        }

        let wallets = self.keyed_wallets().await?;
        info!("💸 Transact cycle over {} wallets", wallets.len());

        let this = self.clone();
        let token = cancel.clone();
        let mut outcome = self
            .transact_governor
            .fan_out(wallets, cancel, self.deadline(), move |wallet| {
                let this = this.clone();
                let token = token.clone();
                async move { this.transact_wallet(&wallet, &token).await }
            })
            .await;
        self.escalate_collected_timeouts(&mut outcome.failed).await;

        let report = CycleReport::from_fan_out(Phase::Transact, outcome, |settlement| {
            !matches!(settlement, WalletSettlement::Settled { .. })
        });
        info!(
            "✓ Transact cycle done: {} settled, {} skipped, {} failed",
            report.succeeded,
            report.skipped,
            report.failures.len()
        );
        Ok(report)
    }

    /// Return pre-collection claims idle for longer than `stale_after` to Draft
    pub async fn reclaim_stale(&self, stale_after: Duration) -> AppResult<usize> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| AppError::Config(format!("stale claim window: {}", e)))?;
        let stale = self.ledger.stale_claims(chrono::Utc::now() - stale_after).await?;

        let mut reset = 0;
        for run in stale {
            match self.ledger.reset_to_draft(run.id).await {
                Ok(_) => {
                    warn!(wallet = %run.wallet_key, run_id = %run.id, state = %run.state, "Reclaimed stale settlement run");
                    reset += 1;
                }
                Err(e) => warn!(run_id = %run.id, "Could not reclaim stale run: {}", e),
            }
        }
        Ok(reset)
    }

    /// A deadline that fires after collection leaves the wallet's run
    /// Collected with no recorded transfer; the next cycle will not touch it.
    async fn escalate_collected_timeouts(&self, failed: &mut [(String, AppError)]) {
        for (wallet_key, error) in failed.iter_mut() {
            if !matches!(error, AppError::DeadlineExceeded) {
                continue;
            }
            match self.ledger.open_run(wallet_key).await {
                Ok(Some(run)) if run.state == RunState::Collected => {
                    error!(wallet = %wallet_key, run_id = %run.id, "🚨 Cycle deadline passed after fees were collected");
                    *error = AppError::ReconciliationRequired {
                        run_id: run.id,
                        reason: "cycle deadline passed after fees were collected".to_string(),
                    };
                }
                Ok(_) => {}
                Err(e) => warn!(wallet = %wallet_key, "Could not inspect run after deadline: {}", e),
            }
        }
    }

    #[instrument(skip(self, wallet, cancel), fields(wallet = %wallet.public_key))]
    pub async fn transact_wallet(
        self: &Arc<Self>,
        wallet: &WalletEntry,
        cancel: &CancellationToken,
    ) -> AppResult<WalletSettlement> {
        let Some(open) = self.ledger.open_run(&wallet.public_key).await? else {
            return Ok(WalletSettlement::NoDraft);
        };
        if open.state != RunState::Draft {
            return Ok(WalletSettlement::Busy {
                run_id: open.id,
                state: open.state,
            });
        }

        let events = self.ledger.run_events(open.id).await?;
        let obligation = NettingEngine::net(&events)?;
        if !obligation.proceed {
            debug!(run_id = %open.id, debt = %obligation.debt, "Nothing owed, carrying draft forward");
            return Ok(WalletSettlement::CarriedForward {
                run_id: open.id,
                debt: obligation.debt,
            });
        }

        checkpoint(cancel)?;
        let Some(run) = self.ledger.begin_transacting(&wallet.public_key).await? else {
            return Ok(WalletSettlement::Busy {
                run_id: open.id,
                state: RunState::Transacting,
            });
        };

        let run_id = run.id;
        let outcome = self.execute_run(wallet, run, cancel).await?;
        Ok(WalletSettlement::Settled { run_id, outcome })
    }

    /// Drive a claimed run forward. Steps are strictly sequential.
    ///
    /// Errors before collection leave the run in Transacting or Signed with no
    /// events collected. Errors after collection leave the run Collected and
    /// are escalated as reconciliation failures. Every write before collection
    /// is made under the run's claim, so a pipeline whose run was reclaimed
    /// stops with [`LedgerError::ClaimLost`](crate::error::LedgerError::ClaimLost).
    #[instrument(skip(self, wallet, run, cancel), fields(wallet = %wallet.public_key, run_id = %run.id))]
    pub async fn execute_run(
        self: &Arc<Self>,
        wallet: &WalletEntry,
        run: SettlementRun,
        cancel: &CancellationToken,
    ) -> AppResult<RunOutcome> {
        let run_id = run.id;
        let claim = run
            .claim()
            .ok_or_else(|| AppError::Internal(format!("run {} was not claimed", run_id)))?;

        // Authoritative amount comes from the run's own events
        let events = self.ledger.run_events(run_id).await?;
        let obligation = NettingEngine::net(&events)?;
        if !obligation.proceed {
            self.ledger
                .fail_claim(claim, "net obligation is not positive")
                .await?;
            return Ok(RunOutcome::NothingOwed);
        }
        if obligation.amount > self.config.max_fee_amount {
            let reason = format!(
                "net {} exceeds max fee amount {}",
                obligation.amount, self.config.max_fee_amount
            );
            self.ledger.fail_claim(claim, &reason).await?;
            return Err(AppError::InvalidAmount(reason));
        }
        let amount = obligation.amount;
        let fee_ids: Vec<_> = events.iter().map(|event| event.id).collect();

        checkpoint(cancel)?;
        let payload = self
            .builder
            .build(
                &wallet.address,
                &self.config.treasury_address,
                &self.config.token_contract,
                amount,
            )
            .await?;

        checkpoint(cancel)?;
        let signature = self.signing.sign(&wallet.public_key, run_id, &payload).await?;

        checkpoint(cancel)?;
        let unsigned_hex = payload.to_hex();
        self.ledger.mark_signed(claim, &unsigned_hex).await?;

        checkpoint(cancel)?;
        self.ledger.mark_collected(claim).await?;
        info!(amount, fees = fee_ids.len(), "🧾 Fees collected, broadcasting");

        // No cancellation point from here on. The tail runs as its own task so
        // a cycle deadline cannot drop it between submission and recording.
        let tail = self
            .clone()
            .broadcast_collected(run_id, amount, unsigned_hex, fee_ids, payload, signature);
        match tokio::spawn(tail.in_current_span()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("🚨 Broadcast task ended abnormally after fees were collected: {}", e);
                Err(AppError::ReconciliationRequired {
                    run_id,
                    reason: format!("broadcast task ended abnormally: {}", e),
                })
            }
        }
    }

    async fn broadcast_collected(
        self: Arc<Self>,
        run_id: Uuid,
        amount: u64,
        unsigned_hex: String,
        fee_ids: Vec<FeeId>,
        payload: UnsignedPayload,
        signature: TxSignature,
    ) -> AppResult<RunOutcome> {
        self.report_collection(run_id, amount, &unsigned_hex, &fee_ids).await;

        let tx_hash = match self.signing.broadcast(&payload, &signature).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                error!(
                    "🚨 Broadcast failed after fees were collected, run needs reconciliation: {}",
                    e
                );
                return Err(AppError::ReconciliationRequired {
                    run_id,
                    reason: format!("broadcast failed: {}", e),
                });
            }
        };

        if let Err(e) = self.ledger.mark_broadcast(run_id, &tx_hash).await {
            error!(tx_hash = %tx_hash, "🚨 Transfer submitted but not recorded: {}", e);
            return Err(AppError::ReconciliationRequired {
                run_id,
                reason: format!("broadcast {} not recorded: {}", tx_hash, e),
            });
        }
        info!(tx_hash = %tx_hash, "📡 Settlement broadcast");

        if !self.config.wait_mined {
            return Ok(RunOutcome::Broadcast { tx_hash });
        }

        match self.signing.wait_mined(&tx_hash).await {
            Ok(_) => {
                self.ledger.mark_confirmed(run_id).await?;
                info!(tx_hash = %tx_hash, "✅ Settlement confirmed");
                Ok(RunOutcome::Confirmed { tx_hash })
            }
            Err(e @ AppError::Chain(ChainError::ReceiptFailed { .. })) => {
                self.ledger.mark_failed(run_id, &e.to_string()).await?;
                Err(e)
            }
            Err(e) => {
                warn!(tx_hash = %tx_hash, "Receipt not available yet, post phase will confirm: {}", e);
                Ok(RunOutcome::Broadcast { tx_hash })
            }
        }
    }

    /// Best-effort: a failed report leaves `ledger_reported` unset for the post phase
    async fn report_collection(&self, run_id: Uuid, amount: u64, reference: &str, fee_ids: &[FeeId]) {
        let reported = self
            .fees
            .report_collected(amount, reference, self.chain.network(), fee_ids)
            .await;

        match reported {
            Ok(()) => {
                if let Err(e) = self.ledger.set_ledger_reported(run_id).await {
                    warn!(run_id = %run_id, "Could not record ledger report: {}", e);
                }
            }
            Err(e) => warn!(run_id = %run_id, "Collection report failed, post phase retries: {}", e),
        }
    }

    // ========== POST PHASE ==========

    /// Confirm Broadcast runs with enough confirmations and retry collection
    /// reports the fee ledger has not acknowledged
    #[instrument(skip_all)]
    pub async fn run_post_cycle(self: &Arc<Self>, cancel: &CancellationToken) -> AppResult<CycleReport> {
        let broadcast = self.ledger.runs_in_state(RunState::Broadcast).await?;
        let unreported = self.ledger.collected_unreported().await?;
        info!(
            "🔎 Post cycle: {} broadcast runs, {} unreported collections",
            broadcast.len(),
            unreported.len()
        );

        let deadline = self.deadline();

        let this = self.clone();
        let confirmations = self
            .post_governor
            .fan_out(keyed_runs(broadcast), cancel, deadline, move |run| {
                let this = this.clone();
                async move { this.confirm_run(&run).await }
            })
            .await;

        let this = self.clone();
        let reports = self
            .post_governor
            .fan_out(keyed_runs(unreported), cancel, deadline, move |run| {
                let this = this.clone();
                async move { this.report_run(&run).await }
            })
            .await;

        let report = CycleReport::from_fan_out(Phase::Post, confirmations, |outcome| {
            *outcome == PostOutcome::Pending
        })
        .merge(CycleReport::from_fan_out(Phase::Post, reports, |_| false));

        info!(
            "✓ Post cycle done: {} finalized, {} pending, {} failed",
            report.succeeded,
            report.skipped,
            report.failures.len()
        );
        Ok(report)
    }

    #[instrument(skip(self, run), fields(wallet = %run.wallet_key, run_id = %run.id))]
    pub async fn confirm_run(&self, run: &SettlementRun) -> AppResult<PostOutcome> {
        let tx_hash = run.tx_hash.as_deref().ok_or_else(|| {
            AppError::Internal(format!("broadcast run {} has no transaction hash", run.id))
        })?;

        let Some(receipt) = self.chain.receipt(tx_hash).await? else {
            return Ok(PostOutcome::Pending);
        };
        let head = self.chain.block_number().await?;
        let confirmations = head.saturating_sub(receipt.block_number) + 1;
        if confirmations < self.config.success_confirmations {
            debug!(tx_hash, confirmations, "Waiting for more confirmations");
            return Ok(PostOutcome::Pending);
        }

        if receipt.success {
            self.ledger.mark_confirmed(run.id).await?;
            info!(tx_hash, "✅ Settlement confirmed");
            Ok(PostOutcome::Confirmed)
        } else {
            let reason = ChainError::ReceiptFailed {
                tx_hash: tx_hash.to_string(),
                status: receipt.status,
            }
            .to_string();
            self.ledger.mark_failed(run.id, &reason).await?;
            error!(tx_hash, "🚨 Settlement transfer reverted after fees were collected");
            Ok(PostOutcome::Reverted)
        }
    }

    #[instrument(skip(self, run), fields(wallet = %run.wallet_key, run_id = %run.id))]
    pub async fn report_run(&self, run: &SettlementRun) -> AppResult<PostOutcome> {
        let events = self.ledger.run_events(run.id).await?;
        let obligation = NettingEngine::net(&events)?;
        let fee_ids: Vec<_> = events.iter().map(|event| event.id).collect();
        let reference = run
            .tx_hash
            .as_deref()
            .or(run.unsigned_tx.as_deref())
            .ok_or_else(|| AppError::Internal(format!("collected run {} has no payload", run.id)))?;

        self.fees
            .report_collected(obligation.amount, reference, self.chain.network(), &fee_ids)
            .await?;
        self.ledger.set_ledger_reported(run.id).await?;

        Ok(PostOutcome::Reported)
    }
}

fn keyed_runs(runs: Vec<SettlementRun>) -> Vec<(String, SettlementRun)> {
    runs.into_iter()
        .map(|run| (run.wallet_key.clone(), run))
        .collect()
}
