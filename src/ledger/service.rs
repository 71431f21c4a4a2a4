use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::models::{AttachOutcome, Claim, RunState, RunUpdate, SettlementRun};
use super::store::SettlementStore;
use crate::error::{AppError, AppResult, LedgerError};
use crate::fees::models::FeeEvent;

/// Lost compare-and-set races tolerated before giving up on a transition
const MAX_CAS_ATTEMPTS: usize = 3;

/// What a requested transition means for a run in its current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// The run is already at or past the target; nothing to do
    AlreadyReached,
    /// Move from this state to the target
    From(RunState),
}

fn check_transition(run: &SettlementRun, target: RunState) -> Result<Step, LedgerError> {
    let invalid = || LedgerError::InvalidTransition {
        run_id: run.id,
        current: run.state,
        requested: target,
    };

    if run.state == RunState::Failed {
        return if target == RunState::Failed || run.progress().has_reached(target) {
            Ok(Step::AlreadyReached)
        } else {
            Err(invalid())
        };
    }

    if target == RunState::Failed {
        return match run.state {
            RunState::Confirmed => Err(invalid()),
            current => Ok(Step::From(current)),
        };
    }

    if run.state.has_reached(target) {
        return Ok(Step::AlreadyReached);
    }

    match target.predecessor() {
        Some(expected) if expected == run.state => Ok(Step::From(expected)),
        _ => Err(invalid()),
    }
}

/// Single writer of settlement run state.
///
/// Transitions only move forward. Requesting a state the run already passed
/// is a successful no-op, so every pipeline step can be retried after a crash.
/// Requesting a state out of order is a [`LedgerError::InvalidTransition`].
#[derive(Clone)]
pub struct SettlementLedger {
    store: Arc<dyn SettlementStore>,
}

impl SettlementLedger {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    // ========== EVENTS ==========

    #[instrument(skip(self, event), fields(wallet = %wallet_key, fee_id = event.id))]
    pub async fn attach_event(&self, wallet_key: &str, event: &FeeEvent) -> AppResult<AttachOutcome> {
        self.store.attach_event(wallet_key, event).await
    }

    pub async fn run_events(&self, run_id: Uuid) -> AppResult<Vec<FeeEvent>> {
        self.store.run_events(run_id).await
    }

    // ========== QUERIES ==========

    pub async fn get_run(&self, run_id: Uuid) -> AppResult<SettlementRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| LedgerError::RunNotFound(run_id).into())
    }

    pub async fn open_run(&self, wallet_key: &str) -> AppResult<Option<SettlementRun>> {
        self.store.open_run(wallet_key).await
    }

    pub async fn runs_for_wallet(&self, wallet_key: &str, limit: i64) -> AppResult<Vec<SettlementRun>> {
        self.store.runs_for_wallet(wallet_key, limit).await
    }

    pub async fn runs_in_state(&self, state: RunState) -> AppResult<Vec<SettlementRun>> {
        self.store.runs_in_state(state).await
    }

    pub async fn stale_claims(&self, older_than: DateTime<Utc>) -> AppResult<Vec<SettlementRun>> {
        self.store.stale_claims(older_than).await
    }

    pub async fn collected_unreported(&self) -> AppResult<Vec<SettlementRun>> {
        self.store.collected_unreported().await
    }

    pub async fn set_ledger_reported(&self, run_id: Uuid) -> AppResult<()> {
        self.store.set_ledger_reported(run_id).await
    }

    // ========== TRANSITIONS ==========

    /// Claim the wallet's Draft run. `None` when there is no Draft run or the
    /// wallet already has a run in flight. The returned run carries the new
    /// [`Claim`] the pipeline writes under until collection.
    #[instrument(skip(self), fields(wallet = %wallet_key))]
    pub async fn begin_transacting(&self, wallet_key: &str) -> AppResult<Option<SettlementRun>> {
        let claimed = self.store.claim_draft(wallet_key).await?;
        if let Some(run) = &claimed {
            info!(run_id = %run.id, events = run.event_ids.len(), "🔒 Claimed settlement run");
        }
        Ok(claimed)
    }

    /// Returns true when the run moved, false when it was already past Signed
    pub async fn mark_signed(&self, claim: Claim, unsigned_tx_hex: &str) -> AppResult<bool> {
        let update = RunUpdate {
            unsigned_tx: Some(unsigned_tx_hex.to_string()),
            ..Default::default()
        };
        self.advance(claim.run_id, RunState::Signed, update, Some(claim.claim_id))
            .await
    }

    /// Signed → Collected, flipping every attached event's collected flag in
    /// the same atomic step
    pub async fn collect_events(&self, claim: Claim) -> AppResult<bool> {
        self.advance(
            claim.run_id,
            RunState::Collected,
            RunUpdate::default(),
            Some(claim.claim_id),
        )
        .await
    }

    pub async fn mark_collected(&self, claim: Claim) -> AppResult<bool> {
        self.collect_events(claim).await
    }

    pub async fn mark_broadcast(&self, run_id: Uuid, tx_hash: &str) -> AppResult<bool> {
        let update = RunUpdate {
            tx_hash: Some(tx_hash.to_string()),
            ..Default::default()
        };
        self.advance(run_id, RunState::Broadcast, update, None).await
    }

    pub async fn mark_confirmed(&self, run_id: Uuid) -> AppResult<bool> {
        self.advance(run_id, RunState::Confirmed, RunUpdate::default(), None)
            .await
    }

    /// Move any non-confirmed run to Failed, keeping the state it had reached
    pub async fn mark_failed(&self, run_id: Uuid, reason: &str) -> AppResult<bool> {
        self.fail(run_id, reason, None).await
    }

    /// [`mark_failed`](Self::mark_failed) for a pipeline that still holds its claim
    pub async fn fail_claim(&self, claim: Claim, reason: &str) -> AppResult<bool> {
        self.fail(claim.run_id, reason, Some(claim.claim_id)).await
    }

    /// Return a pre-collection run (Transacting or Signed) to Draft so a later
    /// transact phase can claim it again. Collected and later runs are refused.
    #[instrument(skip(self))]
    pub async fn reset_to_draft(&self, run_id: Uuid) -> AppResult<SettlementRun> {
        let run = self.get_run(run_id).await?;
        if !run.state.is_pre_collection() {
            return Err(LedgerError::NotResettable {
                run_id,
                current: run.state,
            }
            .into());
        }

        if !self.store.reset_to_draft(run_id, run.state).await? {
            let current = self.get_run(run_id).await?;
            return Err(LedgerError::NotResettable {
                run_id,
                current: current.state,
            }
            .into());
        }

        info!(run_id = %run_id, from = %run.state, "↩️ Settlement run reset to draft");
        self.get_run(run_id).await
    }

    async fn fail(&self, run_id: Uuid, reason: &str, holder: Option<Uuid>) -> AppResult<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let run = self.held_run(run_id, holder).await?;
            let expected = match check_transition(&run, RunState::Failed)? {
                Step::AlreadyReached => return Ok(false),
                Step::From(expected) => expected,
            };

            let update = RunUpdate {
                failure_reason: Some(reason.to_string()),
                last_good_state: Some(expected),
                ..Default::default()
            };
            if self
                .store
                .compare_and_set(run_id, expected, RunState::Failed, update, holder)
                .await?
            {
                warn!(run_id = %run_id, state = %expected, reason, "❌ Settlement run failed");
                return Ok(true);
            }
        }

        Err(lost_race(run_id, RunState::Failed))
    }

    async fn advance(
        &self,
        run_id: Uuid,
        target: RunState,
        update: RunUpdate,
        holder: Option<Uuid>,
    ) -> AppResult<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let run = self.held_run(run_id, holder).await?;
            let expected = match check_transition(&run, target)? {
                Step::AlreadyReached => return Ok(false),
                Step::From(expected) => expected,
            };

            let moved = if target == RunState::Collected {
                self.store.collect_events(run_id, holder).await?
            } else {
                self.store
                    .compare_and_set(run_id, expected, target, update.clone(), holder)
                    .await?
            };

            if moved {
                info!(run_id = %run_id, from = %expected, state = %target, "➡️ Settlement run advanced");
                return Ok(true);
            }
        }

        Err(lost_race(run_id, target))
    }

    /// The run as stored, provided `holder` (when given) still holds it
    async fn held_run(&self, run_id: Uuid, holder: Option<Uuid>) -> AppResult<SettlementRun> {
        let run = self.get_run(run_id).await?;
        match holder {
            Some(claim_id) if run.claim_id != Some(claim_id) => {
                warn!(run_id = %run_id, state = %run.state, "Claim on settlement run was lost");
                Err(LedgerError::ClaimLost { run_id }.into())
            }
            _ => Ok(run),
        }
    }
}

fn lost_race(run_id: Uuid, target: RunState) -> AppError {
    AppError::Internal(format!(
        "run {} kept changing while moving to {}",
        run_id, target
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemorySettlementStore;

    fn ledger() -> (SettlementLedger, Arc<MemorySettlementStore>) {
        let store = Arc::new(MemorySettlementStore::new());
        (SettlementLedger::new(store.clone()), store)
    }

    async fn claimed_run(ledger: &SettlementLedger) -> Claim {
        ledger.attach_event("W1", &FeeEvent::debit(1, "W1", 500)).await.unwrap();
        ledger.attach_event("W1", &FeeEvent::credit(2, "W1", 100)).await.unwrap();
        let run = ledger.begin_transacting("W1").await.unwrap().unwrap();
        run.claim().unwrap()
    }

    #[tokio::test]
    async fn test_attach_event_is_idempotent() {
        let (ledger, _) = ledger();
        let event = FeeEvent::debit(7, "W1", 250);

        let first = ledger.attach_event("W1", &event).await.unwrap();
        let second = ledger.attach_event("W1", &event).await.unwrap();

        assert!(matches!(first, AttachOutcome::Attached { .. }));
        assert_eq!(second, AttachOutcome::AlreadyAttached { run_id: first.run_id() });

        let run = ledger.get_run(first.run_id()).await.unwrap();
        assert_eq!(run.event_ids, vec![7]);
        assert_eq!(run.net_amount, 250);
    }

    #[tokio::test]
    async fn test_attach_deferred_while_run_in_flight() {
        let (ledger, _) = ledger();
        let run_id = claimed_run(&ledger).await.run_id;

        let outcome = ledger.attach_event("W1", &FeeEvent::debit(3, "W1", 10)).await.unwrap();

        assert_eq!(
            outcome,
            AttachOutcome::Deferred {
                run_id,
                state: RunState::Transacting
            }
        );
        assert_eq!(ledger.get_run(run_id).await.unwrap().event_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_begin_transacting_excludes_concurrent_claims() {
        let (ledger, _) = ledger();
        ledger.attach_event("W1", &FeeEvent::debit(1, "W1", 500)).await.unwrap();

        let claims = futures::future::join_all(
            (0..8).map(|_| {
                let ledger = ledger.clone();
                async move { ledger.begin_transacting("W1").await.unwrap() }
            }),
        )
        .await;

        assert_eq!(claims.iter().filter(|claim| claim.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_begin_transacting_on_transacting_run_mutates_nothing() {
        let (ledger, _) = ledger();
        let run_id = claimed_run(&ledger).await.run_id;
        let before = ledger.get_run(run_id).await.unwrap();

        assert!(ledger.begin_transacting("W1").await.unwrap().is_none());

        let after = ledger.get_run(run_id).await.unwrap();
        assert_eq!(after.state, RunState::Transacting);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_mark_signed_after_collected_is_noop() {
        let (ledger, _) = ledger();
        let claim = claimed_run(&ledger).await;

        assert!(ledger.mark_signed(claim, "f86c01").await.unwrap());
        assert!(ledger.collect_events(claim).await.unwrap());
        assert!(!ledger.mark_signed(claim, "deadbeef").await.unwrap());

        let run = ledger.get_run(claim.run_id).await.unwrap();
        assert_eq!(run.state, RunState::Collected);
        assert_eq!(run.unsigned_tx.as_deref(), Some("f86c01"));
        assert_eq!(run.tx_hash, None);
    }

    #[tokio::test]
    async fn test_mark_confirmed_on_draft_is_violation() {
        let (ledger, _) = ledger();
        let run_id = ledger
            .attach_event("W1", &FeeEvent::debit(1, "W1", 500))
            .await
            .unwrap()
            .run_id();

        let err = ledger.mark_confirmed(run_id).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::InvalidTransition {
                current: RunState::Draft,
                requested: RunState::Confirmed,
                ..
            })
        ));
        assert_eq!(ledger.get_run(run_id).await.unwrap().state, RunState::Draft);
    }

    #[tokio::test]
    async fn test_collect_events_flips_every_attached_event() {
        let (ledger, store) = ledger();
        let claim = claimed_run(&ledger).await;
        ledger.mark_signed(claim, "f86c01").await.unwrap();

        ledger.collect_events(claim).await.unwrap();
        // Repeating is a no-op
        assert!(!ledger.collect_events(claim).await.unwrap());

        assert_eq!(store.is_collected(1), Some(true));
        assert_eq!(store.is_collected(2), Some(true));
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_last_good_state() {
        let (ledger, _) = ledger();
        let claim = claimed_run(&ledger).await;
        let run_id = claim.run_id;
        ledger.mark_signed(claim, "f86c01").await.unwrap();
        ledger.collect_events(claim).await.unwrap();

        assert!(ledger.mark_failed(run_id, "receipt reverted").await.unwrap());
        assert!(!ledger.mark_failed(run_id, "again").await.unwrap());

        let run = ledger.get_run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.last_good_state, Some(RunState::Collected));
        assert_eq!(run.failure_reason.as_deref(), Some("receipt reverted"));

        // Steps already reached before failing stay no-ops
        assert!(!ledger.mark_signed(claim, "f86c01").await.unwrap());
        assert!(ledger.mark_broadcast(run_id, "0xabc").await.is_err());
    }

    #[tokio::test]
    async fn test_mark_failed_refuses_confirmed_run() {
        let (ledger, _) = ledger();
        let claim = claimed_run(&ledger).await;
        let run_id = claim.run_id;
        ledger.mark_signed(claim, "f86c01").await.unwrap();
        ledger.collect_events(claim).await.unwrap();
        ledger.mark_broadcast(run_id, "0xabc").await.unwrap();
        ledger.mark_confirmed(run_id).await.unwrap();

        assert!(ledger.mark_failed(run_id, "late").await.is_err());
        assert_eq!(ledger.get_run(run_id).await.unwrap().state, RunState::Confirmed);
    }

    #[tokio::test]
    async fn test_reset_to_draft_from_signed() {
        let (ledger, _) = ledger();
        let claim = claimed_run(&ledger).await;
        ledger.mark_signed(claim, "f86c01").await.unwrap();

        let run = ledger.reset_to_draft(claim.run_id).await.unwrap();

        assert_eq!(run.state, RunState::Draft);
        assert_eq!(run.unsigned_tx, None);
        assert_eq!(run.claim_id, None);
        assert!(ledger.begin_transacting("W1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_to_draft_after_collection_is_refused() {
        let (ledger, _) = ledger();
        let claim = claimed_run(&ledger).await;
        ledger.mark_signed(claim, "f86c01").await.unwrap();
        ledger.collect_events(claim).await.unwrap();

        let err = ledger.reset_to_draft(claim.run_id).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::NotResettable {
                current: RunState::Collected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reclaimed_run_rejects_stale_pipeline() {
        let (ledger, store) = ledger();
        let stale = claimed_run(&ledger).await;

        // Another worker resets the idle claim and claims the run again
        ledger.reset_to_draft(stale.run_id).await.unwrap();
        let fresh = ledger.begin_transacting("W1").await.unwrap().unwrap().claim().unwrap();
        assert_eq!(fresh.run_id, stale.run_id);
        assert_ne!(fresh.claim_id, stale.claim_id);

        let err = ledger.mark_signed(stale, "f86c01").await.unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::ClaimLost { .. })));
        assert!(ledger.fail_claim(stale, "net obligation is not positive").await.is_err());

        let run = ledger.get_run(fresh.run_id).await.unwrap();
        assert_eq!(run.state, RunState::Transacting);
        assert_eq!(run.unsigned_tx, None);
        assert_eq!(run.claim_id, Some(fresh.claim_id));

        // The current holder moves on; the stale one still cannot collect
        assert!(ledger.mark_signed(fresh, "f86c02").await.unwrap());
        assert!(ledger.collect_events(stale).await.is_err());
        assert_eq!(store.is_collected(1), Some(false));
        assert!(ledger.collect_events(fresh).await.unwrap());
        assert_eq!(store.is_collected(1), Some(true));
    }
}
