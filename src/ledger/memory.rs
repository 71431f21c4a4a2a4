use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::*;
use super::store::SettlementStore;
use crate::error::{AppError, AppResult, LedgerError};
use crate::fees::models::{FeeDirection, FeeEvent, FeeId};

#[derive(Default)]
struct State {
    runs: HashMap<Uuid, SettlementRun>,
    events: HashMap<FeeId, (Uuid, FeeEvent)>,
}

impl State {
    fn open_run_id(&self, wallet_key: &str) -> Option<Uuid> {
        self.runs
            .values()
            .find(|run| run.wallet_key == wallet_key && !run.state.is_terminal())
            .map(|run| run.id)
    }

    fn run_mut(&mut self, run_id: Uuid) -> AppResult<&mut SettlementRun> {
        self.runs
            .get_mut(&run_id)
            .ok_or_else(|| LedgerError::RunNotFound(run_id).into())
    }

    /// The run, if it is in `expected` and held under `claim_id` when one is given
    fn guarded_run(
        &mut self,
        run_id: Uuid,
        expected: RunState,
        claim_id: Option<Uuid>,
    ) -> Option<&mut SettlementRun> {
        self.runs.get_mut(&run_id).filter(|run| {
            run.state == expected && claim_id.map_or(true, |claim| run.claim_id == Some(claim))
        })
    }
}

/// Single-lock settlement store for tests and local dry runs.
///
/// Holds the same invariants as the Postgres store: one open run per wallet,
/// an event id belongs to at most one run, state changes are compare-and-set.
#[derive(Default)]
pub struct MemorySettlementStore {
    state: Mutex<State>,
}

impl MemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected flag of a single event, as stored
    pub fn is_collected(&self, fee_id: FeeId) -> Option<bool> {
        self.state
            .lock()
            .events
            .get(&fee_id)
            .map(|(_, event)| event.collected)
    }

    #[cfg(test)]
    pub fn backdate(&self, run_id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(run) = self.state.lock().runs.get_mut(&run_id) {
            run.updated_at = updated_at;
        }
    }

    /// Attach an event to a run whatever its state, bypassing the Draft check
    #[cfg(test)]
    pub fn force_attach(&self, run_id: Uuid, event: FeeEvent) {
        let mut state = self.state.lock();
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.event_ids.push(event.id);
            run.event_ids.sort_unstable();
        }
        state.events.insert(event.id, (run_id, event));
    }
}

#[async_trait]
impl SettlementStore for MemorySettlementStore {
    async fn attach_event(&self, wallet_key: &str, event: &FeeEvent) -> AppResult<AttachOutcome> {
        if event.wallet_key != wallet_key {
            return Err(LedgerError::WalletMismatch {
                fee_id: event.id,
                owner: event.wallet_key.clone(),
                wallet: wallet_key.to_string(),
            }
            .into());
        }
        if event.collected {
            return Err(LedgerError::EventAlreadyCollected(event.id).into());
        }
        let amount = i64::try_from(event.amount).map_err(|_| {
            AppError::InvalidAmount(format!("fee {} amount {} out of range", event.id, event.amount))
        })?;

        let mut state = self.state.lock();

        if let Some((run_id, existing)) = state.events.get(&event.id) {
            if existing.wallet_key != wallet_key {
                return Err(LedgerError::WalletMismatch {
                    fee_id: event.id,
                    owner: existing.wallet_key.clone(),
                    wallet: wallet_key.to_string(),
                }
                .into());
            }
            return Ok(AttachOutcome::AlreadyAttached { run_id: *run_id });
        }

        let run_id = match state.open_run_id(wallet_key) {
            Some(run_id) => {
                let run = state.run_mut(run_id)?;
                if run.state != RunState::Draft {
                    return Ok(AttachOutcome::Deferred {
                        run_id,
                        state: run.state,
                    });
                }
                run_id
            }
            None => {
                let run = SettlementRun::draft(wallet_key);
                let run_id = run.id;
                state.runs.insert(run_id, run);
                run_id
            }
        };

        let delta = match event.direction {
            FeeDirection::Debit => amount,
            FeeDirection::Credit => -amount,
        };
        let run = state.run_mut(run_id)?;
        run.event_ids.push(event.id);
        run.event_ids.sort_unstable();
        run.net_amount = run.net_amount.saturating_add(delta);
        run.updated_at = Utc::now();

        let mut stored = event.clone();
        stored.collected = false;
        state.events.insert(event.id, (run_id, stored));

        Ok(AttachOutcome::Attached { run_id })
    }

    async fn claim_draft(&self, wallet_key: &str) -> AppResult<Option<SettlementRun>> {
        let mut state = self.state.lock();
        let Some(run_id) = state.open_run_id(wallet_key) else {
            return Ok(None);
        };

        let run = state.run_mut(run_id)?;
        if run.state != RunState::Draft {
            return Ok(None);
        }
        run.state = RunState::Transacting;
        run.claim_id = Some(Uuid::new_v4());
        run.updated_at = Utc::now();

        Ok(Some(run.clone()))
    }

    async fn get_run(&self, run_id: Uuid) -> AppResult<Option<SettlementRun>> {
        Ok(self.state.lock().runs.get(&run_id).cloned())
    }

    async fn open_run(&self, wallet_key: &str) -> AppResult<Option<SettlementRun>> {
        let state = self.state.lock();
        Ok(state
            .open_run_id(wallet_key)
            .and_then(|run_id| state.runs.get(&run_id).cloned()))
    }

    async fn runs_for_wallet(&self, wallet_key: &str, limit: i64) -> AppResult<Vec<SettlementRun>> {
        let state = self.state.lock();
        let mut runs: Vec<SettlementRun> = state
            .runs
            .values()
            .filter(|run| run.wallet_key == wallet_key)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));

        Ok(runs)
    }

    async fn runs_in_state(&self, wanted: RunState) -> AppResult<Vec<SettlementRun>> {
        let state = self.state.lock();
        let mut runs: Vec<SettlementRun> = state
            .runs
            .values()
            .filter(|run| run.state == wanted)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.updated_at);

        Ok(runs)
    }

    async fn run_events(&self, run_id: Uuid) -> AppResult<Vec<FeeEvent>> {
        let state = self.state.lock();
        let mut events: Vec<FeeEvent> = state
            .events
            .values()
            .filter(|(owner, _)| *owner == run_id)
            .map(|(_, event)| event.clone())
            .collect();
        events.sort_by_key(|event| event.id);

        Ok(events)
    }

    async fn compare_and_set(
        &self,
        run_id: Uuid,
        expected: RunState,
        next: RunState,
        update: RunUpdate,
        claim_id: Option<Uuid>,
    ) -> AppResult<bool> {
        let mut state = self.state.lock();
        let Some(run) = state.guarded_run(run_id, expected, claim_id) else {
            return Ok(false);
        };

        run.state = next;
        if update.unsigned_tx.is_some() {
            run.unsigned_tx = update.unsigned_tx;
        }
        if update.tx_hash.is_some() {
            run.tx_hash = update.tx_hash;
        }
        if update.failure_reason.is_some() {
            run.failure_reason = update.failure_reason;
        }
        if update.last_good_state.is_some() {
            run.last_good_state = update.last_good_state;
        }
        run.updated_at = Utc::now();

        Ok(true)
    }

    async fn collect_events(&self, run_id: Uuid, claim_id: Option<Uuid>) -> AppResult<bool> {
        let mut state = self.state.lock();
        let Some(run) = state.guarded_run(run_id, RunState::Signed, claim_id) else {
            return Ok(false);
        };
        run.state = RunState::Collected;
        run.updated_at = Utc::now();

        for (owner, event) in state.events.values_mut() {
            if *owner == run_id {
                event.collected = true;
            }
        }

        Ok(true)
    }

    async fn set_ledger_reported(&self, run_id: Uuid) -> AppResult<()> {
        let mut state = self.state.lock();
        let run = state.run_mut(run_id)?;
        run.ledger_reported = true;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_to_draft(&self, run_id: Uuid, expected: RunState) -> AppResult<bool> {
        let mut state = self.state.lock();
        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if run.state != expected || !expected.is_pre_collection() {
            return Ok(false);
        }

        run.state = RunState::Draft;
        run.unsigned_tx = None;
        run.claim_id = None;
        run.updated_at = Utc::now();

        Ok(true)
    }

    async fn stale_claims(&self, older_than: DateTime<Utc>) -> AppResult<Vec<SettlementRun>> {
        let state = self.state.lock();
        Ok(state
            .runs
            .values()
            .filter(|run| run.state.is_pre_collection() && run.updated_at < older_than)
            .cloned()
            .collect())
    }

    async fn collected_unreported(&self) -> AppResult<Vec<SettlementRun>> {
        let state = self.state.lock();
        let mut runs: Vec<SettlementRun> = state
            .runs
            .values()
            .filter(|run| !run.ledger_reported && run.is_collected())
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_creates_single_draft() {
        let store = MemorySettlementStore::new();

        let first = store.attach_event("W1", &FeeEvent::debit(1, "W1", 500)).await.unwrap();
        let second = store.attach_event("W1", &FeeEvent::credit(2, "W1", 100)).await.unwrap();

        assert_eq!(first.run_id(), second.run_id());
        let run = store.get_run(first.run_id()).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Draft);
        assert_eq!(run.event_ids, vec![1, 2]);
        assert_eq!(run.net_amount, 400);
    }

    #[tokio::test]
    async fn test_attach_rejects_foreign_wallet_event() {
        let store = MemorySettlementStore::new();

        let err = store
            .attach_event("W1", &FeeEvent::debit(1, "W2", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::WalletMismatch { .. })));
    }

    #[tokio::test]
    async fn test_claim_draft_only_once() {
        let store = MemorySettlementStore::new();
        store.attach_event("W1", &FeeEvent::debit(1, "W1", 10)).await.unwrap();

        assert!(store.claim_draft("W1").await.unwrap().is_some());
        assert!(store.claim_draft("W1").await.unwrap().is_none());
        assert!(store.claim_draft("W2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_collect_events_requires_signed() {
        let store = MemorySettlementStore::new();
        let run_id = store
            .attach_event("W1", &FeeEvent::debit(1, "W1", 10))
            .await
            .unwrap()
            .run_id();
        store.claim_draft("W1").await.unwrap();

        assert!(!store.collect_events(run_id, None).await.unwrap());
        assert_eq!(store.is_collected(1), Some(false));

        store
            .compare_and_set(run_id, RunState::Transacting, RunState::Signed, RunUpdate::default(), None)
            .await
            .unwrap();
        assert!(store.collect_events(run_id, None).await.unwrap());
        assert_eq!(store.is_collected(1), Some(true));
    }

    #[tokio::test]
    async fn test_reset_to_draft_refuses_collected_run() {
        let store = MemorySettlementStore::new();
        let run_id = store
            .attach_event("W1", &FeeEvent::debit(1, "W1", 10))
            .await
            .unwrap()
            .run_id();
        store.claim_draft("W1").await.unwrap();
        store
            .compare_and_set(run_id, RunState::Transacting, RunState::Signed, RunUpdate::default(), None)
            .await
            .unwrap();
        store.collect_events(run_id, None).await.unwrap();

        assert!(!store.reset_to_draft(run_id, RunState::Collected).await.unwrap());
    }

    #[tokio::test]
    async fn test_writes_under_replaced_claim_are_refused() {
        let store = MemorySettlementStore::new();
        store.attach_event("W1", &FeeEvent::debit(1, "W1", 10)).await.unwrap();
        let first = store.claim_draft("W1").await.unwrap().unwrap();
        store.reset_to_draft(first.id, RunState::Transacting).await.unwrap();
        assert_eq!(store.get_run(first.id).await.unwrap().unwrap().claim_id, None);

        let second = store.claim_draft("W1").await.unwrap().unwrap();
        assert_ne!(second.claim_id, first.claim_id);

        let moved = store
            .compare_and_set(
                first.id,
                RunState::Transacting,
                RunState::Signed,
                RunUpdate::default(),
                first.claim_id,
            )
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(store.get_run(first.id).await.unwrap().unwrap().state, RunState::Transacting);

        store
            .compare_and_set(
                second.id,
                RunState::Transacting,
                RunState::Signed,
                RunUpdate::default(),
                second.claim_id,
            )
            .await
            .unwrap();
        assert!(!store.collect_events(first.id, first.claim_id).await.unwrap());
        assert_eq!(store.is_collected(1), Some(false));
        assert!(store.collect_events(second.id, second.claim_id).await.unwrap());
    }
}
