use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{AttachOutcome, RunState, RunUpdate, SettlementRun};
use crate::error::AppResult;
use crate::fees::models::FeeEvent;

/// Durable storage for settlement runs and their fee events.
///
/// Every state change is a compare-and-set on the run's current state, so
/// concurrent workers (in-process or across instances) coordinate only here.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Attach a fee event to the wallet's Draft run, creating the run if the
    /// wallet has no open run. Repeating the call for the same event id is a no-op.
    async fn attach_event(&self, wallet_key: &str, event: &FeeEvent) -> AppResult<AttachOutcome>;

    /// Atomically move the wallet's Draft run to Transacting under a fresh
    /// `claim_id`. Returns `None` when there is no Draft run to claim.
    async fn claim_draft(&self, wallet_key: &str) -> AppResult<Option<SettlementRun>>;

    async fn get_run(&self, run_id: Uuid) -> AppResult<Option<SettlementRun>>;

    /// The wallet's non-terminal run, if any
    async fn open_run(&self, wallet_key: &str) -> AppResult<Option<SettlementRun>>;

    /// Most recent runs first
    async fn runs_for_wallet(&self, wallet_key: &str, limit: i64) -> AppResult<Vec<SettlementRun>>;

    async fn runs_in_state(&self, state: RunState) -> AppResult<Vec<SettlementRun>>;

    /// Events attached to a run, ordered by id
    async fn run_events(&self, run_id: Uuid) -> AppResult<Vec<FeeEvent>>;

    /// Move `run_id` from `expected` to `next`, writing the non-empty fields of
    /// `update`. Returns false if the run was not in `expected`, or if
    /// `claim_id` is given and the run is no longer held under it.
    async fn compare_and_set(
        &self,
        run_id: Uuid,
        expected: RunState,
        next: RunState,
        update: RunUpdate,
        claim_id: Option<Uuid>,
    ) -> AppResult<bool>;

    /// Signed → Collected together with flipping every attached event's
    /// `collected` flag, in one atomic step. Same `claim_id` guard as
    /// [`compare_and_set`](Self::compare_and_set).
    async fn collect_events(&self, run_id: Uuid, claim_id: Option<Uuid>) -> AppResult<bool>;

    async fn set_ledger_reported(&self, run_id: Uuid) -> AppResult<()>;

    /// Return a pre-collection run in `expected` to Draft, clearing the unsigned
    /// payload and the claim. Returns false if the run was not in `expected`.
    async fn reset_to_draft(&self, run_id: Uuid, expected: RunState) -> AppResult<bool>;

    /// Pre-collection runs whose last update is older than `older_than`
    async fn stale_claims(&self, older_than: DateTime<Utc>) -> AppResult<Vec<SettlementRun>>;

    /// Runs whose events are collected but whose collection has not reached
    /// the fee ledger API yet
    async fn collected_unreported(&self) -> AppResult<Vec<SettlementRun>>;
}
