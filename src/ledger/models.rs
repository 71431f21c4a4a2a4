use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::fees::models::FeeId;

/// Settlement run state.
///
/// Forward path: Draft → Transacting → Signed → Collected → Broadcast → Confirmed.
/// Failed is terminal and keeps the last state reached in `last_good_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Draft,
    Transacting,
    Signed,
    Collected,
    Broadcast,
    Confirmed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Draft => "draft",
            RunState::Transacting => "transacting",
            RunState::Signed => "signed",
            RunState::Collected => "collected",
            RunState::Broadcast => "broadcast",
            RunState::Confirmed => "confirmed",
            RunState::Failed => "failed",
        }
    }

    /// Position on the forward path; `None` for Failed
    fn rank(self) -> Option<u8> {
        match self {
            RunState::Draft => Some(0),
            RunState::Transacting => Some(1),
            RunState::Signed => Some(2),
            RunState::Collected => Some(3),
            RunState::Broadcast => Some(4),
            RunState::Confirmed => Some(5),
            RunState::Failed => None,
        }
    }

    /// The state a run must be in to move to `self`
    pub fn predecessor(self) -> Option<RunState> {
        match self {
            RunState::Transacting => Some(RunState::Draft),
            RunState::Signed => Some(RunState::Transacting),
            RunState::Collected => Some(RunState::Signed),
            RunState::Broadcast => Some(RunState::Collected),
            RunState::Confirmed => Some(RunState::Broadcast),
            RunState::Draft | RunState::Failed => None,
        }
    }

    /// True when `self` is `target` or further along the forward path
    pub fn has_reached(self, target: RunState) -> bool {
        match (self.rank(), target.rank()) {
            (Some(current), Some(wanted)) => current >= wanted,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Confirmed | RunState::Failed)
    }

    /// Claimed by a pipeline; fee loading for the wallet is suspended
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            RunState::Transacting | RunState::Signed | RunState::Collected | RunState::Broadcast
        )
    }

    /// States that can be returned to Draft without touching collected events
    pub fn is_pre_collection(self) -> bool {
        matches!(self, RunState::Transacting | RunState::Signed)
    }
}

/// A batch of fee events settled together for one wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRun {
    pub id: Uuid,
    pub wallet_key: String,
    pub state: RunState,
    /// Last forward state reached before the run failed
    pub last_good_state: Option<RunState>,
    pub event_ids: Vec<FeeId>,
    /// Running debits minus credits of the attached events
    pub net_amount: i64,
    pub unsigned_tx: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    /// Collection reported to the fee ledger API
    pub ledger_reported: bool,
    /// Token of the pipeline holding the run; replaced on every claim
    pub claim_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementRun {
    pub fn draft(wallet_key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            wallet_key: wallet_key.to_string(),
            state: RunState::Draft,
            last_good_state: None,
            event_ids: Vec::new(),
            net_amount: 0,
            unsigned_tx: None,
            tx_hash: None,
            failure_reason: None,
            ledger_reported: false,
            claim_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The furthest forward state this run reached
    pub fn progress(&self) -> RunState {
        match self.state {
            RunState::Failed => self.last_good_state.unwrap_or(RunState::Draft),
            state => state,
        }
    }

    /// Events of this run are marked collected
    pub fn is_collected(&self) -> bool {
        self.progress().has_reached(RunState::Collected)
    }

    pub fn claim(&self) -> Option<Claim> {
        self.claim_id.map(|claim_id| Claim {
            run_id: self.id,
            claim_id,
        })
    }
}

/// A pipeline's hold on a claimed run.
///
/// Pre-collection writes made under a claim fail with
/// [`LedgerError::ClaimLost`](crate::error::LedgerError::ClaimLost) once the
/// run was reset and claimed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub run_id: Uuid,
    pub claim_id: Uuid,
}

/// Row shape of the `settlement_runs` table plus aggregated event ids
#[derive(Debug, Clone, FromRow)]
pub struct SettlementRunRow {
    pub id: Uuid,
    pub wallet_key: String,
    pub state: RunState,
    pub last_good_state: Option<RunState>,
    pub event_ids: Vec<i64>,
    pub net_amount: i64,
    pub unsigned_tx: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub ledger_reported: bool,
    pub claim_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SettlementRunRow> for SettlementRun {
    fn from(row: SettlementRunRow) -> Self {
        Self {
            id: row.id,
            wallet_key: row.wallet_key,
            state: row.state,
            last_good_state: row.last_good_state,
            event_ids: row.event_ids,
            net_amount: row.net_amount,
            unsigned_tx: row.unsigned_tx,
            tx_hash: row.tx_hash,
            failure_reason: row.failure_reason,
            ledger_reported: row.ledger_reported,
            claim_id: row.claim_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Result of attaching a fee event to the wallet's draft run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttachOutcome {
    /// Newly attached to this run
    Attached { run_id: Uuid },
    /// The event id already belongs to this run; nothing changed
    AlreadyAttached { run_id: Uuid },
    /// The wallet has a run in flight; loading resumes once it leaves that state
    Deferred { run_id: Uuid, state: RunState },
}

impl AttachOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            AttachOutcome::Attached { run_id }
            | AttachOutcome::AlreadyAttached { run_id }
            | AttachOutcome::Deferred { run_id, .. } => *run_id,
        }
    }
}

/// Fields written by a state transition; `None` leaves a column untouched
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub unsigned_tx: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub last_good_state: Option<RunState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_ordering() {
        assert!(RunState::Collected.has_reached(RunState::Signed));
        assert!(RunState::Signed.has_reached(RunState::Signed));
        assert!(!RunState::Draft.has_reached(RunState::Confirmed));
        assert!(!RunState::Failed.has_reached(RunState::Draft));
    }

    #[test]
    fn test_predecessors_follow_forward_path() {
        assert_eq!(RunState::Transacting.predecessor(), Some(RunState::Draft));
        assert_eq!(RunState::Confirmed.predecessor(), Some(RunState::Broadcast));
        assert_eq!(RunState::Draft.predecessor(), None);
        assert_eq!(RunState::Failed.predecessor(), None);
    }

    #[test]
    fn test_failed_run_progress() {
        let mut run = SettlementRun::draft("W1");
        run.state = RunState::Failed;
        run.last_good_state = Some(RunState::Broadcast);

        assert_eq!(run.progress(), RunState::Broadcast);
        assert!(run.is_collected());
    }

    #[test]
    fn test_state_groups() {
        assert!(RunState::Broadcast.is_in_flight());
        assert!(!RunState::Draft.is_in_flight());
        assert!(RunState::Signed.is_pre_collection());
        assert!(!RunState::Collected.is_pre_collection());
        assert!(RunState::Failed.is_terminal());
    }
}
