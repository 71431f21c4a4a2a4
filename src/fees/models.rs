use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;

/// Fee event identifier as issued by the fee ledger.
///
/// The ledger issues unsigned ids; they are stored as `BIGINT`, so only ids
/// up to `i64::MAX` are accepted. Larger ids are dropped at decode time.
pub type FeeId = i64;

/// Whether a fee event adds to or subtracts from what a wallet owes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type, Default)]
#[sqlx(type_name = "fee_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FeeDirection {
    #[default]
    Debit,
    Credit,
}

impl fmt::Display for FeeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeDirection::Debit => write!(f, "debit"),
            FeeDirection::Credit => write!(f, "credit"),
        }
    }
}

/// One billable or credited unit owed by a wallet.
///
/// INVARIANT: once `collected` is true the event is never attached to
/// another settlement run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEvent {
    pub id: FeeId,
    pub wallet_key: String,
    /// Smallest currency unit (USDC has 6 decimals)
    pub amount: u64,
    pub direction: FeeDirection,
    pub collected: bool,
    pub created_at: DateTime<Utc>,
}

impl FeeEvent {
    pub fn debit(id: FeeId, wallet_key: &str, amount: u64) -> Self {
        Self::new(id, wallet_key, amount, FeeDirection::Debit)
    }

    pub fn credit(id: FeeId, wallet_key: &str, amount: u64) -> Self {
        Self::new(id, wallet_key, amount, FeeDirection::Credit)
    }

    fn new(id: FeeId, wallet_key: &str, amount: u64, direction: FeeDirection) -> Self {
        Self {
            id,
            wallet_key: wallet_key.to_string(),
            amount,
            direction,
            collected: false,
            created_at: Utc::now(),
        }
    }
}

/// Row shape of the `fee_events` table
#[derive(Debug, Clone, FromRow)]
pub struct FeeEventRow {
    pub id: i64,
    pub wallet_key: String,
    pub amount: i64,
    pub direction: FeeDirection,
    pub collected: bool,
    pub created_at: DateTime<Utc>,
}

impl FeeEventRow {
    pub fn into_event(self) -> FeeEvent {
        FeeEvent {
            id: self.id,
            wallet_key: self.wallet_key,
            // amount has a CHECK (amount >= 0) constraint
            amount: self.amount.max(0) as u64,
            direction: self.direction,
            collected: self.collected,
            created_at: self.created_at,
        }
    }
}
