use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// A custodial wallet known to the settlement worker.
///
/// Written once when the wallet is provisioned (keygen or reshare), read-only
/// afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct WalletEntry {
    /// Hex-encoded ECDSA public key of the threshold wallet
    pub public_key: String,
    /// On-chain address the settlement transfers are sent from
    pub address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterWalletRequest {
    pub public_key: String,
    pub address: String,
}
