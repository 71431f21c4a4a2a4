// Fee events owed by wallets and the ledger API they are read from
pub mod models;
pub mod source;

pub use models::{FeeDirection, FeeEvent, FeeId};
pub use source::{FeeEventSource, LedgerApiClient, LedgerApiConfig};
