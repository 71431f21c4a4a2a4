pub mod memory;
pub mod models;
pub mod repository;
pub mod service;
pub mod store;

pub use memory::MemorySettlementStore;
pub use models::{AttachOutcome, RunState, SettlementRun};
pub use repository::PgSettlementStore;
pub use service::SettlementLedger;
pub use store::SettlementStore;
