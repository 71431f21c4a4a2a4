pub mod models;
pub mod repository;

pub use models::WalletEntry;
pub use repository::{MemoryWalletRegistry, PgWalletRegistry, WalletRegistry};
