pub mod builder;
pub mod chain;
pub mod evm;
pub mod signing;

pub use builder::TransactionBuilder;
pub use chain::{ChainClient, TxReceipt, TxSignature, UnsignedPayload};
pub use evm::{EvmConfig, EvmRpcClient};
pub use signing::{RemoteSigner, Signer, SignerConfig, SigningCoordinator};
