use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::fees::models::FeeId;
use crate::ledger::models::RunState;

/// Top-level error type for the settlement worker
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Settlement ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Fee API error: {0}")]
    FeeApi(#[from] FeeApiError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Fee event {0} appears more than once with different contents")]
    ConflictingFee(FeeId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External error: {0}")]
    ExternalError(String),

    #[error("Reconciliation required for run {run_id}: {reason}")]
    ReconciliationRequired { run_id: Uuid, reason: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Cycle deadline exceeded")]
    DeadlineExceeded,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Settlement ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Settlement run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Run {run_id} cannot move from {current} to {requested}")]
    InvalidTransition {
        run_id: Uuid,
        current: RunState,
        requested: RunState,
    },

    #[error("Run {run_id} cannot be reset to draft from {current}")]
    NotResettable { run_id: Uuid, current: RunState },

    #[error("Run {run_id} was reclaimed; this pipeline no longer holds it")]
    ClaimLost { run_id: Uuid },

    #[error("Fee event {0} is already collected")]
    EventAlreadyCollected(FeeId),

    #[error("Fee event {fee_id} belongs to wallet {owner}, not {wallet}")]
    WalletMismatch {
        fee_id: FeeId,
        owner: String,
        wallet: String,
    },
}

/// Fee ledger API errors
#[derive(Error, Debug)]
pub enum FeeApiError {
    #[error("Wallet not known to the fee ledger: {0}")]
    WalletNotFound(String),

    #[error("Unexpected status code {status} from {endpoint}")]
    UnexpectedStatus { endpoint: String, status: u16 },

    #[error("{message} ({details})")]
    Rejected { message: String, details: String },
}

/// Threshold signing errors
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Expected exactly one message/signature pair, got {0}")]
    SignatureCount(usize),

    #[error("Signature returned for unexpected message {0}")]
    MessageMismatch(String),

    #[error("Malformed signature field {field}: {reason}")]
    MalformedSignature { field: &'static str, reason: String },

    #[error("Signer rejected request: {0}")]
    Rejected(String),
}

/// Chain collaborator errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Failed to build transfer: {0}")]
    BuildFailed(String),

    #[error("Transaction submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Transaction {tx_hash} mined with failed status {status}")]
    ReceiptFailed { tx_hash: String, status: u64 },

    #[error("Timed out waiting for {0} to be mined")]
    ReceiptTimeout(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed transaction payload: {0}")]
    MalformedPayload(String),
}

/// How an error is handled by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/timeout on a collaborator; the next cycle retries
    Transient,
    /// A collaborator broke its contract; fatal for the wallet's cycle
    ProtocolViolation,
    /// Out-of-order state transition; a programming or integration error
    StateViolation,
    /// Events are collected but the transfer may not exist
    ReconciliationRequired,
    Cancelled,
    Fatal,
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Database(_)
            | AppError::FeeApi(_)
            | AppError::ExternalError(_)
            | AppError::DeadlineExceeded
            | AppError::Signing(SigningError::Rejected(_))
            | AppError::Chain(ChainError::BuildFailed(_))
            | AppError::Chain(ChainError::SubmissionFailed(_))
            | AppError::Chain(ChainError::ReceiptTimeout(_))
            | AppError::Chain(ChainError::Rpc { .. }) => ErrorClass::Transient,

            AppError::Signing(_)
            | AppError::Chain(ChainError::MalformedPayload(_))
            | AppError::InvalidAmount(_)
            | AppError::InvalidAddress(_)
            | AppError::ConflictingFee(_) => ErrorClass::ProtocolViolation,

            AppError::Ledger(_) => ErrorClass::StateViolation,

            AppError::ReconciliationRequired { .. }
            | AppError::Chain(ChainError::ReceiptFailed { .. }) => {
                ErrorClass::ReconciliationRequired
            }

            AppError::Cancelled => ErrorClass::Cancelled,

            AppError::Config(_) | AppError::NotFound(_) | AppError::Internal(_) => {
                ErrorClass::Fatal
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AppError::NotFound(_) | AppError::Ledger(LedgerError::RunNotFound(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            AppError::Ledger(LedgerError::NotResettable { .. })
            | AppError::Ledger(LedgerError::InvalidTransition { .. })
            | AppError::Ledger(LedgerError::ClaimLost { .. }) => {
                (StatusCode::CONFLICT, "INVALID_RUN_STATE")
            }
            AppError::InvalidAddress(_) | AppError::InvalidAmount(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT")
            }
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let message = match &self {
            AppError::Database(_) => "A database error occurred".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<rlp::DecoderError> for AppError {
    fn from(error: rlp::DecoderError) -> Self {
        AppError::Chain(ChainError::MalformedPayload(error.to_string()))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            AppError::Chain(ChainError::SubmissionFailed("nonce too low".into())).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            AppError::Signing(SigningError::SignatureCount(2)).class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            AppError::Ledger(LedgerError::InvalidTransition {
                run_id: Uuid::nil(),
                current: RunState::Draft,
                requested: RunState::Confirmed,
            })
            .class(),
            ErrorClass::StateViolation
        );
        assert_eq!(
            AppError::ReconciliationRequired {
                run_id: Uuid::nil(),
                reason: "broadcast failed".into(),
            }
            .class(),
            ErrorClass::ReconciliationRequired
        );
        assert_eq!(
            AppError::Ledger(LedgerError::ClaimLost { run_id: Uuid::nil() }).class(),
            ErrorClass::StateViolation
        );
        assert_eq!(AppError::ConflictingFee(7).class(), ErrorClass::ProtocolViolation);
        assert!(AppError::DeadlineExceeded.is_transient());
        assert!(!AppError::Cancelled.is_transient());
    }
}
