// Copyright (c) 2024 The Botho Foundation

//! Error types for the custody service.

use displaydoc::Display;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use bth_custody_core::{UserId, ValidationError};

use crate::chain::ChainError;

/// Failure kinds surfaced by custody operations.
///
/// The request layer maps these onto status codes via [`CustodyError::kind`].
#[derive(Debug, Display, Error)]
pub enum CustodyError {
    /// Invalid input: {0}
    InvalidInput(String),

    /// User not found: {0}
    UserNotFound(String),

    /// Amount must be strictly positive, got {0}
    InvalidAmount(Decimal),

    /// Insufficient balance: requested {requested}, available {available}
    InsufficientBalance { requested: Decimal, available: Decimal },

    /// Balance of user {user_id} cannot absorb {amount}
    BalanceOverflow { user_id: UserId, amount: Decimal },

    /// Chain unavailable: {0}
    ChainUnavailable(String),

    /// Block {block} is not final: head {head}, {required} confirmations required
    BlockNotConfirmed { block: u64, head: u64, required: u64 },

    /// Withdrawal {withdrawal_id} rejected before inclusion: {reason}
    SubmissionFailed { withdrawal_id: Uuid, reason: String },

    /// Withdrawal {withdrawal_id} outcome unknown (tx {tx_hash}), pending reconciliation
    SubmissionAmbiguous { withdrawal_id: Uuid, tx_hash: String },

    /// Key custody error: {0}
    Custody(String),

    /// Storage failure: {0}
    StorageFailure(String),
}

impl CustodyError {
    /// Stable machine-readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CustodyError::InvalidInput(_) => "invalid_input",
            CustodyError::UserNotFound(_) => "user_not_found",
            CustodyError::InvalidAmount(_) => "invalid_amount",
            CustodyError::InsufficientBalance { .. } => "insufficient_balance",
            CustodyError::BalanceOverflow { .. } => "balance_overflow",
            CustodyError::ChainUnavailable(_) => "chain_unavailable",
            CustodyError::BlockNotConfirmed { .. } => "block_not_confirmed",
            CustodyError::SubmissionFailed { .. } => "submission_failed",
            CustodyError::SubmissionAmbiguous { .. } => "submission_ambiguous",
            CustodyError::Custody(_) => "custody",
            CustodyError::StorageFailure(_) => "storage_failure",
        }
    }

    /// Whether the caller may retry the same request later.
    ///
    /// Ambiguous submissions are deliberately not retryable: a retry could
    /// sign a second transaction for the same funds.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CustodyError::ChainUnavailable(_) | CustodyError::BlockNotConfirmed { .. }
        )
    }
}

impl From<ValidationError> for CustodyError {
    fn from(err: ValidationError) -> Self {
        CustodyError::InvalidInput(err.to_string())
    }
}

impl From<rusqlite::Error> for CustodyError {
    fn from(err: rusqlite::Error) -> Self {
        CustodyError::StorageFailure(err.to_string())
    }
}

impl From<ChainError> for CustodyError {
    fn from(err: ChainError) -> Self {
        CustodyError::ChainUnavailable(err.to_string())
    }
}

/// Result alias for custody operations.
pub type Result<T> = std::result::Result<T, CustodyError>;
