// Copyright (c) 2024 The Botho Foundation

//! Ledger entries and the withdrawal state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::user::UserId;

/// Direction of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Tokens received at a custodial deposit address
    Deposit,
    /// Tokens sent from a custodial deposit address to a user-controlled one
    Withdrawal,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryType::Deposit => write!(f, "deposit"),
            EntryType::Withdrawal => write!(f, "withdrawal"),
        }
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(EntryType::Deposit),
            "withdrawal" => Ok(EntryType::Withdrawal),
            _ => Err(format!("Unknown entry type: {}", s)),
        }
    }
}

/// Persisted status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Confirmed,
    Failed,
}

impl EntryStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Confirmed | EntryStatus::Failed)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Pending => write!(f, "pending"),
            EntryStatus::Confirmed => write!(f, "confirmed"),
            EntryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "confirmed" => Ok(EntryStatus::Confirmed),
            "failed" => Ok(EntryStatus::Failed),
            _ => Err(format!("Unknown entry status: {}", s)),
        }
    }
}

/// Final on-chain outcome of a withdrawal, as passed to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalOutcome {
    Confirmed,
    Failed,
}

impl From<WithdrawalOutcome> for EntryStatus {
    fn from(outcome: WithdrawalOutcome) -> Self {
        match outcome {
            WithdrawalOutcome::Confirmed => EntryStatus::Confirmed,
            WithdrawalOutcome::Failed => EntryStatus::Failed,
        }
    }
}

/// Lifecycle of a withdrawal request.
///
/// `Requested` exists only in memory; every later state is derived from the
/// persisted entry (`Reserved` = pending without a transaction hash,
/// `Submitted` = pending with one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalState {
    /// Request validated, nothing persisted yet
    Requested,
    /// Balance debited, no transaction signed yet
    Reserved,
    /// Signed transaction recorded and handed to the network
    Submitted,
    /// Receipt reported success
    Confirmed,
    /// Rejected, reverted or abandoned; balance restored
    Failed,
}

impl WithdrawalState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawalState::Confirmed | WithdrawalState::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: WithdrawalState) -> bool {
        use WithdrawalState::*;
        matches!(
            (self, next),
            (Requested, Reserved)
                | (Reserved, Submitted)
                | (Reserved, Failed)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
        )
    }
}

impl std::fmt::Display for WithdrawalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WithdrawalState::Requested => write!(f, "requested"),
            WithdrawalState::Reserved => write!(f, "reserved"),
            WithdrawalState::Submitted => write!(f, "submitted"),
            WithdrawalState::Confirmed => write!(f, "confirmed"),
            WithdrawalState::Failed => write!(f, "failed"),
        }
    }
}

/// A row of the transaction history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry identifier; doubles as the withdrawal id
    pub id: Uuid,

    /// Owner of the balance this entry moved
    pub user_id: UserId,

    /// Amount in token units
    pub amount: Decimal,

    pub address_from: String,

    pub address_to: String,

    pub entry_type: EntryType,

    pub status: EntryStatus,

    /// Chain tx hash for deposits, withdrawal id for withdrawals
    pub idempotency_key: String,

    /// Hash of the outbound transaction once signed (withdrawals only)
    pub chain_tx_hash: Option<String>,

    /// Account nonce the outbound transaction was signed with
    pub nonce: Option<u64>,

    /// Block the deposit was observed in
    pub block_number: Option<u64>,

    /// Failure reason for failed withdrawals
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create a confirmed deposit entry keyed by the chain transaction hash.
    pub fn new_deposit(
        user_id: UserId,
        amount: Decimal,
        address_from: String,
        address_to: String,
        tx_hash: String,
        block_number: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            address_from,
            address_to,
            entry_type: EntryType::Deposit,
            status: EntryStatus::Confirmed,
            idempotency_key: tx_hash.clone(),
            chain_tx_hash: Some(tx_hash),
            nonce: None,
            block_number,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a pending withdrawal entry; its id is the idempotency key.
    pub fn new_withdrawal(
        user_id: UserId,
        amount: Decimal,
        deposit_address: String,
        destination: String,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            user_id,
            amount,
            address_from: deposit_address,
            address_to: destination,
            entry_type: EntryType::Withdrawal,
            status: EntryStatus::Pending,
            idempotency_key: id.to_string(),
            chain_tx_hash: None,
            nonce: None,
            block_number: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Position of a withdrawal entry in the withdrawal lifecycle.
    pub fn withdrawal_state(&self) -> Option<WithdrawalState> {
        if self.entry_type != EntryType::Withdrawal {
            return None;
        }

        Some(match (self.status, &self.chain_tx_hash) {
            (EntryStatus::Pending, None) => WithdrawalState::Reserved,
            (EntryStatus::Pending, Some(_)) => WithdrawalState::Submitted,
            (EntryStatus::Confirmed, _) => WithdrawalState::Confirmed,
            (EntryStatus::Failed, _) => WithdrawalState::Failed,
        })
    }

    /// Signed effect of this entry on the owner's balance.
    ///
    /// Summing this over a user's entries must reproduce the stored balance.
    pub fn balance_effect(&self) -> Decimal {
        match (self.entry_type, self.status) {
            (EntryType::Deposit, EntryStatus::Confirmed) => self.amount,
            (EntryType::Withdrawal, EntryStatus::Pending | EntryStatus::Confirmed) => -self.amount,
            _ => Decimal::ZERO,
        }
    }

    /// Seconds since the entry was created.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }
}
