// Copyright (c) 2024 The Botho Foundation

//! Custody users and wallet views.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entry::LedgerEntry;

/// Opaque user identifier assigned by the ledger store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A custody account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,

    /// Contact handle, unique across users
    pub email: String,

    /// Lower-case custodial deposit address
    pub deposit_address: String,

    /// Spendable balance in token units
    pub balance: Decimal,

    pub created_at: DateTime<Utc>,
}

/// Result of account creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedUser {
    pub user_id: UserId,
    pub deposit_address: String,
}

/// Balance, most recent deposit and full history for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSummary {
    pub balance: Decimal,

    /// Amount of the latest deposit, zero if there is none
    pub last_deposit: Decimal,

    pub history: Vec<LedgerEntry>,
}
