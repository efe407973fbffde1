// Copyright (c) 2024 The Botho Foundation

//! Core types and logic for the BTH token custody ledger.
//!
//! This crate holds everything about custody that does not touch a network
//! or a database:
//!
//! - Token amount scaling between raw chain integers and token units
//! - ERC-20 calldata classification
//! - Ledger entries and the withdrawal state machine
//! - Boundary request validation
//! - Configuration structures

pub mod address;
pub mod amount;
pub mod calldata;
pub mod config;
pub mod entry;
pub mod request;
pub mod user;

pub use calldata::{CalldataClassifier, Classification, IgnoreReason, TokenTransfer, TransferKind};
pub use config::{
    ConfigError, CustodyConfig, EthereumConfig, KeyCustodyConfig, LedgerConfig, ScannerSettings,
    WithdrawalSettings,
};
pub use entry::{EntryStatus, EntryType, LedgerEntry, WithdrawalOutcome, WithdrawalState};
pub use request::{ValidatedWithdrawal, ValidationError};
pub use user::{CreatedUser, User, UserId, WalletSummary};
