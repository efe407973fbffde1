// Copyright (c) 2024 The Botho Foundation

//! BTH token custody service.
//!
//! Users get a custodial deposit address on an EVM chain. The service scans
//! confirmed blocks for ERC-20 transfers into those addresses, credits an
//! internal ledger, and pays withdrawals out of the user's own deposit
//! address.
//!
//! # Architecture
//!
//! - [`scanner`] classifies the transactions of a block into deposit candidates
//! - [`ledger`] owns balances; every mutation is a single SQLite transaction
//! - [`withdrawal`] reserves, signs and broadcasts withdrawals
//! - [`reconcile`] settles withdrawals whose outcome was unknown at submit time
//! - [`engine`] follows the chain and runs reconciliation in the background
//!
//! # Security Model
//!
//! Deposit-address private keys are sealed with a key derived from an operator
//! passphrase and only unsealed in memory to sign a withdrawal.

pub mod chain;
pub mod custody;
pub mod db;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod reconcile;
pub mod scanner;
pub mod service;
pub mod withdrawal;

pub use chain::{ChainClient, ChainError, EthereumClient};
#[cfg(any(test, feature = "test_utils"))]
pub use chain::MockChainClient;
pub use custody::KeyStore;
pub use db::Database;
pub use engine::{ChainFollower, CustodyEngine};
pub use error::{CustodyError, Result};
pub use ledger::{CreditOutcome, Ledger};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler};
pub use scanner::{BlockScanner, DepositCandidate};
pub use service::{CustodyService, ScanSummary};
pub use withdrawal::{WithdrawalEngine, WithdrawalReceipt};
