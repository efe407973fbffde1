// Copyright (c) 2024 The Botho Foundation

//! Shared setup for custody integration tests.
//!
//! A [`TestCustody`] wires a [`CustodyService`] to an in-memory SQLite ledger
//! and a [`MockChainClient`], with cheap key-derivation parameters.

#![allow(dead_code)]

use std::{str::FromStr, sync::Arc};

use alloy::primitives::{Address, U256};
use bth_custody_core::{
    address, calldata,
    request::{CreateUserRequest, WalletSummaryRequest, WithdrawalRequest},
    CustodyConfig, KeyCustodyConfig, UserId, WalletSummary,
};
use bth_custody_service::{
    chain::ChainTransaction, CustodyService, Database, KeyStore, Ledger, MockChainClient,
};
use rust_decimal::Decimal;

pub const TOKEN: Address = alloy::primitives::address!("9999f7fea5938fd3b1e26a12c3f2fb024e194f97");
pub const SENDER: Address = alloy::primitives::address!("00000000000000000000000000000000000a11ce");
pub const DESTINATION: Address = alloy::primitives::address!("0000000000000000000000000000000000000abc");
pub const PASSPHRASE: &str = "integration-passphrase";

pub struct TestCustody {
    pub chain: Arc<MockChainClient>,
    pub service: Arc<CustodyService>,
}

/// Configuration tuned for tests: no confirmation depth, no waiting.
pub fn test_config() -> CustodyConfig {
    let mut config = CustodyConfig::default();
    config.ethereum.token_contract = address::normalize(&TOKEN);
    config.ethereum.confirmations_required = 0;
    config.custody = KeyCustodyConfig {
        argon2_memory_kib: 1024,
        argon2_iterations: 1,
        ..KeyCustodyConfig::default()
    };
    config.scanner.retry_backoff_secs = 0;
    config.scanner.poll_interval_secs = 1;
    config.withdrawal.receipt_timeout_secs = 0;
    config.withdrawal.receipt_poll_interval_secs = 0;
    config
}

impl TestCustody {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CustodyConfig) -> Self {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Self::with_database(config, db)
    }

    pub fn with_database(config: CustodyConfig, db: Database) -> Self {
        let keys = Arc::new(KeyStore::new(db.clone(), PASSPHRASE, &config.custody).unwrap());
        let chain = Arc::new(MockChainClient::new());
        let service =
            CustodyService::new(config, Ledger::new(db), keys, chain.clone()).unwrap();

        Self {
            chain,
            service: Arc::new(service),
        }
    }

    /// Register `email` and return its id and deposit address.
    pub fn user(&self, email: &str) -> (UserId, Address) {
        let created = self
            .service
            .create_user(&CreateUserRequest {
                email: Some(email.to_string()),
            })
            .unwrap();
        (
            created.user_id,
            Address::from_str(&created.deposit_address).unwrap(),
        )
    }

    /// Put a token transfer of `raw` units to `to` into block `number`.
    pub fn deposit(&self, number: u64, hash: &str, to: Address, raw: u64) {
        self.chain.push_block(number, vec![transfer_tx(hash, 0, to, raw)]);
    }

    pub fn withdrawal(&self, email: &str, amount: &str) -> WithdrawalRequest {
        WithdrawalRequest {
            user_email: Some(email.to_string()),
            withdraw_address: Some(address::normalize(&DESTINATION)),
            withdraw_amount: Some(amount.to_string()),
        }
    }

    pub fn summary(&self, email: &str) -> WalletSummary {
        self.service
            .get_wallet_summary(&WalletSummaryRequest {
                user_email: Some(email.to_string()),
            })
            .unwrap()
    }

    pub fn balance(&self, user_id: UserId) -> Decimal {
        self.service.ledger().balance_of(user_id).unwrap()
    }
}

pub fn transfer_tx(hash: &str, index: u64, to: Address, raw: u64) -> ChainTransaction {
    ChainTransaction {
        hash: hash.to_string(),
        from: SENDER,
        to: Some(TOKEN),
        input: calldata::encode_transfer(to, U256::from(raw)),
        index,
    }
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}
