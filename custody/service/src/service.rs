// Copyright (c) 2024 The Botho Foundation

//! Boundary operations consumed by the request layer.

use bth_custody_core::{
    address,
    request::{CreateUserRequest, ScanBlockRequest, WalletSummaryRequest, WithdrawalRequest},
    CalldataClassifier, CreatedUser, CustodyConfig, WalletSummary,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::{
    chain::ChainClient,
    custody::KeyStore,
    error::{CustodyError, Result},
    ledger::Ledger,
    reconcile::{ReconcileReport, Reconciler},
    scanner::{BlockScanner, DepositCandidate},
    withdrawal::{WithdrawalEngine, WithdrawalReceipt},
};

/// What crediting one block did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub block_number: u64,
    /// Deposits to custodial addresses found in the block
    pub candidates: usize,
    /// Deposits newly credited by this call
    pub credited_count: usize,
    /// Deposits that had already been credited
    pub duplicate_count: usize,
}

/// The custody core wired to its collaborators.
pub struct CustodyService {
    config: CustodyConfig,
    ledger: Ledger,
    keys: Arc<KeyStore>,
    scanner: BlockScanner,
    withdrawals: WithdrawalEngine,
    reconciler: Reconciler,
}

impl CustodyService {
    pub fn new(
        config: CustodyConfig,
        ledger: Ledger,
        keys: Arc<KeyStore>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self> {
        let token = address::parse_address(&config.ethereum.token_contract)
            .map_err(|e| CustodyError::InvalidInput(format!("token contract: {}", e)))?;
        let classifier = CalldataClassifier::new(token, config.ethereum.token_decimals);

        let scanner = BlockScanner::new(
            chain.clone(),
            ledger.clone(),
            classifier,
            config.ethereum.confirmations_required,
        );
        let withdrawals = WithdrawalEngine::new(
            chain.clone(),
            ledger.clone(),
            keys.clone(),
            &config.ethereum,
            config.withdrawal.clone(),
        )?;
        let reconciler = Reconciler::new(
            chain,
            ledger.clone(),
            classifier,
            config.withdrawal.clone(),
        );

        Ok(Self {
            config,
            ledger,
            keys,
            scanner,
            withdrawals,
            reconciler,
        })
    }

    pub fn config(&self) -> &CustodyConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn scanner(&self) -> &BlockScanner {
        &self.scanner
    }

    /// Register a user and generate its deposit address.
    pub fn create_user(&self, request: &CreateUserRequest) -> Result<CreatedUser> {
        let email = request.validate()?;
        let key = self.keys.generate()?;
        self.ledger.create_user(&email, &key)
    }

    /// Scan one block and credit every deposit in it.
    pub async fn scan_block(&self, request: &ScanBlockRequest) -> Result<ScanSummary> {
        let block_number = request.validate()?;
        let candidates = self.scanner.scan(block_number).await?;
        self.credit_candidates(block_number, &candidates)
    }

    /// Credit deposit candidates of one block, in order.
    pub fn credit_candidates(
        &self,
        block_number: u64,
        candidates: &[DepositCandidate],
    ) -> Result<ScanSummary> {
        let mut summary = ScanSummary {
            block_number,
            candidates: candidates.len(),
            ..ScanSummary::default()
        };

        for candidate in candidates {
            let outcome = self.ledger.credit(
                candidate.user_id,
                candidate.amount,
                &candidate.from,
                &candidate.tx_hash,
                Some(candidate.block_number),
            )?;
            if outcome.is_new() {
                summary.credited_count += 1;
            } else {
                summary.duplicate_count += 1;
            }
        }

        if summary.credited_count > 0 {
            info!(
                "Block {}: credited {} deposits ({} already known)",
                block_number, summary.credited_count, summary.duplicate_count
            );
        }

        Ok(summary)
    }

    /// Withdraw from a user's balance to an address they control.
    pub async fn request_withdrawal(&self, request: &WithdrawalRequest) -> Result<WithdrawalReceipt> {
        let withdrawal = request.validate()?;
        let user = self.ledger.user_by_email(&withdrawal.user_email)?;
        self.withdrawals
            .withdraw(&user, withdrawal.destination, withdrawal.amount)
            .await
    }

    /// Balance, latest deposit and history of a user.
    pub fn get_wallet_summary(&self, request: &WalletSummaryRequest) -> Result<WalletSummary> {
        let email = request.validate()?;
        let user = self.ledger.user_by_email(&email)?;

        let last_deposit = self
            .ledger
            .last_deposit(user.id)?
            .map(|entry| entry.amount)
            .unwrap_or(Decimal::ZERO);

        Ok(WalletSummary {
            balance: user.balance,
            last_deposit,
            history: self.ledger.history_of(user.id)?,
        })
    }

    /// One reconciliation pass over pending withdrawals.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.run_once().await
    }
}
