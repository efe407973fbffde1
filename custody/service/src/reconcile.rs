// Copyright (c) 2024 The Botho Foundation

//! Out-of-band settlement of pending withdrawals.
//!
//! A pending withdrawal is only compensated when the chain proves its
//! transaction can no longer land:
//!
//! 1. no transaction hash recorded and the reservation is stale: the
//!    transaction was never broadcast;
//! 2. a receipt exists: settle from its status;
//! 3. the node still knows the transaction: wait;
//! 4. the node forgot it and the address's mined nonce moved past the
//!    entry's nonce, for longer than the abandon window: the nonce was
//!    consumed by another transaction;
//! 5. the node forgot it and its nonce is still free: the recorded signed
//!    transaction is broadcast again and the entry stays pending.
//!
//! Any chain error leaves the entry untouched until the next pass.

use alloy::primitives::Address;
use bth_custody_core::{
    address, amount, calldata, CalldataClassifier, LedgerEntry, WithdrawalOutcome,
    WithdrawalSettings,
};
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    chain::{ChainClient, ChainError, NonceTag, SignedTransfer},
    error::{CustodyError, Result},
    ledger::Ledger,
};

/// Decision for one pending withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed,
    Failed(String),
    /// The dropped transaction was handed to the node again.
    Rebroadcast,
    Pending,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub pending: usize,
    pub rebroadcast: usize,
    pub chain_errors: usize,
}

/// Why a withdrawal could not be resolved.
#[derive(Debug, Display, Error)]
pub enum ReconcileError {
    /// Chain unavailable, retry next pass: {0}
    Chain(#[from] ChainError),

    /// Ledger: {0}
    Ledger(#[from] CustodyError),
}

pub struct Reconciler {
    chain: Arc<dyn ChainClient>,
    ledger: Ledger,
    token: CalldataClassifier,
    settings: WithdrawalSettings,
}

impl Reconciler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Ledger,
        token: CalldataClassifier,
        settings: WithdrawalSettings,
    ) -> Self {
        Self {
            chain,
            ledger,
            token,
            settings,
        }
    }

    /// Examine every pending withdrawal once.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for entry in self.ledger.pending_withdrawals()? {
            report.examined += 1;

            match self.resolve(&entry).await {
                Ok(Resolution::Confirmed) => {
                    self.ledger
                        .finalize_withdrawal(&entry.id, WithdrawalOutcome::Confirmed, None)?;
                    info!("Reconciled withdrawal {} as confirmed", entry.id);
                    report.confirmed += 1;
                }
                Ok(Resolution::Failed(reason)) => {
                    self.ledger.finalize_withdrawal(
                        &entry.id,
                        WithdrawalOutcome::Failed,
                        Some(&reason),
                    )?;
                    info!("Reconciled withdrawal {} as failed: {}", entry.id, reason);
                    report.failed += 1;
                }
                Ok(Resolution::Rebroadcast) => {
                    info!("Rebroadcast dropped withdrawal {}", entry.id);
                    report.rebroadcast += 1;
                    report.pending += 1;
                }
                Ok(Resolution::Pending) => report.pending += 1,
                Err(ReconcileError::Chain(e)) => {
                    warn!("Cannot reconcile withdrawal {} yet: {}", entry.id, e);
                    report.chain_errors += 1;
                }
                Err(ReconcileError::Ledger(e)) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Decide what the chain says about one pending withdrawal.
    pub async fn resolve(
        &self,
        entry: &LedgerEntry,
    ) -> std::result::Result<Resolution, ReconcileError> {
        let age = entry.age_secs();

        let Some(tx_hash) = entry.chain_tx_hash.as_deref() else {
            if age >= self.settings.stale_reservation_secs {
                return Ok(Resolution::Failed("reservation never broadcast".to_string()));
            }
            return Ok(Resolution::Pending);
        };

        if let Some(receipt) = self.chain.get_receipt(tx_hash).await? {
            return Ok(if receipt.success {
                Resolution::Confirmed
            } else {
                Resolution::Failed(format!("transaction {} reverted", tx_hash))
            });
        }

        if self.chain.get_transaction(tx_hash).await?.is_some() {
            return Ok(Resolution::Pending);
        }

        let (Some(nonce), Ok(from)) = (entry.nonce, address::parse_address(&entry.address_from))
        else {
            return Ok(Resolution::Pending);
        };

        let mined = self.mined_nonce(from).await?;
        if mined > nonce {
            if age >= self.settings.abandon_after_secs {
                return Ok(Resolution::Failed(format!(
                    "transaction {} dropped, nonce {} consumed",
                    tx_hash, nonce
                )));
            }
            return Ok(Resolution::Pending);
        }

        let Some(raw) = self.ledger.signed_transaction(&entry.id)? else {
            return Ok(Resolution::Pending);
        };
        let signed = self.rebuild(entry, tx_hash, from, nonce, raw)?;
        match self.chain.send_raw(&signed).await {
            Ok(()) => Ok(Resolution::Rebroadcast),
            Err(e) if e.is_ambiguous() => Err(e.into()),
            Err(e) => {
                // Peers may still hold a copy, so a refusal is not proof it cannot land.
                warn!("Node refused rebroadcast of {}: {}", tx_hash, e);
                Ok(Resolution::Pending)
            }
        }
    }

    fn rebuild(
        &self,
        entry: &LedgerEntry,
        tx_hash: &str,
        from: Address,
        nonce: u64,
        raw: Vec<u8>,
    ) -> Result<SignedTransfer> {
        let destination = address::parse_address(&entry.address_to).map_err(|e| {
            CustodyError::StorageFailure(format!("withdrawal {} destination: {}", entry.id, e))
        })?;
        let raw_amount = amount::to_raw(entry.amount, self.token.decimals()).map_err(|e| {
            CustodyError::StorageFailure(format!("withdrawal {} amount: {}", entry.id, e))
        })?;

        Ok(SignedTransfer {
            hash: tx_hash.to_string(),
            raw: raw.into(),
            from,
            to: self.token.token_contract(),
            nonce,
            input: calldata::encode_transfer(destination, raw_amount),
        })
    }

    async fn mined_nonce(&self, from: Address) -> std::result::Result<u64, ChainError> {
        self.chain.transaction_count(from, NonceTag::Latest).await
    }
}
