// Copyright (c) 2024 The Botho Foundation

//! Withdrawal engine.
//!
//! `Requested → Reserved → Submitted → {Confirmed | Failed}`
//!
//! The balance is debited (reserved) before any chain interaction. Every
//! failure that provably happened before broadcast is compensated on the
//! spot. Once a signed transaction may have reached the network the entry
//! is only settled from a receipt, here or in the reconciliation pass.

use alloy::primitives::Address;
use bth_custody_core::{
    address, amount, EthereumConfig, LedgerEntry, User, WithdrawalOutcome, WithdrawalSettings,
    WithdrawalState,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::Mutex as AsyncMutex, time::Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    chain::{self, ChainClient, NonceTag, TransferParams, TxReceipt},
    custody::KeyStore,
    error::{CustodyError, Result},
    ledger::Ledger,
};

/// Outcome reported to the caller of a completed withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalReceipt {
    pub withdrawal_id: Uuid,
    pub status: WithdrawalState,
    pub tx_hash: Option<String>,
    pub amount: Decimal,
    pub destination: String,
}

/// Nonce after the last transaction this process sent from one deposit address.
#[derive(Debug, Default)]
struct NonceTracker {
    next: Option<u64>,
}

pub struct WithdrawalEngine {
    chain: Arc<dyn ChainClient>,
    ledger: Ledger,
    keys: Arc<KeyStore>,
    token: Address,
    decimals: u8,
    gas_limit: u64,
    chain_id: u64,
    settings: WithdrawalSettings,
    address_locks: Mutex<HashMap<String, Arc<AsyncMutex<NonceTracker>>>>,
}

impl WithdrawalEngine {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Ledger,
        keys: Arc<KeyStore>,
        ethereum: &EthereumConfig,
        settings: WithdrawalSettings,
    ) -> Result<Self> {
        let token = address::parse_address(&ethereum.token_contract)
            .map_err(|e| CustodyError::InvalidInput(format!("token contract: {}", e)))?;

        Ok(Self {
            chain,
            ledger,
            keys,
            token,
            decimals: ethereum.token_decimals,
            gas_limit: ethereum.gas_limit,
            chain_id: ethereum.chain_id,
            settings,
            address_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Serialization point for nonce use on one deposit address.
    fn address_lock(&self, deposit_address: &str) -> Arc<AsyncMutex<NonceTracker>> {
        let mut locks = match self.address_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(deposit_address.to_string())
            .or_default()
            .clone()
    }

    /// Run one withdrawal from `user`'s deposit address to `destination`.
    pub async fn withdraw(
        &self,
        user: &User,
        destination: Address,
        amount: Decimal,
    ) -> Result<WithdrawalReceipt> {
        // Requested
        let raw_amount = amount::to_raw(amount, self.decimals)
            .map_err(|e| CustodyError::InvalidInput(e.to_string()))?;
        let from = address::parse_address(&user.deposit_address)
            .map_err(|e| CustodyError::Custody(format!("stored deposit address: {}", e)))?;
        let signer = self.keys.signing_key(&user.deposit_address)?;

        // Reserved
        let entry = self
            .ledger
            .reserve_for_withdrawal(user.id, amount, &address::normalize(&destination))?;

        if self.settings.check_onchain_balance {
            match chain::token_balance(self.chain.as_ref(), self.token, from).await {
                Ok(held) if held >= raw_amount => {}
                Ok(held) => {
                    let reason = format!(
                        "deposit address holds {} raw units, {} required",
                        held, raw_amount
                    );
                    return Err(self.fail_unsent(&entry, reason));
                }
                Err(e) => {
                    let reason = format!("balance check failed: {}", e);
                    self.compensate(&entry, &reason)?;
                    return Err(CustodyError::ChainUnavailable(reason));
                }
            }
        }

        // Submitted
        let tx_hash = {
            let lock = self.address_lock(&user.deposit_address);
            let mut tracker = lock.lock().await;

            let pending = match self.chain.transaction_count(from, NonceTag::Pending).await {
                Ok(n) => n,
                Err(e) => {
                    let reason = format!("nonce unavailable: {}", e);
                    self.compensate(&entry, &reason)?;
                    return Err(CustodyError::ChainUnavailable(reason));
                }
            };
            // The node's pending count is authoritative. A count below what
            // this process already sent means the node dropped a transaction,
            // and its nonce must be reused or every later nonce is gapped.
            if let Some(next) = tracker.next.filter(|next| *next > pending) {
                warn!(
                    "Node pending nonce for {} is {} but {} was already sent; reusing the dropped nonce",
                    user.deposit_address, pending, next
                );
            }
            let nonce = pending;

            let gas_price = match self.chain.gas_price().await {
                Ok(price) => price,
                Err(e) => {
                    let reason = format!("gas price unavailable: {}", e);
                    self.compensate(&entry, &reason)?;
                    return Err(CustodyError::ChainUnavailable(reason));
                }
            };

            let params = TransferParams {
                token: self.token,
                from,
                to: destination,
                raw_amount,
                nonce,
                gas_price,
                gas_limit: self.gas_limit,
                chain_id: self.chain_id,
            };
            let signed = match chain::sign_transfer(&params, &signer).await {
                Ok(signed) => signed,
                Err(e) => {
                    self.compensate(&entry, &e.to_string())?;
                    return Err(e);
                }
            };

            // Without a recorded hash the entry is known never to have been
            // broadcast, and reconciliation may compensate it.
            self.ledger
                .record_submission(&entry.id, &signed.hash, nonce, &signed.raw)?;

            match self.chain.send_raw(&signed).await {
                Ok(()) => {
                    tracker.next = Some(nonce + 1);
                    info!(
                        "Withdrawal {} submitted as {} (nonce {})",
                        entry.id, signed.hash, nonce
                    );
                }
                Err(e) if e.is_ambiguous() => {
                    tracker.next = None;
                    warn!(
                        "Withdrawal {} submission outcome unknown ({}), left for reconciliation",
                        entry.id, e
                    );
                    return Err(CustodyError::SubmissionAmbiguous {
                        withdrawal_id: entry.id,
                        tx_hash: signed.hash,
                    });
                }
                Err(e) => {
                    tracker.next = None;
                    return Err(self.fail_unsent(&entry, e.to_string()));
                }
            }

            signed.hash
        };

        // Await the receipt
        match self.wait_for_receipt(&tx_hash).await {
            Some(receipt) if receipt.success => {
                self.ledger
                    .finalize_withdrawal(&entry.id, WithdrawalOutcome::Confirmed, None)?;
                Ok(WithdrawalReceipt {
                    withdrawal_id: entry.id,
                    status: WithdrawalState::Confirmed,
                    tx_hash: Some(tx_hash),
                    amount,
                    destination: entry.address_to,
                })
            }
            Some(_) => {
                let reason = format!("transaction {} reverted", tx_hash);
                self.ledger.finalize_withdrawal(
                    &entry.id,
                    WithdrawalOutcome::Failed,
                    Some(&reason),
                )?;
                Err(CustodyError::SubmissionFailed {
                    withdrawal_id: entry.id,
                    reason,
                })
            }
            None => {
                warn!(
                    "No receipt for withdrawal {} ({}) within {}s, left for reconciliation",
                    entry.id, tx_hash, self.settings.receipt_timeout_secs
                );
                Err(CustodyError::SubmissionAmbiguous {
                    withdrawal_id: entry.id,
                    tx_hash,
                })
            }
        }
    }

    /// Poll for a receipt until the configured timeout.
    async fn wait_for_receipt(&self, tx_hash: &str) -> Option<TxReceipt> {
        let deadline = Instant::now() + Duration::from_secs(self.settings.receipt_timeout_secs);
        let interval = Duration::from_secs(self.settings.receipt_poll_interval_secs);

        loop {
            match self.chain.get_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(e) => warn!("Receipt query for {} failed: {}", tx_hash, e),
            }

            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Compensate a withdrawal that was never broadcast.
    fn compensate(&self, entry: &LedgerEntry, reason: &str) -> Result<()> {
        warn!("Withdrawal {} failed before broadcast: {}", entry.id, reason);
        self.ledger
            .finalize_withdrawal(&entry.id, WithdrawalOutcome::Failed, Some(reason))
            .map(|_| ())
            .map_err(|e| {
                error!("Failed to compensate withdrawal {}: {}", entry.id, e);
                e
            })
    }

    fn fail_unsent(&self, entry: &LedgerEntry, reason: String) -> CustodyError {
        if let Err(e) = self.compensate(entry, &reason) {
            return e;
        }
        CustodyError::SubmissionFailed {
            withdrawal_id: entry.id,
            reason,
        }
    }
}
