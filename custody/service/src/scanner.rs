// Copyright (c) 2024 The Botho Foundation

//! Block scanner: turns a block into deposit candidates for our addresses.
//!
//! Scanning never mutates balances. Re-scanning a block yields the same
//! candidates; the ledger's idempotency key makes crediting them again a
//! no-op.

use bth_custody_core::{address, CalldataClassifier, Classification, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::{
    chain::{ChainBlock, ChainClient},
    error::{CustodyError, Result},
    ledger::Ledger,
};

/// A token transfer into a custodial deposit address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositCandidate {
    /// Transaction hash; the ledger idempotency key
    pub tx_hash: String,

    /// Sender of the transaction
    pub from: String,

    /// Deposit address that received the tokens
    pub to: String,

    /// Owner of the deposit address
    pub user_id: UserId,

    /// Amount in token units
    pub amount: Decimal,

    pub block_number: u64,

    /// Position inside the block
    pub tx_index: u64,
}

/// Scans blocks behind the confirmation-depth guard.
pub struct BlockScanner {
    chain: Arc<dyn ChainClient>,
    ledger: Ledger,
    classifier: CalldataClassifier,
    confirmations: u64,
}

impl BlockScanner {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Ledger,
        classifier: CalldataClassifier,
        confirmations: u64,
    ) -> Self {
        Self {
            chain,
            ledger,
            classifier,
            confirmations,
        }
    }

    /// Highest block that has reached the confirmation depth, if any.
    pub async fn finalized_head(&self) -> Result<Option<u64>> {
        let head = self.chain.block_number().await?;
        Ok(head.checked_sub(self.confirmations))
    }

    /// Fail with [`CustodyError::BlockNotConfirmed`] unless `block` is deep enough.
    pub async fn ensure_final(&self, block: u64) -> Result<()> {
        let head = self.chain.block_number().await?;
        match head.checked_sub(self.confirmations) {
            Some(finalized) if block <= finalized => Ok(()),
            _ => Err(CustodyError::BlockNotConfirmed {
                block,
                head,
                required: self.confirmations,
            }),
        }
    }

    /// Fetch a block, mapping any failure or absence to `ChainUnavailable`.
    pub async fn fetch(&self, block_number: u64) -> Result<ChainBlock> {
        self.chain
            .get_block(block_number)
            .await?
            .ok_or_else(|| {
                CustodyError::ChainUnavailable(format!("block {} not available", block_number))
            })
    }

    /// Deposit candidates in `block_number`, in transaction order.
    pub async fn scan(&self, block_number: u64) -> Result<Vec<DepositCandidate>> {
        self.ensure_final(block_number).await?;
        let block = self.fetch(block_number).await?;
        self.candidates(&block)
    }

    /// Classify every transaction of an already fetched block.
    pub fn candidates(&self, block: &ChainBlock) -> Result<Vec<DepositCandidate>> {
        let mut transactions = block.transactions.iter().collect::<Vec<_>>();
        transactions.sort_by_key(|tx| tx.index);

        let mut candidates = Vec::new();
        for tx in transactions {
            // Contract creation
            let Some(contract) = tx.to else {
                continue;
            };

            let transfer = match self.classifier.classify(contract, &tx.input) {
                Classification::Transfer(transfer) => transfer,
                Classification::Ignored(reason) => {
                    debug!("Ignoring tx {}: {:?}", tx.hash, reason);
                    continue;
                }
            };

            let recipient = address::normalize(&transfer.to);
            let Some(user) = self.ledger.user_by_address(&recipient)? else {
                continue;
            };

            debug!(
                "Deposit candidate {} of {} to user {} in block {}",
                tx.hash, transfer.amount, user.id, block.number
            );

            candidates.push(DepositCandidate {
                tx_hash: tx.hash.clone(),
                from: address::normalize(&tx.from),
                to: recipient,
                user_id: user.id,
                amount: transfer.amount,
                block_number: block.number,
                tx_index: tx.index,
            });
        }

        Ok(candidates)
    }
}
