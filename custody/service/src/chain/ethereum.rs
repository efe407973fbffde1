// Copyright (c) 2024 The Botho Foundation

//! JSON-RPC chain client built on alloy.

use alloy::{
    eips::BlockId,
    network::{ReceiptResponse, TransactionResponse},
    primitives::{Address, Bytes, B256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{BlockNumberOrTag, BlockTransactionsKind, Transaction, TransactionRequest},
    transports::{
        http::{Client, Http},
        RpcError, TransportResult,
    },
};
use async_trait::async_trait;
use bth_custody_core::EthereumConfig;
use std::{future::IntoFuture, str::FromStr, time::Duration};
use tracing::debug;

use super::{ChainBlock, ChainClient, ChainError, ChainTransaction, NonceTag, SignedTransfer, TxReceipt};

/// Ethereum node reached over HTTP.
pub struct EthereumClient {
    provider: RootProvider<Http<Client>>,
    timeout: Duration,
}

impl EthereumClient {
    pub fn new(config: &EthereumConfig) -> Result<Self, ChainError> {
        let url = config
            .rpc_url
            .parse()
            .map_err(|e| ChainError::Unavailable(format!("invalid rpc_url: {}", e)))?;

        Ok(Self {
            provider: ProviderBuilder::new().on_http(url),
            timeout: Duration::from_secs(config.rpc_timeout_secs),
        })
    }

    /// Await an RPC call within the configured timeout.
    async fn bounded<T, F>(&self, call: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = TransportResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ChainError::Unavailable(e.to_string())),
            Err(_) => Err(ChainError::Timeout),
        }
    }
}

fn parse_hash(hash: &str) -> Result<B256, ChainError> {
    B256::from_str(hash).map_err(|e| ChainError::Rejected(format!("invalid tx hash {}: {}", hash, e)))
}

fn to_chain_transaction(tx: &Transaction, fallback_index: u64) -> ChainTransaction {
    ChainTransaction {
        hash: format!("{:#x}", tx.tx_hash()),
        from: tx.from(),
        to: alloy::consensus::Transaction::to(tx),
        input: alloy::consensus::Transaction::input(tx).clone(),
        index: tx.transaction_index.unwrap_or(fallback_index),
    }
}

#[async_trait]
impl ChainClient for EthereumClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.bounded(self.provider.get_block_number()).await
    }

    async fn get_block(&self, number: u64) -> Result<Option<ChainBlock>, ChainError> {
        let block = self
            .bounded(
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(number), BlockTransactionsKind::Full),
            )
            .await?;

        let Some(block) = block else {
            return Ok(None);
        };

        let transactions = block
            .transactions
            .as_transactions()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, tx)| to_chain_transaction(tx, i as u64))
            .collect::<Vec<_>>();

        debug!("Fetched block {} with {} transactions", number, transactions.len());

        Ok(Some(ChainBlock {
            number: block.header.number,
            hash: format!("{:#x}", block.header.hash),
            transactions,
        }))
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, ChainError> {
        let hash = parse_hash(hash)?;
        let tx = self
            .bounded(self.provider.get_transaction_by_hash(hash))
            .await?;
        Ok(tx.map(|tx| to_chain_transaction(&tx, 0)))
    }

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> Result<u64, ChainError> {
        let block = match tag {
            NonceTag::Latest => BlockId::latest(),
            NonceTag::Pending => BlockId::pending(),
        };
        self.bounded(self.provider.get_transaction_count(address).block_id(block))
            .await
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.bounded(self.provider.get_gas_price()).await
    }

    async fn send_raw(&self, tx: &SignedTransfer) -> Result<(), ChainError> {
        match tokio::time::timeout(self.timeout, self.provider.send_raw_transaction(&tx.raw)).await {
            Ok(Ok(_pending)) => Ok(()),
            Ok(Err(RpcError::ErrorResp(payload))) => Err(classify_send_error(&payload.message)),
            Ok(Err(e)) => Err(ChainError::Unavailable(e.to_string())),
            Err(_) => Err(ChainError::Timeout),
        }
    }

    async fn get_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, ChainError> {
        let hash = parse_hash(hash)?;
        let receipt = self
            .bounded(self.provider.get_transaction_receipt(hash))
            .await?;
        Ok(receipt.map(|r| TxReceipt {
            success: r.status(),
            block_number: r.block_number,
        }))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let request = TransactionRequest::default().to(to).input(data.into());
        self.bounded(self.provider.call(&request)).await
    }
}

/// Node error messages that prove a raw transaction was refused and is not
/// in the pool. Matched case-insensitively as substrings.
const TERMINAL_SEND_ERRORS: &[&str] = &[
    "nonce too low",
    "insufficient funds",
    "intrinsic gas too low",
    "underpriced",
    "exceeds block gas limit",
];

/// Map a JSON-RPC error from `eth_sendRawTransaction` onto a [`ChainError`].
///
/// Anything not known to be terminal is ambiguous: clients report duplicates
/// ("already known", "known transaction", `AlreadyKnown`) and internal
/// failures through the same channel, and the transaction may still land.
fn classify_send_error(message: &str) -> ChainError {
    let lower = message.to_ascii_lowercase();
    if TERMINAL_SEND_ERRORS.iter().any(|reason| lower.contains(reason)) {
        ChainError::Rejected(message.to_string())
    } else {
        ChainError::Unavailable(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusals_are_terminal() {
        for message in [
            "nonce too low: next nonce 5, tx nonce 4",
            "insufficient funds for gas * price + value",
            "intrinsic gas too low",
            "replacement transaction underpriced",
            "transaction underpriced",
            "exceeds block gas limit",
            "Nonce too low",
        ] {
            let err = classify_send_error(message);
            assert!(!err.is_ambiguous(), "{message}");
            assert_eq!(err, ChainError::Rejected(message.to_string()));
        }
    }

    #[test]
    fn test_duplicates_and_node_failures_are_ambiguous() {
        for message in [
            "already known",
            "known transaction: 0x5f3c",
            "transaction already imported",
            "AlreadyKnown",
            "internal error",
            "request timed out",
            "header not found",
        ] {
            assert!(classify_send_error(message).is_ambiguous(), "{message}");
        }
    }
}
