// Copyright (c) 2024 The Botho Foundation

//! Chain access for the custody service.
//!
//! [`ChainClient`] is the narrow view of an Ethereum node the scanner, the
//! withdrawal engine and the reconciler need. [`EthereumClient`] talks JSON-RPC
//! through alloy; `MockChainClient`, behind the `test_utils` feature, keeps
//! an in-memory chain for tests.
//!
//! Signing is local and kept out of the trait so the transaction hash is
//! known, and can be recorded, before anything is broadcast.

mod ethereum;
#[cfg(any(test, feature = "test_utils"))]
pub mod mock;

pub use ethereum::EthereumClient;
#[cfg(any(test, feature = "test_utils"))]
pub use mock::MockChainClient;

use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, U256},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;
use bth_custody_core::calldata;
use displaydoc::Display;
use thiserror::Error;

use crate::error::{CustodyError, Result};

/// Failure talking to the node.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ChainError {
    /// RPC unavailable: {0}
    Unavailable(String),

    /// RPC call timed out
    Timeout,

    /// Rejected by node: {0}
    Rejected(String),
}

impl ChainError {
    /// Whether a submission that failed this way may still have reached the network.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ChainError::Unavailable(_) | ChainError::Timeout)
    }
}

/// A transaction as seen inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    /// Lower-case `0x` hash
    pub hash: String,
    pub from: Address,
    /// `None` for contract creation
    pub to: Option<Address>,
    pub input: Bytes,
    /// Position inside the block
    pub index: u64,
}

/// A block with its full transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub number: u64,
    pub hash: String,
    pub transactions: Vec<ChainTransaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    /// Status flag of the receipt; `false` means the call reverted
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Which view of an account's nonce to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    /// Transactions included in blocks
    Latest,
    /// Included plus those waiting in the node's pool
    Pending,
}

/// Everything needed to sign one token transfer.
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub raw_amount: U256,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub chain_id: u64,
}

/// A signed, encoded transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub hash: String,
    pub raw: Bytes,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub input: Bytes,
}

/// Read and submit operations against an Ethereum node.
///
/// Every implementation bounds each call in time; a call that does not
/// complete returns [`ChainError::Timeout`].
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    async fn block_number(&self) -> std::result::Result<u64, ChainError>;

    /// Block `number` with full transactions, `None` if the node does not have it.
    async fn get_block(&self, number: u64) -> std::result::Result<Option<ChainBlock>, ChainError>;

    /// Transaction by hash, `None` if the node does not know it.
    async fn get_transaction(
        &self,
        hash: &str,
    ) -> std::result::Result<Option<ChainTransaction>, ChainError>;

    /// Number of transactions sent from `address`.
    async fn transaction_count(
        &self,
        address: Address,
        tag: NonceTag,
    ) -> std::result::Result<u64, ChainError>;

    /// Gas price in wei.
    async fn gas_price(&self) -> std::result::Result<u128, ChainError>;

    /// Broadcast a signed transaction.
    async fn send_raw(&self, tx: &SignedTransfer) -> std::result::Result<(), ChainError>;

    /// Receipt of a transaction, `None` while it is not included.
    async fn get_receipt(&self, hash: &str) -> std::result::Result<Option<TxReceipt>, ChainError>;

    /// `eth_call` against `to` at the latest block.
    async fn call(&self, to: Address, data: Bytes) -> std::result::Result<Bytes, ChainError>;
}

/// Read `token.balanceOf(account)`.
pub async fn token_balance(
    client: &dyn ChainClient,
    token: Address,
    account: Address,
) -> std::result::Result<U256, ChainError> {
    let data = client.call(token, calldata::encode_balance_of(account)).await?;
    calldata::decode_balance_of(&data)
        .ok_or_else(|| ChainError::Unavailable("malformed balanceOf return data".to_string()))
}

/// Sign a legacy token transfer with a custodial key.
pub async fn sign_transfer(
    params: &TransferParams,
    signer: &PrivateKeySigner,
) -> Result<SignedTransfer> {
    let input = calldata::encode_transfer(params.to, params.raw_amount);
    let request = TransactionRequest::default()
        .with_from(params.from)
        .with_to(params.token)
        .with_input(input.clone())
        .with_nonce(params.nonce)
        .with_gas_price(params.gas_price)
        .with_gas_limit(params.gas_limit)
        .with_chain_id(params.chain_id);

    let wallet = EthereumWallet::from(signer.clone());
    let envelope = request
        .build(&wallet)
        .await
        .map_err(|e| CustodyError::Custody(format!("Failed to sign transfer: {}", e)))?;

    Ok(SignedTransfer {
        hash: format!("{:#x}", envelope.tx_hash()),
        raw: envelope.encoded_2718().into(),
        from: params.from,
        to: params.token,
        nonce: params.nonce,
        input,
    })
}
