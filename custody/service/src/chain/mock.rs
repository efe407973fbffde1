// Copyright (c) 2024 The Botho Foundation

//! In-memory chain for tests.
//!
//! Blocks are pushed by the caller; sent transactions land according to the
//! configured [`SendBehavior`].

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use bth_custody_core::calldata;
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use super::{ChainBlock, ChainClient, ChainError, ChainTransaction, NonceTag, SignedTransfer, TxReceipt};

/// What happens to the next transactions handed to [`ChainClient::send_raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendBehavior {
    /// Accepted and mined immediately with the given receipt status.
    Mine { success: bool },
    /// Accepted into the pool; no receipt until [`MockChainClient::mine`] is called.
    Hold,
    /// Refused by the node before inclusion.
    Reject(String),
    /// Delivered to the node but the call times out.
    TimeoutAfterBroadcast,
    /// The call fails and the transaction never reaches the node.
    Unreachable,
}

#[derive(Debug)]
struct MockState {
    head: u64,
    blocks: HashMap<u64, ChainBlock>,
    known: HashMap<String, ChainTransaction>,
    receipts: HashMap<String, TxReceipt>,
    latest_nonces: HashMap<Address, u64>,
    pending_nonces: HashMap<Address, u64>,
    token_balances: HashMap<Address, U256>,
    default_token_balance: U256,
    gas_price: u128,
    send_behavior: SendBehavior,
    sent: Vec<SignedTransfer>,
    failing_blocks: HashSet<u64>,
    block_failures: HashMap<u64, u32>,
    offline: bool,
}

/// Chain client backed by in-memory state.
#[derive(Debug)]
pub struct MockChainClient {
    state: Mutex<MockState>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                head: 0,
                blocks: HashMap::new(),
                known: HashMap::new(),
                receipts: HashMap::new(),
                latest_nonces: HashMap::new(),
                pending_nonces: HashMap::new(),
                token_balances: HashMap::new(),
                default_token_balance: U256::MAX,
                gas_price: 1_000_000_000,
                send_behavior: SendBehavior::Mine { success: true },
                sent: Vec::new(),
                failing_blocks: HashSet::new(),
                block_failures: HashMap::new(),
                offline: false,
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Add a block and move the head to it if it is higher.
    pub fn push_block(&self, number: u64, transactions: Vec<ChainTransaction>) {
        self.with_state(|s| {
            for tx in &transactions {
                s.known.insert(tx.hash.clone(), tx.clone());
                s.receipts.insert(
                    tx.hash.clone(),
                    TxReceipt {
                        success: true,
                        block_number: Some(number),
                    },
                );
            }
            s.blocks.insert(
                number,
                ChainBlock {
                    number,
                    hash: format!("{:#066x}", number),
                    transactions,
                },
            );
            s.head = s.head.max(number);
        });
    }

    pub fn set_head(&self, head: u64) {
        self.with_state(|s| s.head = head);
    }

    pub fn set_send_behavior(&self, behavior: SendBehavior) {
        self.with_state(|s| s.send_behavior = behavior);
    }

    pub fn set_token_balance(&self, account: Address, balance: U256) {
        self.with_state(|s| {
            s.token_balances.insert(account, balance);
        });
    }

    /// Set the mined nonce of an account, as if it sent transactions elsewhere.
    pub fn set_latest_nonce(&self, account: Address, nonce: u64) {
        self.with_state(|s| {
            s.latest_nonces.insert(account, nonce);
            let pending = s.pending_nonces.entry(account).or_insert(nonce);
            *pending = (*pending).max(nonce);
        });
    }

    /// Make every call fail with [`ChainError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    /// Make fetches of `number` fail until [`Self::heal_block`] is called.
    pub fn fail_block(&self, number: u64) {
        self.with_state(|s| {
            s.failing_blocks.insert(number);
        });
    }

    pub fn heal_block(&self, number: u64) {
        self.with_state(|s| {
            s.failing_blocks.remove(&number);
        });
    }

    /// How many fetches of `number` failed so far.
    pub fn block_failures(&self, number: u64) -> u32 {
        self.with_state(|s| s.block_failures.get(&number).copied().unwrap_or(0))
    }

    /// Include a held transaction with the given receipt status.
    pub fn mine(&self, hash: &str, success: bool) {
        self.with_state(|s| {
            let block_number = s.head + 1;
            s.head = block_number;
            s.receipts.insert(
                hash.to_string(),
                TxReceipt {
                    success,
                    block_number: Some(block_number),
                },
            );
            if let Some(tx) = s.known.get(hash) {
                let next = s.latest_nonces.get(&tx.from).copied().unwrap_or(0);
                let sent_nonce = s
                    .sent
                    .iter()
                    .find(|t| t.hash == hash)
                    .map(|t| t.nonce + 1)
                    .unwrap_or(next);
                s.latest_nonces.insert(tx.from, next.max(sent_nonce));
            }
        });
    }

    /// Drop a transaction from the node's pool, as an evicted or replaced one would be.
    ///
    /// The account's pending nonce falls back to the highest one still in the pool.
    pub fn forget(&self, hash: &str) {
        self.with_state(|s| {
            let Some(tx) = s.known.remove(hash) else {
                return;
            };
            s.receipts.remove(hash);

            let latest = s.latest_nonces.get(&tx.from).copied().unwrap_or(0);
            let pooled = s
                .sent
                .iter()
                .filter(|t| t.from == tx.from && s.known.contains_key(&t.hash))
                .filter(|t| !s.receipts.contains_key(&t.hash))
                .map(|t| t.nonce + 1)
                .max()
                .unwrap_or(0);
            s.pending_nonces.insert(tx.from, latest.max(pooled));
        });
    }

    /// Transactions successfully handed to the node, in send order.
    pub fn sent(&self) -> Vec<SignedTransfer> {
        self.with_state(|s| s.sent.clone())
    }

    fn record_broadcast(s: &mut MockState, tx: &SignedTransfer) {
        s.sent.push(tx.clone());
        s.known.insert(
            tx.hash.clone(),
            ChainTransaction {
                hash: tx.hash.clone(),
                from: tx.from,
                to: Some(tx.to),
                input: tx.input.clone(),
                index: 0,
            },
        );
        let pending = s.pending_nonces.entry(tx.from).or_insert(0);
        *pending = (*pending).max(tx.nonce + 1);
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.with_state(|s| {
            if s.offline {
                return Err(ChainError::Unavailable("mock chain offline".to_string()));
            }
            Ok(s.head)
        })
    }

    async fn get_block(&self, number: u64) -> Result<Option<ChainBlock>, ChainError> {
        self.with_state(|s| {
            if s.offline || s.failing_blocks.contains(&number) {
                *s.block_failures.entry(number).or_insert(0) += 1;
                return Err(ChainError::Unavailable(format!("block {} unavailable", number)));
            }
            if number > s.head {
                return Ok(None);
            }
            Ok(Some(s.blocks.get(&number).cloned().unwrap_or_else(|| ChainBlock {
                number,
                hash: format!("{:#066x}", number),
                transactions: Vec::new(),
            })))
        })
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, ChainError> {
        self.with_state(|s| {
            if s.offline {
                return Err(ChainError::Unavailable("mock chain offline".to_string()));
            }
            Ok(s.known.get(hash).cloned())
        })
    }

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> Result<u64, ChainError> {
        self.with_state(|s| {
            if s.offline {
                return Err(ChainError::Unavailable("mock chain offline".to_string()));
            }
            let latest = s.latest_nonces.get(&address).copied().unwrap_or(0);
            Ok(match tag {
                NonceTag::Latest => latest,
                NonceTag::Pending => latest.max(s.pending_nonces.get(&address).copied().unwrap_or(0)),
            })
        })
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.with_state(|s| {
            if s.offline {
                return Err(ChainError::Unavailable("mock chain offline".to_string()));
            }
            Ok(s.gas_price)
        })
    }

    async fn send_raw(&self, tx: &SignedTransfer) -> Result<(), ChainError> {
        let behavior = self.with_state(|s| s.send_behavior.clone());
        match behavior {
            SendBehavior::Mine { success } => {
                self.with_state(|s| Self::record_broadcast(s, tx));
                self.mine(&tx.hash, success);
                Ok(())
            }
            SendBehavior::Hold => {
                self.with_state(|s| Self::record_broadcast(s, tx));
                Ok(())
            }
            SendBehavior::Reject(reason) => Err(ChainError::Rejected(reason)),
            SendBehavior::TimeoutAfterBroadcast => {
                self.with_state(|s| Self::record_broadcast(s, tx));
                Err(ChainError::Timeout)
            }
            SendBehavior::Unreachable => {
                Err(ChainError::Unavailable("connection refused".to_string()))
            }
        }
    }

    async fn get_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, ChainError> {
        self.with_state(|s| {
            if s.offline {
                return Err(ChainError::Unavailable("mock chain offline".to_string()));
            }
            Ok(s.receipts.get(hash).copied())
        })
    }

    async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.with_state(|s| {
            if s.offline {
                return Err(ChainError::Unavailable("mock chain offline".to_string()));
            }
            let account = calldata::decode_balance_of_call(&data)
                .ok_or_else(|| ChainError::Rejected("execution reverted".to_string()))?;
            let balance = s
                .token_balances
                .get(&account)
                .copied()
                .unwrap_or(s.default_token_balance);
            Ok(Bytes::from(balance.to_be_bytes::<32>().to_vec()))
        })
    }
}
