// Copyright (c) 2024 The Botho Foundation

//! Custody service configuration types.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::address::parse_address;

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main custody configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyConfig {
    /// Ethereum node and token settings
    pub ethereum: EthereumConfig,

    /// Ledger database settings
    pub ledger: LedgerConfig,

    /// Key custody settings
    #[serde(default)]
    pub custody: KeyCustodyConfig,

    /// Block scanner settings
    #[serde(default)]
    pub scanner: ScannerSettings,

    /// Withdrawal engine settings
    #[serde(default)]
    pub withdrawal: WithdrawalSettings,
}

/// Ethereum connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthereumConfig {
    /// HTTP JSON-RPC URL
    pub rpc_url: String,

    /// ERC-20 token contract held in custody
    pub token_contract: String,

    /// Token decimal precision
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u8,

    /// Chain ID used when signing
    pub chain_id: u64,

    /// Blocks that must sit on top of a block before it is scanned
    #[serde(default = "default_eth_confirmations")]
    pub confirmations_required: u64,

    /// Gas limit for token transfers
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    /// Upper bound on any single RPC call
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

fn default_token_decimals() -> u8 {
    6
}

fn default_eth_confirmations() -> u64 {
    12
}

fn default_gas_limit() -> u64 {
    2_000_000
}

fn default_rpc_timeout() -> u64 {
    30
}

/// Ledger storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path to SQLite database
    pub db_path: String,
}

/// Encryption of deposit private keys at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCustodyConfig {
    /// Environment variable holding the key-encryption passphrase
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,

    /// Argon2 salt (base64, no padding)
    #[serde(default = "default_salt")]
    pub salt: String,

    /// Argon2id memory cost in KiB
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,

    /// Argon2id passes
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,
}

fn default_passphrase_env() -> String {
    "CUSTODY_PASSPHRASE".to_string()
}

fn default_salt() -> String {
    "Ym90aG8tY3VzdG9keS1zYWx0".to_string()
}

fn default_argon2_memory_kib() -> u32 {
    65536
}

fn default_argon2_iterations() -> u32 {
    3
}

impl Default for KeyCustodyConfig {
    fn default() -> Self {
        Self {
            passphrase_env: default_passphrase_env(),
            salt: default_salt(),
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
        }
    }
}

/// Block scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Polling interval in seconds when caught up
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Number of blocks fetched concurrently while catching up
    #[serde(default = "default_max_parallel_blocks")]
    pub max_parallel_blocks: usize,

    /// First block to scan when no cursor has been stored
    #[serde(default)]
    pub start_block: u64,

    /// Base delay between retries of a failed block fetch
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Retries of a single block before giving up on this pass
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_parallel_blocks() -> usize {
    4
}

fn default_retry_backoff() -> u64 {
    2
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_parallel_blocks: default_max_parallel_blocks(),
            start_block: 0,
            retry_backoff_secs: default_retry_backoff(),
            max_retries: default_max_retries(),
        }
    }
}

/// Withdrawal engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalSettings {
    /// How long to wait for a receipt before reporting an ambiguous outcome
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,

    /// Receipt polling interval
    #[serde(default = "default_receipt_poll_interval")]
    pub receipt_poll_interval_secs: u64,

    /// Interval of the reconciliation pass
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Reserved entries without a signed transaction older than this are failed
    #[serde(default = "default_stale_reservation")]
    pub stale_reservation_secs: i64,

    /// Submitted transactions the node forgot, whose nonce was consumed,
    /// are failed after this long
    #[serde(default = "default_abandon_after")]
    pub abandon_after_secs: i64,

    /// Refuse withdrawals the deposit address cannot cover on chain
    #[serde(default = "default_check_onchain_balance")]
    pub check_onchain_balance: bool,
}

fn default_receipt_timeout() -> u64 {
    120
}

fn default_receipt_poll_interval() -> u64 {
    3
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_stale_reservation() -> i64 {
    300
}

fn default_abandon_after() -> i64 {
    1800
}

fn default_check_onchain_balance() -> bool {
    true
}

impl Default for WithdrawalSettings {
    fn default() -> Self {
        Self {
            receipt_timeout_secs: default_receipt_timeout(),
            receipt_poll_interval_secs: default_receipt_poll_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            stale_reservation_secs: default_stale_reservation(),
            abandon_after_secs: default_abandon_after(),
            check_onchain_balance: default_check_onchain_balance(),
        }
    }
}

impl CustodyConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CustodyConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ethereum.rpc_url.is_empty() {
            return Err(ConfigError::Invalid("ethereum.rpc_url is required".into()));
        }

        parse_address(&self.ethereum.token_contract).map_err(|e| {
            ConfigError::Invalid(format!("ethereum.token_contract: {}", e))
        })?;

        // 10^77 is the largest power of ten a U256 holds
        if self.ethereum.token_decimals > 77 {
            return Err(ConfigError::Invalid(format!(
                "ethereum.token_decimals must be <= 77, got {}",
                self.ethereum.token_decimals
            )));
        }

        if self.ethereum.rpc_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "ethereum.rpc_timeout_secs must be positive".into(),
            ));
        }

        if self.ledger.db_path.is_empty() {
            return Err(ConfigError::Invalid("ledger.db_path is required".into()));
        }

        if self.custody.salt.len() < 11 {
            return Err(ConfigError::Invalid(
                "custody.salt must encode at least 8 bytes".into(),
            ));
        }

        if self.scanner.max_parallel_blocks == 0 {
            return Err(ConfigError::Invalid(
                "scanner.max_parallel_blocks must be positive".into(),
            ));
        }

        if self.withdrawal.receipt_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "withdrawal.receipt_poll_interval_secs must be positive".into(),
            ));
        }

        if self.ethereum.confirmations_required == 0 {
            tracing::warn!("confirmations_required = 0: deposits are credited from unconfirmed blocks");
        }

        Ok(())
    }
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            ethereum: EthereumConfig {
                rpc_url: "http://localhost:8545".to_string(),
                token_contract: "0x9999f7fea5938fd3b1e26a12c3f2fb024e194f97".to_string(),
                token_decimals: default_token_decimals(),
                chain_id: 80001,
                confirmations_required: default_eth_confirmations(),
                gas_limit: default_gas_limit(),
                rpc_timeout_secs: default_rpc_timeout(),
            },
            ledger: LedgerConfig {
                db_path: "custody.db".to_string(),
            },
            custody: KeyCustodyConfig::default(),
            scanner: ScannerSettings::default(),
            withdrawal: WithdrawalSettings::default(),
        }
    }
}
