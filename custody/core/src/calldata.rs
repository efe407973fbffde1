// Copyright (c) 2024 The Botho Foundation

//! ERC-20 calldata classification.
//!
//! The classifier looks at a transaction's destination contract and input
//! bytes and decides whether it moves custody tokens. It never panics on
//! hostile input: anything it cannot decode is reported as
//! [`Classification::Ignored`] with a reason.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use rust_decimal::Decimal;

use crate::amount;

alloy::sol! {
    /// The subset of ERC-20 the custody service reads and writes.
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
        function balanceOf(address account) external view returns (uint256);
    }
}

/// Which ERC-20 entry point moved the tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// `transfer(to, amount)` signed by the token holder
    Transfer,
    /// `transferFrom(from, to, amount)` executed by an approved spender
    TransferFrom { from: Address },
}

/// A decoded token movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub kind: TransferKind,
    /// Receiving address taken from the call arguments
    pub to: Address,
    /// Amount as encoded on chain
    pub raw_amount: U256,
    /// Amount in token units (`raw_amount / 10^decimals`, truncated)
    pub amount: Decimal,
}

/// Why a transaction was not treated as a token transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Sent to some contract other than the custody token
    ForeignContract,
    /// No call data, or a selector other than transfer/transferFrom
    UnknownSelector,
    /// Selector matched but the arguments did not decode
    Malformed,
    /// Transfer of zero tokens
    ZeroAmount,
    /// Raw amount too large to represent in token units
    AmountOverflow,
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Transfer(TokenTransfer),
    Ignored(IgnoreReason),
}

impl Classification {
    pub fn transfer(&self) -> Option<&TokenTransfer> {
        match self {
            Classification::Transfer(t) => Some(t),
            Classification::Ignored(_) => None,
        }
    }
}

/// Stateless classifier for a single token contract.
#[derive(Debug, Clone, Copy)]
pub struct CalldataClassifier {
    token_contract: Address,
    decimals: u8,
}

impl CalldataClassifier {
    pub fn new(token_contract: Address, decimals: u8) -> Self {
        Self {
            token_contract,
            decimals,
        }
    }

    pub fn token_contract(&self) -> Address {
        self.token_contract
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    /// Classify a call to `contract` carrying `input`.
    pub fn classify(&self, contract: Address, input: &[u8]) -> Classification {
        if contract != self.token_contract {
            return Classification::Ignored(IgnoreReason::ForeignContract);
        }

        if input.is_empty() {
            return Classification::Ignored(IgnoreReason::UnknownSelector);
        }
        if input.len() < 4 {
            return Classification::Ignored(IgnoreReason::Malformed);
        }

        let selector = &input[..4];
        let decoded = if selector == IERC20::transferCall::SELECTOR {
            IERC20::transferCall::abi_decode(input, true)
                .map(|call| (TransferKind::Transfer, call.to, call.amount))
        } else if selector == IERC20::transferFromCall::SELECTOR {
            IERC20::transferFromCall::abi_decode(input, true).map(|call| {
                (
                    TransferKind::TransferFrom { from: call.from },
                    call.to,
                    call.amount,
                )
            })
        } else {
            return Classification::Ignored(IgnoreReason::UnknownSelector);
        };

        let (kind, to, raw_amount) = match decoded {
            Ok(fields) => fields,
            Err(_) => return Classification::Ignored(IgnoreReason::Malformed),
        };

        if raw_amount.is_zero() {
            return Classification::Ignored(IgnoreReason::ZeroAmount);
        }

        let amount = match amount::from_raw(raw_amount, self.decimals) {
            Some(amount) if !amount.is_zero() => amount,
            Some(_) => return Classification::Ignored(IgnoreReason::ZeroAmount),
            None => return Classification::Ignored(IgnoreReason::AmountOverflow),
        };

        Classification::Transfer(TokenTransfer {
            kind,
            to,
            raw_amount,
            amount,
        })
    }
}

/// Encode `transfer(to, raw_amount)` calldata.
pub fn encode_transfer(to: Address, raw_amount: U256) -> Bytes {
    IERC20::transferCall {
        to,
        amount: raw_amount,
    }
    .abi_encode()
    .into()
}

/// Encode `balanceOf(account)` calldata.
pub fn encode_balance_of(account: Address) -> Bytes {
    IERC20::balanceOfCall { account }.abi_encode().into()
}

/// Account argument of `balanceOf` calldata.
pub fn decode_balance_of_call(data: &[u8]) -> Option<Address> {
    IERC20::balanceOfCall::abi_decode(data, true)
        .ok()
        .map(|call| call.account)
}

/// Decode the return data of `balanceOf`.
pub fn decode_balance_of(data: &[u8]) -> Option<U256> {
    IERC20::balanceOfCall::abi_decode_returns(data, true)
        .ok()
        .map(|ret| ret._0)
}
