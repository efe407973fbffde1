// Copyright (c) 2024 The Botho Foundation

//! Boundary request bodies and their validation.
//!
//! Request structs mirror the loosely typed JSON the HTTP layer receives:
//! every field is optional so that a missing field surfaces as a validation
//! error instead of a deserialization failure. `validate()` turns a body into
//! the typed arguments the core operates on.

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    address::{parse_address, AddressError},
    amount::{parse_positive, AmountError},
};

/// Reasons a request body is rejected before it reaches the core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ValidationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field)),
    }
}

/// Minimal shape check; delivery is the request layer's concern.
pub fn validate_email(email: &str) -> Result<String, ValidationError> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    };

    if !valid || email.len() > 255 || email.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidEmail(email.to_string()));
    }

    Ok(email.to_ascii_lowercase())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub email: Option<String>,
}

impl CreateUserRequest {
    /// Returns the normalised email.
    pub fn validate(&self) -> Result<String, ValidationError> {
        validate_email(required(&self.email, "email")?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanBlockRequest {
    pub block_number: Option<u64>,
}

impl ScanBlockRequest {
    pub fn validate(&self) -> Result<u64, ValidationError> {
        self.block_number
            .ok_or(ValidationError::MissingField("block_number"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub user_email: Option<String>,
    pub withdraw_address: Option<String>,
    /// Decimal string in token units, e.g. `"2.5"`
    pub withdraw_amount: Option<String>,
}

/// A withdrawal request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedWithdrawal {
    pub user_email: String,
    pub destination: Address,
    pub amount: Decimal,
}

impl WithdrawalRequest {
    pub fn validate(&self) -> Result<ValidatedWithdrawal, ValidationError> {
        let user_email = validate_email(required(&self.user_email, "user_email")?)?;
        let destination = parse_address(required(&self.withdraw_address, "withdraw_address")?)?;
        let amount = parse_positive(required(&self.withdraw_amount, "withdraw_amount")?)?;

        Ok(ValidatedWithdrawal {
            user_email,
            destination,
            amount,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletSummaryRequest {
    pub user_email: Option<String>,
}

impl WalletSummaryRequest {
    pub fn validate(&self) -> Result<String, ValidationError> {
        validate_email(required(&self.user_email, "user_email")?)
    }
}
