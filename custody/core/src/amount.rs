// Copyright (c) 2024 The Botho Foundation

//! Token amounts and conversion between raw on-chain integers and token units.
//!
//! Balances, ledger entries and requests all carry amounts in token units
//! (`raw / 10^decimals`). Raw `U256` values only exist at the chain boundary.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Largest scale a [`Decimal`] can carry.
pub const MAX_DECIMAL_SCALE: u32 = 28;

/// Errors converting or parsing token amounts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("amount must be strictly positive")]
    NotPositive,

    #[error("amount is not a decimal number: {0}")]
    Unparseable(String),

    #[error("amount has more than {decimals} fractional digits")]
    TooPrecise { decimals: u8 },

    #[error("amount does not fit in 256 bits at {decimals} decimals")]
    Overflow { decimals: u8 },
}

/// `10^exp` as a `U256`, or `None` if it does not fit.
fn pow10(exp: u32) -> Option<U256> {
    U256::from(10u64).checked_pow(U256::from(exp))
}

/// Convert a raw token integer into token units, truncating.
///
/// Digits beyond [`MAX_DECIMAL_SCALE`] fractional places are dropped, never
/// rounded. Returns `None` when the integer part is too large for a
/// [`Decimal`] mantissa.
pub fn from_raw(raw: U256, decimals: u8) -> Option<Decimal> {
    let mut raw = raw;
    let mut scale = u32::from(decimals);

    if scale > MAX_DECIMAL_SCALE {
        let excess = scale - MAX_DECIMAL_SCALE;
        raw = match pow10(excess) {
            Some(divisor) => raw / divisor,
            None => U256::ZERO,
        };
        scale = MAX_DECIMAL_SCALE;
    }

    let mantissa = u128::try_from(raw).ok()?;
    let mantissa = i128::try_from(mantissa).ok()?;
    Decimal::try_from_i128_with_scale(mantissa, scale)
        .ok()
        .map(|d| d.normalize())
}

/// Convert token units into the raw integer the token contract expects.
///
/// Amounts with more fractional digits than the token supports are rejected
/// rather than silently truncated, since this direction moves real value.
pub fn to_raw(amount: Decimal, decimals: u8) -> Result<U256, AmountError> {
    if amount.is_sign_negative() || amount.is_zero() {
        return Err(AmountError::NotPositive);
    }

    let amount = amount.normalize();
    let scale = amount.scale();
    if scale > u32::from(decimals) {
        return Err(AmountError::TooPrecise { decimals });
    }

    let mantissa = U256::from(amount.mantissa().unsigned_abs());
    let multiplier = pow10(u32::from(decimals) - scale).ok_or(AmountError::Overflow { decimals })?;
    mantissa
        .checked_mul(multiplier)
        .ok_or(AmountError::Overflow { decimals })
}

/// Parse a user-supplied amount string, requiring a strictly positive value.
pub fn parse_positive(input: &str) -> Result<Decimal, AmountError> {
    let trimmed = input.trim();
    let amount = Decimal::from_str(trimmed)
        .map_err(|_| AmountError::Unparseable(trimmed.to_string()))?;

    if amount.is_sign_negative() || amount.is_zero() {
        return Err(AmountError::NotPositive);
    }

    Ok(amount.normalize())
}
