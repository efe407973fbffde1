// Copyright (c) 2024 The Botho Foundation

//! Ethereum address parsing and normalisation.
//!
//! Deposit addresses are stored lower-cased so that lookups coming from
//! decoded calldata, user requests and the key store all agree.

use alloy::primitives::Address;
use std::str::FromStr;

/// Errors validating a user-supplied address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address cannot be empty")]
    Empty,

    #[error("address must start with 0x")]
    MissingPrefix,

    #[error("address must be 42 characters, got {0}")]
    WrongLength(usize),

    #[error("address must be valid hex")]
    NotHex,
}

/// Parse a `0x`-prefixed 20-byte hex address.
///
/// Checksums are not enforced; the ledger stores addresses lower-cased.
pub fn parse_address(input: &str) -> Result<Address, AddressError> {
    let address = input.trim();

    if address.is_empty() {
        return Err(AddressError::Empty);
    }
    if !address.starts_with("0x") && !address.starts_with("0X") {
        return Err(AddressError::MissingPrefix);
    }
    if address.len() != 42 {
        return Err(AddressError::WrongLength(address.len()));
    }
    if !address[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressError::NotHex);
    }

    Address::from_str(&address.to_ascii_lowercase()).map_err(|_| AddressError::NotHex)
}

/// Canonical lower-case `0x` form used as the storage key.
pub fn normalize(address: &Address) -> String {
    format!("{address:#x}")
}

/// Normalise an address string that is already known to be well formed.
///
/// Strings that fail to parse are lower-cased as-is so lookups still miss
/// deterministically instead of erroring.
pub fn normalize_str(address: &str) -> String {
    parse_address(address)
        .map(|a| normalize(&a))
        .unwrap_or_else(|_| address.trim().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_address() {
        let address = parse_address("0x1234567890abcdef1234567890ABCDEF12345678").unwrap();
        assert_eq!(
            normalize(&address),
            "0x1234567890abcdef1234567890abcdef12345678"
        );
    }

    #[test]
    fn test_parse_invalid_addresses() {
        assert_eq!(parse_address(""), Err(AddressError::Empty));
        assert_eq!(
            parse_address("1234567890abcdef1234567890abcdef12345678"),
            Err(AddressError::MissingPrefix)
        );
        assert_eq!(parse_address("0x1234"), Err(AddressError::WrongLength(6)));
        assert_eq!(
            parse_address("0xzz34567890abcdef1234567890abcdef12345678"),
            Err(AddressError::NotHex)
        );
    }

    #[test]
    fn test_normalize_str_is_case_insensitive() {
        assert_eq!(
            normalize_str("0xABCDEF0000000000000000000000000000000001"),
            "0xabcdef0000000000000000000000000000000001"
        );
        assert_eq!(normalize_str(" 0xAbc "), "0xabc");
    }
}
