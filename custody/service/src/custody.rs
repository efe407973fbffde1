// Copyright (c) 2024 The Botho Foundation

//! Deposit key custody.
//!
//! Each user gets a fresh secp256k1 key. The secret is sealed with
//! ChaCha20-Poly1305 under a key derived from the operator passphrase with
//! Argon2id, and stored in `custody_keys`, apart from the ledger tables. The
//! address is bound into the ciphertext as associated data, so a sealed key
//! cannot be swapped onto another address row.

use alloy::signers::local::PrivateKeySigner;
use argon2::{password_hash::SaltString, Argon2, PasswordHasher};
use bth_custody_core::{address, KeyCustodyConfig};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::Rng;
use rusqlite::Connection;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    db::{self, Database},
    error::{CustodyError, Result},
};

/// A freshly generated deposit key, sealed and ready to persist.
#[derive(Clone)]
pub struct SealedKey {
    /// Lower-case `0x` address
    pub address: String,
    nonce: String,
    ciphertext: String,
}

impl std::fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl SealedKey {
    /// Persist into `custody_keys` on the given connection.
    pub fn store(&self, conn: &Connection) -> Result<()> {
        db::insert_key(conn, &self.address, &self.nonce, &self.ciphertext)
    }
}

/// Generates, seals and unseals deposit keys.
pub struct KeyStore {
    db: Database,
    key: Zeroizing<[u8; 32]>,
}

impl KeyStore {
    /// Derive the sealing key from `passphrase`.
    pub fn new(db: Database, passphrase: &str, config: &KeyCustodyConfig) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(CustodyError::Custody("Empty key-encryption passphrase".into()));
        }

        Ok(Self {
            db,
            key: derive_key(passphrase, config)?,
        })
    }

    /// Read the passphrase from the environment variable named in the config.
    pub fn from_env(db: Database, config: &KeyCustodyConfig) -> Result<Self> {
        let passphrase = Zeroizing::new(std::env::var(&config.passphrase_env).map_err(|_| {
            CustodyError::Custody(format!(
                "Passphrase variable {} is not set",
                config.passphrase_env
            ))
        })?);
        Self::new(db, &passphrase, config)
    }

    /// Generate a new keypair and seal its secret.
    pub fn generate(&self) -> Result<SealedKey> {
        let signer = PrivateKeySigner::random();
        let address = address::normalize(&signer.address());
        let secret = Zeroizing::new(signer.to_bytes().0);

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: secret.as_slice(),
                    aad: address.as_bytes(),
                },
            )
            .map_err(|_| CustodyError::Custody("Encryption failed".into()))?;

        debug!("Generated deposit key for {}", address);

        Ok(SealedKey {
            address,
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Unseal the signing key of a custodial address.
    pub fn signing_key(&self, deposit_address: &str) -> Result<PrivateKeySigner> {
        let address = address::normalize_str(deposit_address);
        let (nonce_hex, ciphertext_hex) = self
            .db
            .read(|conn| db::key_by_address(conn, &address))?
            .ok_or_else(|| CustodyError::Custody(format!("No key held for {}", address)))?;

        let nonce_bytes = hex::decode(&nonce_hex)
            .map_err(|_| CustodyError::Custody("Invalid nonce format".into()))?;
        let ciphertext = hex::decode(&ciphertext_hex)
            .map_err(|_| CustodyError::Custody("Invalid ciphertext format".into()))?;

        if nonce_bytes.len() != 12 {
            return Err(CustodyError::Custody("Invalid nonce length".into()));
        }

        let secret = Zeroizing::new(
            self.cipher()?
                .decrypt(
                    Nonce::from_slice(&nonce_bytes),
                    Payload {
                        msg: ciphertext.as_slice(),
                        aad: address.as_bytes(),
                    },
                )
                .map_err(|_| {
                    CustodyError::Custody(format!("Cannot decrypt key for {}", address))
                })?,
        );

        let signer = PrivateKeySigner::from_slice(&secret)
            .map_err(|e| CustodyError::Custody(format!("Invalid key material: {}", e)))?;

        if address::normalize(&signer.address()) != address {
            return Err(CustodyError::Custody(format!(
                "Key held for {} derives a different address",
                address
            )));
        }

        Ok(signer)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(self.key.as_slice())
            .map_err(|_| CustodyError::Custody("Failed to create cipher".into()))
    }
}

/// Derive a 32-byte sealing key from the passphrase using Argon2id.
fn derive_key(passphrase: &str, config: &KeyCustodyConfig) -> Result<Zeroizing<[u8; 32]>> {
    let salt = SaltString::from_b64(&config.salt)
        .map_err(|_| CustodyError::Custody("Invalid salt format".into()))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(config.argon2_memory_kib, config.argon2_iterations, 1, Some(32))
            .map_err(|_| CustodyError::Custody("Invalid Argon2 parameters".into()))?,
    );

    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|_| CustodyError::Custody("Key derivation failed".into()))?;

    let output = hash
        .hash
        .ok_or_else(|| CustodyError::Custody("No hash output".into()))?;

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&output.as_bytes()[..32]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KeyCustodyConfig {
        KeyCustodyConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            ..KeyCustodyConfig::default()
        }
    }

    fn test_store(passphrase: &str) -> (Database, KeyStore) {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let store = KeyStore::new(db.clone(), passphrase, &test_config()).unwrap();
        (db, store)
    }

    #[test]
    fn test_generate_and_unseal() {
        let (db, store) = test_store("correct horse");
        let sealed = store.generate().unwrap();
        assert!(sealed.address.starts_with("0x"));
        assert_eq!(sealed.address, sealed.address.to_lowercase());

        db.write(|tx| sealed.store(tx)).unwrap();

        let signer = store.signing_key(&sealed.address).unwrap();
        assert_eq!(address::normalize(&signer.address()), sealed.address);

        // Lookups are case-insensitive.
        let upper = format!("0x{}", sealed.address[2..].to_uppercase());
        assert!(store.signing_key(&upper).is_ok());
    }

    #[test]
    fn test_wrong_passphrase_cannot_unseal() {
        let (db, store) = test_store("correct horse");
        let sealed = store.generate().unwrap();
        db.write(|tx| sealed.store(tx)).unwrap();

        let other = KeyStore::new(db, "battery staple", &test_config()).unwrap();
        let err = other.signing_key(&sealed.address).unwrap_err();
        assert_eq!(err.kind(), "custody");
    }

    #[test]
    fn test_unknown_address() {
        let (_db, store) = test_store("correct horse");
        assert!(store
            .signing_key("0x0000000000000000000000000000000000000001")
            .is_err());
    }

    #[test]
    fn test_sealed_key_is_bound_to_its_address() {
        let (db, store) = test_store("correct horse");
        let first = store.generate().unwrap();
        let second = store.generate().unwrap();

        // Store the first key's ciphertext under the second address.
        let swapped = SealedKey {
            address: second.address.clone(),
            nonce: first.nonce.clone(),
            ciphertext: first.ciphertext.clone(),
        };
        db.write(|tx| swapped.store(tx)).unwrap();

        assert!(store.signing_key(&second.address).is_err());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let db = Database::open_in_memory().unwrap();
        assert!(KeyStore::new(db, "", &test_config()).is_err());
    }
}
