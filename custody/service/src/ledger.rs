// Copyright (c) 2024 The Botho Foundation

//! Balances and transaction history.
//!
//! Every mutation (credit, reservation, submission record, finalization)
//! runs in one immediate transaction on the single writer connection, so
//! operations on the same user are serialized and either fully applied or
//! not at all. For every user, at every commit:
//!
//! `balance == Σ confirmed deposits − Σ (pending + confirmed) withdrawals`

use bth_custody_core::{
    address, CreatedUser, EntryStatus, EntryType, LedgerEntry, User, UserId, WithdrawalOutcome,
    WithdrawalState,
};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::{
    custody::SealedKey,
    db::{self, Database},
    error::{CustodyError, Result},
};

/// Result of [`Ledger::credit`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    /// A new deposit entry was written and the balance increased.
    Credited(LedgerEntry),
    /// The idempotency key was already applied; nothing changed.
    Duplicate(LedgerEntry),
}

impl CreditOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            CreditOutcome::Credited(entry) | CreditOutcome::Duplicate(entry) => entry,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, CreditOutcome::Credited(_))
    }
}

/// The custody ledger.
#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Register a user together with its sealed deposit key.
    pub fn create_user(&self, email: &str, key: &SealedKey) -> Result<CreatedUser> {
        self.db.write(|tx| {
            if db::user_by_email(tx, email)?.is_some() {
                return Err(CustodyError::InvalidInput(format!(
                    "{} is already registered",
                    email
                )));
            }

            key.store(tx)?;
            let user_id = db::insert_user(tx, email, &key.address)?;
            db::log_audit(
                tx,
                None,
                "user_created",
                &format!("user {} deposit address {}", user_id, key.address),
            )?;

            info!("Created user {} with deposit address {}", user_id, key.address);

            Ok(CreatedUser {
                user_id,
                deposit_address: key.address.clone(),
            })
        })
    }

    pub fn user(&self, user_id: UserId) -> Result<User> {
        self.db
            .read(|conn| db::user_by_id(conn, user_id))?
            .ok_or_else(|| CustodyError::UserNotFound(user_id.to_string()))
    }

    pub fn user_by_email(&self, email: &str) -> Result<User> {
        self.db
            .read(|conn| db::user_by_email(conn, email))?
            .ok_or_else(|| CustodyError::UserNotFound(email.to_string()))
    }

    /// The owner of a deposit address, if it is one of ours.
    pub fn user_by_address(&self, deposit_address: &str) -> Result<Option<User>> {
        let address = address::normalize_str(deposit_address);
        self.db.read(|conn| db::user_by_address(conn, &address))
    }

    pub fn users(&self) -> Result<Vec<User>> {
        self.db.read(db::all_users)
    }

    /// Apply a deposit exactly once per idempotency key.
    pub fn credit(
        &self,
        user_id: UserId,
        amount: Decimal,
        source_address: &str,
        idempotency_key: &str,
        block_number: Option<u64>,
    ) -> Result<CreditOutcome> {
        if amount <= Decimal::ZERO {
            return Err(CustodyError::InvalidAmount(amount));
        }

        self.db.write(|tx| {
            if let Some(existing) = db::live_entry_by_key(tx, idempotency_key)? {
                return Ok(CreditOutcome::Duplicate(existing));
            }

            let user = db::user_by_id(tx, user_id)?
                .ok_or_else(|| CustodyError::UserNotFound(user_id.to_string()))?;

            let entry = LedgerEntry::new_deposit(
                user.id,
                amount,
                address::normalize_str(source_address),
                user.deposit_address.clone(),
                idempotency_key.to_string(),
                block_number,
            );
            let balance = user
                .balance
                .checked_add(amount)
                .ok_or(CustodyError::BalanceOverflow { user_id: user.id, amount })?;
            db::insert_entry(tx, &entry)?;
            db::set_balance(tx, user.id, balance)?;
            db::log_audit(
                tx,
                Some(&entry.id),
                "deposit_credited",
                &format!("{} to user {} from {}", amount, user.id, idempotency_key),
            )?;

            info!(
                "Credited {} to user {} (tx {})",
                amount, user.id, idempotency_key
            );

            Ok(CreditOutcome::Credited(entry))
        })
    }

    /// Debit `amount` and open a pending withdrawal entry.
    ///
    /// Fails with [`CustodyError::InsufficientBalance`] without any mutation
    /// when the balance does not cover the amount.
    pub fn reserve_for_withdrawal(
        &self,
        user_id: UserId,
        amount: Decimal,
        destination: &str,
    ) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(CustodyError::InvalidAmount(amount));
        }

        self.db.write(|tx| {
            let user = db::user_by_id(tx, user_id)?
                .ok_or_else(|| CustodyError::UserNotFound(user_id.to_string()))?;

            if user.balance < amount {
                return Err(CustodyError::InsufficientBalance {
                    requested: amount,
                    available: user.balance,
                });
            }

            let balance = user
                .balance
                .checked_sub(amount)
                .ok_or(CustodyError::BalanceOverflow { user_id: user.id, amount })?;
            let entry = LedgerEntry::new_withdrawal(
                user.id,
                amount,
                user.deposit_address.clone(),
                address::normalize_str(destination),
            );
            db::insert_entry(tx, &entry)?;
            db::set_balance(tx, user.id, balance)?;
            db::log_audit(
                tx,
                Some(&entry.id),
                "withdrawal_reserved",
                &format!("{} from user {} to {}", amount, user.id, entry.address_to),
            )?;

            info!(
                "Reserved {} for withdrawal {} (user {})",
                amount, entry.id, user.id
            );

            Ok(entry)
        })
    }

    /// Record the signed transaction of a reserved withdrawal.
    ///
    /// Called before the transaction is broadcast. A reservation that was
    /// already compensated fails with [`CustodyError::SubmissionFailed`].
    pub fn record_submission(
        &self,
        entry_id: &Uuid,
        tx_hash: &str,
        nonce: u64,
        signed_tx: &[u8],
    ) -> Result<()> {
        self.db.write(|tx| {
            let entry = load_withdrawal(tx, entry_id)?;
            if entry.status == EntryStatus::Failed {
                return Err(CustodyError::SubmissionFailed {
                    withdrawal_id: entry.id,
                    reason: entry
                        .error_message
                        .unwrap_or_else(|| "reservation already released".to_string()),
                });
            }

            let state = entry.withdrawal_state().unwrap_or(WithdrawalState::Failed);
            if !state.can_transition_to(WithdrawalState::Submitted) {
                return Err(CustodyError::InvalidInput(format!(
                    "withdrawal {} is {}, cannot record a submission",
                    entry_id, state
                )));
            }

            db::set_entry_submission(tx, entry_id, tx_hash, nonce, &hex::encode(signed_tx))?;
            db::log_audit(
                tx,
                Some(entry_id),
                "withdrawal_signed",
                &format!("tx {} nonce {}", tx_hash, nonce),
            )?;
            Ok(())
        })
    }

    /// Settle a pending withdrawal.
    ///
    /// `Failed` restores the reserved amount. Finalizing again with the same
    /// outcome is a no-op; a conflicting outcome is refused.
    pub fn finalize_withdrawal(
        &self,
        entry_id: &Uuid,
        outcome: WithdrawalOutcome,
        reason: Option<&str>,
    ) -> Result<LedgerEntry> {
        let target = EntryStatus::from(outcome);

        self.db.write(|tx| {
            let entry = load_withdrawal(tx, entry_id)?;

            if entry.status.is_terminal() {
                if entry.status == target {
                    return Ok(entry);
                }
                return Err(CustodyError::InvalidInput(format!(
                    "withdrawal {} is already {}",
                    entry_id, entry.status
                )));
            }

            match outcome {
                WithdrawalOutcome::Confirmed => {
                    db::update_entry_status(tx, entry_id, EntryStatus::Confirmed, None)?;
                    db::log_audit(
                        tx,
                        Some(entry_id),
                        "withdrawal_confirmed",
                        entry.chain_tx_hash.as_deref().unwrap_or(""),
                    )?;
                    info!("Withdrawal {} confirmed", entry_id);
                }
                WithdrawalOutcome::Failed => {
                    let user = db::user_by_id(tx, entry.user_id)?
                        .ok_or_else(|| CustodyError::UserNotFound(entry.user_id.to_string()))?;
                    let balance = user.balance.checked_add(entry.amount).ok_or(
                        CustodyError::BalanceOverflow {
                            user_id: user.id,
                            amount: entry.amount,
                        },
                    )?;
                    db::update_entry_status(tx, entry_id, EntryStatus::Failed, reason)?;
                    db::set_balance(tx, user.id, balance)?;
                    db::log_audit(
                        tx,
                        Some(entry_id),
                        "withdrawal_failed",
                        &format!("restored {}: {}", entry.amount, reason.unwrap_or("unknown")),
                    )?;
                    info!(
                        "Withdrawal {} failed, restored {} to user {}",
                        entry_id, entry.amount, user.id
                    );
                }
            }

            load_withdrawal(tx, entry_id)
        })
    }

    pub fn balance_of(&self, user_id: UserId) -> Result<Decimal> {
        Ok(self.user(user_id)?.balance)
    }

    /// Every entry in which the user's deposit address appears, oldest first.
    pub fn history_of(&self, user_id: UserId) -> Result<Vec<LedgerEntry>> {
        let user = self.user(user_id)?;
        self.db
            .read(|conn| db::entries_for_address(conn, &user.deposit_address))
    }

    /// The user's most recent confirmed deposit.
    pub fn last_deposit(&self, user_id: UserId) -> Result<Option<LedgerEntry>> {
        let user = self.user(user_id)?;
        self.db
            .read(|conn| db::latest_deposit(conn, &user.deposit_address))
    }

    pub fn entry(&self, entry_id: &Uuid) -> Result<Option<LedgerEntry>> {
        self.db.read(|conn| db::entry_by_id(conn, entry_id))
    }

    /// The signed transaction recorded for a withdrawal, if any.
    pub fn signed_transaction(&self, entry_id: &Uuid) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = self.db.read(|conn| db::signed_transaction(conn, entry_id))? else {
            return Ok(None);
        };
        hex::decode(&encoded).map(Some).map_err(|e| {
            CustodyError::StorageFailure(format!("signed transaction of {}: {}", entry_id, e))
        })
    }

    pub fn pending_withdrawals(&self) -> Result<Vec<LedgerEntry>> {
        self.db.read(db::pending_withdrawals)
    }

    /// Stored balance and the balance implied by the user's entries.
    pub fn audit_balance(&self, user_id: UserId) -> Result<(Decimal, Decimal)> {
        self.db.read(|conn| {
            let user = db::user_by_id(conn, user_id)?
                .ok_or_else(|| CustodyError::UserNotFound(user_id.to_string()))?;
            let derived = db::entries_for_user(conn, user_id)?.iter().try_fold(
                Decimal::ZERO,
                |total, entry| {
                    total.checked_add(entry.balance_effect()).ok_or(
                        CustodyError::BalanceOverflow {
                            user_id,
                            amount: entry.amount,
                        },
                    )
                },
            )?;
            Ok((user.balance, derived))
        })
    }

    /// Highest block whose deposits are all recorded.
    pub fn scan_cursor(&self) -> Result<Option<u64>> {
        self.db.read(db::scan_cursor)
    }

    pub fn advance_scan_cursor(&self, block: u64) -> Result<u64> {
        self.db.write(|tx| db::advance_scan_cursor(tx, block))
    }
}

fn load_withdrawal(conn: &rusqlite::Connection, entry_id: &Uuid) -> Result<LedgerEntry> {
    let entry = db::entry_by_id(conn, entry_id)?
        .ok_or_else(|| CustodyError::InvalidInput(format!("unknown withdrawal {}", entry_id)))?;
    if entry.entry_type != EntryType::Withdrawal {
        return Err(CustodyError::InvalidInput(format!(
            "entry {} is not a withdrawal",
            entry_id
        )));
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::KeyStore;
    use bth_custody_core::KeyCustodyConfig;
    use proptest::prelude::*;
    use std::{str::FromStr, sync::Arc};

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn test_ledger() -> (Ledger, KeyStore) {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let config = KeyCustodyConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            ..KeyCustodyConfig::default()
        };
        let keys = KeyStore::new(db.clone(), "test passphrase", &config).unwrap();
        (Ledger::new(db), keys)
    }

    fn new_user(ledger: &Ledger, keys: &KeyStore, email: &str) -> CreatedUser {
        ledger.create_user(email, &keys.generate().unwrap()).unwrap()
    }

    fn assert_conserved(ledger: &Ledger, user: UserId) {
        let (stored, derived) = ledger.audit_balance(user).unwrap();
        assert_eq!(stored, derived);
        assert!(stored >= Decimal::ZERO);
    }

    #[test]
    fn test_credit_is_idempotent() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");

        let first = ledger
            .credit(user.user_id, dec("5"), "0xsender", "0xdeadbeef", Some(10))
            .unwrap();
        assert!(first.is_new());
        assert_eq!(first.entry().address_to, user.deposit_address);

        let second = ledger
            .credit(user.user_id, dec("5"), "0xsender", "0xdeadbeef", Some(10))
            .unwrap();
        assert!(!second.is_new());
        assert_eq!(second.entry().id, first.entry().id);

        assert_eq!(ledger.balance_of(user.user_id).unwrap(), dec("5"));
        assert_eq!(ledger.history_of(user.user_id).unwrap().len(), 1);
        assert_conserved(&ledger, user.user_id);
    }

    #[test]
    fn test_credit_rejects_non_positive_amounts() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");

        let err = ledger
            .credit(user.user_id, Decimal::ZERO, "0xsender", "0x01", None)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_amount");
        assert!(ledger
            .credit(user.user_id, dec("-1"), "0xsender", "0x02", None)
            .is_err());
        assert!(ledger.history_of(user.user_id).unwrap().is_empty());
    }

    #[test]
    fn test_credit_unknown_user() {
        let (ledger, _keys) = test_ledger();
        let err = ledger
            .credit(UserId(42), dec("1"), "0xsender", "0x01", None)
            .unwrap_err();
        assert_eq!(err.kind(), "user_not_found");
    }

    #[test]
    fn test_duplicate_email() {
        let (ledger, keys) = test_ledger();
        new_user(&ledger, &keys, "a@example.com");
        let err = ledger
            .create_user("a@example.com", &keys.generate().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(ledger.users().unwrap().len(), 1);
    }

    #[test]
    fn test_reserve_insufficient_balance_changes_nothing() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        ledger
            .credit(user.user_id, dec("1"), "0xsender", "0x01", None)
            .unwrap();

        let err = ledger
            .reserve_for_withdrawal(user.user_id, dec("3"), "0xabc")
            .unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance_of(user.user_id).unwrap(), dec("1"));
        assert_eq!(ledger.history_of(user.user_id).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_withdrawal_restores_exact_amount() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        ledger
            .credit(user.user_id, dec("5"), "0xsender", "0x01", None)
            .unwrap();

        let entry = ledger
            .reserve_for_withdrawal(user.user_id, dec("3"), "0xabc")
            .unwrap();
        assert_eq!(ledger.balance_of(user.user_id).unwrap(), dec("2"));
        assert_conserved(&ledger, user.user_id);

        let failed = ledger
            .finalize_withdrawal(&entry.id, WithdrawalOutcome::Failed, Some("reverted"))
            .unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("reverted"));
        assert_eq!(ledger.balance_of(user.user_id).unwrap(), dec("5"));
        assert_conserved(&ledger, user.user_id);

        // Replaying the same outcome does not restore twice.
        ledger
            .finalize_withdrawal(&entry.id, WithdrawalOutcome::Failed, Some("reverted"))
            .unwrap();
        assert_eq!(ledger.balance_of(user.user_id).unwrap(), dec("5"));

        // A conflicting outcome is refused.
        assert!(ledger
            .finalize_withdrawal(&entry.id, WithdrawalOutcome::Confirmed, None)
            .is_err());
    }

    #[test]
    fn test_confirmed_withdrawal_keeps_debit() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        ledger
            .credit(user.user_id, dec("5"), "0xsender", "0x01", None)
            .unwrap();

        let entry = ledger
            .reserve_for_withdrawal(user.user_id, dec("2"), "0xabc")
            .unwrap();
        ledger.record_submission(&entry.id, "0xfeed", 0, &[0x02]).unwrap();

        let confirmed = ledger
            .finalize_withdrawal(&entry.id, WithdrawalOutcome::Confirmed, None)
            .unwrap();
        assert_eq!(confirmed.status, EntryStatus::Confirmed);
        assert_eq!(confirmed.chain_tx_hash.as_deref(), Some("0xfeed"));
        assert_eq!(ledger.balance_of(user.user_id).unwrap(), dec("3"));
        assert_conserved(&ledger, user.user_id);
    }

    #[test]
    fn test_submission_recorded_once() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        ledger
            .credit(user.user_id, dec("5"), "0xsender", "0x01", None)
            .unwrap();
        let entry = ledger
            .reserve_for_withdrawal(user.user_id, dec("1"), "0xabc")
            .unwrap();

        ledger.record_submission(&entry.id, "0xfeed", 4, &[0x02, 0xaa]).unwrap();
        let err = ledger
            .record_submission(&entry.id, "0xbeef", 5, &[0x02])
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");

        let stored = ledger.entry(&entry.id).unwrap().unwrap();
        assert_eq!(stored.nonce, Some(4));
        assert_eq!(
            ledger.signed_transaction(&entry.id).unwrap(),
            Some(vec![0x02, 0xaa])
        );
        assert_eq!(stored.withdrawal_state(), Some(WithdrawalState::Submitted));
        assert_eq!(ledger.pending_withdrawals().unwrap().len(), 1);
    }

    #[test]
    fn test_credit_overflow_leaves_ledger_usable() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        ledger
            .credit(user.user_id, Decimal::MAX, "0xsender", "0x01", None)
            .unwrap();

        let err = ledger
            .credit(user.user_id, Decimal::ONE, "0xsender", "0x02", None)
            .unwrap_err();
        assert_eq!(err.kind(), "balance_overflow");
        assert!(!err.is_retryable());

        assert_eq!(ledger.balance_of(user.user_id).unwrap(), Decimal::MAX);
        assert_eq!(ledger.history_of(user.user_id).unwrap().len(), 1);
        assert_conserved(&ledger, user.user_id);

        // Withdrawals still work against the saturated balance.
        let entry = ledger
            .reserve_for_withdrawal(user.user_id, Decimal::ONE, "0xabc")
            .unwrap();
        ledger
            .finalize_withdrawal(&entry.id, WithdrawalOutcome::Failed, None)
            .unwrap();
        assert_eq!(ledger.balance_of(user.user_id).unwrap(), Decimal::MAX);
    }

    #[test]
    fn test_submission_after_compensation_is_a_failed_withdrawal() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        ledger
            .credit(user.user_id, dec("5"), "0xsender", "0x01", None)
            .unwrap();
        let entry = ledger
            .reserve_for_withdrawal(user.user_id, dec("2"), "0xabc")
            .unwrap();
        ledger
            .finalize_withdrawal(
                &entry.id,
                WithdrawalOutcome::Failed,
                Some("stale reservation"),
            )
            .unwrap();

        let err = ledger
            .record_submission(&entry.id, "0xfeed", 0, &[0x02])
            .unwrap_err();
        assert_eq!(err.kind(), "submission_failed");
        match err {
            CustodyError::SubmissionFailed {
                withdrawal_id,
                reason,
            } => {
                assert_eq!(withdrawal_id, entry.id);
                assert_eq!(reason, "stale reservation");
            }
            other => panic!("unexpected error: {}", other),
        }

        let stored = ledger.entry(&entry.id).unwrap().unwrap();
        assert!(stored.chain_tx_hash.is_none());
        assert!(ledger.signed_transaction(&entry.id).unwrap().is_none());
        assert_eq!(ledger.balance_of(user.user_id).unwrap(), dec("5"));
    }

    #[test]
    fn test_last_deposit_and_history() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        assert!(ledger.last_deposit(user.user_id).unwrap().is_none());

        ledger
            .credit(user.user_id, dec("1"), "0xsender", "0x01", Some(1))
            .unwrap();
        ledger
            .credit(user.user_id, dec("2.5"), "0xsender", "0x02", Some(2))
            .unwrap();
        ledger
            .reserve_for_withdrawal(user.user_id, dec("0.5"), "0xabc")
            .unwrap();

        let last = ledger.last_deposit(user.user_id).unwrap().unwrap();
        assert_eq!(last.amount, dec("2.5"));

        let history = ledger.history_of(user.user_id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].entry_type, EntryType::Withdrawal);
    }

    #[test]
    fn test_user_by_address_normalises_case() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        let upper = format!("0x{}", user.deposit_address[2..].to_uppercase());
        let found = ledger.user_by_address(&upper).unwrap().unwrap();
        assert_eq!(found.id, user.user_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_overdraw() {
        let (ledger, keys) = test_ledger();
        let user = new_user(&ledger, &keys, "a@example.com");
        ledger
            .credit(user.user_id, dec("10"), "0xsender", "0x01", None)
            .unwrap();

        let ledger = Arc::new(ledger);
        let mut handles = Vec::new();
        for _ in 0..25 {
            let ledger = ledger.clone();
            let user_id = user.user_id;
            handles.push(tokio::spawn(async move {
                ledger.reserve_for_withdrawal(user_id, dec("1"), "0xabc")
            }));
        }
        for i in 0..10 {
            let ledger = ledger.clone();
            let user_id = user.user_id;
            handles.push(tokio::spawn(async move {
                ledger
                    .credit(user_id, dec("0.5"), "0xsender", &format!("0xc{}", i), None)
                    .map(|outcome| outcome.entry().clone())
            }));
        }

        for handle in handles {
            let _ = handle.await.unwrap();
        }

        let balance = ledger.balance_of(user.user_id).unwrap();
        assert!(balance >= Decimal::ZERO);
        assert_conserved(&ledger, user.user_id);

        let reserved = ledger
            .pending_withdrawals()
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum::<Decimal>();
        assert_eq!(balance + reserved, dec("15"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Credit { cents: u32, key: u8 },
        Reserve { cents: u32 },
        Finalize { pick: usize, confirm: bool },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..10_000, 0u8..8).prop_map(|(cents, key)| Op::Credit { cents, key }),
            (1u32..10_000).prop_map(|cents| Op::Reserve { cents }),
            (0usize..16, any::<bool>()).prop_map(|(pick, confirm)| Op::Finalize { pick, confirm }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn balance_matches_entries(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let (ledger, keys) = test_ledger();
            let user = new_user(&ledger, &keys, "p@example.com");
            let mut reservations: Vec<Uuid> = Vec::new();

            for op in ops {
                let before = ledger.balance_of(user.user_id).unwrap();
                match op {
                    Op::Credit { cents, key } => {
                        let amount = Decimal::new(i64::from(cents), 2);
                        ledger
                            .credit(user.user_id, amount, "0xsender", &format!("0x{:02x}", key), None)
                            .unwrap();
                    }
                    Op::Reserve { cents } => {
                        let amount = Decimal::new(i64::from(cents), 2);
                        match ledger.reserve_for_withdrawal(user.user_id, amount, "0xabc") {
                            Ok(entry) => reservations.push(entry.id),
                            Err(CustodyError::InsufficientBalance { .. }) => {
                                prop_assert!(before < amount);
                                prop_assert_eq!(ledger.balance_of(user.user_id).unwrap(), before);
                            }
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                    Op::Finalize { pick, confirm } => {
                        if let Some(id) = reservations.get(pick % reservations.len().max(1)).copied() {
                            let outcome = if confirm {
                                WithdrawalOutcome::Confirmed
                            } else {
                                WithdrawalOutcome::Failed
                            };
                            // Conflicting outcomes on settled entries are refused; either way
                            // the invariant must hold.
                            let _ = ledger.finalize_withdrawal(&id, outcome, None);
                        }
                    }
                }

                let (stored, derived) = ledger.audit_balance(user.user_id).unwrap();
                prop_assert_eq!(stored, derived);
                prop_assert!(stored >= Decimal::ZERO);
            }
        }

        #[test]
        fn concurrent_operations_conserve_funds(
            credits in proptest::collection::vec(1u32..10_000, 1..12),
            reserves in proptest::collection::vec(1u32..10_000, 1..24),
            outcomes in proptest::collection::vec(any::<bool>(), 24),
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let (ledger, keys) = test_ledger();
            let user = new_user(&ledger, &keys, "c@example.com");
            let user_id = user.user_id;
            let ledger = Arc::new(ledger);
            let total_credited = credits
                .iter()
                .map(|cents| Decimal::new(i64::from(*cents), 2))
                .sum::<Decimal>();

            // Credits and reservations race each other.
            let reserved: Vec<LedgerEntry> = runtime.block_on(async {
                let mut credit_tasks = Vec::new();
                for (i, cents) in credits.iter().enumerate() {
                    let ledger = ledger.clone();
                    let amount = Decimal::new(i64::from(*cents), 2);
                    credit_tasks.push(tokio::spawn(async move {
                        ledger.credit(user_id, amount, "0xsender", &format!("0xc{}", i), None)
                    }));
                }
                let mut reserve_tasks = Vec::new();
                for cents in &reserves {
                    let ledger = ledger.clone();
                    let amount = Decimal::new(i64::from(*cents), 2);
                    reserve_tasks.push(tokio::spawn(async move {
                        ledger.reserve_for_withdrawal(user_id, amount, "0xabc")
                    }));
                }

                for task in credit_tasks {
                    assert!(task.await.unwrap().unwrap().is_new());
                }
                let mut reserved = Vec::new();
                for task in reserve_tasks {
                    match task.await.unwrap() {
                        Ok(entry) => reserved.push(entry),
                        Err(CustodyError::InsufficientBalance { .. }) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                reserved
            });

            let (stored, derived) = ledger.audit_balance(user_id).unwrap();
            prop_assert_eq!(stored, derived);
            prop_assert!(stored >= Decimal::ZERO);
            let held = reserved.iter().map(|e| e.amount).sum::<Decimal>();
            prop_assert_eq!(stored + held, total_credited);

            // Settle every reservation concurrently, each one twice.
            runtime.block_on(async {
                let mut tasks = Vec::new();
                for (entry, confirm) in reserved.iter().zip(outcomes.iter().cycle()) {
                    let outcome = if *confirm {
                        WithdrawalOutcome::Confirmed
                    } else {
                        WithdrawalOutcome::Failed
                    };
                    for _ in 0..2 {
                        let ledger = ledger.clone();
                        let id = entry.id;
                        tasks.push(tokio::spawn(async move {
                            ledger.finalize_withdrawal(&id, outcome, None)
                        }));
                    }
                }
                for task in tasks {
                    task.await.unwrap().unwrap();
                }
            });

            let confirmed = reserved
                .iter()
                .zip(outcomes.iter().cycle())
                .filter(|(_, confirm)| **confirm)
                .map(|(e, _)| e.amount)
                .sum::<Decimal>();
            let (stored, derived) = ledger.audit_balance(user_id).unwrap();
            prop_assert_eq!(stored, derived);
            prop_assert_eq!(stored + confirmed, total_credited);
            prop_assert!(ledger.pending_withdrawals().unwrap().is_empty());
        }
    }
}
