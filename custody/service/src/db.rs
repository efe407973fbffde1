// Copyright (c) 2024 The Botho Foundation

//! SQLite storage for users, custody keys, ledger entries and the scan cursor.
//!
//! A single connection sits behind a mutex; every mutation runs inside one
//! `IMMEDIATE` transaction on it, so ledger updates are serialized and
//! atomic. Query helpers take a `&Connection` so they compose inside
//! [`Database::write`] closures.

use bth_custody_core::{EntryStatus, EntryType, LedgerEntry, User, UserId};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{
    params, types::Type, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use rust_decimal::Decimal;
use std::{
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::warn;
use uuid::Uuid;

use crate::error::{CustodyError, Result};

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations.
    pub fn migrate(&self) -> Result<()> {
        self.read(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    deposit_address TEXT NOT NULL UNIQUE,
                    balance TEXT NOT NULL DEFAULT '0',
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS custody_keys (
                    address TEXT PRIMARY KEY,
                    nonce TEXT NOT NULL,
                    ciphertext TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS ledger_entries (
                    entry_id TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(user_id),
                    amount TEXT NOT NULL,
                    address_from TEXT NOT NULL,
                    address_to TEXT NOT NULL,
                    entry_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    idempotency_key TEXT NOT NULL,
                    chain_tx_hash TEXT,
                    nonce INTEGER,
                    block_number INTEGER,
                    error_message TEXT,
                    signed_tx TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_idempotency
                    ON ledger_entries(idempotency_key) WHERE status != 'failed';
                CREATE INDEX IF NOT EXISTS idx_entries_user ON ledger_entries(user_id);
                CREATE INDEX IF NOT EXISTS idx_entries_from ON ledger_entries(address_from);
                CREATE INDEX IF NOT EXISTS idx_entries_to ON ledger_entries(address_to);
                CREATE INDEX IF NOT EXISTS idx_entries_type_status
                    ON ledger_entries(entry_type, status);

                CREATE TABLE IF NOT EXISTS scan_cursor (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    last_block INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entry_id TEXT,
                    action TEXT NOT NULL,
                    details TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_audit_entry ON audit_log(entry_id);
                CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);
                "#,
            )?;
            Ok(())
        })
    }

    /// Run `f` against the connection without opening a transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside an immediate transaction; commit on `Ok`, roll back on `Err`.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// A panic inside a closure drops its transaction, which rolls it back,
    /// so a poisoned lock still guards a consistent connection.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Recovering database connection after a panic");
                poisoned.into_inner()
            }
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, e.to_string()))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| conversion_error(idx, format!("invalid timestamp {}", millis)))
}

const USER_COLUMNS: &str = "user_id, email, deposit_address, balance, created_at";

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(row.get(0)?),
        email: row.get(1)?,
        deposit_address: row.get(2)?,
        balance: decimal_column(row, 3)?,
        created_at: time_column(row, 4)?,
    })
}

const ENTRY_COLUMNS: &str = "entry_id, user_id, amount, address_from, address_to, entry_type, \
     status, idempotency_key, chain_tx_hash, nonce, block_number, error_message, \
     created_at, updated_at";

/// Convert a database row to a LedgerEntry.
fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let id_str: String = row.get(0)?;
    let entry_type_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let nonce: Option<i64> = row.get(9)?;
    let block_number: Option<i64> = row.get(10)?;

    Ok(LedgerEntry {
        id: Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e.to_string()))?,
        user_id: UserId(row.get(1)?),
        amount: decimal_column(row, 2)?,
        address_from: row.get(3)?,
        address_to: row.get(4)?,
        entry_type: EntryType::from_str(&entry_type_str).map_err(|e| conversion_error(5, e))?,
        status: EntryStatus::from_str(&status_str).map_err(|e| conversion_error(6, e))?,
        idempotency_key: row.get(7)?,
        chain_tx_hash: row.get(8)?,
        nonce: nonce.map(|n| n as u64),
        block_number: block_number.map(|n| n as u64),
        error_message: row.get(11)?,
        created_at: time_column(row, 12)?,
        updated_at: time_column(row, 13)?,
    })
}

/// Insert a new user and return its id.
pub fn insert_user(conn: &Connection, email: &str, deposit_address: &str) -> Result<UserId> {
    conn.execute(
        "INSERT INTO users (email, deposit_address, balance, created_at) VALUES (?1, ?2, '0', ?3)",
        params![email, deposit_address, now_millis()],
    )?;
    Ok(UserId(conn.last_insert_rowid()))
}

pub fn user_by_id(conn: &Connection, id: UserId) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1");
    Ok(conn.query_row(&sql, params![id.0], row_to_user).optional()?)
}

pub fn user_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1");
    Ok(conn.query_row(&sql, params![email], row_to_user).optional()?)
}

pub fn user_by_address(conn: &Connection, deposit_address: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE deposit_address = ?1");
    Ok(conn
        .query_row(&sql, params![deposit_address], row_to_user)
        .optional()?)
}

pub fn all_users(conn: &Connection) -> Result<Vec<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY user_id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map([], row_to_user)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

pub fn set_balance(conn: &Connection, id: UserId, balance: Decimal) -> Result<()> {
    let updated = conn.execute(
        "UPDATE users SET balance = ?1 WHERE user_id = ?2",
        params![balance.to_string(), id.0],
    )?;
    if updated != 1 {
        return Err(CustodyError::UserNotFound(id.to_string()));
    }
    Ok(())
}

/// Insert a ledger entry.
pub fn insert_entry(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO ledger_entries (
            entry_id, user_id, amount, address_from, address_to, entry_type,
            status, idempotency_key, chain_tx_hash, nonce, block_number,
            error_message, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            entry.id.to_string(),
            entry.user_id.0,
            entry.amount.to_string(),
            entry.address_from,
            entry.address_to,
            entry.entry_type.to_string(),
            entry.status.to_string(),
            entry.idempotency_key,
            entry.chain_tx_hash,
            entry.nonce.map(|n| n as i64),
            entry.block_number.map(|n| n as i64),
            entry.error_message,
            entry.created_at.timestamp_millis(),
            entry.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

pub fn entry_by_id(conn: &Connection, id: &Uuid) -> Result<Option<LedgerEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE entry_id = ?1");
    Ok(conn
        .query_row(&sql, params![id.to_string()], row_to_entry)
        .optional()?)
}

/// The entry holding `key`, ignoring failed ones.
pub fn live_entry_by_key(conn: &Connection, key: &str) -> Result<Option<LedgerEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
         WHERE idempotency_key = ?1 AND status != 'failed'"
    );
    Ok(conn.query_row(&sql, params![key], row_to_entry).optional()?)
}

/// Update status and failure reason of an entry.
pub fn update_entry_status(
    conn: &Connection,
    id: &Uuid,
    status: EntryStatus,
    error_message: Option<&str>,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE ledger_entries
        SET status = ?1, error_message = ?2, updated_at = ?3
        WHERE entry_id = ?4
        "#,
        params![status.to_string(), error_message, now_millis(), id.to_string()],
    )?;
    Ok(())
}

/// Record the signed transaction of a withdrawal; `signed_tx` is its hex encoding.
pub fn set_entry_submission(
    conn: &Connection,
    id: &Uuid,
    tx_hash: &str,
    nonce: u64,
    signed_tx: &str,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE ledger_entries
        SET chain_tx_hash = ?1, nonce = ?2, signed_tx = ?3, updated_at = ?4
        WHERE entry_id = ?5
        "#,
        params![tx_hash, nonce as i64, signed_tx, now_millis(), id.to_string()],
    )?;
    Ok(())
}

/// Hex-encoded signed transaction recorded for a withdrawal.
pub fn signed_transaction(conn: &Connection, id: &Uuid) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT signed_tx FROM ledger_entries WHERE entry_id = ?1",
            params![id.to_string()],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

/// All entries where `address` is sender or recipient, oldest first.
pub fn entries_for_address(conn: &Connection, address: &str) -> Result<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
         WHERE address_from = ?1 OR address_to = ?1 \
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params![address], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// All entries owned by a user, oldest first.
pub fn entries_for_user(conn: &Connection, id: UserId) -> Result<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE user_id = ?1 \
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params![id.0], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Most recent confirmed deposit to `address`.
pub fn latest_deposit(conn: &Connection, address: &str) -> Result<Option<LedgerEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
         WHERE address_to = ?1 AND entry_type = 'deposit' AND status = 'confirmed' \
         ORDER BY created_at DESC, rowid DESC LIMIT 1"
    );
    Ok(conn.query_row(&sql, params![address], row_to_entry).optional()?)
}

/// Pending withdrawals, oldest first.
pub fn pending_withdrawals(conn: &Connection) -> Result<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
         WHERE entry_type = 'withdrawal' AND status = 'pending' \
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Store an encrypted private key.
pub fn insert_key(conn: &Connection, address: &str, nonce: &str, ciphertext: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO custody_keys (address, nonce, ciphertext, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![address, nonce, ciphertext, now_millis()],
    )?;
    Ok(())
}

/// Fetch `(nonce, ciphertext)` for an address.
pub fn key_by_address(conn: &Connection, address: &str) -> Result<Option<(String, String)>> {
    Ok(conn
        .query_row(
            "SELECT nonce, ciphertext FROM custody_keys WHERE address = ?1",
            params![address],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Highest block fully processed, if any.
pub fn scan_cursor(conn: &Connection) -> Result<Option<u64>> {
    let block: Option<i64> = conn
        .query_row("SELECT last_block FROM scan_cursor WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(block.map(|b| b as u64))
}

/// Advance the cursor to `block`; never moves it backwards.
pub fn advance_scan_cursor(conn: &Connection, block: u64) -> Result<u64> {
    conn.execute(
        r#"
        INSERT INTO scan_cursor (id, last_block, updated_at) VALUES (1, ?1, ?2)
        ON CONFLICT(id) DO UPDATE SET
            last_block = MAX(last_block, excluded.last_block),
            updated_at = excluded.updated_at
        "#,
        params![block as i64, now_millis()],
    )?;
    scan_cursor(conn)?.ok_or_else(|| CustodyError::StorageFailure("scan cursor missing".into()))
}

/// Log an audit event.
pub fn log_audit(conn: &Connection, entry_id: Option<&Uuid>, action: &str, details: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO audit_log (entry_id, action, details, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![entry_id.map(|id| id.to_string()), action, details, now_millis()],
    )?;
    Ok(())
}

/// Number of audit events recorded for an entry.
pub fn audit_count(conn: &Connection, entry_id: &Uuid) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM audit_log WHERE entry_id = ?1",
        params![entry_id.to_string()],
        |row| row.get(0),
    )?)
}
