// src/cachedb/mod.rs

//! The action-cache's relational model: schema, schema-checked
//! statements, and per-table CRUD.

pub mod models;
pub mod schema;
pub mod statements;

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Retry count for client request paths (§7 "bounded for read-mostly
/// paths"): `put_uid`/`get_uid`/`has_uid`/`remove_uid`/`put_deps` and an
/// explicit `force_gc`/`synchronous_gc` call all give up and surface
/// `BUSY`/`LOCKED` to the caller after this many attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry count for the integrity handler's own background GC pass (§7
/// "unlimited for the IH writer"): the steady-state eviction loop never
/// gives up on a transient `BUSY`/`LOCKED` from a client request holding
/// the lock, since there is no caller waiting on it to fail fast.
pub const UNLIMITED_RETRIES: u32 = u32::MAX;

/// Open a connection, apply pending migrations, and verify every
/// declared statement against the resulting schema. Call once per
/// worker/reader connection at startup.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(0))?;
    schema::migrate(&conn)?;
    statements::verify_all(&conn)?;
    info!(path = %path.display(), "opened action-cache database");
    Ok(conn)
}

/// Run `f` inside a transaction, retrying the `BEGIN` on `BUSY`/`LOCKED`
/// up to `max_retries` times with a short sleep between attempts (§5 "DB:
/// one writer connection per worker ... all writes go through the BEGIN
/// wrapper that handles retries").
pub fn with_retrying_txn<T>(
    conn: &mut Connection,
    exclusive: bool,
    max_retries: u32,
    mut f: impl FnMut(&rusqlite::Transaction) -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        let behavior = if exclusive {
            rusqlite::TransactionBehavior::Exclusive
        } else {
            rusqlite::TransactionBehavior::Deferred
        };

        let txn = match conn.transaction_with_behavior(behavior) {
            Ok(txn) => txn,
            Err(e) if crate::error::sqlite_error_is_busy(&e) && attempt < max_retries => {
                attempt += 1;
                debug!(attempt, "BEGIN retried after busy/locked");
                std::thread::yield_now();
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                return Ok(value);
            }
            Err(e) if e.is_busy() && attempt < max_retries => {
                attempt += 1;
                debug!(attempt, "transaction body retried after busy/locked");
                std::thread::yield_now();
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}
