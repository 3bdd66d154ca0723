//! SQLite storage for Torii Pin.
//!
//! - [`PinStorage`]: live pin state, one row per `(address, signature, hash)`.
//! - [`TxLogStorage`]: raw event history per `(address, signature)`, reorg flags included.
//!
//! Both can share one database file; each opens its own connection.

pub mod pins;
pub mod tx_logs;

pub use pins::PinStorage;
pub use tx_logs::TxLogStorage;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Open `db_path` with the WAL + performance PRAGMAs.
pub(crate) fn open_connection(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open SQLite database: {db_path}"))?;

    // - WAL mode: readers don't block writers
    // - synchronous=NORMAL: safe with WAL
    // - busy_timeout: pin state and history may share the file
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA cache_size=-16000;
         PRAGMA temp_store=MEMORY;
         PRAGMA busy_timeout=5000;",
    )?;

    Ok(conn)
}
