//! Raw event history, one row per log identity.
//!
//! A log is identified by `(address, signature, block_number, tx_index, log_index)`. Inserting
//! the same identity again overwrites the row, so a later `removed = true` replaces the
//! original and a re-included log replaces the removal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, Params};
use std::sync::{Arc, Mutex};
use torii_pin::etl::{EventSource, PinScope, RawLog};

use crate::open_connection;

pub struct TxLogStorage {
    conn: Arc<Mutex<Connection>>,
}

impl TxLogStorage {
    /// Create or open the database
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = open_connection(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tx_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                signature TEXT NOT NULL,
                args TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                tx_index INTEGER NOT NULL,
                log_index INTEGER NOT NULL,
                removed INTEGER NOT NULL DEFAULT 0,
                data_index_start INTEGER NOT NULL DEFAULT 0,
                UNIQUE(address, signature, block_number, tx_index, log_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tx_logs_scope_block
             ON tx_logs(address, signature, block_number)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or overwrite logs in a single transaction.
    pub fn insert_logs(&self, logs: &[RawLog]) -> Result<usize> {
        if logs.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO tx_logs (address, signature, args, block_number, tx_index, log_index, removed, data_index_start)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(address, signature, block_number, tx_index, log_index) DO UPDATE SET
                    args = excluded.args,
                    removed = excluded.removed,
                    data_index_start = excluded.data_index_start",
            )?;

            for log in logs {
                let scope = PinScope::new(&log.address, &log.signature);
                let args = serde_json::to_string(&log.args)?;
                written += stmt.execute(params![
                    scope.address,
                    scope.signature,
                    args,
                    log.block_number,
                    log.tx_index,
                    log.log_index,
                    log.removed,
                    log.data_index_start as i64,
                ])?;
            }
        }

        tx.commit()?;

        tracing::debug!(target: "torii_pin_storage", logs = written, "Stored logs");

        Ok(written)
    }

    /// Every log of `scope` in canonical order, removed ones included.
    pub fn logs_for(&self, scope: &PinScope) -> Result<Vec<RawLog>> {
        self.query_logs(
            "SELECT address, signature, args, block_number, tx_index, log_index, removed, data_index_start
             FROM tx_logs
             WHERE address = ?1 AND signature = ?2
             ORDER BY block_number, tx_index, log_index",
            params![scope.address, scope.signature],
        )
    }

    /// The whole history, every scope.
    pub fn all_logs(&self) -> Result<Vec<RawLog>> {
        self.query_logs(
            "SELECT address, signature, args, block_number, tx_index, log_index, removed, data_index_start
             FROM tx_logs
             ORDER BY address, signature, block_number, tx_index, log_index",
            [],
        )
    }

    fn query_logs(&self, sql: &str, params: impl Params) -> Result<Vec<RawLog>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(sql)?;

        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, u64>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut logs = Vec::new();
        for row in rows {
            let (address, signature, args, block_number, tx_index, log_index, removed, start) =
                row?;
            let args: Vec<String> = serde_json::from_str(&args).with_context(|| {
                format!("Corrupted args for log {block_number}:{tx_index}:{log_index}")
            })?;
            logs.push(RawLog {
                address,
                signature,
                args,
                block_number,
                tx_index,
                log_index,
                removed,
                data_index_start: start as usize,
            });
        }
        Ok(logs)
    }

    /// Flag a stored log as removed by a reorg. Returns false if the log is unknown.
    pub fn mark_removed(
        &self,
        scope: &PinScope,
        block_number: u64,
        tx_index: u64,
        log_index: u64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE tx_logs SET removed = 1
             WHERE address = ?1 AND signature = ?2 AND block_number = ?3 AND tx_index = ?4 AND log_index = ?5",
            params![scope.address, scope.signature, block_number, tx_index, log_index],
        )?;
        Ok(rows > 0)
    }

    pub fn log_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tx_logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl EventSource for TxLogStorage {
    async fn fetch(&self, scope: &PinScope) -> Result<Vec<RawLog>> {
        self.logs_for(scope)
    }
}
