//! Live pin state.
//!
//! Hashes are stored as 32-byte BLOBs; `pinned_at` as Unix milliseconds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use torii_pin::etl::{EventRef, PinRecord, PinScope, PinStateStore};
use torii_pin_common::{blob_to_bytes32, bytes32_to_blob, Bytes32};

use crate::open_connection;

pub struct PinStorage {
    conn: Arc<Mutex<Connection>>,
}

impl PinStorage {
    /// Create or open the database
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = open_connection(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pins (
                address TEXT NOT NULL,
                signature TEXT NOT NULL,
                hash BLOB NOT NULL,
                pinned_at INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                tx_index INTEGER NOT NULL,
                log_index INTEGER NOT NULL,
                PRIMARY KEY (address, signature, hash)
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_pins_hash ON pins(hash)", [])?;

        tracing::info!(target: "torii_pin_storage", db_path, "Pin state database ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn upsert_pin(&self, record: &PinRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pins (address, signature, hash, pinned_at, block_number, tx_index, log_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(address, signature, hash) DO UPDATE SET
                pinned_at = excluded.pinned_at,
                block_number = excluded.block_number,
                tx_index = excluded.tx_index,
                log_index = excluded.log_index",
            params![
                record.scope.address,
                record.scope.signature,
                bytes32_to_blob(record.hash),
                record.pinned_at.timestamp_millis(),
                record.source.block_number,
                record.source.tx_index,
                record.source.log_index,
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row was deleted.
    pub fn delete_pin(&self, scope: &PinScope, hash: Bytes32) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM pins WHERE address = ?1 AND signature = ?2 AND hash = ?3",
            params![scope.address, scope.signature, bytes32_to_blob(hash)],
        )?;
        Ok(rows > 0)
    }

    pub fn get_pin(&self, scope: &PinScope, hash: Bytes32) -> Result<Option<PinRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT address, signature, hash, pinned_at, block_number, tx_index, log_index
             FROM pins WHERE address = ?1 AND signature = ?2 AND hash = ?3",
            params![scope.address, scope.signature, bytes32_to_blob(hash)],
            row_to_record,
        )
        .optional()?
        .transpose()
    }

    pub fn count_pin(&self, scope: &PinScope, hash: Bytes32) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pins WHERE address = ?1 AND signature = ?2 AND hash = ?3",
            params![scope.address, scope.signature, bytes32_to_blob(hash)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn active_hashes(&self, scope: &PinScope) -> Result<HashSet<Bytes32>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT hash FROM pins WHERE address = ?1 AND signature = ?2")?;
        let rows = stmt.query_map(params![scope.address, scope.signature], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;

        let mut hashes = HashSet::new();
        for blob in rows {
            hashes.insert(blob_to_bytes32(&blob?));
        }
        Ok(hashes)
    }

    /// Whether a scope other than `scope` holds `hash`.
    pub fn is_held_elsewhere(&self, scope: &PinScope, hash: Bytes32) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let held: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM pins WHERE hash = ?1 AND NOT (address = ?2 AND signature = ?3)
             )",
            params![bytes32_to_blob(hash), scope.address, scope.signature],
            |row| row.get(0),
        )?;
        Ok(held)
    }

    /// Pins across every scope.
    pub fn total_pins(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pins", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Result<PinRecord>> {
    let address: String = row.get(0)?;
    let signature: String = row.get(1)?;
    let hash: Vec<u8> = row.get(2)?;
    let pinned_at: i64 = row.get(3)?;
    let source = EventRef {
        block_number: row.get(4)?,
        tx_index: row.get(5)?,
        log_index: row.get(6)?,
    };

    Ok(DateTime::<Utc>::from_timestamp_millis(pinned_at)
        .with_context(|| format!("Invalid pinned_at timestamp: {pinned_at}"))
        .map(|pinned_at| PinRecord {
            scope: PinScope::new(address, signature),
            hash: blob_to_bytes32(&hash),
            pinned_at,
            source,
        }))
}

#[async_trait]
impl PinStateStore for PinStorage {
    async fn upsert(&self, record: &PinRecord) -> Result<()> {
        self.upsert_pin(record)
    }

    async fn delete(&self, scope: &PinScope, hash: Bytes32) -> Result<()> {
        self.delete_pin(scope, hash).map(|_| ())
    }

    async fn count_by_hash(&self, scope: &PinScope, hash: Bytes32) -> Result<u64> {
        self.count_pin(scope, hash)
    }

    async fn list_active(&self, scope: &PinScope) -> Result<HashSet<Bytes32>> {
        self.active_hashes(scope)
    }

    async fn held_elsewhere(&self, scope: &PinScope, hash: Bytes32) -> Result<bool> {
        self.is_held_elsewhere(scope, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, PinStorage) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pins.db");
        let storage = PinStorage::new(path.to_str().unwrap()).unwrap();
        (dir, storage)
    }

    fn record(scope: &PinScope, n: u8, block: u64) -> PinRecord {
        PinRecord {
            scope: scope.clone(),
            hash: Bytes32::from([n; 32]),
            pinned_at: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap(),
            source: EventRef {
                block_number: block,
                tx_index: 1,
                log_index: 2,
            },
        }
    }

    #[test]
    fn test_upsert_is_keyed_by_scope_and_hash() {
        let (_dir, storage) = storage();
        let scope = PinScope::new("0xAbC", "0x01");

        storage.upsert_pin(&record(&scope, 1, 10)).unwrap();
        storage.upsert_pin(&record(&scope, 1, 20)).unwrap();

        assert_eq!(storage.total_pins().unwrap(), 1);
        assert_eq!(storage.count_pin(&scope, Bytes32::from([1; 32])).unwrap(), 1);

        let stored = storage
            .get_pin(&scope, Bytes32::from([1; 32]))
            .unwrap()
            .unwrap();
        assert_eq!(stored, record(&scope, 1, 20));
    }

    #[test]
    fn test_delete_and_list() {
        let (_dir, storage) = storage();
        let scope = PinScope::new("0xabc", "0x01");

        for n in 1..=3 {
            storage.upsert_pin(&record(&scope, n, u64::from(n))).unwrap();
        }
        assert!(storage.delete_pin(&scope, Bytes32::from([2; 32])).unwrap());
        assert!(!storage.delete_pin(&scope, Bytes32::from([2; 32])).unwrap());

        let active = storage.active_hashes(&scope).unwrap();
        assert_eq!(
            active,
            HashSet::from([Bytes32::from([1; 32]), Bytes32::from([3; 32])])
        );
    }

    #[test]
    fn test_held_elsewhere() {
        let (_dir, storage) = storage();
        let a = PinScope::new("0xabc", "0x01");
        let b = PinScope::new("0xabc", "0x02");

        storage.upsert_pin(&record(&a, 7, 1)).unwrap();
        assert!(!storage.is_held_elsewhere(&a, Bytes32::from([7; 32])).unwrap());
        assert!(storage.is_held_elsewhere(&b, Bytes32::from([7; 32])).unwrap());

        storage.upsert_pin(&record(&b, 7, 2)).unwrap();
        assert!(storage.is_held_elsewhere(&a, Bytes32::from([7; 32])).unwrap());
        assert_eq!(storage.total_pins().unwrap(), 2);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pins.db");
        let scope = PinScope::new("0xabc", "0x01");

        PinStorage::new(path.to_str().unwrap())
            .unwrap()
            .upsert_pin(&record(&scope, 9, 1))
            .unwrap();

        let reopened = PinStorage::new(path.to_str().unwrap()).unwrap();
        assert_eq!(reopened.active_hashes(&scope).unwrap().len(), 1);
    }
}
