//! Pin sinks: the content store and the persisted pin state.
//!
//! Both are external collaborators reached only through these traits. The [`PinDriver`] is
//! the single writer of pin state.

pub mod driver;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use torii_pin_common::Bytes32;

use super::event::{EventRef, PinScope};

pub use driver::{ApplyOutcome, ApplyReport, PinDriver, PinDriverConfig};
pub use memory::{MemoryContentStore, MemoryPinStore};

/// Outcome of a pin request. Both variants count as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    Pinned,
    AlreadyPinned,
}

/// Outcome of an unpin request. Both variants count as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpinOutcome {
    Unpinned,
    NotPinned,
}

/// Content-addressable store exposing pin primitives.
///
/// Implementations map the store's "already pinned" / "not pinned" answers to the outcome
/// enums and reserve `Err` for failures worth retrying.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store raw bytes and return their base58 multihash.
    async fn put(&self, data: &[u8]) -> anyhow::Result<String>;

    async fn pin(&self, multihash: &str) -> anyhow::Result<PinOutcome>;

    async fn unpin(&self, multihash: &str) -> anyhow::Result<UnpinOutcome>;
}

/// One active pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRecord {
    pub scope: PinScope,
    pub hash: Bytes32,
    pub pinned_at: DateTime<Utc>,
    pub source: EventRef,
}

/// Persisted, live view of active pins (not a history).
///
/// Records are keyed by `(scope, hash)`: within one scope a hash appears at most once.
#[async_trait]
pub trait PinStateStore: Send + Sync {
    /// Insert or replace the record for `(record.scope, record.hash)`.
    async fn upsert(&self, record: &PinRecord) -> anyhow::Result<()>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn delete(&self, scope: &PinScope, hash: Bytes32) -> anyhow::Result<()>;

    /// 0 or 1.
    async fn count_by_hash(&self, scope: &PinScope, hash: Bytes32) -> anyhow::Result<u64>;

    async fn list_active(&self, scope: &PinScope) -> anyhow::Result<HashSet<Bytes32>>;

    /// Whether any scope other than `scope` holds `hash`.
    async fn held_elsewhere(&self, scope: &PinScope, hash: Bytes32) -> anyhow::Result<bool>;
}
