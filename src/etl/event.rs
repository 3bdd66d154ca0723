//! Raw and canonical event types flowing through the pinning pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use torii_pin_common::Bytes32;

/// Contract address + event signature pair.
///
/// Every history query, reconciliation and pin record is scoped to one of these.
/// Both parts are normalized to lowercase so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinScope {
    pub address: String,
    pub signature: String,
}

impl PinScope {
    pub fn new(address: impl AsRef<str>, signature: impl AsRef<str>) -> Self {
        Self {
            address: address.as_ref().to_lowercase(),
            signature: signature.as_ref().to_lowercase(),
        }
    }
}

impl fmt::Display for PinScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.signature)
    }
}

/// Raw log entry as stored by the history source.
///
/// `args[0]` is the topic slot; input `i` of the indexed-first layout sits at `args[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub signature: String,
    pub args: Vec<String>,
    pub block_number: u64,
    pub tx_index: u64,
    /// Log index inside the block.
    #[serde(alias = "index")]
    pub log_index: u64,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub data_index_start: usize,
}

/// Canonical ordering key: `(block_number, tx_index, log_index)`.
///
/// It doubles as the log identity: a `removed` record cancels the record with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: u64,
}

impl CanonicalKey {
    pub fn new(block_number: u64, tx_index: u64, log_index: u64) -> Self {
        Self {
            block_number,
            tx_index,
            log_index,
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.block_number, self.tx_index, self.log_index)
    }
}

/// Decoded event, immutable once built by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub scope: PinScope,
    pub args: Vec<String>,
    pub key: CanonicalKey,
    pub removed: bool,
    /// `None` when the argument is unset (all zeroes).
    pub new_hash: Option<Bytes32>,
    pub old_hash: Option<Bytes32>,
    pub data_index_start: usize,
}

impl EventRecord {
    /// Reference stored alongside a pin to remember which event caused it.
    pub fn source(&self) -> EventRef {
        EventRef {
            block_number: self.key.block_number,
            tx_index: self.key.tx_index,
            log_index: self.key.log_index,
        }
    }
}

/// Pointer from a pin record back to the event that introduced the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: u64,
}

impl From<CanonicalKey> for EventRef {
    fn from(key: CanonicalKey) -> Self {
        Self {
            block_number: key.block_number,
            tx_index: key.tx_index,
            log_index: key.log_index,
        }
    }
}
