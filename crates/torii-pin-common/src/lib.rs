//! Common utilities for the Torii pinning crates
//!
//! Provides the fixed-width [`Bytes32`] hash used for set membership and storage, and lossless
//! conversions to and from the content store's base58 multihash form.

use cid::Cid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Multihash code for sha2-256.
pub const SHA2_256_CODE: u8 = 0x12;

/// Digest length of sha2-256 in bytes.
pub const SHA2_256_LEN: u8 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("Invalid hex value '{0}'")]
    InvalidHex(String),
    #[error("Hash value '{0}' is wider than 32 bytes")]
    TooWide(String),
    #[error("Invalid content identifier '{0}': {1}")]
    InvalidCid(String, String),
    #[error("Unsupported multihash in '{0}' (expected sha2-256, got code {1:#x} with {2} bytes)")]
    UnsupportedMultihash(String, u64, usize),
}

/// Fixed-width 32-byte hash
///
/// This is the comparison form used for every set operation in the reconciler and for the
/// persisted pin state. The all-zero value means "no hash" (an unset event argument).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Bytes32([u8; 32]);

impl Bytes32 {
    pub const ZERO: Self = Self([0u8; 32]);

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a hex string (with or without `0x`), right-aligning short values.
    ///
    /// `0x0` parses to [`Bytes32::ZERO`], which is how unset hash arguments appear in logs.
    pub fn from_hex(value: &str) -> Result<Self, HashError> {
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);

        if digits.len() > 64 {
            return Err(HashError::TooWide(value.to_string()));
        }

        // hex::decode wants an even number of digits
        let padded = if digits.len() % 2 == 1 {
            format!("0{digits}")
        } else {
            digits.to_string()
        };

        let bytes = hex::decode(&padded).map_err(|_| HashError::InvalidHex(value.to_string()))?;
        Ok(blob_to_bytes32(&bytes))
    }

    /// `0x`-prefixed lowercase hex, always 64 digits.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes32({})", self.to_hex())
    }
}

impl FromStr for Bytes32 {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

// ===== Blob conversions =====

/// Convert a hash to a 32-byte BLOB for storage
pub fn bytes32_to_blob(hash: Bytes32) -> Vec<u8> {
    hash.0.to_vec()
}

/// Convert a BLOB back to a hash (right-aligned, truncated to 32 bytes)
pub fn blob_to_bytes32(bytes: &[u8]) -> Bytes32 {
    let mut arr = [0u8; 32];
    let len = bytes.len().min(32);
    arr[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    Bytes32(arr)
}

// ===== Multihash conversions =====

/// Convert a content identifier to the fixed-width hash.
///
/// Accepts base58 sha2-256 multihashes (`Qm...`, CIDv0) and CIDv1 strings whose multihash is
/// sha2-256. Anything else cannot round-trip through 32 bytes and is rejected.
pub fn multihash_to_bytes32(value: &str) -> Result<Bytes32, HashError> {
    let cid =
        Cid::from_str(value).map_err(|e| HashError::InvalidCid(value.to_string(), e.to_string()))?;

    let hash = cid.hash();
    let digest = hash.digest();
    if hash.code() != u64::from(SHA2_256_CODE) || digest.len() != usize::from(SHA2_256_LEN) {
        return Err(HashError::UnsupportedMultihash(
            value.to_string(),
            hash.code(),
            digest.len(),
        ));
    }

    Ok(blob_to_bytes32(digest))
}

/// Convert the fixed-width hash back to the base58 sha2-256 multihash form.
pub fn bytes32_to_multihash(hash: Bytes32) -> String {
    let mut raw = Vec::with_capacity(34);
    raw.push(SHA2_256_CODE);
    raw.push(SHA2_256_LEN);
    raw.extend_from_slice(&hash.0);
    bs58::encode(raw).into_string()
}
