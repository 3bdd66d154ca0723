//! In-memory content store and pin state, for tests and dry runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use torii_pin_common::{bytes32_to_multihash, Bytes32};

use super::{ContentStore, PinOutcome, PinRecord, PinStateStore, UnpinOutcome};
use crate::etl::event::PinScope;

/// Content store keeping pins in a set.
///
/// `fail_next` injects transient failures: the next `n` pin/unpin calls return an error.
#[derive(Default)]
pub struct MemoryContentStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pins: Mutex<HashSet<String>>,
    pin_calls: AtomicUsize,
    unpin_calls: AtomicUsize,
    failures: AtomicU32,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: u32) {
        self.failures.store(calls, Ordering::SeqCst);
    }

    pub fn is_pinned(&self, multihash: &str) -> bool {
        self.pins.lock().unwrap().contains(multihash)
    }

    pub fn pinned(&self) -> HashSet<String> {
        self.pins.lock().unwrap().clone()
    }

    pub fn pin_calls(&self) -> usize {
        self.pin_calls.load(Ordering::SeqCst)
    }

    pub fn unpin_calls(&self) -> usize {
        self.unpin_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: &[u8]) -> Result<String> {
        let digest: [u8; 32] = Sha256::digest(data).into();
        let multihash = bytes32_to_multihash(Bytes32::new(digest));
        self.objects
            .lock()
            .unwrap()
            .insert(multihash.clone(), data.to_vec());
        Ok(multihash)
    }

    async fn pin(&self, multihash: &str) -> Result<PinOutcome> {
        self.pin_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            bail!("injected failure pinning {multihash}");
        }
        if self.pins.lock().unwrap().insert(multihash.to_string()) {
            Ok(PinOutcome::Pinned)
        } else {
            Ok(PinOutcome::AlreadyPinned)
        }
    }

    async fn unpin(&self, multihash: &str) -> Result<UnpinOutcome> {
        self.unpin_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            bail!("injected failure unpinning {multihash}");
        }
        if self.pins.lock().unwrap().remove(multihash) {
            Ok(UnpinOutcome::Unpinned)
        } else {
            Ok(UnpinOutcome::NotPinned)
        }
    }
}

/// Pin state held in a map keyed by `(scope, hash)`.
#[derive(Default)]
pub struct MemoryPinStore {
    records: Mutex<HashMap<(PinScope, Bytes32), PinRecord>>,
}

impl MemoryPinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, scope: &PinScope, hash: Bytes32) -> Option<PinRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(scope.clone(), hash))
            .cloned()
    }
}

#[async_trait]
impl PinStateStore for MemoryPinStore {
    async fn upsert(&self, record: &PinRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert((record.scope.clone(), record.hash), record.clone());
        Ok(())
    }

    async fn delete(&self, scope: &PinScope, hash: Bytes32) -> Result<()> {
        self.records.lock().unwrap().remove(&(scope.clone(), hash));
        Ok(())
    }

    async fn count_by_hash(&self, scope: &PinScope, hash: Bytes32) -> Result<u64> {
        let present = self
            .records
            .lock()
            .unwrap()
            .contains_key(&(scope.clone(), hash));
        Ok(u64::from(present))
    }

    async fn list_active(&self, scope: &PinScope) -> Result<HashSet<Bytes32>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .keys()
            .filter(|(s, _)| s == scope)
            .map(|(_, hash)| *hash)
            .collect())
    }

    async fn held_elsewhere(&self, scope: &PinScope, hash: Bytes32) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .keys()
            .any(|(s, h)| *h == hash && s != scope))
    }
}
