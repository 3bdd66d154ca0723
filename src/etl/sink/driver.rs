//! PinDriver applies a [`PinDiff`] to the content store and the pin state.
//!
//! - `to_pin`: pin in the content store, then upsert the [`PinRecord`].
//! - `to_unpin`: unpin in the content store (skipped while another scope still holds the hash),
//!   then delete the record.
//!
//! Every call goes through the retry policy. A hash whose retries run out is reported as failed
//! and the remaining hashes are still processed; the next cycle picks the leftovers up because
//! the desired set is recomputed from scratch.
//!
//! Hash operations of one diff run concurrently (bounded by `concurrency`). They commute, so
//! their completion order does not matter. Operations on the same hash from different scopes
//! are serialized: the shared-hash check and the store call it decides must not interleave with
//! another scope's pin and record.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use torii_pin_common::{bytes32_to_multihash, Bytes32};

use super::{ContentStore, PinOutcome, PinRecord, PinStateStore, UnpinOutcome};
use crate::etl::event::{EventRef, PinScope};
use crate::etl::reconcile::PinDiff;
use crate::etl::retry::RetryPolicy;
use crate::etl::run_state::RunStates;

#[derive(Debug, Clone)]
pub struct PinDriverConfig {
    pub retry: RetryPolicy,
    /// Maximum in-flight hash operations per diff.
    pub concurrency: usize,
}

impl Default for PinDriverConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            concurrency: 8,
        }
    }
}

/// Counters for one applied diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub pinned: usize,
    pub already_pinned: usize,
    pub unpinned: usize,
    pub not_pinned: usize,
    /// Records dropped without unpinning because another scope holds the hash.
    pub shared: usize,
    pub failed: Vec<(Bytes32, String)>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> usize {
        self.pinned + self.already_pinned + self.unpinned + self.not_pinned + self.shared
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ApplyReport),
    /// Another application for the same scope was in flight.
    Skipped,
}

enum HashOp {
    Pin(Bytes32, EventRef),
    Unpin(Bytes32),
}

enum HashDone {
    Pin(PinOutcome),
    Unpin(UnpinOutcome),
    Shared,
}

pub struct PinDriver {
    content: Arc<dyn ContentStore>,
    state: Arc<dyn PinStateStore>,
    config: PinDriverConfig,
    in_flight: RunStates<PinScope>,
    hash_locks: Mutex<HashMap<Bytes32, Arc<AsyncMutex<()>>>>,
}

impl PinDriver {
    pub fn new(
        content: Arc<dyn ContentStore>,
        state: Arc<dyn PinStateStore>,
        config: PinDriverConfig,
    ) -> Self {
        Self {
            content,
            state,
            config,
            in_flight: RunStates::new(),
            hash_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_store(&self) -> &Arc<dyn PinStateStore> {
        &self.state
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Apply `diff` for `scope`, unless an application for the same scope is in flight.
    pub async fn apply(&self, scope: &PinScope, diff: &PinDiff) -> ApplyOutcome {
        let Some(_ticket) = self.in_flight.try_begin(scope) else {
            tracing::warn!(
                target: "torii_pin::etl::driver",
                scope = %scope,
                "Diff application already in flight, skipping"
            );
            return ApplyOutcome::Skipped;
        };

        let mut report = ApplyReport::default();
        if diff.is_empty() {
            return ApplyOutcome::Applied(report);
        }

        let ops: Vec<HashOp> = diff
            .to_pin
            .iter()
            .map(|(hash, source)| HashOp::Pin(*hash, *source))
            .chain(diff.to_unpin.iter().map(|hash| HashOp::Unpin(*hash)))
            .collect();

        let results: Vec<(Bytes32, anyhow::Result<HashDone>)> = stream::iter(ops)
            .map(|op| self.run(scope, op))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        self.release_idle_locks();

        for (hash, result) in results {
            match result {
                Ok(HashDone::Pin(PinOutcome::Pinned)) => report.pinned += 1,
                Ok(HashDone::Pin(PinOutcome::AlreadyPinned)) => report.already_pinned += 1,
                Ok(HashDone::Unpin(UnpinOutcome::Unpinned)) => report.unpinned += 1,
                Ok(HashDone::Unpin(UnpinOutcome::NotPinned)) => report.not_pinned += 1,
                Ok(HashDone::Shared) => report.shared += 1,
                Err(e) => {
                    tracing::warn!(
                        target: "torii_pin::etl::driver",
                        scope = %scope,
                        hash = %hash,
                        error = %format!("{e:#}"),
                        "Hash left for the next cycle"
                    );
                    report.failed.push((hash, format!("{e:#}")));
                }
            }
        }

        ApplyOutcome::Applied(report)
    }

    async fn run(&self, scope: &PinScope, op: HashOp) -> (Bytes32, anyhow::Result<HashDone>) {
        match op {
            HashOp::Pin(hash, source) => {
                let _guard = self.lock_hash(hash).await;
                (hash, self.pin_one(scope, hash, source).await)
            }
            HashOp::Unpin(hash) => {
                let _guard = self.lock_hash(hash).await;
                (hash, self.unpin_one(scope, hash).await)
            }
        }
    }

    async fn lock_hash(&self, hash: Bytes32) -> OwnedMutexGuard<()> {
        let lock = self
            .hash_locks
            .lock()
            .unwrap()
            .entry(hash)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop the locks nobody holds or waits for.
    fn release_idle_locks(&self) {
        self.hash_locks
            .lock()
            .unwrap()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    async fn pin_one(
        &self,
        scope: &PinScope,
        hash: Bytes32,
        source: EventRef,
    ) -> anyhow::Result<HashDone> {
        let multihash = bytes32_to_multihash(hash);
        let retry = &self.config.retry;

        let outcome = retry
            .execute(&format!("pin {multihash}"), || self.content.pin(&multihash))
            .await?;

        let record = PinRecord {
            scope: scope.clone(),
            hash,
            pinned_at: Utc::now(),
            source,
        };
        retry
            .execute(&format!("record {hash}"), || self.state.upsert(&record))
            .await?;

        tracing::debug!(
            target: "torii_pin::etl::driver",
            scope = %scope,
            hash = %hash,
            multihash = %multihash,
            ?outcome,
            "Pinned"
        );

        Ok(HashDone::Pin(outcome))
    }

    async fn unpin_one(&self, scope: &PinScope, hash: Bytes32) -> anyhow::Result<HashDone> {
        let multihash = bytes32_to_multihash(hash);
        let retry = &self.config.retry;

        let shared = retry
            .execute(&format!("lookup {hash}"), || self.state.held_elsewhere(scope, hash))
            .await?;

        let done = if shared {
            HashDone::Shared
        } else {
            HashDone::Unpin(
                retry
                    .execute(&format!("unpin {multihash}"), || self.content.unpin(&multihash))
                    .await?,
            )
        };

        retry
            .execute(&format!("forget {hash}"), || self.state.delete(scope, hash))
            .await?;

        tracing::debug!(
            target: "torii_pin::etl::driver",
            scope = %scope,
            hash = %hash,
            shared,
            "Unpinned"
        );

        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::sink::{MemoryContentStore, MemoryPinStore};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet, HashSet};
    use std::time::Duration;

    fn h(n: u8) -> Bytes32 {
        let mut bytes = [0u8; 32];
        bytes[31] = n;
        Bytes32::new(bytes)
    }

    fn source(block: u64) -> EventRef {
        EventRef {
            block_number: block,
            tx_index: 0,
            log_index: 0,
        }
    }

    fn scope() -> PinScope {
        PinScope::new("0xc0ffee", "0xsig")
    }

    fn setup(retry: RetryPolicy) -> (PinDriver, Arc<MemoryContentStore>, Arc<MemoryPinStore>) {
        let content = Arc::new(MemoryContentStore::new());
        let state = Arc::new(MemoryPinStore::new());
        let driver = PinDriver::new(
            content.clone(),
            state.clone(),
            PinDriverConfig {
                retry,
                concurrency: 4,
            },
        );
        (driver, content, state)
    }

    fn pin_diff(hashes: &[u8]) -> PinDiff {
        PinDiff {
            to_pin: hashes.iter().map(|n| (h(*n), source(u64::from(*n)))).collect(),
            to_unpin: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_pins_and_records() {
        let (driver, content, state) = setup(RetryPolicy::no_retry());

        let outcome = driver.apply(&scope(), &pin_diff(&[1, 2, 3])).await;
        let ApplyOutcome::Applied(report) = outcome else {
            panic!("expected an applied diff");
        };

        assert_eq!(report.pinned, 3);
        assert!(report.failed.is_empty());
        assert_eq!(state.len(), 3);
        assert!(content.is_pinned(&bytes32_to_multihash(h(2))));
        assert_eq!(state.get(&scope(), h(2)).unwrap().source.block_number, 2);
    }

    #[tokio::test]
    async fn test_applying_twice_is_idempotent() {
        let (driver, content, state) = setup(RetryPolicy::no_retry());
        let diff = PinDiff {
            to_pin: BTreeMap::from([(h(1), source(1)), (h(2), source(2))]),
            to_unpin: BTreeSet::from([h(9)]),
        };

        driver.apply(&scope(), &diff).await;
        let snapshot = state.list_active(&scope()).await.unwrap();
        let ApplyOutcome::Applied(second) = driver.apply(&scope(), &diff).await else {
            panic!("expected an applied diff");
        };

        assert_eq!(state.list_active(&scope()).await.unwrap(), snapshot);
        assert_eq!(second.already_pinned, 2);
        assert_eq!(second.not_pinned, 1);
        assert_eq!(content.pinned().len(), 2);
    }

    #[tokio::test]
    async fn test_unpin_removes_record_and_content() {
        let (driver, content, state) = setup(RetryPolicy::no_retry());
        driver.apply(&scope(), &pin_diff(&[1, 2])).await;

        let diff = PinDiff {
            to_pin: BTreeMap::new(),
            to_unpin: BTreeSet::from([h(1)]),
        };
        let ApplyOutcome::Applied(report) = driver.apply(&scope(), &diff).await else {
            panic!("expected an applied diff");
        };

        assert_eq!(report.unpinned, 1);
        assert_eq!(state.count_by_hash(&scope(), h(1)).await.unwrap(), 0);
        assert!(!content.is_pinned(&bytes32_to_multihash(h(1))));
        assert!(content.is_pinned(&bytes32_to_multihash(h(2))));
    }

    #[tokio::test]
    async fn test_shared_hash_stays_pinned_for_other_scope() {
        let (driver, content, state) = setup(RetryPolicy::no_retry());
        let other = PinScope::new("0xc0ffee", "0xother");

        driver.apply(&scope(), &pin_diff(&[1])).await;
        driver.apply(&other, &pin_diff(&[1])).await;

        let diff = PinDiff {
            to_pin: BTreeMap::new(),
            to_unpin: BTreeSet::from([h(1)]),
        };
        let ApplyOutcome::Applied(report) = driver.apply(&scope(), &diff).await else {
            panic!("expected an applied diff");
        };

        assert_eq!(report.shared, 1);
        assert_eq!(content.unpin_calls(), 0);
        assert!(content.is_pinned(&bytes32_to_multihash(h(1))));
        assert_eq!(state.count_by_hash(&scope(), h(1)).await.unwrap(), 0);
        assert_eq!(state.count_by_hash(&other, h(1)).await.unwrap(), 1);
    }

    /// Pin state whose writes land late, leaving a window between the content pin and its record.
    struct LateUpsertStore {
        inner: MemoryPinStore,
        delay: Duration,
    }

    #[async_trait]
    impl PinStateStore for LateUpsertStore {
        async fn upsert(&self, record: &PinRecord) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.upsert(record).await
        }

        async fn delete(&self, scope: &PinScope, hash: Bytes32) -> anyhow::Result<()> {
            self.inner.delete(scope, hash).await
        }

        async fn count_by_hash(&self, scope: &PinScope, hash: Bytes32) -> anyhow::Result<u64> {
            self.inner.count_by_hash(scope, hash).await
        }

        async fn list_active(&self, scope: &PinScope) -> anyhow::Result<HashSet<Bytes32>> {
            self.inner.list_active(scope).await
        }

        async fn held_elsewhere(&self, scope: &PinScope, hash: Bytes32) -> anyhow::Result<bool> {
            self.inner.held_elsewhere(scope, hash).await
        }
    }

    fn late_upsert_setup() -> (PinDriver, Arc<MemoryContentStore>, Arc<LateUpsertStore>) {
        let content = Arc::new(MemoryContentStore::new());
        let state = Arc::new(LateUpsertStore {
            inner: MemoryPinStore::new(),
            delay: Duration::from_millis(100),
        });
        let driver = PinDriver::new(
            content.clone(),
            state.clone(),
            PinDriverConfig {
                retry: RetryPolicy::no_retry(),
                concurrency: 4,
            },
        );
        (driver, content, state)
    }

    fn unpin_diff(hashes: &[u8]) -> PinDiff {
        PinDiff {
            to_pin: BTreeMap::new(),
            to_unpin: hashes.iter().map(|n| h(*n)).collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_scopes_sharing_a_hash_keep_it_pinned() {
        let (driver, content, state) = late_upsert_setup();
        let other = PinScope::new("0xc0ffee", "0xother");
        driver.apply(&scope(), &pin_diff(&[1])).await;

        // `other` starts pinning the hash while `scope()` retires it.
        let (scope_a, pin_a, unpin_a) = (scope(), pin_diff(&[1]), unpin_diff(&[1]));
        let (pinned, retired) = tokio::join!(
            driver.apply(&other, &pin_a),
            driver.apply(&scope_a, &unpin_a)
        );
        let ApplyOutcome::Applied(pinned) = pinned else {
            panic!("expected an applied diff");
        };
        let ApplyOutcome::Applied(retired) = retired else {
            panic!("expected an applied diff");
        };

        assert_eq!(pinned.already_pinned, 1);
        assert_eq!(retired.shared, 1);
        assert_eq!(content.unpin_calls(), 0);
        assert!(content.is_pinned(&bytes32_to_multihash(h(1))));
        assert_eq!(state.count_by_hash(&other, h(1)).await.unwrap(), 1);
        assert_eq!(state.count_by_hash(&scope(), h(1)).await.unwrap(), 0);
        assert!(driver.hash_locks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_after_concurrent_unpin_restores_content() {
        let (driver, content, state) = late_upsert_setup();
        let other = PinScope::new("0xc0ffee", "0xother");
        driver.apply(&scope(), &pin_diff(&[1])).await;

        let (scope_a, unpin_a, pin_a) = (scope(), unpin_diff(&[1]), pin_diff(&[1]));
        let (retired, pinned) = tokio::join!(
            driver.apply(&scope_a, &unpin_a),
            driver.apply(&other, &pin_a)
        );
        let ApplyOutcome::Applied(retired) = retired else {
            panic!("expected an applied diff");
        };
        let ApplyOutcome::Applied(pinned) = pinned else {
            panic!("expected an applied diff");
        };

        assert_eq!(retired.unpinned, 1);
        assert_eq!(pinned.pinned, 1);
        assert!(content.is_pinned(&bytes32_to_multihash(h(1))));
        assert_eq!(state.count_by_hash(&other, h(1)).await.unwrap(), 1);
        assert_eq!(state.count_by_hash(&scope(), h(1)).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (driver, content, state) = setup(RetryPolicy::new(
            3,
            Duration::from_millis(10),
            Duration::from_millis(40),
            2.0,
        ));
        content.fail_next(2);

        let ApplyOutcome::Applied(report) = driver.apply(&scope(), &pin_diff(&[1])).await else {
            panic!("expected an applied diff");
        };

        assert_eq!(report.pinned, 1);
        assert_eq!(content.pin_calls(), 3);
        assert_eq!(state.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_hash_does_not_abort_diff() {
        let (driver, content, state) = setup(RetryPolicy::no_retry());
        content.fail_next(1);

        let ApplyOutcome::Applied(report) = driver.apply(&scope(), &pin_diff(&[1, 2, 3])).await
        else {
            panic!("expected an applied diff");
        };

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.pinned, 2);
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_application_is_skipped() {
        let (driver, _content, _state) = setup(RetryPolicy::no_retry());
        let _ticket = driver.in_flight.try_begin(&scope()).unwrap();

        assert_eq!(
            driver.apply(&scope(), &pin_diff(&[1])).await,
            ApplyOutcome::Skipped
        );
    }
}
