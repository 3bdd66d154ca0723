//! Reconciliation of an event history into a desired pin-set.
//!
//! The desired set is recomputed from the full history on every run. Nothing from a previous
//! run is trusted, because a reorg can retroactively invalidate any part of the history.
//!
//! # Fold
//!
//! 1. Collect the identities of all `removed` records; every record with one of those identities
//!    is dropped (the removal and the log it cancels).
//! 2. Sort the survivors by canonical key `(block_number, tx_index, log_index)`.
//! 3. Walk left to right: an `old_hash` that is currently active leaves the set, then the
//!    `new_hash` enters it (a no-op when already present).
//!
//! The diff against the persisted snapshot is `to_pin = desired - persisted` and
//! `to_unpin = persisted - desired`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use torii_pin_common::Bytes32;

use super::event::{CanonicalKey, EventRecord, EventRef};

/// Desired hashes, each with the event that (last) introduced it.
pub type DesiredSet = BTreeMap<Bytes32, EventRef>;

/// Work for the pin driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinDiff {
    pub to_pin: BTreeMap<Bytes32, EventRef>,
    pub to_unpin: BTreeSet<Bytes32>,
}

impl PinDiff {
    pub fn is_empty(&self) -> bool {
        self.to_pin.is_empty() && self.to_unpin.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_pin.len() + self.to_unpin.len()
    }
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub desired: DesiredSet,
    pub diff: PinDiff,
    /// Records dropped because a reorg removed them (removal markers included).
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// Fold a history into the set of hashes that should be pinned.
    pub fn materialize(&self, records: &[EventRecord]) -> DesiredSet {
        self.fold(records).0
    }

    /// Compute the desired set and its diff against `persisted`.
    pub fn reconcile(&self, records: &[EventRecord], persisted: &HashSet<Bytes32>) -> Reconciliation {
        let (desired, cancelled) = self.fold(records);
        let diff = self.diff(&desired, persisted);

        tracing::debug!(
            target: "torii_pin::etl::reconcile",
            records = records.len(),
            cancelled,
            desired = desired.len(),
            persisted = persisted.len(),
            to_pin = diff.to_pin.len(),
            to_unpin = diff.to_unpin.len(),
            "Reconciled history"
        );

        Reconciliation {
            desired,
            diff,
            cancelled,
        }
    }

    pub fn diff(&self, desired: &DesiredSet, persisted: &HashSet<Bytes32>) -> PinDiff {
        let to_pin = desired
            .iter()
            .filter(|(hash, _)| !persisted.contains(*hash))
            .map(|(hash, source)| (*hash, *source))
            .collect();

        let to_unpin = persisted
            .iter()
            .filter(|hash| !desired.contains_key(*hash))
            .copied()
            .collect();

        PinDiff { to_pin, to_unpin }
    }

    fn fold(&self, records: &[EventRecord]) -> (DesiredSet, usize) {
        let removed: HashSet<CanonicalKey> = records
            .iter()
            .filter(|record| record.removed)
            .map(|record| record.key)
            .collect();

        let mut live: Vec<&EventRecord> = records
            .iter()
            .filter(|record| !removed.contains(&record.key))
            .collect();
        let cancelled = records.len() - live.len();

        // Hashes are part of the sort so duplicate identities resolve the same way whatever
        // order the history arrived in.
        live.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then_with(|| a.new_hash.cmp(&b.new_hash))
                .then_with(|| a.old_hash.cmp(&b.old_hash))
        });
        live.dedup_by_key(|record| record.key);

        let mut active = DesiredSet::new();
        for record in live {
            if let Some(old) = record.old_hash {
                // Only a hash that is currently active can be superseded.
                active.remove(&old);
            }
            if let Some(new) = record.new_hash {
                active.entry(new).or_insert_with(|| record.source());
            }
        }

        (active, cancelled)
    }
}
