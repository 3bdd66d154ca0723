//! In-memory event history, for tests and dry runs.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::RwLock;

use super::EventSource;
use crate::etl::event::{PinScope, RawLog};

/// Append-only list of raw logs.
#[derive(Default)]
pub struct MemoryEventSource {
    logs: RwLock<Vec<RawLog>>,
}

impl MemoryEventSource {
    pub fn new(logs: Vec<RawLog>) -> Self {
        Self {
            logs: RwLock::new(logs),
        }
    }

    pub fn extend(&self, logs: impl IntoIterator<Item = RawLog>) {
        self.logs.write().unwrap().extend(logs);
    }

    /// Append a removal marker for the log at `(block, tx, index)` of `scope`.
    ///
    /// Returns false if no such log was recorded.
    pub fn mark_removed(&self, scope: &PinScope, block_number: u64, tx_index: u64, log_index: u64) -> bool {
        let mut logs = self.logs.write().unwrap();
        let original = logs
            .iter()
            .find(|log| {
                PinScope::new(&log.address, &log.signature) == *scope
                    && log.block_number == block_number
                    && log.tx_index == tx_index
                    && log.log_index == log_index
            })
            .cloned();

        match original {
            Some(mut log) => {
                log.removed = true;
                logs.push(log);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.logs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn fetch(&self, scope: &PinScope) -> Result<Vec<RawLog>> {
        Ok(self
            .logs
            .read()
            .unwrap()
            .iter()
            .filter(|log| PinScope::new(&log.address, &log.signature) == *scope)
            .cloned()
            .collect())
    }
}
