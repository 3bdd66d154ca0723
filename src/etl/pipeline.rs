//! One fetch -> decode -> reconcile -> apply cycle for a single event type.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;

use super::decoder::EventDecoder;
use super::event::PinScope;
use super::extractor::EventSource;
use super::reconcile::Reconciler;
use super::sink::{ApplyOutcome, ApplyReport, PinDriver};

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub event: String,
    /// Logs decoded into records.
    pub records: usize,
    /// Logs that could not be decoded and were ignored.
    pub undecodable: usize,
    /// Records dropped by reorg removals.
    pub cancelled: usize,
    pub desired: usize,
    pub to_pin: usize,
    pub to_unpin: usize,
    /// `None` when the cycle was skipped because another one was running.
    pub applied: Option<ApplyReport>,
}

impl CycleReport {
    pub fn skipped(event: &str) -> Self {
        Self {
            event: event.to_string(),
            ..Self::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.applied.is_none()
    }

    pub fn failed(&self) -> usize {
        self.applied.as_ref().map_or(0, |a| a.failed.len())
    }
}

/// Everything one event type needs to run a cycle. Collaborators are injected.
pub struct PinPipeline {
    decoder: EventDecoder,
    source: Arc<dyn EventSource>,
    driver: Arc<PinDriver>,
    reconciler: Reconciler,
    io_timeout: Duration,
}

impl PinPipeline {
    pub fn new(decoder: EventDecoder, source: Arc<dyn EventSource>, driver: Arc<PinDriver>) -> Self {
        Self {
            decoder,
            source,
            driver,
            reconciler: Reconciler::new(),
            io_timeout: Duration::from_secs(120),
        }
    }

    /// Upper bound for reading the history and the pin snapshot (retries included).
    /// Diff application is never cut short.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn event_name(&self) -> &str {
        self.decoder.event_name()
    }

    pub fn scope(&self) -> &PinScope {
        self.decoder.scope()
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let scope = self.decoder.scope();
        let retry = self.driver.retry_policy();

        let raws = tokio::time::timeout(
            self.io_timeout,
            retry.execute("fetch history", || self.source.fetch(scope)),
        )
        .await
        .map_err(|_| anyhow!("Fetching history for {scope} timed out"))??;

        let (records, undecodable) = self.decoder.decode_all(&raws);

        let persisted = tokio::time::timeout(
            self.io_timeout,
            retry.execute("list pins", || self.driver.state_store().list_active(scope)),
        )
        .await
        .map_err(|_| anyhow!("Listing pins for {scope} timed out"))??;

        let reconciliation = self.reconciler.reconcile(&records, &persisted);

        let mut report = CycleReport {
            event: self.event_name().to_string(),
            records: records.len(),
            undecodable,
            cancelled: reconciliation.cancelled,
            desired: reconciliation.desired.len(),
            to_pin: reconciliation.diff.to_pin.len(),
            to_unpin: reconciliation.diff.to_unpin.len(),
            applied: None,
        };

        match self.driver.apply(scope, &reconciliation.diff).await {
            ApplyOutcome::Applied(applied) => report.applied = Some(applied),
            ApplyOutcome::Skipped => return Ok(report),
        }

        tracing::info!(
            target: "torii_pin::etl::pipeline",
            event = %report.event,
            records = report.records,
            cancelled = report.cancelled,
            desired = report.desired,
            to_pin = report.to_pin,
            to_unpin = report.to_unpin,
            failed = report.failed(),
            "Cycle complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::decoder::{ContractAbi, EventAbi, EventInput};
    use crate::etl::event::RawLog;
    use crate::etl::extractor::MemoryEventSource;
    use crate::etl::retry::RetryPolicy;
    use crate::etl::sink::{MemoryContentStore, MemoryPinStore, PinDriverConfig, PinStateStore};
    use torii_pin_common::Bytes32;

    const ADDRESS: &str = "0xc0ffee";
    const SIGNATURE: &str = "0x5e7";

    fn abi() -> ContractAbi {
        let input = |name: &str, indexed| EventInput {
            name: name.to_string(),
            kind: "bytes32".to_string(),
            indexed,
        };
        ContractAbi::new(vec![EventAbi {
            name: "HashUpdated".to_string(),
            signature: SIGNATURE.to_string(),
            inputs: vec![input("newHash", false), input("oldHash", false)],
        }])
    }

    fn log(block: u64, new: u8, old: u8) -> RawLog {
        RawLog {
            address: ADDRESS.to_string(),
            signature: SIGNATURE.to_string(),
            args: vec!["0x0".to_string(), format!("{new:#x}"), format!("{old:#x}")],
            block_number: block,
            tx_index: 0,
            log_index: 0,
            removed: false,
            data_index_start: 0,
        }
    }

    fn h(n: u8) -> Bytes32 {
        Bytes32::from_hex(&format!("{n:#x}")).unwrap()
    }

    fn pipeline(source: Arc<MemoryEventSource>) -> (PinPipeline, Arc<MemoryPinStore>) {
        let state = Arc::new(MemoryPinStore::new());
        let driver = Arc::new(PinDriver::new(
            Arc::new(MemoryContentStore::new()),
            state.clone(),
            PinDriverConfig {
                retry: RetryPolicy::no_retry(),
                concurrency: 2,
            },
        ));
        let decoder =
            EventDecoder::new(ADDRESS, &abi(), "HashUpdated", "newHash", Some("oldHash")).unwrap();
        (PinPipeline::new(decoder, source, driver), state)
    }

    #[tokio::test]
    async fn test_cycle_pins_latest_hashes() {
        let source = Arc::new(MemoryEventSource::new(vec![log(1, 1, 0), log(2, 2, 1), log(3, 3, 0)]));
        let (pipeline, state) = pipeline(source);

        let report = pipeline.run_cycle().await.unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(report.desired, 2);
        assert_eq!(report.applied.unwrap().pinned, 2);

        let active = state.list_active(pipeline.scope()).await.unwrap();
        assert!(active.contains(&h(2)) && active.contains(&h(3)));
        assert!(!active.contains(&h(1)));
    }

    #[tokio::test]
    async fn test_reorg_between_cycles_is_corrected() {
        let source = Arc::new(MemoryEventSource::new(vec![log(1, 1, 0), log(2, 2, 1)]));
        let (pipeline, state) = pipeline(source.clone());
        pipeline.run_cycle().await.unwrap();

        assert!(source.mark_removed(pipeline.scope(), 2, 0, 0));
        let report = pipeline.run_cycle().await.unwrap();

        assert_eq!(report.cancelled, 2);
        let active = state.list_active(pipeline.scope()).await.unwrap();
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec![h(1)]);
    }

    #[tokio::test]
    async fn test_second_cycle_on_converged_state_is_empty() {
        let source = Arc::new(MemoryEventSource::new(vec![log(1, 1, 0)]));
        let (pipeline, _state) = pipeline(source);

        pipeline.run_cycle().await.unwrap();
        let report = pipeline.run_cycle().await.unwrap();
        assert_eq!(report.to_pin + report.to_unpin, 0);
        assert_eq!(report.applied, Some(ApplyReport::default()));
    }
}
