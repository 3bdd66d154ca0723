//! Torii Pin - keeps a content store's pin-set in sync with hash-lifecycle events.
//!
//! Contracts announce content hashes through events (`Added(hash)`, `Updated(newHash, oldHash)`,
//! ...). For every configured event type this crate folds the full event history, reorgs
//! included, into the set of hashes that should be pinned, diffs it against the persisted pin
//! state and applies the difference to the content store. Runs are scheduled per event type
//! with cron expressions.
//!
//! Storage and transport live in sibling crates (`torii-pin-storage`, `torii-pin-ipfs`); this
//! crate only depends on the [`etl::EventSource`], [`etl::ContentStore`] and
//! [`etl::PinStateStore`] traits.

pub mod etl;

// Re-export commonly used types for collaborator implementations
pub use async_trait::async_trait;
pub use tokio;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use etl::{
    ContentStore, ContractAbi, CycleReport, EventSource, EventTypeConfig, PinDriver,
    PinDriverConfig, PinStateStore, RetryPolicy, Scheduler,
};

/// Default cron expression: every five minutes.
pub const DEFAULT_SCHEDULE: &str = "*/5 * * * *";

/// Configuration for the pin service with injected collaborators.
pub struct PinServiceConfig {
    /// Contract emitting the hash-lifecycle events.
    pub contract_address: String,

    pub abi: ContractAbi,

    /// Event types to reconcile.
    pub event_types: Vec<EventTypeConfig>,

    /// Cron expression used by event types without their own schedule.
    pub default_schedule: String,

    pub source: Arc<dyn EventSource>,
    pub content: Arc<dyn ContentStore>,
    pub state: Arc<dyn PinStateStore>,

    pub driver: PinDriverConfig,

    /// Upper bound for reading history and pin state in one cycle, in seconds.
    pub io_timeout: u64,

    /// Graceful shutdown timeout in seconds (default: 30).
    ///
    /// On SIGINT/SIGTERM ticking stops and in-flight cycles get this long to finish.
    pub shutdown_timeout: u64,
}

impl PinServiceConfig {
    pub fn builder() -> PinServiceConfigBuilder {
        PinServiceConfigBuilder::new()
    }
}

/// Builder for [`PinServiceConfig`].
#[derive(Default)]
pub struct PinServiceConfigBuilder {
    contract_address: Option<String>,
    abi: Option<ContractAbi>,
    event_types: Vec<EventTypeConfig>,
    default_schedule: Option<String>,
    source: Option<Arc<dyn EventSource>>,
    content: Option<Arc<dyn ContentStore>>,
    state: Option<Arc<dyn PinStateStore>>,
    retry: Option<RetryPolicy>,
    concurrency: Option<usize>,
    io_timeout: Option<u64>,
    shutdown_timeout: Option<u64>,
}

impl PinServiceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contract_address(mut self, address: impl Into<String>) -> Self {
        self.contract_address = Some(address.into());
        self
    }

    pub fn abi(mut self, abi: ContractAbi) -> Self {
        self.abi = Some(abi);
        self
    }

    pub fn add_event_type(mut self, event_type: EventTypeConfig) -> Self {
        self.event_types.push(event_type);
        self
    }

    pub fn event_types(mut self, event_types: Vec<EventTypeConfig>) -> Self {
        self.event_types.extend(event_types);
        self
    }

    pub fn default_schedule(mut self, expr: impl Into<String>) -> Self {
        self.default_schedule = Some(expr.into());
        self
    }

    pub fn event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn content_store(mut self, content: Arc<dyn ContentStore>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn pin_state_store(mut self, state: Arc<dyn PinStateStore>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Maximum in-flight pin/unpin operations per diff (default: 8).
    pub fn pin_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn io_timeout(mut self, seconds: u64) -> Self {
        self.io_timeout = Some(seconds);
        self
    }

    /// Sets the graceful shutdown timeout in seconds. Default is 30 seconds.
    pub fn shutdown_timeout(mut self, seconds: u64) -> Self {
        self.shutdown_timeout = Some(seconds);
        self
    }

    /// Builds the configuration. Fails when a collaborator or the contract is missing.
    pub fn build(self) -> Result<PinServiceConfig> {
        let defaults = PinDriverConfig::default();

        Ok(PinServiceConfig {
            contract_address: self
                .contract_address
                .ok_or_else(|| anyhow::anyhow!("contract address is required"))?,
            abi: self
                .abi
                .ok_or_else(|| anyhow::anyhow!("contract ABI is required"))?,
            event_types: self.event_types,
            default_schedule: self
                .default_schedule
                .unwrap_or_else(|| DEFAULT_SCHEDULE.to_string()),
            source: self
                .source
                .ok_or_else(|| anyhow::anyhow!("event source is required"))?,
            content: self
                .content
                .ok_or_else(|| anyhow::anyhow!("content store is required"))?,
            state: self
                .state
                .ok_or_else(|| anyhow::anyhow!("pin state store is required"))?,
            driver: PinDriverConfig {
                retry: self.retry.unwrap_or(defaults.retry),
                concurrency: self.concurrency.unwrap_or(defaults.concurrency).max(1),
            },
            io_timeout: self.io_timeout.unwrap_or(120),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(30),
        })
    }
}

/// Builds the scheduler for `config`. Invalid event types are logged and left out.
pub fn build_scheduler(config: PinServiceConfig) -> Scheduler {
    let driver = Arc::new(PinDriver::new(config.content, config.state, config.driver));

    Scheduler::from_configs(
        &config.contract_address,
        &config.abi,
        &config.event_types,
        &config.default_schedule,
        config.source,
        driver,
        Duration::from_secs(config.io_timeout),
        Duration::from_secs(config.shutdown_timeout),
    )
}

/// Runs a single cycle for every event type and returns their reports.
pub async fn run_once(config: PinServiceConfig) -> Vec<(String, Result<CycleReport>)> {
    let scheduler = build_scheduler(config);
    tracing::info!(
        target: "torii_pin::main",
        "Running one cycle for {} event type(s)",
        scheduler.event_names().len()
    );
    scheduler.run_once().await
}

/// Starts the scheduler and runs until SIGINT/SIGTERM.
///
/// NOTE: The caller is responsible for initializing the tracing subscriber before calling this function.
pub async fn run(config: PinServiceConfig) -> Result<()> {
    let scheduler = build_scheduler(config);
    let scheduled = scheduler.event_names().len();
    let excluded = scheduler.excluded().len();

    if scheduled == 0 {
        anyhow::bail!("No valid event type to schedule ({excluded} excluded)");
    }
    tracing::info!(
        target: "torii_pin::main",
        "Starting Torii Pin with {} event type(s), {} excluded",
        scheduled,
        excluded
    );

    let shutdown_token = CancellationToken::new();
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_token.clone()));

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "torii_pin::main", "Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(target: "torii_pin::main", "Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!(target: "torii_pin::main", "Received SIGINT (Ctrl+C), initiating graceful shutdown...");
        }
        () = terminate => {
            tracing::info!(target: "torii_pin::main", "Received SIGTERM, initiating graceful shutdown...");
        }
    }

    shutdown_token.cancel();

    // The scheduler bounds its own drain with the shutdown timeout.
    if let Err(e) = scheduler_handle.await {
        tracing::error!(target: "torii_pin::main", "Scheduler panicked: {}", e);
    }

    tracing::info!(target: "torii_pin::main", "Torii Pin shutdown complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl::MemoryEventSource;
    use etl::sink::{MemoryContentStore, MemoryPinStore};

    #[test]
    fn test_builder_requires_collaborators() {
        let err = PinServiceConfig::builder()
            .contract_address("0x1")
            .abi(ContractAbi::default())
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("event source"));
    }

    #[test]
    fn test_builder_defaults() {
        let config = PinServiceConfig::builder()
            .contract_address("0x1")
            .abi(ContractAbi::default())
            .event_source(Arc::new(MemoryEventSource::default()))
            .content_store(Arc::new(MemoryContentStore::new()))
            .pin_state_store(Arc::new(MemoryPinStore::new()))
            .pin_concurrency(0)
            .build()
            .unwrap();

        assert_eq!(config.default_schedule, DEFAULT_SCHEDULE);
        assert_eq!(config.driver.concurrency, 1);
        assert_eq!(config.shutdown_timeout, 30);
    }
}
