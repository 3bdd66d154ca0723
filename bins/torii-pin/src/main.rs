//! Torii Pin - IPFS pin reconciliation for contract hash events
//!
//! # Usage
//!
//! ```bash
//! # Run on schedule against a local IPFS node
//! torii-pin --contract-address 0xabc... --abi-path abi.json --events-path events.json
//!
//! # Ingest logs, reconcile once and exit
//! torii-pin ... --import-logs logs.json --once
//!
//! # See what would be pinned without touching IPFS or the pin state
//! torii-pin ... --dry-run
//! ```

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use std::sync::Arc;
use torii_pin::etl::sink::{MemoryContentStore, MemoryPinStore};
use torii_pin::etl::{
    ContentStore, ContractAbi, EventSource, MemoryEventSource, PinStateStore, RawLog,
};
use torii_pin::PinServiceConfig;
use torii_pin_ipfs::{IpfsClient, IpfsConfig};
use torii_pin_storage::{PinStorage, TxLogStorage};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!(target: "torii_pin::main", "Starting Torii Pin");
    tracing::info!(target: "torii_pin::main", "Contract: {}", config.contract_address);
    tracing::info!(target: "torii_pin::main", "Database: {}", config.db_path);
    tracing::info!(target: "torii_pin::main", "IPFS API: {}", config.ipfs_url);

    let abi = ContractAbi::from_file(&config.abi_path).await?;
    let event_types = config::load_event_types(&config.events_path).await?;

    let history = Arc::new(TxLogStorage::new(&config.db_path)?);
    let imported = match &config.import_logs {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read logs: {path}"))?;
            let logs: Vec<RawLog> = serde_json::from_str(&json).context("Invalid logs file")?;
            tracing::info!(target: "torii_pin::main", "Read {} log(s) from {}", logs.len(), path);
            logs
        }
        None => Vec::new(),
    };

    // A dry run reads the stored history but keeps imported logs in memory.
    let source: Arc<dyn EventSource> = if config.dry_run {
        let source = MemoryEventSource::new(history.all_logs()?);
        source.extend(imported);
        Arc::new(source)
    } else {
        if !imported.is_empty() {
            let written = history.insert_logs(&imported)?;
            tracing::info!(target: "torii_pin::main", "Imported {} log(s)", written);
        }
        history
    };

    let (content, state): (Arc<dyn ContentStore>, Arc<dyn PinStateStore>) = if config.dry_run {
        tracing::info!(target: "torii_pin::main", "Dry run: using in-memory stores");
        (
            Arc::new(MemoryContentStore::new()),
            Arc::new(MemoryPinStore::new()),
        )
    } else {
        let ipfs = IpfsClient::new(IpfsConfig {
            api_url: config.ipfs_url.clone(),
            timeout: config.ipfs_timeout(),
        })?;
        match ipfs.version().await {
            Ok(version) => {
                tracing::info!(target: "torii_pin::main", "Connected to IPFS {}", version.version);
            }
            Err(e) => {
                tracing::warn!(target: "torii_pin::main", "IPFS node not reachable yet: {}", e);
            }
        }
        (Arc::new(ipfs), Arc::new(PinStorage::new(&config.db_path)?))
    };

    let service = PinServiceConfig::builder()
        .contract_address(&config.contract_address)
        .abi(abi)
        .event_types(event_types)
        .default_schedule(&config.default_schedule)
        .event_source(source)
        .content_store(content)
        .pin_state_store(state)
        .retry_policy(config.retry_policy())
        .pin_concurrency(config.pin_concurrency)
        .io_timeout(config.io_timeout)
        .shutdown_timeout(config.shutdown_timeout)
        .build()?;

    if !(config.once || config.dry_run) {
        return torii_pin::run(service).await;
    }

    let mut failed = false;
    for (event, result) in torii_pin::run_once(service).await {
        match result {
            Ok(report) => {
                let applied = report.applied.clone().unwrap_or_default();
                tracing::info!(
                    target: "torii_pin::main",
                    "{}: {} record(s), {} desired, +{} -{} ({} failed)",
                    event,
                    report.records,
                    report.desired,
                    applied.pinned,
                    applied.unpinned,
                    applied.failed.len()
                );
                failed |= !applied.failed.is_empty();
            }
            Err(e) => {
                tracing::error!(target: "torii_pin::main", "{}: cycle failed: {:#}", event, e);
                failed = true;
            }
        }
    }

    if failed {
        anyhow::bail!("One or more cycles did not complete cleanly");
    }
    Ok(())
}
