//! Configuration for the pin service

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use torii_pin::etl::{EventTypeConfig, RetryPolicy};

/// Torii Pin
///
/// Keeps an IPFS node's pins in sync with the hashes announced by contract events.
#[derive(Parser, Debug)]
#[command(name = "torii-pin")]
#[command(about = "Reconcile contract hash events into IPFS pins", long_about = None)]
pub struct Config {
    /// IPFS RPC API URL
    #[arg(long, env = "IPFS_API_URL", default_value = "http://127.0.0.1:5001")]
    pub ipfs_url: String,

    /// Timeout of a single IPFS request, in seconds
    #[arg(long, env = "IPFS_TIMEOUT", default_value = "60")]
    pub ipfs_timeout: u64,

    /// Database path for the event history and the pin state
    #[arg(long, env = "TORII_PIN_DB", default_value = "./torii-pin.db")]
    pub db_path: String,

    /// Contract emitting the hash events
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: String,

    /// Contract ABI JSON (bare array or `{ "abi": [...] }`)
    #[arg(long, env = "CONTRACT_ABI")]
    pub abi_path: String,

    /// Event types to reconcile
    ///
    /// JSON array of `{ "eventName", "newHashField", "oldHashField"?, "schedule"? }`.
    #[arg(long, env = "EVENTS_CONFIG")]
    pub events_path: String,

    /// Cron expression for event types without their own schedule
    #[arg(long, env = "DEFAULT_SCHEDULE", default_value = torii_pin::DEFAULT_SCHEDULE)]
    pub default_schedule: String,

    /// Maximum concurrent pin/unpin calls per cycle
    #[arg(long, default_value = "8")]
    pub pin_concurrency: usize,

    /// Retries per store call before the hash is reported as failed
    #[arg(long, default_value = "4")]
    pub max_retries: u32,

    /// Upper bound for reading history and pin state in one cycle, in seconds
    #[arg(long, default_value = "120")]
    pub io_timeout: u64,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value = "30")]
    pub shutdown_timeout: u64,

    /// Ingest raw logs (JSON array) into the history before starting
    #[arg(long)]
    pub import_logs: Option<String>,

    /// Run a single cycle per event type and exit
    #[arg(long)]
    pub once: bool,

    /// Run a single cycle against in-memory stores; nothing is pinned or written
    #[arg(long)]
    pub dry_run: bool,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn ipfs_timeout(&self) -> Duration {
        Duration::from_secs(self.ipfs_timeout)
    }
}

pub fn parse_event_types(json: &str) -> Result<Vec<EventTypeConfig>> {
    serde_json::from_str(json).context("Invalid event type configuration")
}

pub async fn load_event_types(path: &str) -> Result<Vec<EventTypeConfig>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read event type configuration: {path}"))?;
    parse_event_types(&json)
}
