//! Cron-driven cycles, one independent timer task per event type.
//!
//! Each event type owns a [`RunState`]. A tick that finds its type still `Running` is dropped;
//! the next tick recomputes everything anyway. Cycles run on their own tasks so a panic or an
//! error in one of them never reaches the tick loop or the other types.

use anyhow::{anyhow, Result};
use chrono::Utc;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::decoder::{ContractAbi, EventDecoder};
use super::extractor::EventSource;
use super::pipeline::{CycleReport, PinPipeline};
use super::run_state::RunState;
use super::sink::PinDriver;

/// One configured event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTypeConfig {
    pub event_name: String,
    pub new_hash_field: String,
    #[serde(default)]
    pub old_hash_field: Option<String>,
    /// Cron expression. Falls back to the scheduler default when absent.
    #[serde(default)]
    pub schedule: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// Parse a cron expression. Standard five-field expressions get a leading seconds field of `0`.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

struct Job {
    pipeline: Arc<PinPipeline>,
    schedule: Schedule,
    state: Arc<RunState>,
}

impl Job {
    /// Spawn a cycle unless one is already running for this type.
    fn trigger(&self) -> Option<JoinHandle<Result<CycleReport>>> {
        let ticket = self.state.try_begin()?;
        let pipeline = self.pipeline.clone();
        Some(tokio::spawn(async move {
            let _ticket = ticket;
            pipeline.run_cycle().await
        }))
    }
}

pub struct Scheduler {
    jobs: Vec<Job>,
    excluded: Vec<(String, String)>,
    shutdown_timeout: Duration,
}

impl Scheduler {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            excluded: Vec::new(),
            shutdown_timeout,
        }
    }

    /// Build one pipeline per event type. Types with configuration errors are logged and
    /// excluded; the others are scheduled normally.
    pub fn from_configs(
        address: &str,
        abi: &ContractAbi,
        configs: &[EventTypeConfig],
        default_schedule: &str,
        source: Arc<dyn EventSource>,
        driver: Arc<PinDriver>,
        io_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        let mut scheduler = Self::new(shutdown_timeout);

        for config in configs {
            let decoder = match EventDecoder::new(
                address,
                abi,
                &config.event_name,
                &config.new_hash_field,
                config.old_hash_field.as_deref(),
            ) {
                Ok(decoder) => decoder,
                Err(e) => {
                    scheduler.exclude(&config.event_name, e.to_string());
                    continue;
                }
            };

            let expr = config.schedule.as_deref().unwrap_or(default_schedule);
            let schedule = match parse_schedule(expr) {
                Ok(schedule) => schedule,
                Err(e) => {
                    scheduler.exclude(&config.event_name, e.to_string());
                    continue;
                }
            };

            scheduler.add(
                PinPipeline::new(decoder, source.clone(), driver.clone()).with_io_timeout(io_timeout),
                schedule,
            );
        }

        scheduler
    }

    pub fn add(&mut self, pipeline: PinPipeline, schedule: Schedule) {
        tracing::info!(
            target: "torii_pin::etl::scheduler",
            event = %pipeline.event_name(),
            scope = %pipeline.scope(),
            schedule = %schedule,
            "Scheduled event type"
        );
        self.jobs.push(Job {
            pipeline: Arc::new(pipeline),
            schedule,
            state: Arc::new(RunState::new()),
        });
    }

    fn exclude(&mut self, event: &str, reason: String) {
        tracing::error!(
            target: "torii_pin::etl::scheduler",
            event = %event,
            "Excluding event type from scheduling: {}",
            reason
        );
        self.excluded.push((event.to_string(), reason));
    }

    pub fn event_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.pipeline.event_name()).collect()
    }

    /// Event types rejected at configuration time, with the reason.
    pub fn excluded(&self) -> &[(String, String)] {
        &self.excluded
    }

    /// Run one cycle for every event type concurrently and wait for all of them.
    ///
    /// Types whose previous cycle is still running report a skipped cycle.
    pub async fn run_once(&self) -> Vec<(String, Result<CycleReport>)> {
        let handles: Vec<_> = self
            .jobs
            .iter()
            .map(|job| (job.pipeline.event_name().to_string(), job.trigger()))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (event, handle) in handles {
            let result = match handle {
                None => Ok(CycleReport::skipped(&event)),
                Some(handle) => join_cycle(handle).await,
            };
            if let Err(e) = &result {
                tracing::error!(
                    target: "torii_pin::etl::scheduler",
                    event = %event,
                    "Cycle failed: {:#}",
                    e
                );
            }
            results.push((event, result));
        }
        results
    }

    /// Tick every event type on its schedule until `shutdown` is cancelled, then wait (bounded by
    /// the shutdown timeout) for in-flight cycles to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        if self.jobs.is_empty() {
            tracing::warn!(target: "torii_pin::etl::scheduler", "No event types to schedule");
            return;
        }

        let loops: Vec<_> = self
            .jobs
            .into_iter()
            .map(|job| tokio::spawn(tick_loop(job, shutdown.clone())))
            .collect();

        let mut in_flight = Vec::new();
        for handle in loops {
            match handle.await {
                Ok(Some(cycle)) => in_flight.push(cycle),
                Ok(None) => {}
                Err(e) => tracing::error!(
                    target: "torii_pin::etl::scheduler",
                    "Tick loop terminated abnormally: {}",
                    e
                ),
            }
        }

        if in_flight.is_empty() {
            return;
        }

        tracing::info!(
            target: "torii_pin::etl::scheduler",
            "Waiting for {} in-flight cycle(s)",
            in_flight.len()
        );
        let drain = futures::future::join_all(in_flight);
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            tracing::warn!(
                target: "torii_pin::etl::scheduler",
                "In-flight cycles did not complete within {:?}",
                self.shutdown_timeout
            );
        }
    }
}

async fn join_cycle(handle: JoinHandle<Result<CycleReport>>) -> Result<CycleReport> {
    handle
        .await
        .map_err(|e| anyhow!("Cycle task failed: {e}"))?
}

/// Returns the handle of the cycle still running when shutdown was requested, if any.
async fn tick_loop(job: Job, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
    let event = job.pipeline.event_name().to_string();
    let mut current: Option<JoinHandle<()>> = None;
    // Ticks are computed after the last fired one so an early timer never fires a tick twice.
    let mut last = Utc::now();

    loop {
        let from = std::cmp::max(last, Utc::now());
        let Some(next) = job.schedule.after(&from).next() else {
            tracing::info!(
                target: "torii_pin::etl::scheduler",
                event = %event,
                "Schedule has no upcoming ticks"
            );
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
        last = next;

        let Some(handle) = job.trigger() else {
            tracing::warn!(
                target: "torii_pin::etl::scheduler",
                event = %event,
                "Previous cycle still running, dropping tick"
            );
            continue;
        };

        let event = event.clone();
        current = Some(tokio::spawn(async move {
            if let Err(e) = join_cycle(handle).await {
                tracing::error!(
                    target: "torii_pin::etl::scheduler",
                    event = %event,
                    "Cycle failed: {:#}",
                    e
                );
            }
        }));
    }

    current.filter(|handle| !handle.is_finished())
}
