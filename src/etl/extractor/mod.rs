//! Event history sources.
//!
//! A source answers one question: "give me every log recorded for this scope", removed logs
//! included. Order does not matter; the reconciler sorts by canonical key.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::etl::event::{PinScope, RawLog};

pub use memory::MemoryEventSource;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Every log recorded for `scope`.
    async fn fetch(&self, scope: &PinScope) -> Result<Vec<RawLog>>;
}
