//! Contract ABI parsing (events only).
//!
//! Accepts either a bare JSON ABI array or a build artifact wrapping it under `"abi"`.
//! Event entries must carry their `signature` (topic hash); the pipeline never hashes names.

use anyhow::{Context, Result};
use serde::Deserialize;

/// One declared event input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventInput {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub indexed: bool,
}

/// Declared event layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventAbi {
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub inputs: Vec<EventInput>,
}

impl EventAbi {
    /// Inputs in on-chain encoding order: indexed inputs first, declaration order kept
    /// within each group.
    pub fn encoding_order(&self) -> Vec<&EventInput> {
        let mut sorted: Vec<&EventInput> = self.inputs.iter().collect();
        // sort_by_key is stable
        sorted.sort_by_key(|input| !input.indexed);
        sorted
    }

    /// Index of the first non-indexed input in declaration order.
    pub fn data_index_start(&self) -> usize {
        self.inputs
            .iter()
            .position(|input| !input.indexed)
            .unwrap_or(self.inputs.len())
    }
}

#[derive(Deserialize)]
struct AbiEntry {
    #[serde(rename = "type", default)]
    kind: String,
    name: Option<String>,
    signature: Option<String>,
    #[serde(default)]
    inputs: Vec<EventInput>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AbiDocument {
    Bare(Vec<AbiEntry>),
    Artifact { abi: Vec<AbiEntry> },
}

/// Events declared by one contract.
#[derive(Debug, Clone, Default)]
pub struct ContractAbi {
    events: Vec<EventAbi>,
}

impl ContractAbi {
    pub fn new(events: Vec<EventAbi>) -> Self {
        Self { events }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: AbiDocument =
            serde_json::from_str(json).context("Failed to parse contract ABI")?;
        let entries = match document {
            AbiDocument::Bare(entries) | AbiDocument::Artifact { abi: entries } => entries,
        };

        let mut events = Vec::new();
        for entry in entries.into_iter().filter(|e| e.kind == "event") {
            let name = entry.name.context("ABI event entry without a name")?;
            let Some(signature) = entry.signature else {
                tracing::warn!(
                    target: "torii_pin::etl::decoder",
                    event = %name,
                    "ABI event has no signature, skipping"
                );
                continue;
            };
            events.push(EventAbi {
                name,
                signature,
                inputs: entry.inputs,
            });
        }

        Ok(Self { events })
    }

    pub async fn from_file(path: &str) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read ABI file: {path}"))?;
        Self::from_json(&json)
    }

    /// Event lookup by name, case-insensitive.
    pub fn event(&self, name: &str) -> Option<&EventAbi> {
        self.events
            .iter()
            .find(|event| event.name.eq_ignore_ascii_case(name))
    }

    pub fn events(&self) -> &[EventAbi] {
        &self.events
    }
}
