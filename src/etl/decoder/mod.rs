pub mod abi;

use torii_pin_common::{Bytes32, HashError};

use super::event::{CanonicalKey, EventRecord, PinScope, RawLog};

pub use abi::{ContractAbi, EventAbi, EventInput};

/// Decoding failures.
///
/// `UnknownEvent` and `MissingField` are configuration errors: they are raised once, when the
/// decoder is built, and exclude the event type from scheduling. `MalformedArgument` is per log.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Event '{0}' is not declared in the contract ABI")]
    UnknownEvent(String),
    #[error("Field '{field}' is not an input of event '{event}'")]
    MissingField { event: String, field: String },
    #[error("Log {key} has no argument at position {position}")]
    MissingArgument { key: CanonicalKey, position: usize },
    #[error("Log {key} has a malformed hash at position {position}: {source}")]
    MalformedArgument {
        key: CanonicalKey,
        position: usize,
        #[source]
        source: HashError,
    },
    #[error("Log {key} belongs to {actual}, decoder is bound to {expected}")]
    ScopeMismatch {
        key: CanonicalKey,
        expected: PinScope,
        actual: PinScope,
    },
}

/// Argument positions of the hash fields, resolved once per event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    /// Position of the new hash inside `RawLog::args`.
    pub new_hash_position: usize,
    /// Position of the superseded hash, when the event carries one.
    pub old_hash_position: Option<usize>,
    pub data_index_start: usize,
}

impl FieldLayout {
    /// Resolve field names against the indexed-first input order.
    pub fn resolve(
        event: &EventAbi,
        new_hash_field: &str,
        old_hash_field: Option<&str>,
    ) -> Result<Self, DecodeError> {
        let order = event.encoding_order();
        let position_of = |field: &str| {
            order
                .iter()
                .position(|input| input.name == field)
                // args[0] is the topic slot
                .map(|index| index + 1)
                .ok_or_else(|| DecodeError::MissingField {
                    event: event.name.clone(),
                    field: field.to_string(),
                })
        };

        Ok(Self {
            new_hash_position: position_of(new_hash_field)?,
            old_hash_position: old_hash_field.map(position_of).transpose()?,
            data_index_start: event.data_index_start(),
        })
    }
}

/// Turns raw logs of one event type into canonical [`EventRecord`]s.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    event_name: String,
    scope: PinScope,
    layout: FieldLayout,
}

impl EventDecoder {
    /// Build a decoder for `event_name` of the contract at `address`.
    pub fn new(
        address: &str,
        abi: &ContractAbi,
        event_name: &str,
        new_hash_field: &str,
        old_hash_field: Option<&str>,
    ) -> Result<Self, DecodeError> {
        let event = abi
            .event(event_name)
            .ok_or_else(|| DecodeError::UnknownEvent(event_name.to_string()))?;
        let layout = FieldLayout::resolve(event, new_hash_field, old_hash_field)?;

        tracing::debug!(
            target: "torii_pin::etl::decoder",
            event = %event.name,
            new_hash_position = layout.new_hash_position,
            old_hash_position = ?layout.old_hash_position,
            "Resolved hash field layout"
        );

        Ok(Self {
            event_name: event.name.clone(),
            scope: PinScope::new(address, &event.signature),
            layout,
        })
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn scope(&self) -> &PinScope {
        &self.scope
    }

    pub fn layout(&self) -> FieldLayout {
        self.layout
    }

    /// Decode one raw log.
    ///
    /// Removed logs only need their identity, so their hash arguments are read leniently.
    pub fn decode(&self, raw: &RawLog) -> Result<EventRecord, DecodeError> {
        let key = CanonicalKey::new(raw.block_number, raw.tx_index, raw.log_index);

        let scope = PinScope::new(&raw.address, &raw.signature);
        if scope != self.scope {
            return Err(DecodeError::ScopeMismatch {
                key,
                expected: self.scope.clone(),
                actual: scope,
            });
        }

        let (new_hash, old_hash) = if raw.removed {
            (
                self.read_hash(raw, key, self.layout.new_hash_position)
                    .ok()
                    .flatten(),
                self.layout
                    .old_hash_position
                    .and_then(|position| self.read_hash(raw, key, position).ok().flatten()),
            )
        } else {
            let new_hash = self.read_hash(raw, key, self.layout.new_hash_position)?;
            let old_hash = match self.layout.old_hash_position {
                Some(position) => self.read_hash(raw, key, position)?,
                None => None,
            };
            (new_hash, old_hash)
        };

        Ok(EventRecord {
            scope,
            args: raw.args.clone(),
            key,
            removed: raw.removed,
            new_hash,
            old_hash,
            data_index_start: self.layout.data_index_start,
        })
    }

    /// Decode a history, skipping (and logging) logs that cannot be decoded.
    pub fn decode_all(&self, raws: &[RawLog]) -> (Vec<EventRecord>, usize) {
        let mut records = Vec::with_capacity(raws.len());
        let mut skipped = 0;

        for raw in raws {
            match self.decode(raw) {
                Ok(record) => records.push(record),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        target: "torii_pin::etl::decoder",
                        event = %self.event_name,
                        error = %e,
                        "Skipping undecodable log"
                    );
                }
            }
        }

        (records, skipped)
    }

    fn read_hash(
        &self,
        raw: &RawLog,
        key: CanonicalKey,
        position: usize,
    ) -> Result<Option<Bytes32>, DecodeError> {
        let value = raw
            .args
            .get(position)
            .ok_or(DecodeError::MissingArgument { key, position })?;
        let hash = Bytes32::from_hex(value).map_err(|source| DecodeError::MalformedArgument {
            key,
            position,
            source,
        })?;
        Ok((!hash.is_zero()).then_some(hash))
    }
}
