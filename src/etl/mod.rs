pub mod decoder;
pub mod event;
pub mod extractor;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod run_state;
pub mod scheduler;
pub mod sink;

pub use decoder::{ContractAbi, DecodeError, EventDecoder, FieldLayout};
pub use event::{CanonicalKey, EventRecord, EventRef, PinScope, RawLog};
pub use extractor::{EventSource, MemoryEventSource};
pub use pipeline::{CycleReport, PinPipeline};
pub use reconcile::{PinDiff, Reconciler, Reconciliation};
pub use retry::RetryPolicy;
pub use run_state::{RunState, RunStates, RunTicket};
pub use scheduler::{EventTypeConfig, ScheduleError, Scheduler};
pub use sink::{
    ApplyOutcome, ApplyReport, ContentStore, PinDriver, PinDriverConfig, PinRecord,
    PinStateStore,
};
