//! Ingestion queue: persisted items, the retry state machine, the
//! deduplication gate and the scheduler that drives them.

pub mod dedup;
pub mod model;
pub mod poller;
pub mod processor;

pub use dedup::{DedupGate, DedupKey, LruDedupGate};
pub use model::{QueueItem, QueueStats, QueueStatus, StaleReset};
pub use poller::{Clock, ManualClock, Poller, PollerHandle, SystemClock};
pub use processor::{ItemOutcome, ProcessorSettings, QueueProcessor};
