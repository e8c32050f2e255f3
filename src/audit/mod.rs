//! Per-run audit trail: typed events, JSONL persistence, raw archive.

mod events;
mod logger;

pub use events::{ExecutionEvent, ExecutionEventType};
pub use logger::{read_event_log, ExecutionLogger};
