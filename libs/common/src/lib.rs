//! Shared runtime pieces for fieldnode services
//!
//! - logging bootstrap (console + rolling file)
//! - layered configuration loading
//! - monotonic millisecond clock
//! - named event sinks and the size-bounded event log
//! - shutdown signal handling

pub mod clock;
pub mod config;
pub mod events;
pub mod logging;
pub mod shutdown;

pub use clock::{elapsed_ms, Clock, ManualClock, Millis, MonotonicClock};
pub use config::load_config;
pub use events::{
    EventRecord, EventSink, JsonFileEventLog, MemoryEventLog, TracingEventSink,
    DEFAULT_EVENT_LOG_MAX_BYTES,
};

// Re-export common dependencies
pub use serde;
pub use serde_json;
pub use tokio;
