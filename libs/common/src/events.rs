//! Named event recording
//!
//! Components report notable conditions (`BOOT_LOOP_DETECTED`,
//! `FIRMWARE_COMMITTED`, `CRC_FAILED`, ...) through an [`EventSink`]. Recording
//! never fails from the caller's point of view; sinks log their own errors.

use std::fs;
use std::path::{Path, PathBuf};

use errors::{NodeError, NodeResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Default size limit of the persistent event log
pub const DEFAULT_EVENT_LOG_MAX_BYTES: u64 = 50 * 1024;

/// Fewest events a size cleanup keeps
pub const MIN_RETAINED_EVENTS: usize = 5;

/// Destination for named events
pub trait EventSink: Send + Sync {
    fn record(&self, event: &str, context: &str);
}

/// One persisted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unix timestamp in milliseconds
    pub ts: i64,
    pub lvl: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx: Option<String>,
}

impl EventRecord {
    pub fn error(event: &str, context: &str) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            lvl: "ERROR".to_string(),
            msg: event.to_string(),
            ctx: (!context.is_empty()).then(|| context.to_string()),
        }
    }
}

/// Forwards events to `tracing` only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &str, context: &str) {
        error!(target: "event_log", event, context, "{}", event);
    }
}

/// In-memory event log
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<EventRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().clone()
    }

    /// Event names in recording order
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.msg.clone()).collect()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e.msg == event)
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.msg == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventLog {
    fn record(&self, event: &str, context: &str) {
        debug!(event, context, "Event recorded");
        self.events.lock().push(EventRecord::error(event, context));
    }
}

/// Size-bounded event log persisted as a JSON array
///
/// When the file grows past `max_bytes` the oldest half of the events is
/// dropped, keeping at least [`MIN_RETAINED_EVENTS`].
#[derive(Debug)]
pub struct JsonFileEventLog {
    path: PathBuf,
    max_bytes: u64,
    lock: Mutex<()>,
}

impl JsonFileEventLog {
    /// Open the log, creating an empty one when missing and resetting a corrupt one
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> NodeResult<Self> {
        let log = Self {
            path: path.into(),
            max_bytes,
            lock: Mutex::new(()),
        };

        if let Some(parent) = log.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let _guard = log.lock.lock();
        if !log.path.exists() {
            log.write_events(&[])?;
            info!("Event log created: {}", log.path.display());
        } else if let Err(e) = log.read_events() {
            warn!("Event log corrupt, resetting: {}", e);
            log.write_events(&[])?;
        }
        drop(_guard);

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn events(&self) -> NodeResult<Vec<EventRecord>> {
        let _guard = self.lock.lock();
        self.read_events()
    }

    pub fn event_count(&self) -> usize {
        self.events().map(|events| events.len()).unwrap_or(0)
    }

    pub fn file_size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn clear(&self) -> NodeResult<()> {
        let _guard = self.lock.lock();
        self.write_events(&[])?;
        info!("Event log cleared");
        Ok(())
    }

    /// Enforce the size limit; returns the number of events dropped
    pub fn cleanup(&self) -> NodeResult<usize> {
        let _guard = self.lock.lock();
        if self.file_size() <= self.max_bytes {
            return Ok(0);
        }

        let mut events = self.read_events()?;
        let removed = trim_oldest(&mut events);
        self.write_events(&events)?;
        info!(
            "Event log cleanup: removed {} events, {} remain",
            removed,
            events.len()
        );
        Ok(removed)
    }

    fn try_record(&self, event: &str, context: &str) -> NodeResult<()> {
        let _guard = self.lock.lock();
        let mut events = match self.read_events() {
            Ok(events) => events,
            Err(e) => {
                warn!("Event log unreadable, starting fresh: {}", e);
                Vec::new()
            },
        };
        events.push(EventRecord::error(event, context));

        let mut content = serde_json::to_vec(&events)?;
        if content.len() as u64 > self.max_bytes {
            let removed = trim_oldest(&mut events);
            debug!("Event log over {} bytes, dropped {}", self.max_bytes, removed);
            content = serde_json::to_vec(&events)?;
        }
        self.write_bytes(&content)
    }

    fn read_events(&self) -> NodeResult<Vec<EventRecord>> {
        let content = fs::read(&self.path)?;
        serde_json::from_slice(&content).map_err(|e| NodeError::CorruptState {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn write_events(&self, events: &[EventRecord]) -> NodeResult<()> {
        let content = serde_json::to_vec(events)?;
        self.write_bytes(&content)
    }

    // Temp file + rename so a crash never leaves a half-written array
    fn write_bytes(&self, content: &[u8]) -> NodeResult<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl EventSink for JsonFileEventLog {
    fn record(&self, event: &str, context: &str) {
        error!(target: "event_log", event, context, "{}", event);
        if let Err(e) = self.try_record(event, context) {
            warn!("Failed to persist event {}: {}", event, e);
        }
    }
}

/// Keep the newest half (at least [`MIN_RETAINED_EVENTS`]); returns how many were dropped
fn trim_oldest(events: &mut Vec<EventRecord>) -> usize {
    let keep = (events.len() / 2).max(MIN_RETAINED_EVENTS).min(events.len());
    let removed = events.len() - keep;
    events.drain(..removed);
    removed
}
