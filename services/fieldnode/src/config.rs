//! Node configuration
//!
//! Static settings come from figment layers (defaults, config files,
//! `FIELDNODE_*` environment). Interval overrides pushed by the cloud in
//! upload acknowledgements live in [`RuntimeIntervals`] and are picked up by
//! the scheduler on every tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::logging::LogConfig;
use common::{Millis, DEFAULT_EVENT_LOG_MAX_BYTES};
use errors::{NodeError, NodeResult};
use field_codec::RegisterLimits;
use node_scheduler::IntervalProvider;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::uplink::UploadAck;
use crate::SERVICE_NAME;

/// Configuration key read by the poll task
pub const SAMPLE_KEY: &str = "sample";
/// Configuration key read by the upload task
pub const UPLOAD_KEY: &str = "upload";

/// Root configuration for the field node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device: DeviceConfig,
    pub intervals: IntervalConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub event_log: EventLogConfig,
}

/// Attached inverter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Modbus slave address (1-247)
    pub slave_address: u8,
    pub poll_start_register: u16,
    pub poll_register_count: u16,
    pub max_registers: u16,
    /// Register holding the export power limit in percent
    pub export_power_register: u16,
    pub export_power_min: u16,
    pub export_power_max: u16,
    /// Samples kept while the uplink is unreachable; oldest are dropped first
    pub max_buffered_samples: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let limits = RegisterLimits::default();
        Self {
            slave_address: 0x11,
            poll_start_register: 0,
            poll_register_count: limits.max_registers,
            max_registers: limits.max_registers,
            export_power_register: limits.export_power_register,
            export_power_min: limits.export_power_min,
            export_power_max: limits.export_power_max,
            max_buffered_samples: 64,
        }
    }
}

impl DeviceConfig {
    pub fn register_limits(&self) -> RegisterLimits {
        RegisterLimits {
            max_registers: self.max_registers,
            export_power_register: self.export_power_register,
            export_power_min: self.export_power_min,
            export_power_max: self.export_power_max,
        }
    }
}

/// Default task intervals in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub sample_ms: Millis,
    pub upload_ms: Millis,
    pub event_log_cleanup_ms: Millis,
    /// Pause between scheduler passes
    pub loop_delay_ms: u64,
    /// Every task is due on the first pass after startup
    pub fire_on_start: bool,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            sample_ms: 5_000,
            upload_ms: 15_000,
            event_log_cleanup_ms: 3_600_000,
            loop_delay_ms: 100,
            fire_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the boot record and the firmware bank state
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
        }
    }
}

impl StorageConfig {
    pub fn banks_path(&self) -> PathBuf {
        self.state_dir.join("banks.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` wins when set
    pub level: Option<String>,
    pub dir: PathBuf,
    pub file: bool,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            dir: PathBuf::from("logs"),
            file: false,
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            service_name: SERVICE_NAME.to_string(),
            log_dir: self.dir.clone(),
            level: self.level.clone(),
            enable_file: self.file,
            enable_json: self.json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Defaults to `events.json` in the state directory
    pub path: Option<PathBuf>,
    pub max_bytes: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_bytes: DEFAULT_EVENT_LOG_MAX_BYTES,
        }
    }
}

impl NodeConfig {
    /// Load from all layers and validate
    pub fn load(explicit_path: Option<&Path>) -> NodeResult<Self> {
        let config: Self = common::load_config(SERVICE_NAME, explicit_path)?;
        config.validate_base()?;
        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.event_log
            .path
            .clone()
            .unwrap_or_else(|| self.storage.state_dir.join("events.json"))
    }

    /// Full check, as run by `--validate`
    pub fn validate(&self) -> NodeResult<()> {
        self.validate_base()?;
        self.intervals.validate()
    }

    /// Everything except task intervals
    ///
    /// Intervals are checked when the task table is built at startup, where
    /// a rejected table falls back to the default intervals.
    pub fn validate_base(&self) -> NodeResult<()> {
        let device = &self.device;
        if !(1..=247).contains(&device.slave_address) {
            return Err(invalid(
                "device.slave_address",
                format!("{} is not a unicast Modbus address", device.slave_address),
            ));
        }
        if device.max_registers == 0 {
            return Err(invalid("device.max_registers", "must be at least 1"));
        }
        if !device
            .register_limits()
            .is_valid_read(device.poll_start_register, device.poll_register_count)
        {
            return Err(invalid(
                "device.poll_register_count",
                format!(
                    "read of {} from {} leaves the {}-register window",
                    device.poll_register_count, device.poll_start_register, device.max_registers
                ),
            ));
        }
        if device.export_power_min > device.export_power_max {
            return Err(invalid("device.export_power_min", "greater than export_power_max"));
        }
        if device.max_buffered_samples == 0 {
            return Err(invalid("device.max_buffered_samples", "must be at least 1"));
        }

        if self.intervals.loop_delay_ms == 0 {
            return Err(invalid("intervals.loop_delay_ms", "must be positive"));
        }

        if self.event_log.max_bytes == 0 {
            return Err(invalid("event_log.max_bytes", "must be positive"));
        }
        Ok(())
    }
}

impl IntervalConfig {
    pub fn validate(&self) -> NodeResult<()> {
        for (field, value) in [
            ("intervals.sample_ms", self.sample_ms),
            ("intervals.upload_ms", self.upload_ms),
            ("intervals.event_log_cleanup_ms", self.event_log_cleanup_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "interval must be positive"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> NodeError {
    NodeError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Default)]
struct RemoteIntervals {
    sample_ms: Option<Millis>,
    upload_ms: Option<Millis>,
}

/// Interval overrides received from the cloud
///
/// Uninitialised until the first acknowledgement that carries intervals, in
/// which case the scheduler keeps its configured defaults. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RuntimeIntervals {
    inner: Arc<RwLock<RemoteIntervals>>,
}

impl RuntimeIntervals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_ms(&self) -> Option<Millis> {
        self.inner.read().sample_ms
    }

    pub fn upload_ms(&self) -> Option<Millis> {
        self.inner.read().upload_ms
    }

    pub fn set_sample_ms(&self, ms: Millis) {
        self.inner.write().sample_ms = Some(ms);
    }

    pub fn set_upload_ms(&self, ms: Millis) {
        self.inner.write().upload_ms = Some(ms);
    }

    /// Take interval updates from an upload acknowledgement
    ///
    /// Returns true when anything changed. Zero values are stored as given;
    /// the scheduler ignores them and keeps the last good interval.
    pub fn apply(&self, ack: &UploadAck) -> bool {
        let mut inner = self.inner.write();
        let mut changed = false;
        if let Some(ms) = ack.sample_interval_ms {
            if inner.sample_ms != Some(ms) {
                info!("Sample interval update: {} ms", ms);
                inner.sample_ms = Some(ms);
                changed = true;
            }
        }
        if let Some(ms) = ack.upload_interval_ms {
            if inner.upload_ms != Some(ms) {
                info!("Upload interval update: {} ms", ms);
                inner.upload_ms = Some(ms);
                changed = true;
            }
        }
        changed
    }
}

impl IntervalProvider for RuntimeIntervals {
    fn interval_ms(&self, key: &str) -> Option<Millis> {
        let inner = self.inner.read();
        match key {
            SAMPLE_KEY => inner.sample_ms,
            UPLOAD_KEY => inner.upload_ms,
            _ => None,
        }
    }
}
