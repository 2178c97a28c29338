//! Typed boot record over a [`KvStore`]

use std::fmt;

use errors::NodeResult;

use crate::store::KvStore;

/// Namespace holding the boot record
pub const BOOT_NAMESPACE: &str = "boot";

pub const KEY_BOOT_COUNT: &str = "boot_count";
pub const KEY_VAL_STAGE: &str = "val_stage";
pub const KEY_VAL_START: &str = "val_start";

/// Progress of a new image through its first boot
///
/// Stored as an integer; `-1` means no validation episode is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationStage {
    Inactive,
    BootStarted,
    LinkEstablished,
    ConfigLoaded,
    UplinkReady,
}

impl ValidationStage {
    /// Negative values are `Inactive`; values past the last stage read as the last stage
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            r if r < 0 => Self::Inactive,
            0 => Self::BootStarted,
            1 => Self::LinkEstablished,
            2 => Self::ConfigLoaded,
            _ => Self::UplinkReady,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Inactive => -1,
            Self::BootStarted => 0,
            Self::LinkEstablished => 1,
            Self::ConfigLoaded => 2,
            Self::UplinkReady => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Inactive => "Validation inactive",
            Self::BootStarted => "Boot started",
            Self::LinkEstablished => "Link established",
            Self::ConfigLoaded => "Config loaded",
            Self::UplinkReady => "Uplink ready",
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Inactive
    }
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.as_raw())
    }
}

/// Persistent boot-loop and validation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRecord {
    /// Consecutive cold boots since the last reset
    pub boot_count: u32,
    pub validation_stage: ValidationStage,
    /// Clock reading when the validation episode began
    pub validation_started_ms: u64,
}

impl Default for BootRecord {
    fn default() -> Self {
        Self {
            boot_count: 0,
            validation_stage: ValidationStage::Inactive,
            validation_started_ms: 0,
        }
    }
}

impl BootRecord {
    pub fn load<S: KvStore + ?Sized>(store: &S) -> Self {
        Self {
            boot_count: store.get_int(KEY_BOOT_COUNT, 0).max(0) as u32,
            validation_stage: ValidationStage::from_raw(store.get_int(KEY_VAL_STAGE, -1)),
            validation_started_ms: store.get_ulong(KEY_VAL_START, 0),
        }
    }

    /// Write every field; stops at the first failing key
    pub fn save<S: KvStore + ?Sized>(&self, store: &mut S) -> NodeResult<()> {
        store.put_int(KEY_BOOT_COUNT, self.boot_count as i32)?;
        store.put_int(KEY_VAL_STAGE, self.validation_stage.as_raw())?;
        store.put_ulong(KEY_VAL_START, self.validation_started_ms)
    }

    pub fn is_validating(&self) -> bool {
        self.validation_stage.is_active()
    }
}
