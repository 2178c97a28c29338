//! Unified error handling for fieldnode
//!
//! One error type shared by the scheduler, the rollback manager and the
//! device service, so failures carry a stable code and category all the way
//! to the event log.

use field_codec::FrameError;
use thiserror::Error;

// ============================================================================
// NodeError - Main error type
// ============================================================================

/// Main error type for all fieldnode crates
#[derive(Debug, Error)]
pub enum NodeError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Persistent Storage Errors
    // ======================================
    #[error("Storage error: {namespace}/{key}: {reason}")]
    Storage {
        namespace: String,
        key: String,
        reason: String,
    },

    #[error("Corrupt state file {path}: {reason}")]
    CorruptState { path: String, reason: String },

    // ======================================
    // Firmware Store Errors
    // ======================================
    #[error("Firmware store error: {operation}: {reason}")]
    Firmware { operation: String, reason: String },

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    #[error("Uplink error: {0}")]
    Uplink(String),

    // ======================================
    // Scheduler Errors
    // ======================================
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    // ======================================
    // Validation Errors
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    // ======================================
    // File & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using NodeError
pub type NodeResult<T> = Result<T, NodeError>;

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Storage,
    Firmware,
    Protocol,
    Network,
    Timeout,
    Scheduler,
    Validation,
    Internal,
    DataCorruption,
}

impl NodeError {
    /// Build a storage error for one key of a namespace
    pub fn storage(namespace: &str, key: &str, reason: impl ToString) -> Self {
        Self::Storage {
            namespace: namespace.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a firmware-store error for a named operation
    pub fn firmware(operation: &str, reason: impl ToString) -> Self {
        Self::Firmware {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Stable error code for logs and event records
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::CorruptState { .. } => "CORRUPT_STATE",
            Self::Firmware { .. } => "FIRMWARE_STORE_ERROR",
            Self::Frame(e) => e.code(),
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Uplink(_) => "UPLINK_ERROR",
            Self::UnknownTask(_) => "UNKNOWN_TASK",
            Self::Scheduler(_) => "SCHEDULER_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::Storage { .. } | Self::Io(_) => ErrorCategory::Storage,
            Self::CorruptState { .. } => ErrorCategory::DataCorruption,
            Self::Firmware { .. } => ErrorCategory::Firmware,
            Self::Frame(_) => ErrorCategory::Protocol,
            Self::Communication(_) | Self::Uplink(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::UnknownTask(_) | Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Serialization(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is worth retrying on a later cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Protocol
                | ErrorCategory::Storage
                | ErrorCategory::Firmware
        )
    }

    /// Get log level
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::DataCorruption | ErrorCategory::Firmware => {
                Level::ERROR
            },
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Protocol => {
                Level::WARN
            },
            ErrorCategory::Validation => Level::INFO,
            _ => Level::WARN,
        }
    }
}

// Conversion traits for common error types
impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<figment::Error> for NodeError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(format!("Failed to load configuration: {}", err))
    }
}
