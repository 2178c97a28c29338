//! Field node service
//!
//! Polls the inverter over the field bus, uploads readings, applies remote
//! register writes and interval changes, and keeps a freshly installed
//! firmware image on probation until its first successful upload.

pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod runtime;
pub mod tasks;
pub mod uplink;

/// Service name used for config files, env prefix and log files
pub const SERVICE_NAME: &str = "fieldnode";

pub use bootstrap::{startup, ProcessControl, Startup, StartupReport, SystemControl};
pub use config::{NodeConfig, RuntimeIntervals};
pub use runtime::Node;
pub use tasks::NodeTasks;
