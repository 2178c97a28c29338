//! Node bootstrap
//!
//! Startup order:
//! 1. count the boot and roll back on a crash loop
//! 2. classify the running image (opens validation for a new one)
//! 3. field bus link check, checkpoint 1
//! 4. task table from configuration, checkpoint 2
//! 5. uplink connect, checkpoint 3
//!
//! The event log is opened by the caller before step 1 so boot-loop events
//! are persisted.

use std::path::PathBuf;
use std::time::Duration;

use boot_guard::{Decision, FirmwareStore, KvStore, RollbackManager, SlotState, ValidationStage};
use clap::Parser;
use common::{EventSink, Millis};
use errors::NodeResult;
use node_scheduler::TaskScheduler;
use tracing::{error, info, warn};

use crate::bus::BusTransport;
use crate::config::{IntervalConfig, NodeConfig};
use crate::tasks::task_specs;
use crate::uplink::Uplink;

/// Process exit code asking the supervisor for a restart
pub const RESTART_EXIT_CODE: i32 = 75;

/// Startup failure events
pub mod events {
    pub const BUS_INIT_FAIL: &str = "BUS_INIT_FAIL";
    pub const CONFIG_INIT_FAIL: &str = "CONFIG_INIT_FAIL";
    pub const UPLINK_INIT_FAIL: &str = "UPLINK_INIT_FAIL";
}

/// Command-line arguments for fieldnode
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fieldnode",
    version = env!("CARGO_PKG_VERSION"),
    about = "Field telemetry node",
    long_about = None
)]
pub struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Directory for the boot record, bank state and event log
    #[arg(short = 's', long)]
    pub state_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Validation mode - only validate configuration without starting the node
    #[arg(long)]
    pub validate: bool,

    /// Stage a firmware image in the alternate slot and exit
    #[arg(long)]
    pub stage_update: bool,
}

impl Args {
    /// Command-line values win over every configuration layer
    pub fn apply_to(&self, config: &mut NodeConfig) {
        if let Some(dir) = &self.state_dir {
            config.storage.state_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = Some(level.clone());
        }
    }
}

/// Device restart hook
pub trait SystemControl {
    fn restart(&mut self, reason: &str);
}

/// Restart by exiting; the supervisor starts the process again
#[derive(Debug, Clone)]
pub struct ProcessControl {
    delay: Duration,
}

impl ProcessControl {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ProcessControl {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl SystemControl for ProcessControl {
    fn restart(&mut self, reason: &str) {
        warn!("Restarting in {:?}: {}", self.delay, reason);
        std::thread::sleep(self.delay);
        std::process::exit(RESTART_EXIT_CODE);
    }
}

/// What startup brought up
#[derive(Debug)]
pub struct StartupReport {
    pub decision: Decision,
    /// `None` when the firmware store could not be read
    pub image_state: Option<SlotState>,
    pub bus_ready: bool,
    pub uplink_ready: bool,
    pub scheduler: TaskScheduler,
}

/// Result of the startup sequence
#[derive(Debug)]
pub enum Startup {
    /// A restart was requested and returned; nothing else was initialised
    Restart(Decision),
    Ready(StartupReport),
}

/// Run the startup sequence
///
/// Only a rollback stops the sequence. A failed rollback, an unreachable bus
/// or uplink and a bad task configuration are recorded and startup goes on
/// (the latter with default intervals).
pub fn startup<B, U, S, F>(
    manager: &mut RollbackManager<S, F>,
    bus: &mut B,
    uplink: &mut U,
    config: &NodeConfig,
    events: &dyn EventSink,
    system: &mut dyn SystemControl,
    now: Millis,
) -> NodeResult<Startup>
where
    B: BusTransport,
    U: Uplink,
    S: KvStore,
    F: FirmwareStore,
{
    // Boot loop detection
    let decision = manager.on_cold_boot();
    match &decision {
        Decision::Rollback { from, to } => {
            system.restart(&format!("rollback {} -> {}", from, to));
            return Ok(Startup::Restart(decision));
        },
        Decision::RollbackFailed { reason } => {
            error!("Continuing on the current image after failed rollback: {}", reason);
        },
        Decision::Continue { .. } => {},
    }

    // Firmware validation check
    let image_state = match manager.classify_running_image() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("Running image state unavailable: {}", e);
            None
        },
    };

    // Field bus
    let bus_ready = match bus.probe() {
        Ok(()) => {
            info!("Field bus link up");
            manager.checkpoint(ValidationStage::LinkEstablished);
            true
        },
        Err(e) => {
            warn!("Field bus link check failed: {}", e);
            events.record(events::BUS_INIT_FAIL, &e.to_string());
            false
        },
    };

    // Configuration
    let mut scheduler = match TaskScheduler::new(task_specs(&config.intervals)) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            warn!("Task configuration rejected, using defaults: {}", e);
            events.record(events::CONFIG_INIT_FAIL, &e.to_string());
            TaskScheduler::new(task_specs(&IntervalConfig::default()))?
        },
    };
    manager.checkpoint(ValidationStage::ConfigLoaded);

    // Uplink
    let uplink_ready = match uplink.connect() {
        Ok(()) => {
            manager.checkpoint(ValidationStage::UplinkReady);
            true
        },
        Err(e) => {
            warn!("Uplink initialization failed: {}", e);
            events.record(events::UPLINK_INIT_FAIL, &e.to_string());
            false
        },
    };

    // Tasks otherwise fire on the first pass
    if !config.intervals.fire_on_start {
        scheduler.reset_last_run(now);
    }

    info!(
        bus_ready,
        uplink_ready, "Startup complete, entering main loop"
    );
    Ok(Startup::Ready(StartupReport {
        decision,
        image_state,
        bus_ready,
        uplink_ready,
        scheduler,
    }))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::SimulatedInverter;
    use crate::tasks::names;
    use crate::uplink::LoggingUplink;
    use boot_guard::{MemoryFirmwareStore, MemoryKvStore, Slot, BOOT_NAMESPACE, KEY_BOOT_COUNT};
    use common::{ManualClock, MemoryEventLog};
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingControl {
        restarts: Vec<String>,
    }

    impl SystemControl for RecordingControl {
        fn restart(&mut self, reason: &str) {
            self.restarts.push(reason.to_string());
        }
    }

    fn manager(
        store: MemoryKvStore,
        firmware: MemoryFirmwareStore,
        events: &Arc<MemoryEventLog>,
    ) -> RollbackManager<MemoryKvStore, MemoryFirmwareStore> {
        RollbackManager::new(store, firmware, Arc::new(ManualClock::new(0)), events.clone())
    }

    #[test]
    fn test_healthy_startup_reaches_every_checkpoint() {
        let events = Arc::new(MemoryEventLog::new());
        let mut manager = manager(
            MemoryKvStore::new(BOOT_NAMESPACE),
            MemoryFirmwareStore::new(Slot::App1, SlotState::PendingVerify),
            &events,
        );
        let mut control = RecordingControl::default();

        let startup = startup(
            &mut manager,
            &mut SimulatedInverter::new(0x11, 10),
            &mut LoggingUplink::new(),
            &NodeConfig::default(),
            events.as_ref(),
            &mut control,
            0,
        )
        .unwrap();

        let Startup::Ready(report) = startup else {
            panic!("expected a ready node");
        };
        assert_eq!(report.decision, Decision::Continue { boot_count: 1 });
        assert_eq!(report.image_state, Some(SlotState::PendingVerify));
        assert!(report.bus_ready && report.uplink_ready);
        assert_eq!(
            manager.record().validation_stage,
            ValidationStage::UplinkReady
        );
        assert!(control.restarts.is_empty());
        assert!(events.names().is_empty());
    }

    #[test]
    fn test_boot_loop_requests_restart() {
        let events = Arc::new(MemoryEventLog::new());
        let mut store = MemoryKvStore::new(BOOT_NAMESPACE);
        store.put_int(KEY_BOOT_COUNT, 2).unwrap();
        let mut manager = manager(
            store,
            MemoryFirmwareStore::new(Slot::App1, SlotState::PendingVerify),
            &events,
        );
        let mut bus = SimulatedInverter::new(0x11, 10);
        let mut control = RecordingControl::default();

        let startup = startup(
            &mut manager,
            &mut bus,
            &mut LoggingUplink::new(),
            &NodeConfig::default(),
            events.as_ref(),
            &mut control,
            0,
        )
        .unwrap();

        assert!(matches!(
            startup,
            Startup::Restart(Decision::Rollback {
                from: Slot::App1,
                to: Slot::App0
            })
        ));
        assert_eq!(control.restarts, vec!["rollback app1 -> app0".to_string()]);
        assert_eq!(manager.firmware().next_boot(), Some(Slot::App0));
        assert_eq!(bus.transactions(), 0);
    }

    #[test]
    #[traced_test]
    fn test_failed_rollback_keeps_booting() {
        let events = Arc::new(MemoryEventLog::new());
        let mut store = MemoryKvStore::new(BOOT_NAMESPACE);
        store.put_int(KEY_BOOT_COUNT, 2).unwrap();
        let mut firmware = MemoryFirmwareStore::new(Slot::App0, SlotState::Valid);
        firmware.set_fail_set_boot(true);
        let mut manager = manager(store, firmware, &events);
        let mut control = RecordingControl::default();

        let startup = startup(
            &mut manager,
            &mut SimulatedInverter::new(0x11, 10),
            &mut LoggingUplink::new(),
            &NodeConfig::default(),
            events.as_ref(),
            &mut control,
            0,
        )
        .unwrap();

        let Startup::Ready(report) = startup else {
            panic!("expected a ready node");
        };
        assert!(matches!(report.decision, Decision::RollbackFailed { .. }));
        assert!(control.restarts.is_empty());
        assert!(logs_contain("Continuing on the current image after failed rollback"));
        assert!(events.contains("ROLLBACK_FAILED"));
    }

    #[test]
    fn test_unreachable_peers_are_recorded() {
        let events = Arc::new(MemoryEventLog::new());
        let mut manager = manager(
            MemoryKvStore::new(BOOT_NAMESPACE),
            MemoryFirmwareStore::new(Slot::App1, SlotState::PendingVerify),
            &events,
        );
        let mut bus = SimulatedInverter::new(0x11, 10);
        bus.set_online(false);
        let mut uplink = LoggingUplink::new();
        uplink.set_offline(true);

        let startup = startup(
            &mut manager,
            &mut bus,
            &mut uplink,
            &NodeConfig::default(),
            events.as_ref(),
            &mut RecordingControl::default(),
            0,
        )
        .unwrap();

        let Startup::Ready(report) = startup else {
            panic!("expected a ready node");
        };
        assert!(!report.bus_ready && !report.uplink_ready);
        assert_eq!(
            events.names(),
            vec![events::BUS_INIT_FAIL, events::UPLINK_INIT_FAIL]
        );
        assert_eq!(
            manager.record().validation_stage,
            ValidationStage::ConfigLoaded
        );
    }

    #[test]
    fn test_rejected_intervals_fall_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, "intervals:\n  upload_ms: 0\n").unwrap();
        let config = NodeConfig::load(Some(&path)).unwrap();

        let events = Arc::new(MemoryEventLog::new());
        let mut manager = manager(
            MemoryKvStore::new(BOOT_NAMESPACE),
            MemoryFirmwareStore::new(Slot::App1, SlotState::PendingVerify),
            &events,
        );
        let startup = startup(
            &mut manager,
            &mut SimulatedInverter::new(0x11, 10),
            &mut LoggingUplink::new(),
            &config,
            events.as_ref(),
            &mut RecordingControl::default(),
            0,
        )
        .unwrap();

        let Startup::Ready(report) = startup else {
            panic!("expected a ready node");
        };
        assert_eq!(events.names(), vec![events::CONFIG_INIT_FAIL]);
        let table = report.scheduler.table();
        assert_eq!(table.interval_of(names::UPLOAD), Some(15_000));
        assert_eq!(table.interval_of(names::COMMAND_RESULT), Some(15_000));
        assert_eq!(
            manager.record().validation_stage,
            ValidationStage::UplinkReady
        );
    }

    #[test]
    fn test_fire_on_start_controls_first_pass() {
        let events = Arc::new(MemoryEventLog::new());
        let mut config = NodeConfig::default();
        config.intervals.fire_on_start = false;
        let mut manager = manager(
            MemoryKvStore::new(BOOT_NAMESPACE),
            MemoryFirmwareStore::new(Slot::App0, SlotState::Valid),
            &events,
        );

        let Startup::Ready(report) = startup(
            &mut manager,
            &mut SimulatedInverter::new(0x11, 10),
            &mut LoggingUplink::new(),
            &config,
            events.as_ref(),
            &mut RecordingControl::default(),
            1_000,
        )
        .unwrap() else {
            panic!("expected a ready node");
        };

        let poll = report.scheduler.task(names::POLL).unwrap();
        assert_eq!(poll.last_run_ms(), Some(1_000));
        assert!(!poll.is_due(1_000));
    }

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "fieldnode",
            "--state-dir",
            "/tmp/node",
            "-l",
            "debug",
        ]);
        let mut config = NodeConfig::default();
        args.apply_to(&mut config);
        assert_eq!(config.storage.state_dir, PathBuf::from("/tmp/node"));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert!(!args.validate);
    }
}
