//! Field node entry point

use std::sync::Arc;
use std::time::Duration;

use boot_guard::{FileBankStore, FileKvStore, RollbackManager, BOOT_NAMESPACE};
use clap::Parser;
use common::{Clock, EventSink, JsonFileEventLog, MonotonicClock, TracingEventSink};
use errors::NodeResult;
use tracing::info;

use fieldnode::bootstrap::{self, Args, ProcessControl, Startup};
use fieldnode::bus::SimulatedInverter;
use fieldnode::runtime::{self, Node};
use fieldnode::tasks::NodeTasks;
use fieldnode::uplink::LoggingUplink;
use fieldnode::{NodeConfig, RuntimeIntervals};

#[tokio::main(flavor = "current_thread")]
async fn main() -> NodeResult<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref())?;
    args.apply_to(&mut config);
    common::logging::init_with_config(config.logging.to_log_config())?;
    info!("fieldnode {} starting", env!("CARGO_PKG_VERSION"));

    // Validation mode: validate and exit
    if args.validate {
        config.validate()?;
        info!("Validation completed successfully");
        return Ok(());
    }

    let state_dir = &config.storage.state_dir;
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    // Simulated firmware download: reset loop state, then stage the image
    if args.stage_update {
        let mut manager = RollbackManager::new(
            FileKvStore::open(state_dir, BOOT_NAMESPACE)?,
            FileBankStore::open(config.storage.banks_path())?,
            clock,
            Arc::new(TracingEventSink),
        );
        manager.prepare_for_new_firmware()?;
        let slot = manager.firmware_mut().stage_update()?;
        info!("Firmware staged in {}, restart to boot it", slot);
        return Ok(());
    }

    let event_log = Arc::new(JsonFileEventLog::open(
        config.event_log_path(),
        config.event_log.max_bytes,
    )?);
    let events: Arc<dyn EventSink> = event_log.clone();

    let mut manager = RollbackManager::new(
        FileKvStore::open(state_dir, BOOT_NAMESPACE)?,
        FileBankStore::open(config.storage.banks_path())?,
        clock.clone(),
        events.clone(),
    );
    let device = config.device.clone();
    let mut bus =
        SimulatedInverter::with_sample_readings(device.slave_address, device.max_registers);
    let mut uplink = LoggingUplink::new();
    let mut system = ProcessControl::default();

    let report = match bootstrap::startup(
        &mut manager,
        &mut bus,
        &mut uplink,
        &config,
        events.as_ref(),
        &mut system,
        clock.now_ms(),
    )? {
        Startup::Ready(report) => report,
        Startup::Restart(decision) => {
            info!("Restart pending after {:?}", decision);
            return Ok(());
        },
    };

    let intervals = RuntimeIntervals::new();
    let tasks = NodeTasks::new(bus, uplink, manager, events, intervals.clone(), device)
        .with_event_log(event_log);
    let mut node = Node::new(report.scheduler, tasks, intervals, clock);

    runtime::run(&mut node, Duration::from_millis(config.intervals.loop_delay_ms)).await;
    info!("fieldnode stopped");
    Ok(())
}
