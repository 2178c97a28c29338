//! Node lifecycle across restarts
//!
//! Every boot reopens the file-backed stores from the same state directory,
//! runs the startup sequence and drives the scheduler with a manual clock.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::path::Path;
use std::sync::Arc;

use boot_guard::{
    Decision, FileBankStore, FileKvStore, FirmwareStore, RollbackManager, Slot, SlotState,
    BOOT_NAMESPACE,
};
use common::{ManualClock, MemoryEventLog};
use fieldnode::bootstrap::{startup, Startup, SystemControl};
use fieldnode::bus::SimulatedInverter;
use fieldnode::config::NodeConfig;
use fieldnode::runtime::Node;
use fieldnode::tasks::{names, NodeTasks};
use fieldnode::uplink::{CommandStatus, LoggingUplink, UploadAck, WriteCommand};
use fieldnode::RuntimeIntervals;
use tempfile::TempDir;

type FileNode = Node<SimulatedInverter, LoggingUplink, FileKvStore, FileBankStore>;

#[derive(Default)]
struct RecordingControl {
    restarts: Vec<String>,
}

impl SystemControl for RecordingControl {
    fn restart(&mut self, reason: &str) {
        self.restarts.push(reason.to_string());
    }
}

struct Boot {
    decision: Decision,
    node: Option<FileNode>,
    clock: Arc<ManualClock>,
    restarts: Vec<String>,
}

fn config_for(dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.storage.state_dir = dir.to_path_buf();
    config
}

fn stage_update(dir: &Path) {
    let config = config_for(dir);
    let mut manager = RollbackManager::new(
        FileKvStore::open(dir, BOOT_NAMESPACE).unwrap(),
        FileBankStore::open(config.storage.banks_path()).unwrap(),
        Arc::new(ManualClock::new(0)),
        Arc::new(MemoryEventLog::new()),
    );
    manager.prepare_for_new_firmware().unwrap();
    manager.firmware_mut().stage_update().unwrap();
}

fn boot(dir: &Path, events: &Arc<MemoryEventLog>) -> Boot {
    let config = config_for(dir);
    let clock = Arc::new(ManualClock::new(0));
    let mut manager = RollbackManager::new(
        FileKvStore::open(dir, BOOT_NAMESPACE).unwrap(),
        FileBankStore::open(config.storage.banks_path()).unwrap(),
        clock.clone(),
        events.clone(),
    );
    let mut bus = SimulatedInverter::with_sample_readings(
        config.device.slave_address,
        config.device.max_registers,
    );
    let mut uplink = LoggingUplink::new();
    let mut control = RecordingControl::default();

    let outcome = startup(
        &mut manager,
        &mut bus,
        &mut uplink,
        &config,
        events.as_ref(),
        &mut control,
        0,
    )
    .unwrap();

    match outcome {
        Startup::Restart(decision) => Boot {
            decision,
            node: None,
            clock,
            restarts: control.restarts,
        },
        Startup::Ready(report) => {
            let intervals = RuntimeIntervals::new();
            let tasks = NodeTasks::new(
                bus,
                uplink,
                manager,
                events.clone(),
                intervals.clone(),
                config.device.clone(),
            );
            Boot {
                decision: report.decision,
                node: Some(Node::new(report.scheduler, tasks, intervals, clock.clone())),
                clock,
                restarts: control.restarts,
            }
        },
    }
}

fn running_state(node: &FileNode) -> SlotState {
    let firmware = node.tasks().manager().firmware();
    firmware.get_state(firmware.running_slot()).unwrap()
}

#[test]
fn first_successful_upload_commits_staged_image() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(MemoryEventLog::new());
    stage_update(dir.path());

    let mut first = boot(dir.path(), &events);
    assert_eq!(first.decision, Decision::Continue { boot_count: 1 });
    let node = first.node.as_mut().unwrap();
    assert_eq!(running_state(node), SlotState::PendingVerify);

    let report = node.tick();
    assert!(report.fired(names::POLL));
    assert!(report.fired(names::UPLOAD));
    assert_eq!(running_state(node), SlotState::Valid);
    assert_eq!(events.count("FIRMWARE_COMMITTED"), 1);

    // The commit survives a restart and the counter starts over
    drop(first);
    let banks = FileBankStore::open(dir.path().join("banks.json")).unwrap();
    assert_eq!(banks.running_slot(), Slot::App1);
    assert_eq!(banks.get_state(Slot::App1).unwrap(), SlotState::Valid);
    drop(banks);
    let again = boot(dir.path(), &events);
    assert_eq!(again.decision, Decision::Continue { boot_count: 1 });
}

#[test]
fn corrupted_polls_never_commit_and_the_image_is_rolled_back() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(MemoryEventLog::new());
    stage_update(dir.path());

    {
        let mut first = boot(dir.path(), &events);
        let node = first.node.as_mut().unwrap();
        for step in 0..4 {
            first.clock.set(step * 5_000);
            node.tasks_mut().bus_mut().corrupt_next_response();
            node.tick();
        }
        assert_eq!(node.tasks().stats().polls_failed, 4);
        assert!(node.tasks().uplink().uploads().is_empty());
        assert_eq!(running_state(node), SlotState::PendingVerify);
        assert!(!events.contains("FIRMWARE_COMMITTED"));
    }

    // The image keeps dying before a good upload
    let second = boot(dir.path(), &events);
    assert_eq!(second.decision, Decision::Continue { boot_count: 2 });
    drop(second);

    let third = boot(dir.path(), &events);
    assert_eq!(
        third.decision,
        Decision::Rollback {
            from: Slot::App1,
            to: Slot::App0
        }
    );
    assert!(third.node.is_none());
    assert_eq!(third.restarts.len(), 1);

    let recovered = boot(dir.path(), &events);
    let node = recovered.node.as_ref().unwrap();
    assert_eq!(node.tasks().manager().firmware().running_slot(), Slot::App0);
    assert_eq!(running_state(node), SlotState::Valid);
}

#[test]
fn write_command_result_is_reported_on_the_upload_cadence() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(MemoryEventLog::new());

    let mut running = boot(dir.path(), &events);
    let clock = running.clock.clone();
    let node = running.node.as_mut().unwrap();
    node.tasks_mut().uplink_mut().queue_ack(UploadAck {
        upload_interval_ms: Some(60_000),
        sample_interval_ms: None,
        command: Some(WriteCommand {
            register: 8,
            value: 40,
        }),
    });

    // Upload, write and report all happen in the first pass
    let report = node.tick();
    assert_eq!(
        report.fired,
        vec![
            names::POLL,
            names::UPLOAD,
            names::COMMAND_RESULT,
            names::EVENT_LOG_CLEANUP
        ]
    );
    assert_eq!(node.tasks().bus().register(8), Some(40));
    let reports = node.tasks().uplink().reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, CommandStatus::Success);
    assert!(!node.scheduler().table().is_enabled(names::COMMAND_RESULT));

    // The new upload interval reaches the coupled task on the next pass
    clock.set(15_000);
    let report = node.tick();
    assert!(!report.fired(names::UPLOAD));
    assert_eq!(node.scheduler().table().interval_of(names::UPLOAD), Some(60_000));
    assert_eq!(
        node.scheduler().table().interval_of(names::COMMAND_RESULT),
        Some(60_000)
    );

    clock.set(60_000);
    assert!(node.tick().fired(names::UPLOAD));
    assert_eq!(node.tasks().uplink().uploads().len(), 2);
}

#[test]
fn rejected_command_is_still_reported() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(MemoryEventLog::new());

    let mut running = boot(dir.path(), &events);
    let node = running.node.as_mut().unwrap();
    node.tasks_mut().uplink_mut().queue_ack(UploadAck {
        command: Some(WriteCommand {
            register: 8,
            value: 250,
        }),
        ..Default::default()
    });

    node.tick();
    let reports = node.tasks().uplink().reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, CommandStatus::Rejected);
    assert_eq!(node.tasks().bus().register(8), Some(100));
    assert!(events.contains("WRITE_REJECTED"));
}
