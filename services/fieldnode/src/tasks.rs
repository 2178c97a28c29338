//! Periodic task bodies
//!
//! ```text
//! poll ──► samples ──► upload ──► commit / interval updates
//!                         │
//!                         └─► write command ──► command_result
//! ```
//!
//! Only a successful upload counts as proof that a new image works. Bus
//! noise, exception frames and failed uploads never reach the commit path.

use std::sync::Arc;

use boot_guard::{FirmwareStore, KvStore, RollbackManager};
use chrono::Utc;
use common::{EventSink, JsonFileEventLog, Millis};
use errors::{NodeError, NodeResult};
use field_codec::{
    decode_registers, encode_request, exception_code, exception_description, function_code,
    is_exception, parse_response, RegisterLimits,
};
use node_scheduler::{TaskRunner, TaskSpec, TaskTable};
use tracing::{debug, error, info, warn, Level};

use crate::bus::BusTransport;
use crate::config::{DeviceConfig, IntervalConfig, RuntimeIntervals, SAMPLE_KEY, UPLOAD_KEY};
use crate::uplink::{CommandResult, CommandStatus, Sample, UploadBatch, Uplink, WriteCommand};

/// Task names
pub mod names {
    pub const POLL: &str = "poll";
    pub const UPLOAD: &str = "upload";
    pub const COMMAND_RESULT: &str = "command_result";
    pub const EVENT_LOG_CLEANUP: &str = "event_log_cleanup";
}

/// Event names recorded by the task bodies
pub mod events {
    pub const POLL_FAILED: &str = "POLL_FAILED";
    pub const UPLOAD_FAILED: &str = "UPLOAD_FAILED";
    pub const WRITE_REJECTED: &str = "WRITE_REJECTED";
    pub const WRITE_FAILED: &str = "WRITE_FAILED";
    pub const REPORT_FAILED: &str = "REPORT_FAILED";
}

/// Task table for the node, in execution order
///
/// `command_result` sits after `upload` so a result produced by an upload is
/// reported in the same pass.
pub fn task_specs(intervals: &IntervalConfig) -> Vec<TaskSpec> {
    vec![
        TaskSpec::new(names::POLL, intervals.sample_ms).from_config(SAMPLE_KEY),
        TaskSpec::new(names::UPLOAD, intervals.upload_ms).from_config(UPLOAD_KEY),
        TaskSpec::new(names::COMMAND_RESULT, intervals.upload_ms)
            .coupled_to(names::UPLOAD)
            .disabled(),
        TaskSpec::new(names::EVENT_LOG_CLEANUP, intervals.event_log_cleanup_ms),
    ]
}

/// Counters kept by the task bodies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub uploads_ok: u64,
    pub uploads_failed: u64,
    pub commands_executed: u64,
    pub results_reported: u64,
}

/// Owns the bus, the uplink and the rollback manager for the task bodies
pub struct NodeTasks<B, U, S, F>
where
    B: BusTransport,
    U: Uplink,
    S: KvStore,
    F: FirmwareStore,
{
    bus: B,
    uplink: U,
    manager: RollbackManager<S, F>,
    events: Arc<dyn EventSink>,
    event_log: Option<Arc<JsonFileEventLog>>,
    intervals: RuntimeIntervals,
    device: DeviceConfig,
    limits: RegisterLimits,
    samples: Vec<Sample>,
    pending_result: Option<CommandResult>,
    stats: NodeStats,
}

impl<B, U, S, F> NodeTasks<B, U, S, F>
where
    B: BusTransport,
    U: Uplink,
    S: KvStore,
    F: FirmwareStore,
{
    pub fn new(
        bus: B,
        uplink: U,
        manager: RollbackManager<S, F>,
        events: Arc<dyn EventSink>,
        intervals: RuntimeIntervals,
        device: DeviceConfig,
    ) -> Self {
        let limits = device.register_limits();
        Self {
            bus,
            uplink,
            manager,
            events,
            event_log: None,
            intervals,
            device,
            limits,
            samples: Vec::new(),
            pending_result: None,
            stats: NodeStats::default(),
        }
    }

    /// Event log trimmed by the cleanup task
    pub fn with_event_log(mut self, event_log: Arc<JsonFileEventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn uplink(&self) -> &U {
        &self.uplink
    }

    pub fn uplink_mut(&mut self) -> &mut U {
        &mut self.uplink
    }

    pub fn manager(&self) -> &RollbackManager<S, F> {
        &self.manager
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn pending_result(&self) -> Option<&CommandResult> {
        self.pending_result.as_ref()
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    fn record_failure(&self, event: &str, err: &NodeError) {
        let code = err.error_code();
        let next = if err.is_retryable() {
            "retry next cycle"
        } else {
            "not retryable"
        };
        let level = err.log_level();
        if level == Level::ERROR {
            error!(code, "{}: {} ({})", event, err, next);
        } else if level == Level::WARN {
            warn!(code, "{}: {} ({})", event, err, next);
        } else {
            info!(code, "{}: {} ({})", event, err, next);
        }
        self.events.record(event, &format!("{}: {}", code, err));
    }

    fn poll(&mut self, now: Millis) -> NodeResult<()> {
        let start = self.device.poll_start_register;
        let count = self.device.poll_register_count;
        let request = encode_request(
            self.device.slave_address,
            function_code::READ_HOLDING_REGISTERS,
            start,
            count,
        );

        let registers = self
            .bus
            .transact(&request)
            .and_then(|response| Ok(decode_registers(&response, usize::from(count))?));
        let registers = match registers {
            Ok(registers) => registers,
            Err(e) => {
                self.stats.polls_failed += 1;
                self.record_failure(events::POLL_FAILED, &e);
                return Err(e);
            },
        };

        debug!("Polled {} registers from {}", registers.len(), start);
        self.samples.push(Sample {
            uptime_ms: now,
            captured_at: Utc::now(),
            start_register: start,
            registers,
        });
        if self.samples.len() > self.device.max_buffered_samples {
            let excess = self.samples.len() - self.device.max_buffered_samples;
            self.samples.drain(..excess);
            warn!("Sample buffer full, dropped {} oldest", excess);
        }
        self.stats.polls_ok += 1;
        Ok(())
    }

    fn upload(&mut self, table: &mut TaskTable) -> NodeResult<()> {
        if self.samples.is_empty() {
            debug!("No samples buffered, upload skipped");
            return Ok(());
        }

        let batch = UploadBatch {
            slave_address: self.device.slave_address,
            samples: self.samples.clone(),
        };
        let ack = match self.uplink.upload(&batch) {
            Ok(ack) => ack,
            Err(e) => {
                self.stats.uploads_failed += 1;
                self.record_failure(events::UPLOAD_FAILED, &e);
                return Err(e);
            },
        };
        self.samples.clear();
        self.stats.uploads_ok += 1;

        self.manager.commit_if_pending();

        self.intervals.apply(&ack);

        if let Some(command) = ack.command {
            if let Some(stale) = self.pending_result.take() {
                warn!(
                    "Unreported result for register {} replaced",
                    stale.command.register
                );
            }
            let result = self.execute_write(command);
            self.pending_result = Some(result);
            table.set_enabled(names::COMMAND_RESULT, true)?;
        }
        Ok(())
    }

    fn execute_write(&mut self, command: WriteCommand) -> CommandResult {
        let WriteCommand { register, value } = command;
        self.stats.commands_executed += 1;

        if !self.limits.is_valid_write_value(register, value) {
            warn!("Write rejected: register {} value {}", register, value);
            self.events.record(
                events::WRITE_REJECTED,
                &format!("register={},value={}", register, value),
            );
            return CommandResult::new(
                command,
                CommandStatus::Rejected,
                format!("register {} does not accept {}", register, value),
            );
        }

        let request = encode_request(
            self.device.slave_address,
            function_code::WRITE_SINGLE_REGISTER,
            register,
            value,
        );
        let response = self
            .bus
            .transact(&request)
            .and_then(|hex| Ok(parse_response(&hex)?));

        match response {
            Ok(frame) if is_exception(&frame) => {
                let code = exception_code(&frame).unwrap_or(0);
                let detail = format!("exception 0x{:02X} ({})", code, exception_description(code));
                self.events.record(events::WRITE_FAILED, &detail);
                CommandResult::new(command, CommandStatus::Failed, detail)
            },
            Ok(frame) if frame == request => {
                info!("Register {} set to {}", register, value);
                CommandResult::new(
                    command,
                    CommandStatus::Success,
                    format!("register {} set to {}", register, value),
                )
            },
            Ok(frame) => {
                let detail = format!("echo mismatch: sent {}, got {}", request, frame);
                self.events.record(events::WRITE_FAILED, &detail);
                CommandResult::new(command, CommandStatus::Failed, detail)
            },
            Err(e) => {
                self.record_failure(events::WRITE_FAILED, &e);
                CommandResult::new(command, CommandStatus::Failed, e.to_string())
            },
        }
    }

    fn report_result(&mut self, table: &mut TaskTable) -> NodeResult<()> {
        let Some(result) = self.pending_result.take() else {
            table.set_enabled(names::COMMAND_RESULT, false)?;
            return Ok(());
        };

        if let Err(e) = self.uplink.report_result(&result) {
            // Keep it for the next cycle
            self.pending_result = Some(result);
            self.record_failure(events::REPORT_FAILED, &e);
            return Err(e);
        }
        self.stats.results_reported += 1;
        table.set_enabled(names::COMMAND_RESULT, false)
    }

    fn cleanup_event_log(&mut self) -> NodeResult<()> {
        let Some(log) = &self.event_log else {
            return Ok(());
        };
        let removed = log.cleanup()?;
        if removed > 0 {
            info!("Event log cleanup removed {} events", removed);
        }
        Ok(())
    }
}

impl<B, U, S, F> TaskRunner for NodeTasks<B, U, S, F>
where
    B: BusTransport,
    U: Uplink,
    S: KvStore,
    F: FirmwareStore,
{
    fn run(&mut self, task: &str, now: Millis, table: &mut TaskTable) -> NodeResult<()> {
        match task {
            names::POLL => self.poll(now),
            names::UPLOAD => self.upload(table),
            names::COMMAND_RESULT => self.report_result(table),
            names::EVENT_LOG_CLEANUP => self.cleanup_event_log(),
            other => Err(NodeError::UnknownTask(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::SimulatedInverter;
    use crate::uplink::{LoggingUplink, UploadAck};
    use boot_guard::{MemoryFirmwareStore, MemoryKvStore, Slot, SlotState, BOOT_NAMESPACE};
    use common::{ManualClock, MemoryEventLog};
    use tracing_test::traced_test;

    type TestTasks = NodeTasks<SimulatedInverter, LoggingUplink, MemoryKvStore, MemoryFirmwareStore>;

    fn tasks(state: SlotState) -> (TestTasks, TaskTable, Arc<MemoryEventLog>) {
        let events = Arc::new(MemoryEventLog::new());
        let manager = RollbackManager::new(
            MemoryKvStore::new(BOOT_NAMESPACE),
            MemoryFirmwareStore::new(Slot::App1, state),
            Arc::new(ManualClock::new(0)),
            events.clone(),
        );
        let device = DeviceConfig::default();
        let tasks = NodeTasks::new(
            SimulatedInverter::with_sample_readings(device.slave_address, device.max_registers),
            LoggingUplink::new(),
            manager,
            events.clone(),
            RuntimeIntervals::new(),
            device,
        );
        let table = TaskTable::new(task_specs(&IntervalConfig::default())).unwrap();
        (tasks, table, events)
    }

    fn state_of(tasks: &TestTasks) -> SlotState {
        let firmware = tasks.manager().firmware();
        firmware.get_state(firmware.running_slot()).unwrap()
    }

    #[test]
    fn test_poll_buffers_sample() {
        let (mut tasks, mut table, _) = tasks(SlotState::Valid);
        tasks.run(names::POLL, 100, &mut table).unwrap();

        assert_eq!(tasks.samples().len(), 1);
        assert_eq!(tasks.samples()[0].registers.len(), 10);
        assert_eq!(tasks.samples()[0].registers[0], 2308);
        assert_eq!(tasks.stats().polls_ok, 1);
    }

    #[test]
    #[traced_test]
    fn test_corrupt_poll_is_evented_and_skipped() {
        let (mut tasks, mut table, events) = tasks(SlotState::Valid);
        tasks.bus_mut().corrupt_next_response();

        let err = tasks.run(names::POLL, 100, &mut table).unwrap_err();
        assert_eq!(err.error_code(), "CRC_FAILED");
        assert!(tasks.samples().is_empty());
        assert_eq!(events.count(events::POLL_FAILED), 1);
        assert!(logs_contain("WARN"));
        assert!(logs_contain("retry next cycle"));
    }

    #[test]
    fn test_empty_buffer_skips_upload_and_commit() {
        let (mut tasks, mut table, _) = tasks(SlotState::PendingVerify);
        tasks.run(names::UPLOAD, 0, &mut table).unwrap();
        assert!(tasks.uplink().uploads().is_empty());
        assert_eq!(state_of(&tasks), SlotState::PendingVerify);
    }

    #[test]
    fn test_successful_upload_commits() {
        let (mut tasks, mut table, events) = tasks(SlotState::PendingVerify);
        tasks.run(names::POLL, 0, &mut table).unwrap();
        tasks.run(names::UPLOAD, 0, &mut table).unwrap();

        assert_eq!(state_of(&tasks), SlotState::Valid);
        assert!(events.contains("FIRMWARE_COMMITTED"));
        assert!(tasks.samples().is_empty());
    }

    #[test]
    fn test_failed_upload_keeps_samples_and_never_commits() {
        let (mut tasks, mut table, events) = tasks(SlotState::PendingVerify);
        tasks.run(names::POLL, 0, &mut table).unwrap();
        tasks.uplink_mut().fail_uploads(1);

        assert!(tasks.run(names::UPLOAD, 0, &mut table).is_err());
        assert_eq!(state_of(&tasks), SlotState::PendingVerify);
        assert_eq!(tasks.samples().len(), 1);
        assert!(events.contains(events::UPLOAD_FAILED));
    }

    #[test]
    fn test_sample_buffer_is_bounded() {
        let (mut tasks, mut table, _) = tasks(SlotState::Valid);
        let max = DeviceConfig::default().max_buffered_samples;
        for i in 0..(max as u32 + 3) {
            tasks.run(names::POLL, i, &mut table).unwrap();
        }
        assert_eq!(tasks.samples().len(), max);
        assert_eq!(tasks.samples()[0].uptime_ms, 3);
    }

    #[test]
    fn test_write_command_enables_result_task() {
        let (mut tasks, mut table, _) = tasks(SlotState::Valid);
        tasks.uplink_mut().queue_ack(UploadAck {
            command: Some(WriteCommand {
                register: 8,
                value: 40,
            }),
            ..Default::default()
        });
        tasks.run(names::POLL, 0, &mut table).unwrap();
        tasks.run(names::UPLOAD, 0, &mut table).unwrap();

        assert!(table.is_enabled(names::COMMAND_RESULT));
        assert_eq!(tasks.bus().register(8), Some(40));
        assert_eq!(
            tasks.pending_result().map(|r| r.status),
            Some(CommandStatus::Success)
        );

        tasks.run(names::COMMAND_RESULT, 0, &mut table).unwrap();
        assert!(!table.is_enabled(names::COMMAND_RESULT));
        assert_eq!(tasks.uplink().reports().len(), 1);
        assert!(tasks.pending_result().is_none());
    }

    #[test]
    fn test_out_of_range_write_is_rejected_without_bus_traffic() {
        let (mut tasks, _, events) = tasks(SlotState::Valid);
        let before = tasks.bus().transactions();
        let result = tasks.execute_write(WriteCommand {
            register: 8,
            value: 150,
        });

        assert_eq!(result.status, CommandStatus::Rejected);
        assert_eq!(tasks.bus().transactions(), before);
        assert!(events.contains(events::WRITE_REJECTED));
    }

    #[test]
    fn test_write_exception_is_reported_as_failure() {
        let (mut tasks, _, _) = tasks(SlotState::Valid);
        tasks.limits.max_registers = 20;
        let result = tasks.execute_write(WriteCommand {
            register: 15,
            value: 1,
        });
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(result.detail.contains("Illegal Data Address"));
    }

    #[test]
    fn test_failed_report_is_retried() {
        let (mut tasks, mut table, _) = tasks(SlotState::Valid);
        tasks.pending_result = Some(CommandResult::new(
            WriteCommand {
                register: 1,
                value: 1,
            },
            CommandStatus::Success,
            "ok",
        ));
        table.set_enabled(names::COMMAND_RESULT, true).unwrap();
        tasks.uplink_mut().fail_reports(1);

        assert!(tasks.run(names::COMMAND_RESULT, 0, &mut table).is_err());
        assert!(table.is_enabled(names::COMMAND_RESULT));
        assert!(tasks.pending_result().is_some());

        tasks.run(names::COMMAND_RESULT, 0, &mut table).unwrap();
        assert!(!table.is_enabled(names::COMMAND_RESULT));
    }

    #[test]
    fn test_result_task_without_work_is_noop() {
        let (mut tasks, mut table, _) = tasks(SlotState::Valid);
        table.set_enabled(names::COMMAND_RESULT, true).unwrap();
        tasks.run(names::COMMAND_RESULT, 0, &mut table).unwrap();
        assert!(tasks.uplink().reports().is_empty());
        assert!(!table.is_enabled(names::COMMAND_RESULT));
    }

    #[test]
    fn test_unknown_task() {
        let (mut tasks, mut table, _) = tasks(SlotState::Valid);
        assert!(matches!(
            tasks.run("reboot", 0, &mut table),
            Err(NodeError::UnknownTask(_))
        ));
    }
}
