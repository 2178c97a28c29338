//! Cloud uplink
//!
//! The node pushes buffered samples and gets back an acknowledgement that may
//! carry new intervals and one register write command. The result of that
//! command goes back on the next reporting cycle.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use common::Millis;
use errors::{NodeError, NodeResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One poll's worth of register readings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Node clock when the registers were read
    pub uptime_ms: Millis,
    pub captured_at: DateTime<Utc>,
    pub start_register: u16,
    pub registers: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBatch {
    pub slave_address: u8,
    pub samples: Vec<Sample>,
}

/// Register write requested by the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCommand {
    pub register: u16,
    pub value: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    /// Refused locally before touching the bus
    Rejected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: WriteCommand,
    pub status: CommandStatus,
    pub detail: String,
    pub executed_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn new(command: WriteCommand, status: CommandStatus, detail: impl Into<String>) -> Self {
        Self {
            command,
            status,
            detail: detail.into(),
            executed_at: Utc::now(),
        }
    }
}

/// Cloud response to an upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadAck {
    pub upload_interval_ms: Option<Millis>,
    pub sample_interval_ms: Option<Millis>,
    pub command: Option<WriteCommand>,
}

/// Network transport to the cloud
pub trait Uplink {
    /// Bring the network side up
    fn connect(&mut self) -> NodeResult<()> {
        Ok(())
    }

    fn upload(&mut self, batch: &UploadBatch) -> NodeResult<UploadAck>;

    fn report_result(&mut self, result: &CommandResult) -> NodeResult<()>;
}

/// Uplink that logs payloads instead of sending them
///
/// Acknowledgements are taken from a queue, or empty when the queue is
/// drained. Keeps a history of what went out.
#[derive(Debug, Default)]
pub struct LoggingUplink {
    acks: VecDeque<UploadAck>,
    uploads: Vec<UploadBatch>,
    reports: Vec<CommandResult>,
    fail_uploads: u32,
    fail_reports: u32,
    offline: bool,
}

impl LoggingUplink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge the next upload with `ack`
    pub fn queue_ack(&mut self, ack: UploadAck) {
        self.acks.push_back(ack);
    }

    /// Fail the next `count` uploads
    pub fn fail_uploads(&mut self, count: u32) {
        self.fail_uploads = count;
    }

    /// Fail the next `count` result reports
    pub fn fail_reports(&mut self, count: u32) {
        self.fail_reports = count;
    }

    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn uploads(&self) -> &[UploadBatch] {
        &self.uploads
    }

    pub fn reports(&self) -> &[CommandResult] {
        &self.reports
    }
}

impl Uplink for LoggingUplink {
    fn connect(&mut self) -> NodeResult<()> {
        if self.offline {
            return Err(NodeError::Uplink("network unreachable".to_string()));
        }
        info!("Uplink connected (logging only)");
        Ok(())
    }

    fn upload(&mut self, batch: &UploadBatch) -> NodeResult<UploadAck> {
        if self.offline {
            return Err(NodeError::Uplink("network unreachable".to_string()));
        }
        if self.fail_uploads > 0 {
            self.fail_uploads -= 1;
            return Err(NodeError::Uplink("upload rejected by server".to_string()));
        }

        let payload = serde_json::to_string(batch)?;
        info!(
            "Upload: {} samples, {} bytes",
            batch.samples.len(),
            payload.len()
        );
        debug!("Upload payload: {}", payload);
        self.uploads.push(batch.clone());
        Ok(self.acks.pop_front().unwrap_or_default())
    }

    fn report_result(&mut self, result: &CommandResult) -> NodeResult<()> {
        if self.offline {
            return Err(NodeError::Uplink("network unreachable".to_string()));
        }
        if self.fail_reports > 0 {
            self.fail_reports -= 1;
            return Err(NodeError::Uplink("result report rejected".to_string()));
        }

        info!("Command result: {}", serde_json::to_string(result)?);
        self.reports.push(result.clone());
        Ok(())
    }
}
