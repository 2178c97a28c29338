//! Rollback Manager - boot-loop detection, rollback and commit
//!
//! ```text
//!   cold boot ──► boot_count += 1 ──► < threshold ──► Continue
//!                                  └► ≥ threshold ──► set_next_boot(alternate)
//!                                                      ├─ ok  ──► reset, Rollback (caller restarts)
//!                                                      └─ err ──► RollbackFailed (no retry this boot)
//!
//!   PENDING_VERIFY ──► val_stage 0 ──► checkpoints 1..3 ──► first good upload ──► commit
//! ```

use std::sync::Arc;

use common::clock::Clock;
use common::events::EventSink;
use errors::NodeResult;
use tracing::{debug, error, info, warn};

use crate::firmware::{FirmwareStore, Slot, SlotState};
use crate::record::{BootRecord, ValidationStage, KEY_BOOT_COUNT, KEY_VAL_STAGE, KEY_VAL_START};
use crate::store::KvStore;

/// Consecutive cold boots that count as a boot loop
pub const BOOT_LOOP_THRESHOLD: u32 = 3;

/// Event names reported through the [`EventSink`]
pub mod events {
    pub const BOOT_LOOP_DETECTED: &str = "BOOT_LOOP_DETECTED";
    pub const ROLLBACK_TRIGGERED: &str = "ROLLBACK_TRIGGERED";
    pub const ROLLBACK_SUCCESS: &str = "ROLLBACK_SUCCESS";
    pub const ROLLBACK_FAILED: &str = "ROLLBACK_FAILED";
    pub const FIRMWARE_COMMITTED: &str = "FIRMWARE_COMMITTED";
    pub const FIRMWARE_COMMIT_FAIL: &str = "FIRMWARE_COMMIT_FAIL";
}

/// Outcome of the cold-boot check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Keep booting the running image
    Continue { boot_count: u32 },
    /// The alternate slot is armed; the caller must restart now
    Rollback { from: Slot, to: Slot },
    /// Loop detected but the rollback request failed; manual recovery needed
    RollbackFailed { reason: String },
}

impl Decision {
    pub fn requires_restart(&self) -> bool {
        matches!(self, Self::Rollback { .. })
    }
}

/// Owns the boot record and drives the firmware store
pub struct RollbackManager<S: KvStore, F: FirmwareStore> {
    store: S,
    firmware: F,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    threshold: u32,
}

impl<S: KvStore, F: FirmwareStore> RollbackManager<S, F> {
    pub fn new(store: S, firmware: F, clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            firmware,
            clock,
            events,
            threshold: BOOT_LOOP_THRESHOLD,
        }
    }

    /// Override the loop threshold (minimum 1)
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    pub fn firmware_mut(&mut self) -> &mut F {
        &mut self.firmware
    }

    pub fn into_parts(self) -> (S, F) {
        (self.store, self.firmware)
    }

    pub fn record(&self) -> BootRecord {
        BootRecord::load(&self.store)
    }

    pub fn is_validating(&self) -> bool {
        self.record().is_validating()
    }

    /// Count this cold boot and decide whether to roll back
    ///
    /// The incremented count is persisted before the decision so a crash
    /// during the rollback attempt still counts. The stored count never
    /// exceeds the threshold.
    pub fn on_cold_boot(&mut self) -> Decision {
        let previous = self.store.get_int(KEY_BOOT_COUNT, 0).max(0) as u32;
        let boot_count = previous.saturating_add(1).min(self.threshold);
        info!(boot_count, "Boot count: {}", boot_count);

        if let Err(e) = self.store.put_int(KEY_BOOT_COUNT, boot_count as i32) {
            warn!("Boot count not persisted: {}", e);
        }

        if boot_count < self.threshold {
            return Decision::Continue { boot_count };
        }

        let from = self.firmware.running_slot();
        let to = self.firmware.alternate_slot();
        warn!(boot_count, "Boot loop detected, rolling back {} -> {}", from, to);
        self.events.record(
            events::BOOT_LOOP_DETECTED,
            &format!("count={}", boot_count),
        );
        self.events.record(
            events::ROLLBACK_TRIGGERED,
            &format!("from={},to={}", from, to),
        );

        match self.firmware.set_next_boot_slot(to) {
            Ok(()) => {
                info!(slot = %to, "Rollback slot armed, restart required");
                self.events
                    .record(events::ROLLBACK_SUCCESS, &format!("partition={}", to));
                self.reset_validation("rollback");
                Decision::Rollback { from, to }
            },
            Err(e) => {
                let reason = e.to_string();
                self.events.record(
                    events::ROLLBACK_FAILED,
                    &format!("slot={},error={}", to, reason),
                );
                error!(
                    slot = %from,
                    "Rollback failed: {}. Device needs manual recovery", reason
                );
                Decision::RollbackFailed { reason }
            },
        }
    }

    /// Read the running image state and open a validation episode for a new image
    pub fn classify_running_image(&mut self) -> NodeResult<SlotState> {
        let running = self.firmware.running_slot();
        let state = self.firmware.get_state(running)?;
        info!(slot = %running, "Partition: {}, state: {}", running, state);

        match state {
            SlotState::PendingVerify => {
                let started = u64::from(self.clock.now_ms());
                if let Err(e) = self.store.put_ulong(KEY_VAL_START, started) {
                    warn!("Validation start not persisted: {}", e);
                }
                if let Err(e) = self
                    .store
                    .put_int(KEY_VAL_STAGE, ValidationStage::BootStarted.as_raw())
                {
                    warn!("Validation stage not persisted: {}", e);
                }
                info!("New firmware detected, validation started");
            },
            SlotState::Valid => debug!("Running image previously verified"),
            SlotState::New => warn!("Running image reports NEW (not yet booted)"),
            SlotState::Invalid => warn!("Running image reports INVALID"),
            SlotState::Aborted => warn!("Running image reports ABORTED (incomplete update)"),
            SlotState::Undefined => warn!("Running image state UNDEFINED"),
        }

        Ok(state)
    }

    /// Record validation progress; ignored outside a validation episode
    ///
    /// Stages may arrive in any order. Only the startup checkpoints 1..=3
    /// are accepted; opening and closing an episode belong to the manager.
    pub fn checkpoint(&mut self, stage: ValidationStage) {
        if !matches!(
            stage,
            ValidationStage::LinkEstablished
                | ValidationStage::ConfigLoaded
                | ValidationStage::UplinkReady
        ) {
            warn!("Ignoring checkpoint {}: not a startup stage", stage);
            return;
        }

        let current = ValidationStage::from_raw(self.store.get_int(KEY_VAL_STAGE, -1));
        if !current.is_active() {
            return;
        }

        match self.store.put_int(KEY_VAL_STAGE, stage.as_raw()) {
            Ok(()) => info!(
                stage = stage.as_raw(),
                "Validation checkpoint {}: {}",
                stage.as_raw(),
                stage.label()
            ),
            Err(e) => warn!("Checkpoint {} not persisted: {}", stage, e),
        }
    }

    /// Commit a pending image; true only when this call committed it
    pub fn commit_if_pending(&mut self) -> bool {
        let running = self.firmware.running_slot();
        let state = match self.firmware.get_state(running) {
            Ok(state) => state,
            Err(e) => {
                warn!("Cannot read state of {}: {}", running, e);
                return false;
            },
        };
        if state != SlotState::PendingVerify {
            return false;
        }

        info!("First upload successful, committing firmware in {}", running);
        match self.firmware.mark_running_valid() {
            Ok(()) => {
                self.events.record(
                    events::FIRMWARE_COMMITTED,
                    &format!("partition={}", running),
                );
                self.reset_validation("commit");
                info!(slot = %running, "Firmware marked valid, rollback cancelled");
                true
            },
            Err(e) => {
                warn!("Failed to mark firmware valid: {}", e);
                self.events.record(
                    events::FIRMWARE_COMMIT_FAIL,
                    &format!("slot={},error={}", running, e),
                );
                false
            },
        }
    }

    /// Clear loop and validation state before a new image is installed
    pub fn prepare_for_new_firmware(&mut self) -> NodeResult<()> {
        info!("Resetting boot counter for new firmware validation");
        self.store.put_int(KEY_BOOT_COUNT, 0)?;
        self.store
            .put_int(KEY_VAL_STAGE, ValidationStage::Inactive.as_raw())
    }

    fn reset_validation(&mut self, reason: &str) {
        let result = self
            .store
            .put_int(KEY_BOOT_COUNT, 0)
            .and_then(|()| {
                self.store
                    .put_int(KEY_VAL_STAGE, ValidationStage::Inactive.as_raw())
            });
        match result {
            Ok(()) => debug!("Boot record reset after {}", reason),
            Err(e) => warn!("Boot record reset after {} failed: {}", reason, e),
        }
    }
}
