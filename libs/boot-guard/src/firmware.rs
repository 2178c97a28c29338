//! Dual-bank firmware store

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use errors::{NodeError, NodeResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One of the two firmware banks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    App0,
    App1,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Self::App0 => Self::App1,
            Self::App1 => Self::App0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::App0 => "app0",
            Self::App1 => "app1",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::App0 => 0,
            Self::App1 => 1,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Image state of a slot as reported by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Verified, safe to keep booting
    Valid,
    /// First boot of a new image, not yet committed
    PendingVerify,
    Invalid,
    /// Update was interrupted
    Aborted,
    /// Written but never booted
    New,
    Undefined,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Valid => "VALID",
            Self::PendingVerify => "PENDING_VERIFY",
            Self::Invalid => "INVALID",
            Self::Aborted => "ABORTED",
            Self::New => "NEW",
            Self::Undefined => "UNDEFINED",
        };
        f.write_str(text)
    }
}

/// Bootloader-facing operations used by the rollback manager
pub trait FirmwareStore {
    fn running_slot(&self) -> Slot;

    fn alternate_slot(&self) -> Slot {
        self.running_slot().other()
    }

    fn get_state(&self, slot: Slot) -> NodeResult<SlotState>;

    /// Boot `slot` on the next restart
    fn set_next_boot_slot(&mut self, slot: Slot) -> NodeResult<()>;

    /// Commit the running image and cancel any pending rollback
    fn mark_running_valid(&mut self) -> NodeResult<()>;
}

/// Bank layout shared by the in-memory and file-backed stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankState {
    pub running: Slot,
    #[serde(default)]
    pub next_boot: Option<Slot>,
    pub states: [SlotState; 2],
}

impl Default for BankState {
    fn default() -> Self {
        Self {
            running: Slot::App0,
            next_boot: None,
            states: [SlotState::Valid, SlotState::Undefined],
        }
    }
}

impl BankState {
    pub fn state(&self, slot: Slot) -> SlotState {
        self.states[slot.index()]
    }

    pub fn set_state(&mut self, slot: Slot, state: SlotState) {
        self.states[slot.index()] = state;
    }

    /// What the bootloader does on restart
    ///
    /// Switches to the requested slot, and a `New` image becomes
    /// `PendingVerify` on its first boot. A pending image stays pending
    /// across restarts until it is committed, or it is left behind by a
    /// rollback and becomes `Aborted`.
    pub fn reboot(&mut self) {
        if let Some(next) = self.next_boot.take() {
            if next != self.running {
                info!("Bootloader: switching {} -> {}", self.running, next);
                if self.state(self.running) == SlotState::PendingVerify {
                    warn!("Bootloader: {} abandoned before commit", self.running);
                    self.set_state(self.running, SlotState::Aborted);
                }
            }
            self.running = next;
        }
        if self.state(self.running) == SlotState::New {
            self.set_state(self.running, SlotState::PendingVerify);
        }
    }

    /// Stage a freshly written image in the alternate slot for the next boot
    pub fn stage_update(&mut self) -> Slot {
        let target = self.running.other();
        self.set_state(target, SlotState::New);
        self.next_boot = Some(target);
        target
    }
}

/// In-memory firmware store with failure injection
#[derive(Debug, Clone, Default)]
pub struct MemoryFirmwareStore {
    banks: BankState,
    fail_get_state: bool,
    fail_set_boot: bool,
    fail_mark_valid: bool,
}

impl MemoryFirmwareStore {
    pub fn new(running: Slot, running_state: SlotState) -> Self {
        let mut banks = BankState {
            running,
            next_boot: None,
            states: [SlotState::Undefined; 2],
        };
        banks.set_state(running, running_state);
        banks.set_state(running.other(), SlotState::Valid);
        Self {
            banks,
            ..Default::default()
        }
    }

    pub fn banks(&self) -> &BankState {
        &self.banks
    }

    pub fn banks_mut(&mut self) -> &mut BankState {
        &mut self.banks
    }

    pub fn next_boot(&self) -> Option<Slot> {
        self.banks.next_boot
    }

    pub fn reboot(&mut self) {
        self.banks.reboot();
    }

    pub fn set_fail_get_state(&mut self, fail: bool) {
        self.fail_get_state = fail;
    }

    pub fn set_fail_set_boot(&mut self, fail: bool) {
        self.fail_set_boot = fail;
    }

    pub fn set_fail_mark_valid(&mut self, fail: bool) {
        self.fail_mark_valid = fail;
    }
}

impl FirmwareStore for MemoryFirmwareStore {
    fn running_slot(&self) -> Slot {
        self.banks.running
    }

    fn get_state(&self, slot: Slot) -> NodeResult<SlotState> {
        if self.fail_get_state {
            return Err(NodeError::firmware("get_state", "simulated read failure"));
        }
        Ok(self.banks.state(slot))
    }

    fn set_next_boot_slot(&mut self, slot: Slot) -> NodeResult<()> {
        if self.fail_set_boot {
            return Err(NodeError::firmware("set_next_boot_slot", "simulated flash error"));
        }
        self.banks.next_boot = Some(slot);
        Ok(())
    }

    fn mark_running_valid(&mut self) -> NodeResult<()> {
        if self.fail_mark_valid {
            return Err(NodeError::firmware("mark_running_valid", "simulated flash error"));
        }
        let running = self.banks.running;
        self.banks.set_state(running, SlotState::Valid);
        Ok(())
    }
}

/// Host-side dual bank persisted as JSON
///
/// Opening the store counts as a restart: pending bootloader actions are
/// applied and written back before anything else reads the state.
#[derive(Debug)]
pub struct FileBankStore {
    path: PathBuf,
    banks: BankState,
}

impl FileBankStore {
    pub fn open(path: impl Into<PathBuf>) -> NodeResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut banks = if path.exists() {
            let content = fs::read(&path)?;
            serde_json::from_slice::<BankState>(&content).map_err(|e| NodeError::CorruptState {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            debug!("No bank state at {}, starting from {}", path.display(), Slot::App0);
            BankState::default()
        };

        banks.reboot();
        let store = Self { path, banks };
        store.persist("open")?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn banks(&self) -> &BankState {
        &self.banks
    }

    /// Record that a new image was written to the alternate slot
    pub fn stage_update(&mut self) -> NodeResult<Slot> {
        let target = self.banks.stage_update();
        self.persist("stage_update")?;
        info!("Update staged in {}", target);
        Ok(target)
    }

    fn persist(&self, operation: &str) -> NodeResult<()> {
        let content = serde_json::to_vec_pretty(&self.banks)
            .map_err(|e| NodeError::firmware(operation, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| NodeError::firmware(operation, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            warn!("Bank state write failed: {}", e);
            NodeError::firmware(operation, e)
        })
    }
}

impl FirmwareStore for FileBankStore {
    fn running_slot(&self) -> Slot {
        self.banks.running
    }

    fn get_state(&self, slot: Slot) -> NodeResult<SlotState> {
        Ok(self.banks.state(slot))
    }

    fn set_next_boot_slot(&mut self, slot: Slot) -> NodeResult<()> {
        let previous = self.banks.next_boot.replace(slot);
        if let Err(e) = self.persist("set_next_boot_slot") {
            self.banks.next_boot = previous;
            return Err(e);
        }
        Ok(())
    }

    fn mark_running_valid(&mut self) -> NodeResult<()> {
        let running = self.banks.running;
        let previous = self.banks.state(running);
        self.banks.set_state(running, SlotState::Valid);
        if let Err(e) = self.persist("mark_running_valid") {
            self.banks.set_state(running, previous);
            return Err(e);
        }
        Ok(())
    }
}
