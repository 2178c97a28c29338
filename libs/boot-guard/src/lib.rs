//! Boot Guard - crash-loop detection and firmware rollback
//!
//! Counts consecutive cold boots in a persistent record. When the count
//! reaches the threshold the alternate firmware slot is armed for the next
//! boot. A newly installed image stays `PendingVerify` until the first
//! confirmed upload commits it.

mod firmware;
mod manager;
mod record;
mod store;

pub use firmware::{
    BankState, FileBankStore, FirmwareStore, MemoryFirmwareStore, Slot, SlotState,
};
pub use manager::{events, Decision, RollbackManager, BOOT_LOOP_THRESHOLD};
pub use record::{
    BootRecord, ValidationStage, BOOT_NAMESPACE, KEY_BOOT_COUNT, KEY_VAL_STAGE, KEY_VAL_START,
};
pub use store::{FileKvStore, KvStore, MemoryKvStore};
