//! Multi-boot sequences against file-backed stores
//!
//! Each "boot" reopens the stores from disk, the way a restarted device would.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::path::Path;
use std::sync::Arc;

use boot_guard::{
    Decision, FileBankStore, FileKvStore, FirmwareStore, KvStore, MemoryFirmwareStore,
    MemoryKvStore, RollbackManager, Slot, SlotState, ValidationStage, BOOT_NAMESPACE,
    KEY_BOOT_COUNT,
};
use common::clock::ManualClock;
use common::events::MemoryEventLog;
use tempfile::TempDir;

type FileManager = RollbackManager<FileKvStore, FileBankStore>;

fn boot(dir: &Path, events: &Arc<MemoryEventLog>) -> FileManager {
    let store = FileKvStore::open(dir, BOOT_NAMESPACE).unwrap();
    let banks = FileBankStore::open(dir.join("banks.json")).unwrap();
    RollbackManager::new(
        store,
        banks,
        Arc::new(ManualClock::new(0)),
        events.clone(),
    )
}

fn install_update(dir: &Path) {
    let mut banks = FileBankStore::open(dir.join("banks.json")).unwrap();
    banks.stage_update().unwrap();
}

#[test]
fn count_is_min_of_boots_and_threshold() {
    for n in 1..=6u32 {
        let mut firmware = MemoryFirmwareStore::new(Slot::App0, SlotState::Valid);
        firmware.set_fail_set_boot(true);
        let mut manager = RollbackManager::new(
            MemoryKvStore::new(BOOT_NAMESPACE),
            firmware,
            Arc::new(ManualClock::new(0)),
            Arc::new(MemoryEventLog::new()),
        );

        let mut last = None;
        for _ in 0..n {
            last = Some(manager.on_cold_boot());
        }
        let (store, _) = manager.into_parts();
        assert_eq!(
            store.get_int(KEY_BOOT_COUNT, 0) as u32,
            n.min(3),
            "after {n} boots"
        );
        if n >= 3 {
            assert!(matches!(last, Some(Decision::RollbackFailed { .. })));
        } else {
            assert!(matches!(last, Some(Decision::Continue { .. })));
        }
    }
}

#[test]
fn crashing_update_is_rolled_back_on_third_boot() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(MemoryEventLog::new());

    // Healthy first boot on app0
    {
        let mut manager = boot(dir.path(), &events);
        assert_eq!(manager.on_cold_boot(), Decision::Continue { boot_count: 1 });
        assert_eq!(manager.classify_running_image().unwrap(), SlotState::Valid);
        manager.prepare_for_new_firmware().unwrap();
    }
    install_update(dir.path());

    // The new image boots twice and dies before its first upload
    for expected in 1..=2 {
        let mut manager = boot(dir.path(), &events);
        assert_eq!(manager.firmware().running_slot(), Slot::App1);
        assert_eq!(
            manager.on_cold_boot(),
            Decision::Continue {
                boot_count: expected
            }
        );
        assert_eq!(
            manager.classify_running_image().unwrap(),
            SlotState::PendingVerify
        );
        manager.checkpoint(ValidationStage::LinkEstablished);
    }

    // Third boot: loop detected
    {
        let mut manager = boot(dir.path(), &events);
        assert_eq!(
            manager.on_cold_boot(),
            Decision::Rollback {
                from: Slot::App1,
                to: Slot::App0
            }
        );
        assert_eq!(manager.record().boot_count, 0);
        assert_eq!(manager.record().validation_stage, ValidationStage::Inactive);
    }

    // Back on the old image
    let mut manager = boot(dir.path(), &events);
    assert_eq!(manager.firmware().running_slot(), Slot::App0);
    assert_eq!(manager.on_cold_boot(), Decision::Continue { boot_count: 1 });
    assert_eq!(manager.classify_running_image().unwrap(), SlotState::Valid);
    assert_eq!(manager.firmware().get_state(Slot::App1).unwrap(), SlotState::Aborted);
    assert!(events.contains("ROLLBACK_SUCCESS"));
    assert!(!events.contains("FIRMWARE_COMMITTED"));
}

#[test]
fn committed_image_still_rolls_back_after_three_boots() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(MemoryEventLog::new());
    install_update(dir.path());

    {
        let mut manager = boot(dir.path(), &events);
        manager.on_cold_boot();
        manager.classify_running_image().unwrap();
        manager.checkpoint(ValidationStage::LinkEstablished);
        manager.checkpoint(ValidationStage::ConfigLoaded);
        manager.checkpoint(ValidationStage::UplinkReady);
        assert!(manager.commit_if_pending());
    }

    // Every later run uploads fine, but only a commit clears the counter
    let mut decisions = Vec::new();
    for _ in 0..3 {
        let mut manager = boot(dir.path(), &events);
        assert_eq!(manager.firmware().running_slot(), Slot::App1);
        decisions.push(manager.on_cold_boot());
        assert_eq!(manager.classify_running_image().unwrap(), SlotState::Valid);
        assert!(!manager.commit_if_pending());
    }
    assert_eq!(decisions[0], Decision::Continue { boot_count: 1 });
    assert_eq!(decisions[1], Decision::Continue { boot_count: 2 });
    assert_eq!(
        decisions[2],
        Decision::Rollback {
            from: Slot::App1,
            to: Slot::App0
        }
    );
    assert_eq!(events.count("FIRMWARE_COMMITTED"), 1);
}

#[test]
fn failed_counter_write_keeps_prior_value() {
    let mut store = MemoryKvStore::new(BOOT_NAMESPACE);
    store.put_int(KEY_BOOT_COUNT, 1).unwrap();
    store.set_fail_writes(true);

    let mut manager = RollbackManager::new(
        store,
        MemoryFirmwareStore::new(Slot::App0, SlotState::Valid),
        Arc::new(ManualClock::new(0)),
        Arc::new(MemoryEventLog::new()),
    );

    // The decision still uses this boot's count
    assert_eq!(manager.on_cold_boot(), Decision::Continue { boot_count: 2 });
    assert_eq!(manager.record().boot_count, 1);
}
