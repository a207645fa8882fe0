// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A/B slot management over the misc partition.
//!
//! The record format and the election/normalization rules live in the
//! `avbab` crate; this module binds them to the platform block store and
//! adds the policy bits: resetting corrupt metadata, and disabling slots an
//! earlier loader stage reported as unbootable.

use arrayvec::ArrayString;
use core::fmt::Write as _;

use avbab::{SlotIndex, AB_METADATA_OFFSET};
use liberror::Result;

use crate::ops::{self, AblOps};

/// Partition hosting the BCB and the slot metadata.
pub const MISC_LABEL: &str = "misc";

/// Adapter exposing the misc partition as the byte store the record code
/// wants.
pub(crate) struct MiscAbOps<'a, O: AblOps> {
    pub ops: &'a mut O,
}

impl<O: AblOps> avbab::Ops for MiscAbOps<'_, O> {
    fn read_ab_metadata(&mut self, out: &mut [u8]) -> Result<()> {
        self.ops.read_from_partition(MISC_LABEL, AB_METADATA_OFFSET, out)
    }

    fn write_ab_metadata(&mut self, data: &[u8]) -> Result<()> {
        self.ops.write_to_partition(MISC_LABEL, AB_METADATA_OFFSET, data)?;
        self.ops.flush()
    }

    fn console(&mut self) -> Option<&mut dyn core::fmt::Write> {
        self.ops.console_out()
    }
}

fn loaded_slot_failed_var(slot: usize) -> ArrayString<24> {
    let mut name = ArrayString::new();
    write!(name, "LoadedSlotFailed_{:04x}", slot).unwrap();
    name
}

/// Loads the metadata, resetting it to the default record if it is corrupt,
/// and disables any slot a previous loader stage failed to load.
pub fn init<O: AblOps>(ops: &mut O) -> Result<()> {
    // Reads and normalizes; a corrupt record is replaced by the default and
    // written back.
    avbab::get_active_slot(&mut MiscAbOps { ops })?;
    disable_slots_failed_by_loader(ops);
    Ok(())
}

/// The slot to boot, or `None` when every slot is exhausted.
pub fn active_slot<O: AblOps>(ops: &mut O) -> Result<Option<SlotIndex>> {
    avbab::get_active_slot(&mut MiscAbOps { ops })
}

/// Burns one retry of a not-yet-successful slot.
pub fn mark_boot_attempt<O: AblOps>(ops: &mut O, slot: SlotIndex) -> Result<()> {
    avbab::mark_boot_attempt(&mut MiscAbOps { ops }, slot)
}

/// Permanently disables a slot after verification failed with no retries
/// left.
pub fn mark_boot_failed<O: AblOps>(ops: &mut O, slot: SlotIndex) -> Result<()> {
    avbab::mark_slot_unbootable(&mut MiscAbOps { ops }, slot)
}

/// Records or clears dm-verity corruption for a slot.
pub fn set_verity_corrupted<O: AblOps>(ops: &mut O, slot: SlotIndex, corrupted: bool) -> Result<()> {
    avbab::set_verity_corrupted(&mut MiscAbOps { ops }, slot, corrupted)
}

/// Makes `slot` active with a fresh retry budget.
pub fn set_active<O: AblOps>(ops: &mut O, slot: SlotIndex) -> Result<()> {
    avbab::mark_slot_active(&mut MiscAbOps { ops }, slot)
}

/// Per-slot metadata snapshot.
pub fn slot_info<O: AblOps>(ops: &mut O, slot: SlotIndex) -> Result<avbab::AbSlotData> {
    avbab::get_slot_info(&mut MiscAbOps { ops }, slot)
}

/// Disables slots that the previous loader stage tried and failed to load,
/// as reported through the `LoadedSlot` / `LoadedSlotFailed_%04x`
/// variables. Absent variables mean nothing to do; read errors are logged
/// and ignored so a flaky variable store cannot take out a healthy slot.
fn disable_slots_failed_by_loader<O: AblOps>(ops: &mut O) {
    let loaded =
        match ops::get_var_u8(ops.vars(), devstate::FASTBOOT_NAMESPACE, ops::LOADED_SLOT_VAR) {
            Some(slot) => slot as usize,
            None => return,
        };

    for slot in 0..2usize {
        if slot == loaded {
            continue;
        }
        let failed = ops::get_var_u8(
            ops.vars(),
            devstate::FASTBOOT_NAMESPACE,
            &loaded_slot_failed_var(slot),
        )
        .map(|code| code != 0)
        .unwrap_or(false);
        if !failed {
            continue;
        }
        let Ok(slot) = SlotIndex::try_from(slot) else {
            continue;
        };
        if let Err(e) = mark_boot_failed(ops, slot) {
            crate::abl_println!(ops, "failed to disable slot {}: {}", slot.suffix(), e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::FakeOps;
    use avbab::{AbData, AB_DATA_SIZE, AB_MAX_PRIORITY, AB_MAX_TRIES_REMAINING};

    fn write_record(ops: &mut FakeOps, data: &AbData) {
        let bytes = data.serialize();
        ops.partition_mut(MISC_LABEL)[AB_METADATA_OFFSET as usize..][..AB_DATA_SIZE]
            .copy_from_slice(&bytes);
    }

    fn read_record(ops: &mut FakeOps) -> AbData {
        let mut backing = [0u8; AB_DATA_SIZE];
        backing.copy_from_slice(
            &ops.partition_mut(MISC_LABEL)[AB_METADATA_OFFSET as usize..][..AB_DATA_SIZE],
        );
        AbData::deserialize(&mut backing).unwrap()
    }

    #[test]
    fn test_init_resets_garbage_metadata() {
        let mut ops = FakeOps::new();
        // The misc partition starts zeroed: no magic.
        init(&mut ops).unwrap();
        let record = read_record(&mut ops);
        assert_eq!(record.slot(SlotIndex::A).tries_remaining, AB_MAX_TRIES_REMAINING);
        assert_eq!(active_slot(&mut ops).unwrap(), Some(SlotIndex::A));
    }

    #[test]
    fn test_active_slot_prefers_higher_priority() {
        let mut ops = FakeOps::new();
        let mut data = AbData::default();
        data.slot_mut(SlotIndex::B).priority = AB_MAX_PRIORITY;
        write_record(&mut ops, &data);
        assert_eq!(active_slot(&mut ops).unwrap(), Some(SlotIndex::B));
    }

    #[test]
    fn test_mark_boot_attempt_persists() {
        let mut ops = FakeOps::new();
        init(&mut ops).unwrap();
        mark_boot_attempt(&mut ops, SlotIndex::A).unwrap();
        let record = read_record(&mut ops);
        assert_eq!(record.slot(SlotIndex::A).tries_remaining, AB_MAX_TRIES_REMAINING - 1);
    }

    #[test]
    fn test_mark_boot_failed_elects_other_slot() {
        let mut ops = FakeOps::new();
        init(&mut ops).unwrap();
        mark_boot_failed(&mut ops, SlotIndex::A).unwrap();
        assert_eq!(active_slot(&mut ops).unwrap(), Some(SlotIndex::B));
        mark_boot_failed(&mut ops, SlotIndex::B).unwrap();
        assert_eq!(active_slot(&mut ops).unwrap(), None);
    }

    #[test]
    fn test_loader_reported_failure_disables_slot() {
        let mut ops = FakeOps::new();
        // The loader booted slot 1; slot 0 failed with a nonzero code.
        ops::set_var_u8(ops.vars(), devstate::FASTBOOT_NAMESPACE, ops::LOADED_SLOT_VAR, 1)
            .unwrap();
        ops::set_var_u8(
            ops.vars(),
            devstate::FASTBOOT_NAMESPACE,
            &loaded_slot_failed_var(0),
            0x17,
        )
        .unwrap();

        init(&mut ops).unwrap();
        assert_eq!(active_slot(&mut ops).unwrap(), Some(SlotIndex::B));
        assert!(!slot_info(&mut ops, SlotIndex::A).unwrap().is_bootable());
    }

    #[test]
    fn test_loader_report_absent_is_noop() {
        let mut ops = FakeOps::new();
        init(&mut ops).unwrap();
        assert_eq!(active_slot(&mut ops).unwrap(), Some(SlotIndex::A));
    }

    #[test]
    fn test_set_active_switches_slots() {
        let mut ops = FakeOps::new();
        init(&mut ops).unwrap();
        set_active(&mut ops, SlotIndex::B).unwrap();
        assert_eq!(active_slot(&mut ops).unwrap(), Some(SlotIndex::B));
        let b = slot_info(&mut ops, SlotIndex::B).unwrap();
        assert_eq!(b.priority, AB_MAX_PRIORITY);
        assert!(!b.successful);
    }

    #[test]
    fn test_verity_corrupted_round_trip() {
        let mut ops = FakeOps::new();
        init(&mut ops).unwrap();
        set_verity_corrupted(&mut ops, SlotIndex::A, true).unwrap();
        assert!(slot_info(&mut ops, SlotIndex::A).unwrap().verity_corrupted);
        // Bootability is unaffected.
        assert_eq!(active_slot(&mut ops).unwrap(), Some(SlotIndex::A));
    }
}
