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

//! Android A/B boot slot metadata library.
//!
//! The metadata is a 32 byte big-endian record stored at a fixed offset of
//! the misc partition, after the bootloader control block. Each slot packs
//! priority, remaining tries and the successful flag into a single byte.

#![cfg_attr(not(test), no_std)]

use core::{cmp::min, fmt::Write, mem::size_of};

use crc32fast::Hasher;
use liberror::{Error, Result};

const AB_MAGIC: &[u8; 4] = b"\0AB0";
const AB_MAJOR_VERSION: u8 = 1;
const AB_MINOR_VERSION: u8 = 0;

/// Offset of the metadata record within the misc partition.
pub const AB_METADATA_OFFSET: u64 = 2048;

/// Highest valid slot priority.
pub const AB_MAX_PRIORITY: u8 = 15;
/// Maximum number of retries.
pub const AB_MAX_TRIES_REMAINING: u8 = 7;
/// Priority both slots are reset to when the record is (re)initialized.
pub const AB_DEFAULT_PRIORITY: u8 = 7;

const PRIORITY_MASK: u8 = 0b1111;
const TRIES_OFFSET: u8 = 4;
const TRIES_MASK: u8 = 0b111;
const SUCCESSFUL_BIT: u8 = 1 << 7;

/// `Ops` provides the backend interfaces needed by the A/B APIs.
pub trait Ops {
    /// Reads exactly `out.len()` bytes into `out` from the persistent
    /// storage hosting the A/B metadata.
    fn read_ab_metadata(&mut self, out: &mut [u8]) -> Result<()>;

    /// Writes exactly `data.len()` bytes from `data` to the persistent
    /// storage hosting the A/B metadata. The backend must write the whole
    /// record in one operation.
    fn write_ab_metadata(&mut self, data: &[u8]) -> Result<()>;

    /// Returns an optional console writer for logging error messages.
    fn console(&mut self) -> Option<&mut dyn Write>;
}

impl Ops for [u8; AB_DATA_SIZE] {
    fn read_ab_metadata(&mut self, out: &mut [u8]) -> Result<()> {
        Ok(out
            .clone_from_slice(self.get(..out.len()).ok_or(Error::BufferTooSmall(Some(out.len())))?))
    }

    fn write_ab_metadata(&mut self, data: &[u8]) -> Result<()> {
        Ok(self
            .get_mut(..data.len())
            .ok_or(Error::BufferTooSmall(Some(data.len())))?
            .clone_from_slice(data))
    }

    fn console(&mut self) -> Option<&mut dyn Write> {
        None
    }
}

/// Helper macro for printing A/B log messages.
macro_rules! ab_print {
    ( $ab_ops:expr, $( $x:expr ),* $(,)? ) => {
            match $ab_ops.console() {
                Some(f) => write!(f, $($x,)*).unwrap(),
                _ => {}
            }
    };
}

/// `SlotIndex` identifies one of the two A/B slots.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SlotIndex {
    /// A slot.
    A,
    /// B slot.
    B,
}

impl SlotIndex {
    /// Gets the other slot.
    pub fn other(&self) -> Self {
        match self {
            SlotIndex::A => SlotIndex::B,
            SlotIndex::B => SlotIndex::A,
        }
    }

    /// The partition suffix for this slot, including the leading underscore.
    pub fn suffix(&self) -> &'static str {
        match self {
            SlotIndex::A => "_a",
            SlotIndex::B => "_b",
        }
    }

    fn array_index(&self) -> usize {
        match self {
            SlotIndex::A => 0,
            SlotIndex::B => 1,
        }
    }
}

impl TryFrom<usize> for SlotIndex {
    type Error = Error;

    fn try_from(val: usize) -> Result<SlotIndex> {
        match val {
            0 => Ok(SlotIndex::A),
            1 => Ok(SlotIndex::B),
            v => Err(Error::BadIndex(v)),
        }
    }
}

/// Unpacked per-slot metadata.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct AbSlotData {
    /// Slot priority. Unbootable slots always have priority 0.
    pub priority: u8,
    /// Boot attempts remaining.
    pub tries_remaining: u8,
    /// Whether this slot is known successful.
    pub successful: bool,
    /// Whether dm-verity reported corruption for this slot.
    pub verity_corrupted: bool,
}

impl AbSlotData {
    /// Parses from the packed byte. The verity flag lives outside the packed
    /// byte and is supplied separately.
    fn unpack(packed: u8, verity_corrupted: bool) -> Self {
        Self {
            priority: packed & PRIORITY_MASK,
            tries_remaining: (packed >> TRIES_OFFSET) & TRIES_MASK,
            successful: (packed & SUCCESSFUL_BIT) != 0,
            verity_corrupted,
        }
    }

    /// Serializes to the packed byte.
    fn pack(&self) -> u8 {
        (self.priority & PRIORITY_MASK)
            | ((self.tries_remaining & TRIES_MASK) << TRIES_OFFSET)
            | if self.successful { SUCCESSFUL_BIT } else { 0 }
    }

    /// Returns if the slot is a valid boot candidate.
    pub fn is_bootable(&self) -> bool {
        self.priority > 0 && (self.successful || self.tries_remaining > 0)
    }

    fn set_unbootable(&mut self) {
        self.priority = 0;
        self.tries_remaining = 0;
        self.successful = false;
    }

    /// Gets the priority used for active slot election, treating unbootable
    /// slots as priority 0.
    fn normalized_priority(&self) -> u8 {
        match self.is_bootable() {
            true => self.priority,
            _ => 0,
        }
    }

    /// Ensures all unbootable or illegal states are the canonical unbootable
    /// state, and that a successful slot carries no tries.
    fn normalize(&mut self) {
        if self.priority > 0 {
            if self.tries_remaining == 0 && !self.successful {
                self.set_unbootable();
                return;
            }
            if self.successful {
                // Invariant: successful implies no remaining tries.
                self.tries_remaining = 0;
            }
            self.priority = min(self.priority, AB_MAX_PRIORITY);
            self.tries_remaining = min(self.tries_remaining, AB_MAX_TRIES_REMAINING);
        } else {
            self.set_unbootable();
        }
    }
}

/// `AbData` is the in-memory form of the A/B metadata record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AbData {
    /// Metadata major version.
    pub version_major: u8,
    /// Metadata minor version.
    pub version_minor: u8,
    /// A/B slot data.
    pub slots: [AbSlotData; 2],
    /// Retry budget for the recovery image.
    pub recovery_tries_remaining: u8,
}

/// Size of the serialized record.
pub const AB_DATA_SIZE: usize = 32;

// Serialized layout. The spec reserves bytes 16..28; this implementation
// stores the recovery retry counter and the per-slot verity flags there.
const MAGIC_RANGE: core::ops::Range<usize> = 0..4;
const SLOT_COUNT_RANGE: core::ops::Range<usize> = 8..12;
const SLOT_DATA_OFFSET: usize = 12;
const RECOVERY_TRIES_OFFSET: usize = 16;
const VERITY_FLAGS_OFFSET: usize = 17;
const CRC_RANGE: core::ops::Range<usize> = 28..32;
const CRC_COVERED: usize = 28;

impl AbData {
    /// Returns a const reference to the slot data for `slot`.
    pub fn slot(&self, slot: SlotIndex) -> &AbSlotData {
        &self.slots[slot.array_index()]
    }

    /// Returns a mutable reference to the slot data for `slot`.
    pub fn slot_mut(&mut self, slot: SlotIndex) -> &mut AbSlotData {
        &mut self.slots[slot.array_index()]
    }

    /// Reads, parses and checks the metadata record from persistent storage.
    pub fn deserialize(ab_ops: &mut dyn Ops) -> Result<Self> {
        let mut bytes = [0u8; AB_DATA_SIZE];
        ab_ops.read_ab_metadata(&mut bytes[..])?;

        if bytes[MAGIC_RANGE] != AB_MAGIC[..] {
            ab_print!(ab_ops, "A/B metadata magic is incorrect.\n");
            return Err(Error::BadMagic);
        }
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..CRC_COVERED]);
        if u32::from_be_bytes(bytes[CRC_RANGE].try_into().unwrap()) != hasher.finalize() {
            ab_print!(ab_ops, "A/B metadata CRC32 does not match.\n");
            return Err(Error::BadChecksum);
        }
        if bytes[4] > AB_MAJOR_VERSION {
            ab_print!(ab_ops, "No support for given A/B metadata major version.\n");
            return Err(Error::UnsupportedVersion);
        }
        if u32::from_be_bytes(bytes[SLOT_COUNT_RANGE].try_into().unwrap()) != 2 {
            ab_print!(ab_ops, "Unexpected slot count.\n");
            return Err(Error::InvalidInput);
        }

        let verity = bytes[VERITY_FLAGS_OFFSET];
        Ok(Self {
            version_major: bytes[4],
            version_minor: bytes[5],
            slots: [
                AbSlotData::unpack(bytes[SLOT_DATA_OFFSET], (verity & 1) != 0),
                AbSlotData::unpack(bytes[SLOT_DATA_OFFSET + 1], (verity & 2) != 0),
            ],
            recovery_tries_remaining: bytes[RECOVERY_TRIES_OFFSET],
        })
    }

    /// Serializes the record, recomputing the CRC32 over the first 28 bytes.
    pub fn serialize(&self) -> [u8; AB_DATA_SIZE] {
        let mut res = [0u8; AB_DATA_SIZE];
        res[MAGIC_RANGE].clone_from_slice(AB_MAGIC);
        res[4] = self.version_major;
        res[5] = self.version_minor;
        res[SLOT_COUNT_RANGE].clone_from_slice(&2u32.to_be_bytes());
        res[SLOT_DATA_OFFSET] = self.slot(SlotIndex::A).pack();
        res[SLOT_DATA_OFFSET + 1] = self.slot(SlotIndex::B).pack();
        res[RECOVERY_TRIES_OFFSET] = self.recovery_tries_remaining;
        res[VERITY_FLAGS_OFFSET] = (self.slot(SlotIndex::A).verity_corrupted as u8)
            | ((self.slot(SlotIndex::B).verity_corrupted as u8) << 1);
        let mut hasher = Hasher::new();
        hasher.update(&res[..CRC_COVERED]);
        res[CRC_RANGE].clone_from_slice(&hasher.finalize().to_be_bytes());
        res
    }

    /// Returns the active slot, or `None` when every slot is exhausted.
    ///
    /// Active is the highest priority bootable slot; ties go to the slot
    /// with the lower suffix.
    pub fn active_slot(&self) -> Option<SlotIndex> {
        let priority_a = self.slot(SlotIndex::A).normalized_priority();
        let priority_b = self.slot(SlotIndex::B).normalized_priority();
        if priority_b > priority_a {
            return Some(SlotIndex::B);
        } else if priority_a > 0 {
            return Some(SlotIndex::A);
        }
        None
    }
}

impl Default for AbData {
    fn default() -> Self {
        Self {
            version_major: AB_MAJOR_VERSION,
            version_minor: AB_MINOR_VERSION,
            slots: [
                AbSlotData {
                    priority: AB_DEFAULT_PRIORITY,
                    tries_remaining: AB_MAX_TRIES_REMAINING,
                    successful: false,
                    verity_corrupted: false,
                },
                AbSlotData {
                    priority: AB_DEFAULT_PRIORITY,
                    tries_remaining: AB_MAX_TRIES_REMAINING,
                    successful: false,
                    verity_corrupted: false,
                },
            ],
            recovery_tries_remaining: AB_MAX_TRIES_REMAINING,
        }
    }
}

/// Loads the metadata record and normalizes it, resetting to the well-known
/// default if the record is absent or corrupt. Changes as a result of
/// normalization are not written back, but a copy of the exact original
/// data is returned for use with [save_metadata_if_changed].
///
/// On success returns Ok((ab_data, ab_data_orig)).
pub fn load_metadata(ab_ops: &mut dyn Ops) -> Result<(AbData, AbData)> {
    let mut reset_to_default = false;
    let mut ab_data = match AbData::deserialize(ab_ops) {
        Ok(v) => v,
        Err(Error::BadMagic) | Err(Error::BadChecksum) | Err(Error::UnsupportedVersion) => {
            ab_print!(ab_ops, "Resetting A/B metadata to default.\n");
            reset_to_default = true;
            Default::default()
        }
        Err(e) => {
            ab_print!(ab_ops, "read_ab_metadata error: {:?}\n", e);
            return Err(e);
        }
    };
    ab_data.slot_mut(SlotIndex::A).normalize();
    ab_data.slot_mut(SlotIndex::B).normalize();

    let ab_data_orig = match reset_to_default {
        // Force a write-back by making the original differ from any
        // normalized state.
        true => AbData { version_major: 0, ..ab_data },
        _ => ab_data,
    };
    Ok((ab_data, ab_data_orig))
}

/// Serializes and saves metadata to persistent storage.
pub fn save_metadata(ab_ops: &mut dyn Ops, ab_data: &AbData) -> Result<()> {
    ab_ops.write_ab_metadata(&ab_data.serialize())
}

/// Writes metadata back only if it has changed. `ab_data_orig` should be
/// from [load_metadata].
pub fn save_metadata_if_changed(
    ab_ops: &mut dyn Ops,
    ab_data: &AbData,
    ab_data_orig: &AbData,
) -> Result<()> {
    match ab_data == ab_data_orig {
        true => Ok(()),
        _ => save_metadata(ab_ops, ab_data),
    }
}

/// Returns the active slot, or `None` when all slots are exhausted. Resets
/// corrupt metadata to the default record on the way.
pub fn get_active_slot(ab_ops: &mut dyn Ops) -> Result<Option<SlotIndex>> {
    let (ab_data, ab_data_orig) = load_metadata(ab_ops)?;
    save_metadata_if_changed(ab_ops, &ab_data, &ab_data_orig)?;
    Ok(ab_data.active_slot())
}

/// Records a boot attempt: decrements the retry counter of a
/// not-yet-successful slot, saturating at zero.
pub fn mark_boot_attempt(ab_ops: &mut dyn Ops, slot: SlotIndex) -> Result<()> {
    let (mut ab_data, ab_data_orig) = load_metadata(ab_ops)?;
    let slot_data = ab_data.slot_mut(slot);
    if !slot_data.successful {
        slot_data.tries_remaining = slot_data.tries_remaining.saturating_sub(1);
    }
    save_metadata_if_changed(ab_ops, &ab_data, &ab_data_orig)
}

/// Permanently disables a slot. Invoked on verification failure after all
/// retries are spent.
pub fn mark_slot_unbootable(ab_ops: &mut dyn Ops, slot: SlotIndex) -> Result<()> {
    let (mut ab_data, ab_data_orig) = load_metadata(ab_ops)?;
    ab_data.slot_mut(slot).set_unbootable();
    save_metadata_if_changed(ab_ops, &ab_data, &ab_data_orig)
}

/// Makes `slot` the active slot: top priority, full retry budget, not
/// successful. The other slot is capped one priority level below.
pub fn mark_slot_active(ab_ops: &mut dyn Ops, slot: SlotIndex) -> Result<()> {
    let (mut ab_data, ab_data_orig) = load_metadata(ab_ops)?;
    let slot_data = ab_data.slot_mut(slot);
    slot_data.priority = AB_MAX_PRIORITY;
    slot_data.tries_remaining = AB_MAX_TRIES_REMAINING;
    slot_data.successful = false;

    let other = slot.other();
    let capped = min(ab_data.slot(other).priority, AB_MAX_PRIORITY - 1);
    ab_data.slot_mut(other).priority = capped;

    save_metadata_if_changed(ab_ops, &ab_data, &ab_data_orig)
}

/// Toggles the dm-verity corruption flag without altering bootability.
pub fn set_verity_corrupted(ab_ops: &mut dyn Ops, slot: SlotIndex, corrupted: bool) -> Result<()> {
    let (mut ab_data, ab_data_orig) = load_metadata(ab_ops)?;
    ab_data.slot_mut(slot).verity_corrupted = corrupted;
    save_metadata_if_changed(ab_ops, &ab_data, &ab_data_orig)
}

/// Gets the per-slot metadata after normalization.
pub fn get_slot_info(ab_ops: &mut dyn Ops, slot: SlotIndex) -> Result<AbSlotData> {
    let (ab_data, _) = load_metadata(ab_ops)?;
    Ok(*ab_data.slot(slot))
}
