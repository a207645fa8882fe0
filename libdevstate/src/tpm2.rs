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

//! TPM 2.0 backing for the device state store.
//!
//! The state lives in two NV indices. The `bootloader` index holds the
//! [DeviceStateRecord] and is created lazily on the first boot after
//! provisioning. The `trusty_seed` index is fused once with 32 random bytes
//! and write-locked forever; it is read-locked after the first read of each
//! boot cycle so the seed never survives into the OS.

use liberror::{Error, Result};
use zerocopy::{AsBytes, FromBytes};

use crate::{
    check_rollback_slot, BuildVariant, DeviceState, DeviceStateRecord, LockState,
    DEVICE_STATE_STRUCT_VER, TRUSTY_SEED_SIZE,
};

/// NV index holding the fused TEE seed.
pub const NV_INDEX_TRUSTY_SEED: u32 = 0x0150_0080;
/// NV index holding the device state record.
pub const NV_INDEX_BOOTLOADER: u32 = 0x0150_0082;
/// Allocated size of the bootloader index. New indices cannot be created
/// after the owner is locked, so more space than the record needs is
/// reserved up front.
pub const NV_INDEX_BOOTLOADER_SIZE: u16 = 512;

/// Upper bound on TPM command-ready polls.
pub const MAX_DELAY_ITERATIONS: u32 = 5000;
/// Stall between TPM command-ready polls, in microseconds.
pub const DELAY_POLL_STALL_US: u64 = 1;

/// NV index attributes, the subset of TPMA_NV this store uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NvAttributes {
    /// The index data can be written with owner authorization.
    pub owner_write: bool,
    /// USER role authorization may write the index.
    pub auth_write: bool,
    /// The index data may be read with the authValue.
    pub auth_read: bool,
    /// Partial writes are rejected; writes must cover the whole index.
    pub write_all: bool,
    /// A write lock persists over TPM reset (fuse semantics).
    pub write_define: bool,
    /// A write lock clears on TPM reset.
    pub write_stclear: bool,
    /// A read lock clears on TPM reset.
    pub read_stclear: bool,
}

impl NvAttributes {
    /// Attributes of the seed index: fused once, readable once per boot.
    pub fn seed() -> Self {
        Self {
            owner_write: true,
            auth_write: true,
            auth_read: true,
            write_all: true,
            write_define: true,
            read_stclear: true,
            ..Default::default()
        }
    }

    /// Attributes of the bootloader state index: rewritable, lockable per
    /// boot cycle.
    pub fn bootloader() -> Self {
        Self {
            owner_write: true,
            auth_write: true,
            auth_read: true,
            write_stclear: true,
            read_stclear: true,
            ..Default::default()
        }
    }
}

/// Low-level TPM 2.0 command interface provided by the platform.
///
/// Implementations are expected to poll command readiness up to
/// [MAX_DELAY_ITERATIONS] times with a [DELAY_POLL_STALL_US] stall and
/// return [Error::Timeout] on exhaustion.
pub trait Tpm {
    /// Queries a TPM capability property.
    fn get_capability(&mut self, capability: u32, property: u32) -> Result<u32>;

    /// Defines a new NV index.
    fn nv_define(&mut self, index: u32, attributes: NvAttributes, size: u16) -> Result<()>;

    /// Reads `out.len()` bytes from an NV index at `offset`.
    fn nv_read(&mut self, index: u32, offset: u16, out: &mut [u8]) -> Result<()>;

    /// Writes `data` to an NV index at `offset`.
    fn nv_write(&mut self, index: u32, offset: u16, data: &[u8]) -> Result<()>;

    /// Blocks reads of an NV index until the next TPM reset.
    fn nv_read_lock(&mut self, index: u32) -> Result<()>;

    /// Blocks writes of an NV index; permanent for `write_define` indices.
    fn nv_write_lock(&mut self, index: u32) -> Result<()>;

    /// Fills `out` with TPM-generated random bytes.
    fn get_random(&mut self, out: &mut [u8]) -> Result<()>;
}

/// Device state store backed by TPM 2.0 NV indices.
pub struct Tpm2Store<T: Tpm> {
    tpm: T,
    build: BuildVariant,
    secure_boot: bool,
    end_user: bool,
    record: Option<DeviceStateRecord>,
    provisioning: bool,
    seed_read: bool,
    sealed: bool,
}

impl<T: Tpm> Tpm2Store<T> {
    /// Creates the store.
    ///
    /// `secure_boot` is the platform secure boot state; NV indices are never
    /// created without it. `end_user` is the hardware life-cycle signal.
    pub fn new(tpm: T, build: BuildVariant, secure_boot: bool, end_user: bool) -> Self {
        Self {
            tpm,
            build,
            secure_boot,
            end_user,
            record: None,
            provisioning: false,
            seed_read: false,
            sealed: false,
        }
    }

    fn persist(&mut self) -> Result<()> {
        let record = self.record.as_ref().ok_or(Error::InvalidState)?;
        self.tpm.nv_write(NV_INDEX_BOOTLOADER, 0, record.as_bytes())
    }

    /// Creates the bootloader index and fuses the seed. First boot only.
    fn provision(&mut self) -> Result<()> {
        if !self.secure_boot {
            return Err(Error::PolicyViolation);
        }

        let lock_state = match self.end_user {
            true => LockState::Locked,
            false => LockState::Unlocked,
        };
        self.tpm.nv_define(
            NV_INDEX_BOOTLOADER,
            NvAttributes::bootloader(),
            NV_INDEX_BOOTLOADER_SIZE,
        )?;
        self.record = Some(DeviceStateRecord::new_provisioned(lock_state));
        self.persist()?;
        self.fuse_trusty_seed()?;
        self.provisioning = !self.end_user;
        Ok(())
    }

    /// Generates the seed, writes it, write-locks it forever and verifies
    /// the write took.
    fn fuse_trusty_seed(&mut self) -> Result<()> {
        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        self.tpm.get_random(&mut seed)?;
        self.tpm.nv_define(NV_INDEX_TRUSTY_SEED, NvAttributes::seed(), TRUSTY_SEED_SIZE as u16)?;
        self.tpm.nv_write(NV_INDEX_TRUSTY_SEED, 0, &seed)?;
        self.tpm.nv_write_lock(NV_INDEX_TRUSTY_SEED)?;

        let mut readback = [0u8; TRUSTY_SEED_SIZE];
        self.tpm.nv_read(NV_INDEX_TRUSTY_SEED, 0, &mut readback)?;
        if readback != seed {
            return Err(Error::DeviceError);
        }
        seed.fill(0);
        readback.fill(0);
        Ok(())
    }
}

impl<T: Tpm> DeviceState for Tpm2Store<T> {
    fn init(&mut self) -> Result<()> {
        let mut bytes = [0u8; core::mem::size_of::<DeviceStateRecord>()];
        match self.tpm.nv_read(NV_INDEX_BOOTLOADER, 0, &mut bytes) {
            Ok(()) => {
                let record =
                    DeviceStateRecord::read_from(&bytes[..]).ok_or(Error::InvalidState)?;
                if record.struct_ver > DEVICE_STATE_STRUCT_VER {
                    return Err(Error::UnsupportedVersion);
                }
                self.record = Some(record);
                Ok(())
            }
            Err(Error::NotFound) => self.provision(),
            Err(e) => Err(e),
        }
    }

    fn read_lock_state(&mut self) -> Result<LockState> {
        if self.provisioning {
            return Ok(LockState::Provisioning);
        }
        Ok(match self.record {
            Some(record) => LockState::from_wire(record.lock_state),
            // Unreadable state degrades by build variant rather than
            // bricking the device.
            None => self.build.fallback_lock_state(),
        })
    }

    fn write_lock_state(&mut self, state: LockState) -> Result<()> {
        if self.sealed {
            return Err(Error::AccessDenied);
        }
        let record = self.record.as_mut().ok_or(Error::InvalidState)?;
        record.lock_state = state.to_wire();
        self.persist()
    }

    fn read_rollback_index(&mut self, slot: usize) -> Result<u64> {
        check_rollback_slot(slot)?;
        let record = self.record.as_ref().ok_or(Error::InvalidState)?;
        Ok(record.rollback_index[slot])
    }

    fn write_rollback_index(&mut self, slot: usize, value: u64) -> Result<()> {
        check_rollback_slot(slot)?;
        if self.sealed {
            return Err(Error::AccessDenied);
        }
        let record = self.record.as_mut().ok_or(Error::InvalidState)?;
        if value < record.rollback_index[slot] {
            return Err(Error::PolicyViolation);
        }
        record.rollback_index[slot] = value;
        self.persist()
    }

    fn read_trusty_seed(&mut self, out: &mut [u8; TRUSTY_SEED_SIZE]) -> Result<()> {
        if self.seed_read {
            return Err(Error::AccessDenied);
        }
        let read = self.tpm.nv_read(NV_INDEX_TRUSTY_SEED, 0, out);
        // Lock regardless of the read result.
        let lock = self.tpm.nv_read_lock(NV_INDEX_TRUSTY_SEED);
        self.seed_read = true;
        read.and(lock)
    }

    fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.tpm.nv_read_lock(NV_INDEX_BOOTLOADER)?;
        if !self.seed_read {
            self.tpm.nv_read_lock(NV_INDEX_TRUSTY_SEED)?;
        }
        self.tpm.nv_write_lock(NV_INDEX_TRUSTY_SEED)?;
        self.sealed = true;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    struct NvIndex {
        attributes: NvAttributes,
        data: Vec<u8>,
        read_locked: bool,
        write_locked: bool,
    }

    /// In-memory TPM with just enough NV semantics for the store.
    pub(crate) struct FakeTpm {
        indices: Vec<(u32, NvIndex)>,
        fail_reads: bool,
    }

    impl FakeTpm {
        pub(crate) fn new() -> Self {
            Self { indices: Vec::new(), fail_reads: false }
        }

        fn index(&mut self, index: u32) -> Option<&mut NvIndex> {
            self.indices.iter_mut().find(|(i, _)| *i == index).map(|(_, v)| v)
        }

        /// Simulates a TPM reset: STCLEAR locks drop, fused locks stay.
        pub(crate) fn reset(&mut self) {
            for (_, idx) in self.indices.iter_mut() {
                idx.read_locked = false;
                if !idx.attributes.write_define {
                    idx.write_locked = false;
                }
            }
        }

        fn failing() -> Self {
            Self { indices: Vec::new(), fail_reads: true }
        }
    }

    impl Tpm for FakeTpm {
        fn get_capability(&mut self, _capability: u32, _property: u32) -> Result<u32> {
            Ok(0)
        }

        fn nv_define(&mut self, index: u32, attributes: NvAttributes, size: u16) -> Result<()> {
            if self.index(index).is_some() {
                return Err(Error::AccessDenied);
            }
            self.indices.push((
                index,
                NvIndex {
                    attributes,
                    data: vec![0u8; size as usize],
                    read_locked: false,
                    write_locked: false,
                },
            ));
            Ok(())
        }

        fn nv_read(&mut self, index: u32, offset: u16, out: &mut [u8]) -> Result<()> {
            if self.fail_reads {
                return Err(Error::DeviceError);
            }
            let idx = self.index(index).ok_or(Error::NotFound)?;
            if idx.read_locked {
                return Err(Error::AccessDenied);
            }
            let start = offset as usize;
            out.copy_from_slice(&idx.data[start..start + out.len()]);
            Ok(())
        }

        fn nv_write(&mut self, index: u32, offset: u16, data: &[u8]) -> Result<()> {
            let idx = self.index(index).ok_or(Error::NotFound)?;
            if idx.write_locked {
                return Err(Error::AccessDenied);
            }
            if idx.attributes.write_all && (offset != 0 || data.len() != idx.data.len()) {
                return Err(Error::AccessDenied);
            }
            let start = offset as usize;
            idx.data[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn nv_read_lock(&mut self, index: u32) -> Result<()> {
            let idx = self.index(index).ok_or(Error::NotFound)?;
            if !idx.attributes.read_stclear {
                return Err(Error::AccessDenied);
            }
            idx.read_locked = true;
            Ok(())
        }

        fn nv_write_lock(&mut self, index: u32) -> Result<()> {
            let idx = self.index(index).ok_or(Error::NotFound)?;
            if !idx.attributes.write_define && !idx.attributes.write_stclear {
                return Err(Error::AccessDenied);
            }
            idx.write_locked = true;
            Ok(())
        }

        fn get_random(&mut self, out: &mut [u8]) -> Result<()> {
            // Deterministic but non-zero.
            for (i, b) in out.iter_mut().enumerate() {
                *b = (i as u8).wrapping_mul(37).wrapping_add(11);
            }
            Ok(())
        }
    }

    fn provisioned_store() -> Tpm2Store<FakeTpm> {
        let mut store = Tpm2Store::new(FakeTpm::new(), BuildVariant::User, true, true);
        store.init().unwrap();
        store
    }

    #[test]
    fn test_provisioning_creates_indices() {
        let mut store = provisioned_store();
        assert_eq!(store.read_lock_state().unwrap(), LockState::Locked);
        assert_eq!(store.read_rollback_index(0).unwrap(), 0);
        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        store.read_trusty_seed(&mut seed).unwrap();
        assert!(seed.iter().any(|b| *b != 0));
    }

    #[test]
    fn test_provisioning_requires_secure_boot() {
        let mut store = Tpm2Store::new(FakeTpm::new(), BuildVariant::User, false, true);
        assert_eq!(store.init().unwrap_err(), Error::PolicyViolation);
    }

    #[test]
    fn test_provisioning_substate_without_enduser_lifecycle() {
        let mut store = Tpm2Store::new(FakeTpm::new(), BuildVariant::User, true, false);
        store.init().unwrap();
        assert_eq!(store.read_lock_state().unwrap(), LockState::Provisioning);
    }

    #[test]
    fn test_existing_record_loaded_on_next_boot() {
        let mut store = provisioned_store();
        store.write_lock_state(LockState::Unlocked).unwrap();
        let mut tpm = store.tpm;
        tpm.reset();

        let mut next_boot = Tpm2Store::new(tpm, BuildVariant::User, true, true);
        next_boot.init().unwrap();
        assert_eq!(next_boot.read_lock_state().unwrap(), LockState::Unlocked);
    }

    #[test]
    fn test_rollback_index_monotonic() {
        let mut store = provisioned_store();
        store.write_rollback_index(0, 5).unwrap();
        assert_eq!(store.write_rollback_index(0, 3).unwrap_err(), Error::PolicyViolation);
        assert_eq!(store.read_rollback_index(0).unwrap(), 5);
        // Equal and greater writes are fine.
        store.write_rollback_index(0, 5).unwrap();
        store.write_rollback_index(0, 6).unwrap();
    }

    #[test]
    fn test_rollback_slot_out_of_range() {
        let mut store = provisioned_store();
        assert_eq!(store.read_rollback_index(8).unwrap_err(), Error::BadIndex(8));
    }

    #[test]
    fn test_trusty_seed_single_read_per_boot() {
        let mut store = provisioned_store();
        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        store.read_trusty_seed(&mut seed).unwrap();
        assert_eq!(store.read_trusty_seed(&mut seed).unwrap_err(), Error::AccessDenied);
    }

    #[test]
    fn test_seed_locked_after_reset_cycle() {
        let mut store = provisioned_store();
        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        store.read_trusty_seed(&mut seed).unwrap();
        let first_seed = seed;

        let mut tpm = store.tpm;
        tpm.reset();
        let mut next_boot = Tpm2Store::new(tpm, BuildVariant::User, true, true);
        next_boot.init().unwrap();
        let mut seed2 = [0u8; TRUSTY_SEED_SIZE];
        next_boot.read_trusty_seed(&mut seed2).unwrap();
        assert_eq!(first_seed, seed2);
    }

    #[test]
    fn test_seal_idempotent_and_blocks_writes() {
        let mut store = provisioned_store();
        store.write_rollback_index(1, 9).unwrap();
        store.seal().unwrap();
        store.seal().unwrap();
        assert_eq!(store.write_rollback_index(1, 10).unwrap_err(), Error::AccessDenied);
        assert_eq!(store.write_lock_state(LockState::Unlocked).unwrap_err(), Error::AccessDenied);
    }

    #[test]
    fn test_seal_blocks_seed_read() {
        let mut store = provisioned_store();
        store.seal().unwrap();
        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        // The NV index is read-locked; only the TPM error surfaces.
        assert!(store.read_trusty_seed(&mut seed).is_err());
    }

    #[test]
    fn test_read_failure_falls_back_by_build() {
        let mut store = Tpm2Store::new(FakeTpm::failing(), BuildVariant::User, true, true);
        assert!(store.init().is_err());
        assert_eq!(store.read_lock_state().unwrap(), LockState::Locked);

        let mut store = Tpm2Store::new(FakeTpm::failing(), BuildVariant::Userdebug, true, true);
        assert!(store.init().is_err());
        assert_eq!(store.read_lock_state().unwrap(), LockState::Unlocked);
    }
}
