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

//! Tamper-resistant device state: lock state, anti-rollback indices and the
//! TEE seed.
//!
//! The state is persisted on whichever backing the platform provides:
//!
//!   * a TPM 2.0 NV index ([tpm2::Tpm2Store]),
//!   * authenticated non-volatile firmware variables ([nvvars::AuthVarStore]),
//!   * a shared-memory channel to a hypervisor peer ([teefwd::TeeStore]).
//!
//! All backings expose the same [DeviceState] operations and enforce the
//! same invariants: rollback indices never decrease, the TEE seed can be
//! read at most once per boot, and [DeviceState::seal] is idempotent within
//! a boot.

#![cfg_attr(not(test), no_std)]

use liberror::{Error, Result};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub mod nvvars;
pub mod teefwd;
pub mod tpm2;

/// Number of rollback index slots the record can hold.
pub const ROLLBACK_SLOTS: usize = 8;
/// Size of the TEE seed in bytes.
pub const TRUSTY_SEED_SIZE: usize = 32;

/// Version of [DeviceStateRecord] this implementation writes.
pub const DEVICE_STATE_STRUCT_VER: u8 = 1;

const LOCK_STATE_UNLOCKED_BIT: u8 = 1 << 0;

/// Device lock state.
///
/// `Provisioning` is transient: it exists only while the device state record
/// is absent and the hardware life-cycle signal does not say "end user". It
/// is never persisted; a provisioning device stores `Unlocked`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Verification failures are fatal.
    Locked,
    /// Verification is skipped; the boot state is at most orange.
    Unlocked,
    /// First boot after manufacturing, before the state record exists.
    Provisioning,
}

impl LockState {
    /// Parses the persisted representation.
    pub fn from_wire(val: u8) -> Self {
        match val & LOCK_STATE_UNLOCKED_BIT {
            0 => Self::Locked,
            _ => Self::Unlocked,
        }
    }

    /// Serializes for persistence. `Provisioning` is stored as unlocked.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Locked => 0,
            Self::Unlocked | Self::Provisioning => LOCK_STATE_UNLOCKED_BIT,
        }
    }

    /// Whether verification enforcement applies.
    pub fn is_locked(self) -> bool {
        self == Self::Locked
    }
}

/// Software build variant of the running bootloader. Decides the lock state
/// assumed when the backing store cannot be read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildVariant {
    /// Production build: unreadable state is treated as `Locked`.
    User,
    /// Development build: unreadable state is treated as `Unlocked`.
    Userdebug,
}

impl BuildVariant {
    /// The lock state assumed on a state read failure.
    pub fn fallback_lock_state(self) -> LockState {
        match self {
            BuildVariant::User => LockState::Locked,
            BuildVariant::Userdebug => LockState::Unlocked,
        }
    }
}

/// The persisted device state record. Serialized little-endian at the head
/// of a 512 byte NV space; the remainder is reserved for future use. The
/// layout is naturally aligned, so `repr(C)` carries no padding.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct DeviceStateRecord {
    /// The version of this struct.
    pub struct_ver: u8,
    /// Wire form of the lock state.
    pub lock_state: u8,
    /// Alignment padding; zero.
    pub reserved: [u8; 6],
    /// Monotonic anti-rollback counters.
    pub rollback_index: [u64; ROLLBACK_SLOTS],
}
static_assertions::const_assert_eq!(core::mem::size_of::<DeviceStateRecord>(), 72);

impl DeviceStateRecord {
    /// A fresh record for a just-provisioned device.
    pub fn new_provisioned(lock_state: LockState) -> Self {
        Self {
            struct_ver: DEVICE_STATE_STRUCT_VER,
            lock_state: lock_state.to_wire(),
            reserved: [0u8; 6],
            rollback_index: [0u64; ROLLBACK_SLOTS],
        }
    }
}

/// The device state store operations, identical across backings.
pub trait DeviceState {
    /// Loads or lazily creates the backing record. Must be called before any
    /// other operation.
    fn init(&mut self) -> Result<()>;

    /// Reads the lock state.
    fn read_lock_state(&mut self) -> Result<LockState>;

    /// Persists a new lock state. Only the fastboot path calls this.
    fn write_lock_state(&mut self, state: LockState) -> Result<()>;

    /// Reads the rollback index in `slot`.
    fn read_rollback_index(&mut self, slot: usize) -> Result<u64>;

    /// Writes the rollback index in `slot`. Decreasing an index is refused
    /// with [Error::PolicyViolation].
    fn write_rollback_index(&mut self, slot: usize, value: u64) -> Result<()>;

    /// Reads the TEE seed. Succeeds at most once per boot; the second call
    /// fails with [Error::AccessDenied] and the seed stays read-locked until
    /// the next power cycle.
    fn read_trusty_seed(&mut self, out: &mut [u8; TRUSTY_SEED_SIZE]) -> Result<()>;

    /// Locks the store for the rest of the boot. Called just before kernel
    /// handover, strictly after all rollback writes. Idempotent within a
    /// boot; the locks are transient over a platform reset.
    fn seal(&mut self) -> Result<()>;
}

/// Hardware random number generator interface.
pub trait Rng {
    /// Fills `out` with random bytes.
    fn fill(&mut self, out: &mut [u8]) -> Result<()>;
}

/// Namespace of the loader-owned variables.
pub const LOADER_NAMESPACE: &str = "loader";
/// Namespace of the fastboot-owned variables.
pub const FASTBOOT_NAMESPACE: &str = "fastboot";

/// Non-volatile firmware variable store interface.
///
/// Variables set with `runtime_accessible = false` must carry the
/// boot-services-only attribute so the OS cannot tamper with them.
pub trait VarStore {
    /// Reads variable `name` in `namespace` into `out`. Returns the data
    /// size, or [Error::NotFound].
    fn get_var(&mut self, namespace: &str, name: &str, out: &mut [u8]) -> Result<usize>;

    /// Creates or replaces variable `name` in `namespace`.
    fn set_var(
        &mut self,
        namespace: &str,
        name: &str,
        data: &[u8],
        runtime_accessible: bool,
    ) -> Result<()>;

    /// Deletes variable `name` in `namespace`. Deleting an absent variable
    /// is not an error.
    fn del_var(&mut self, namespace: &str, name: &str) -> Result<()>;
}

/// Validates a rollback slot number.
pub(crate) fn check_rollback_slot(slot: usize) -> Result<()> {
    match slot < ROLLBACK_SLOTS {
        true => Ok(()),
        false => Err(Error::BadIndex(slot)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lock_state_wire_round_trip() {
        assert_eq!(LockState::from_wire(LockState::Locked.to_wire()), LockState::Locked);
        assert_eq!(LockState::from_wire(LockState::Unlocked.to_wire()), LockState::Unlocked);
        // Provisioning is never persisted as such.
        assert_eq!(LockState::from_wire(LockState::Provisioning.to_wire()), LockState::Unlocked);
    }

    #[test]
    fn test_lock_state_ignores_reserved_bits() {
        assert_eq!(LockState::from_wire(0xfe), LockState::Locked);
        assert_eq!(LockState::from_wire(0xff), LockState::Unlocked);
    }

    #[test]
    fn test_fallback_lock_state() {
        assert_eq!(BuildVariant::User.fallback_lock_state(), LockState::Locked);
        assert_eq!(BuildVariant::Userdebug.fallback_lock_state(), LockState::Unlocked);
    }

    #[test]
    fn test_record_layout() {
        let record = DeviceStateRecord::new_provisioned(LockState::Unlocked);
        let bytes = record.as_bytes();
        assert_eq!(bytes.len(), 72);
        assert_eq!(bytes[0], DEVICE_STATE_STRUCT_VER);
        assert_eq!(bytes[1], 1);
        assert!(bytes[2..].iter().all(|b| *b == 0));
    }
}
