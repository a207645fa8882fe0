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

//! Authenticated non-volatile variable backing for the device state store,
//! used when the platform has no TPM.
//!
//! The lock state lives in the `OEMLock` variable; rollback indices live in
//! per-slot `RollbackIndex_%04x` variables. All variables are stored
//! boot-services-only so the OS cannot reach them. The read-lock semantics
//! of the TPM indices have no hardware equivalent here and are enforced in
//! software for the current boot.

use arrayvec::ArrayString;
use core::fmt::Write;
use liberror::{Error, Result};

use crate::{
    check_rollback_slot, BuildVariant, DeviceState, LockState, Rng, VarStore, FASTBOOT_NAMESPACE,
    TRUSTY_SEED_SIZE,
};

/// Variable holding the wire form of the lock state.
pub const OEM_LOCK_VAR: &str = "OEMLock";
/// Variable holding the TEE seed.
pub const TRUSTY_SEED_VAR: &str = "TrustySeed";

fn rollback_var_name(slot: usize) -> ArrayString<20> {
    let mut name = ArrayString::new();
    write!(name, "RollbackIndex_{:04x}", slot).unwrap();
    name
}

/// Device state store backed by authenticated firmware variables.
pub struct AuthVarStore<V: VarStore, R: Rng> {
    vars: V,
    rng: R,
    build: BuildVariant,
    end_user: bool,
    provisioning: bool,
    seed_read: bool,
    sealed: bool,
}

impl<V: VarStore, R: Rng> AuthVarStore<V, R> {
    /// Creates the store. `end_user` is the hardware life-cycle signal.
    pub fn new(vars: V, rng: R, build: BuildVariant, end_user: bool) -> Self {
        Self {
            vars,
            rng,
            build,
            end_user,
            provisioning: false,
            seed_read: false,
            sealed: false,
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.sealed {
            true => Err(Error::AccessDenied),
            false => Ok(()),
        }
    }

    fn provision(&mut self) -> Result<()> {
        let lock_state = match self.end_user {
            true => LockState::Locked,
            false => LockState::Unlocked,
        };
        self.vars.set_var(FASTBOOT_NAMESPACE, OEM_LOCK_VAR, &[lock_state.to_wire()], false)?;

        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        self.rng.fill(&mut seed)?;
        self.vars.set_var(FASTBOOT_NAMESPACE, TRUSTY_SEED_VAR, &seed, false)?;
        seed.fill(0);

        self.provisioning = !self.end_user;
        Ok(())
    }
}

impl<V: VarStore, R: Rng> DeviceState for AuthVarStore<V, R> {
    fn init(&mut self) -> Result<()> {
        let mut wire = [0u8; 1];
        match self.vars.get_var(FASTBOOT_NAMESPACE, OEM_LOCK_VAR, &mut wire) {
            Ok(_) => Ok(()),
            Err(Error::NotFound) => self.provision(),
            Err(e) => Err(e),
        }
    }

    fn read_lock_state(&mut self) -> Result<LockState> {
        if self.provisioning {
            return Ok(LockState::Provisioning);
        }
        let mut wire = [0u8; 1];
        Ok(match self.vars.get_var(FASTBOOT_NAMESPACE, OEM_LOCK_VAR, &mut wire) {
            Ok(1) => LockState::from_wire(wire[0]),
            _ => self.build.fallback_lock_state(),
        })
    }

    fn write_lock_state(&mut self, state: LockState) -> Result<()> {
        self.check_writable()?;
        self.vars.set_var(FASTBOOT_NAMESPACE, OEM_LOCK_VAR, &[state.to_wire()], false)
    }

    fn read_rollback_index(&mut self, slot: usize) -> Result<u64> {
        check_rollback_slot(slot)?;
        let mut bytes = [0u8; 8];
        match self.vars.get_var(FASTBOOT_NAMESPACE, &rollback_var_name(slot), &mut bytes) {
            Ok(8) => Ok(u64::from_le_bytes(bytes)),
            // Absent means never written.
            Err(Error::NotFound) => Ok(0),
            Ok(_) => Err(Error::InvalidState),
            Err(e) => Err(e),
        }
    }

    fn write_rollback_index(&mut self, slot: usize, value: u64) -> Result<()> {
        self.check_writable()?;
        if value < self.read_rollback_index(slot)? {
            return Err(Error::PolicyViolation);
        }
        self.vars.set_var(
            FASTBOOT_NAMESPACE,
            &rollback_var_name(slot),
            &value.to_le_bytes(),
            false,
        )
    }

    fn read_trusty_seed(&mut self, out: &mut [u8; TRUSTY_SEED_SIZE]) -> Result<()> {
        if self.seed_read || self.sealed {
            return Err(Error::AccessDenied);
        }
        self.seed_read = true;
        match self.vars.get_var(FASTBOOT_NAMESPACE, TRUSTY_SEED_VAR, out) {
            Ok(TRUSTY_SEED_SIZE) => Ok(()),
            Ok(_) => Err(Error::InvalidState),
            Err(e) => Err(e),
        }
    }

    fn seal(&mut self) -> Result<()> {
        self.sealed = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct FakeVars {
        entries: Vec<(String, String, Vec<u8>)>,
    }

    impl VarStore for FakeVars {
        fn get_var(&mut self, namespace: &str, name: &str, out: &mut [u8]) -> Result<usize> {
            let (_, _, data) = self
                .entries
                .iter()
                .find(|(ns, n, _)| ns == namespace && n == name)
                .ok_or(Error::NotFound)?;
            if out.len() < data.len() {
                return Err(Error::BufferTooSmall(Some(data.len())));
            }
            out[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }

        fn set_var(
            &mut self,
            namespace: &str,
            name: &str,
            data: &[u8],
            _runtime_accessible: bool,
        ) -> Result<()> {
            self.del_var(namespace, name)?;
            self.entries.push((namespace.into(), name.into(), data.to_vec()));
            Ok(())
        }

        fn del_var(&mut self, namespace: &str, name: &str) -> Result<()> {
            self.entries.retain(|(ns, n, _)| !(ns == namespace && n == name));
            Ok(())
        }
    }

    struct FakeRng;

    impl Rng for FakeRng {
        fn fill(&mut self, out: &mut [u8]) -> Result<()> {
            for (i, b) in out.iter_mut().enumerate() {
                *b = (i as u8).wrapping_mul(59).wrapping_add(3);
            }
            Ok(())
        }
    }

    fn provisioned_store() -> AuthVarStore<FakeVars, FakeRng> {
        let mut store = AuthVarStore::new(FakeVars::default(), FakeRng, BuildVariant::User, true);
        store.init().unwrap();
        store
    }

    #[test]
    fn test_provision_end_user_locks() {
        let mut store = provisioned_store();
        assert_eq!(store.read_lock_state().unwrap(), LockState::Locked);
    }

    #[test]
    fn test_provision_pre_enduser_is_provisioning() {
        let mut store = AuthVarStore::new(FakeVars::default(), FakeRng, BuildVariant::User, false);
        store.init().unwrap();
        assert_eq!(store.read_lock_state().unwrap(), LockState::Provisioning);
    }

    #[test]
    fn test_rollback_var_name_format() {
        assert_eq!(rollback_var_name(0).as_str(), "RollbackIndex_0000");
        assert_eq!(rollback_var_name(7).as_str(), "RollbackIndex_0007");
    }

    #[test]
    fn test_rollback_defaults_to_zero() {
        let mut store = provisioned_store();
        assert_eq!(store.read_rollback_index(3).unwrap(), 0);
    }

    #[test]
    fn test_rollback_monotonic() {
        let mut store = provisioned_store();
        store.write_rollback_index(2, 17).unwrap();
        assert_eq!(store.read_rollback_index(2).unwrap(), 17);
        assert_eq!(store.write_rollback_index(2, 16).unwrap_err(), Error::PolicyViolation);
        assert_eq!(store.read_rollback_index(2).unwrap(), 17);
    }

    #[test]
    fn test_seed_one_shot() {
        let mut store = provisioned_store();
        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        store.read_trusty_seed(&mut seed).unwrap();
        assert!(seed.iter().any(|b| *b != 0));
        assert_eq!(store.read_trusty_seed(&mut seed).unwrap_err(), Error::AccessDenied);
    }

    #[test]
    fn test_seal_blocks_mutation() {
        let mut store = provisioned_store();
        store.seal().unwrap();
        store.seal().unwrap();
        assert_eq!(store.write_rollback_index(0, 1).unwrap_err(), Error::AccessDenied);
        assert_eq!(store.write_lock_state(LockState::Unlocked).unwrap_err(), Error::AccessDenied);
        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        assert_eq!(store.read_trusty_seed(&mut seed).unwrap_err(), Error::AccessDenied);
    }

    #[test]
    fn test_lock_state_survives_reinit() {
        let mut store = provisioned_store();
        store.write_lock_state(LockState::Unlocked).unwrap();
        let vars = store.vars;

        let mut next_boot = AuthVarStore::new(vars, FakeRng, BuildVariant::User, true);
        next_boot.init().unwrap();
        assert_eq!(next_boot.read_lock_state().unwrap(), LockState::Unlocked);
    }

    #[test]
    fn test_missing_vars_fall_back_by_build() {
        // No init: simulates a store whose backing failed.
        let mut store =
            AuthVarStore::new(FakeVars::default(), FakeRng, BuildVariant::Userdebug, true);
        assert_eq!(store.read_lock_state().unwrap(), LockState::Unlocked);
    }
}
