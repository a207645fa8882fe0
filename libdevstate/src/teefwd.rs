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

//! Remote TEE backing for the device state store.
//!
//! Every operation is one request/reply pair forwarded over a shared-memory
//! region to a hypervisor peer that owns the actual record. The reply slot
//! starts at a not-ready sentinel; the store polls it with a bounded 1 us
//! stall loop and gives up with a timeout once the budget is spent.

use liberror::{Error, Result};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::{check_rollback_slot, BuildVariant, DeviceState, LockState, TRUSTY_SEED_SIZE};

/// Magic announcing a valid request in the shared region.
pub const TEE_REQUEST_MAGIC: u32 = 0x12ABCDEF;
/// Reply status while the peer has not answered yet.
pub const TEE_STATUS_NOT_READY: u32 = 0;
/// Upper bound on reply polls before the transaction times out.
pub const TEE_MAX_POLL_ITERATIONS: u32 = 5000;
/// Stall between reply polls, in microseconds.
pub const TEE_POLL_STALL_US: u64 = 1;

/// Request opcodes understood by the peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TeeOpcode {
    /// Load or create the record.
    Init = 1,
    /// Read the lock state.
    ReadLockState = 2,
    /// Write the lock state.
    WriteLockState = 3,
    /// Read a rollback index.
    ReadRollback = 4,
    /// Write a rollback index.
    WriteRollback = 5,
    /// Read the TEE seed.
    ReadSeed = 6,
    /// Lock the record for the rest of the boot.
    Seal = 7,
}

/// Wire format of a request.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct TeeRequest {
    /// Must be [TEE_REQUEST_MAGIC].
    pub magic: u32,
    /// A [TeeOpcode] value.
    pub opcode: u32,
    /// Rollback slot for the rollback opcodes; zero otherwise.
    pub slot: u32,
    /// Padding to align [TeeRequest::value] to 8 bytes; always zero.
    pub _reserved: u32,
    /// Lock state wire value or rollback value; zero otherwise.
    pub value: u64,
}

/// Wire format of a reply.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct TeeReply {
    /// [TEE_STATUS_NOT_READY] until the peer answers, then a status code.
    pub status: u32,
    /// Reserved; zero.
    pub reserved: u32,
    /// Reply payload for the read opcodes.
    pub value: u64,
    /// Seed payload for [TeeOpcode::ReadSeed].
    pub seed: [u8; TRUSTY_SEED_SIZE],
}

// Reply status codes, mirroring the error kinds the local backings produce.
const TEE_STATUS_OK: u32 = 1;
const TEE_STATUS_ACCESS_DENIED: u32 = 2;
const TEE_STATUS_NOT_FOUND: u32 = 3;
const TEE_STATUS_POLICY_VIOLATION: u32 = 4;
const TEE_STATUS_INVALID: u32 = 5;

// Lock state wire values used on the TEE channel only; provisioning is a
// real state here because the peer owns the record lifecycle.
const TEE_LOCK_LOCKED: u64 = 0;
const TEE_LOCK_UNLOCKED: u64 = 1;
const TEE_LOCK_PROVISIONING: u64 = 2;

/// Shared-memory transport to the hypervisor peer.
pub trait TeePort {
    /// Publishes a request into the shared region and kicks the peer.
    fn send_request(&mut self, request: &TeeRequest) -> Result<()>;

    /// Samples the reply slot. Returns `Ok(None)` while the status is still
    /// [TEE_STATUS_NOT_READY].
    fn poll_reply(&mut self) -> Result<Option<TeeReply>>;

    /// Busy-wait stall between polls.
    fn stall_us(&mut self, us: u64);
}

/// Device state store forwarding every operation to a TEE peer.
pub struct TeeStore<P: TeePort> {
    port: P,
    build: BuildVariant,
    seed_read: bool,
    sealed: bool,
}

impl<P: TeePort> TeeStore<P> {
    /// Creates the store.
    pub fn new(port: P, build: BuildVariant) -> Self {
        Self { port, build, seed_read: false, sealed: false }
    }

    fn transact(&mut self, opcode: TeeOpcode, slot: u32, value: u64) -> Result<TeeReply> {
        self.port.send_request(&TeeRequest {
            magic: TEE_REQUEST_MAGIC,
            opcode: opcode as u32,
            slot,
            _reserved: 0,
            value,
        })?;

        for _ in 0..TEE_MAX_POLL_ITERATIONS {
            if let Some(reply) = self.port.poll_reply()? {
                return match reply.status {
                    TEE_STATUS_OK => Ok(reply),
                    TEE_STATUS_ACCESS_DENIED => Err(Error::AccessDenied),
                    TEE_STATUS_NOT_FOUND => Err(Error::NotFound),
                    TEE_STATUS_POLICY_VIOLATION => Err(Error::PolicyViolation),
                    _ => Err(Error::InvalidState),
                };
            }
            self.port.stall_us(TEE_POLL_STALL_US);
        }
        Err(Error::Timeout)
    }
}

impl<P: TeePort> DeviceState for TeeStore<P> {
    fn init(&mut self) -> Result<()> {
        self.transact(TeeOpcode::Init, 0, 0).map(|_| ())
    }

    fn read_lock_state(&mut self) -> Result<LockState> {
        match self.transact(TeeOpcode::ReadLockState, 0, 0) {
            Ok(reply) => Ok(match reply.value {
                TEE_LOCK_UNLOCKED => LockState::Unlocked,
                TEE_LOCK_PROVISIONING => LockState::Provisioning,
                _ => LockState::Locked,
            }),
            // Unreachable peer degrades by build variant.
            Err(_) => Ok(self.build.fallback_lock_state()),
        }
    }

    fn write_lock_state(&mut self, state: LockState) -> Result<()> {
        if self.sealed {
            return Err(Error::AccessDenied);
        }
        let wire = match state {
            LockState::Locked => TEE_LOCK_LOCKED,
            LockState::Unlocked => TEE_LOCK_UNLOCKED,
            LockState::Provisioning => TEE_LOCK_PROVISIONING,
        };
        self.transact(TeeOpcode::WriteLockState, 0, wire).map(|_| ())
    }

    fn read_rollback_index(&mut self, slot: usize) -> Result<u64> {
        check_rollback_slot(slot)?;
        Ok(self.transact(TeeOpcode::ReadRollback, slot as u32, 0)?.value)
    }

    fn write_rollback_index(&mut self, slot: usize, value: u64) -> Result<()> {
        check_rollback_slot(slot)?;
        if self.sealed {
            return Err(Error::AccessDenied);
        }
        self.transact(TeeOpcode::WriteRollback, slot as u32, value).map(|_| ())
    }

    fn read_trusty_seed(&mut self, out: &mut [u8; TRUSTY_SEED_SIZE]) -> Result<()> {
        if self.seed_read {
            return Err(Error::AccessDenied);
        }
        self.seed_read = true;
        let reply = self.transact(TeeOpcode::ReadSeed, 0, 0)?;
        out.copy_from_slice(&reply.seed);
        Ok(())
    }

    fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.transact(TeeOpcode::Seal, 0, 0)?;
        self.sealed = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ROLLBACK_SLOTS;

    /// Loopback peer that owns a record, answering after a configurable
    /// number of not-ready polls.
    struct FakePeer {
        lock_state: u64,
        rollback: [u64; ROLLBACK_SLOTS],
        seed: [u8; TRUSTY_SEED_SIZE],
        seed_locked: bool,
        sealed: bool,
        latency: u32,
        pending: Option<(TeeReply, u32)>,
        stalls: u64,
    }

    impl FakePeer {
        fn new() -> Self {
            let mut seed = [0u8; TRUSTY_SEED_SIZE];
            for (i, b) in seed.iter_mut().enumerate() {
                *b = i as u8 ^ 0x5a;
            }
            Self {
                lock_state: TEE_LOCK_LOCKED,
                rollback: [0; ROLLBACK_SLOTS],
                seed,
                seed_locked: false,
                sealed: false,
                latency: 3,
                pending: None,
                stalls: 0,
            }
        }

        fn handle(&mut self, request: &TeeRequest) -> TeeReply {
            let mut reply = TeeReply::new_zeroed();
            reply.status = TEE_STATUS_OK;
            if request.magic != TEE_REQUEST_MAGIC {
                reply.status = TEE_STATUS_INVALID;
                return reply;
            }
            match request.opcode {
                x if x == TeeOpcode::Init as u32 => {}
                x if x == TeeOpcode::ReadLockState as u32 => reply.value = self.lock_state,
                x if x == TeeOpcode::WriteLockState as u32 => match self.sealed {
                    true => reply.status = TEE_STATUS_ACCESS_DENIED,
                    false => self.lock_state = request.value,
                },
                x if x == TeeOpcode::ReadRollback as u32 => {
                    reply.value = self.rollback[request.slot as usize]
                }
                x if x == TeeOpcode::WriteRollback as u32 => {
                    let current = &mut self.rollback[request.slot as usize];
                    if self.sealed {
                        reply.status = TEE_STATUS_ACCESS_DENIED;
                    } else if request.value < *current {
                        reply.status = TEE_STATUS_POLICY_VIOLATION;
                    } else {
                        *current = request.value;
                    }
                }
                x if x == TeeOpcode::ReadSeed as u32 => match self.seed_locked {
                    true => reply.status = TEE_STATUS_ACCESS_DENIED,
                    false => {
                        reply.seed = self.seed;
                        self.seed_locked = true;
                    }
                },
                x if x == TeeOpcode::Seal as u32 => {
                    self.seed_locked = true;
                    self.sealed = true;
                }
                _ => reply.status = TEE_STATUS_INVALID,
            }
            reply
        }
    }

    impl TeePort for FakePeer {
        fn send_request(&mut self, request: &TeeRequest) -> Result<()> {
            let reply = self.handle(request);
            self.pending = Some((reply, self.latency));
            Ok(())
        }

        fn poll_reply(&mut self) -> Result<Option<TeeReply>> {
            match self.pending.as_mut() {
                Some((_, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Ok(None)
                }
                Some(_) => Ok(Some(self.pending.take().unwrap().0)),
                None => Ok(None),
            }
        }

        fn stall_us(&mut self, _us: u64) {
            self.stalls += 1;
        }
    }

    fn store() -> TeeStore<FakePeer> {
        let mut store = TeeStore::new(FakePeer::new(), BuildVariant::User);
        store.init().unwrap();
        store
    }

    #[test]
    fn test_poll_loop_waits_for_reply() {
        let mut store = store();
        assert_eq!(store.read_lock_state().unwrap(), LockState::Locked);
        assert!(store.port.stalls > 0);
    }

    #[test]
    fn test_unanswered_request_times_out() {
        let mut peer = FakePeer::new();
        peer.latency = TEE_MAX_POLL_ITERATIONS + 1;
        let mut store = TeeStore::new(peer, BuildVariant::User);
        assert_eq!(store.init().unwrap_err(), Error::Timeout);
    }

    #[test]
    fn test_lock_state_round_trip() {
        let mut store = store();
        store.write_lock_state(LockState::Unlocked).unwrap();
        assert_eq!(store.read_lock_state().unwrap(), LockState::Unlocked);
    }

    #[test]
    fn test_timeout_on_lock_state_read_falls_back() {
        let mut peer = FakePeer::new();
        peer.latency = TEE_MAX_POLL_ITERATIONS + 1;
        let mut store = TeeStore::new(peer, BuildVariant::Userdebug);
        assert_eq!(store.read_lock_state().unwrap(), LockState::Unlocked);
    }

    #[test]
    fn test_rollback_monotonic_enforced_by_peer() {
        let mut store = store();
        store.write_rollback_index(1, 4).unwrap();
        assert_eq!(store.write_rollback_index(1, 3).unwrap_err(), Error::PolicyViolation);
        assert_eq!(store.read_rollback_index(1).unwrap(), 4);
    }

    #[test]
    fn test_seed_one_shot() {
        let mut store = store();
        let mut seed = [0u8; TRUSTY_SEED_SIZE];
        store.read_trusty_seed(&mut seed).unwrap();
        assert!(seed.iter().any(|b| *b != 0));
        assert_eq!(store.read_trusty_seed(&mut seed).unwrap_err(), Error::AccessDenied);
    }

    #[test]
    fn test_seal_idempotent() {
        let mut store = store();
        store.write_rollback_index(0, 2).unwrap();
        store.seal().unwrap();
        store.seal().unwrap();
        assert_eq!(store.write_rollback_index(0, 3).unwrap_err(), Error::AccessDenied);
    }
}
