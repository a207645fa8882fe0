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

//! In-memory platform fakes shared by the unit tests of this crate.

use core::fmt::Write;

use boot::{FramebufferInfo, MemoryKind, MemoryRegion};
use devstate::{DeviceState, LockState, VarStore, ROLLBACK_SLOTS, TRUSTY_SEED_SIZE};
use liberror::{Error, Result};

use crate::ops::test::FakeVars;
use crate::ops::{
    AblOps, Key, ResetSource, ResetType, SmbiosString, WakeSource, WallTime,
};
use crate::BootTarget;

/// Default size of an implicitly created fake partition; large enough for
/// the BCB plus the A/B metadata record.
const DEFAULT_PARTITION_SIZE: usize = 8192;

/// In-memory device state with spec-shaped invariant enforcement.
pub(crate) struct FakeState {
    pub lock_state: LockState,
    pub rollback: [u64; ROLLBACK_SLOTS],
    pub sealed: bool,
    pub seed_read: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            lock_state: LockState::Locked,
            rollback: [0; ROLLBACK_SLOTS],
            sealed: false,
            seed_read: false,
        }
    }
}

impl DeviceState for FakeState {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_lock_state(&mut self) -> Result<LockState> {
        Ok(self.lock_state)
    }

    fn write_lock_state(&mut self, state: LockState) -> Result<()> {
        if self.sealed {
            return Err(Error::AccessDenied);
        }
        self.lock_state = state;
        Ok(())
    }

    fn read_rollback_index(&mut self, slot: usize) -> Result<u64> {
        self.rollback.get(slot).copied().ok_or(Error::BadIndex(slot))
    }

    fn write_rollback_index(&mut self, slot: usize, value: u64) -> Result<()> {
        if self.sealed {
            return Err(Error::AccessDenied);
        }
        let current = self.rollback.get_mut(slot).ok_or(Error::BadIndex(slot))?;
        if value < *current {
            return Err(Error::PolicyViolation);
        }
        *current = value;
        Ok(())
    }

    fn read_trusty_seed(&mut self, out: &mut [u8; TRUSTY_SEED_SIZE]) -> Result<()> {
        if self.seed_read || self.sealed {
            return Err(Error::AccessDenied);
        }
        self.seed_read = true;
        out.fill(0x5a);
        Ok(())
    }

    fn seal(&mut self) -> Result<()> {
        self.sealed = true;
        Ok(())
    }
}

/// In-memory [AblOps] implementation.
pub(crate) struct FakeOps {
    pub console: String,
    pub partitions: Vec<(String, Vec<u8>)>,
    pub vars: FakeVars,
    pub wall: WallTime,
    pub mono_us: u64,
    pub pending_key: Option<Key>,
    pub key_held_result: bool,
    pub wake: WakeSource,
    pub reset: ResetSource,
    pub reset_kind: ResetType,
    pub battery_low: bool,
    pub charger: bool,
    pub esp_files: Vec<String>,
    pub crash_choice: BootTarget,
    pub crash_prompted: bool,
    pub low_battery_displayed: bool,
    pub smbios_system_serial: Option<String>,
    pub smbios_board_serial: Option<String>,
    pub smbios_product_name: Option<String>,
    pub smbios_bios_version: Option<String>,
    pub embedded_key: Vec<u8>,
    pub user_key: Option<Vec<u8>>,
    pub memory_cleared: bool,
    pub diskbus: Option<String>,
    pub framebuffer: Option<FramebufferInfo>,
}

impl FakeOps {
    pub fn new() -> Self {
        Self {
            console: String::new(),
            // Every one of these devices has a misc partition.
            partitions: vec![("misc".into(), vec![0u8; DEFAULT_PARTITION_SIZE])],
            vars: FakeVars::default(),
            wall: WallTime { year: 2024, month: 6, day: 1, hour: 9, minute: 0, second: 0 },
            mono_us: 1_000_000,
            pending_key: None,
            key_held_result: false,
            wake: WakeSource::PowerButtonPressed,
            reset: ResetSource::NotApplicable,
            reset_kind: ResetType::Cold,
            battery_low: false,
            charger: false,
            esp_files: Vec::new(),
            crash_choice: BootTarget::NormalBoot,
            crash_prompted: false,
            low_battery_displayed: false,
            smbios_system_serial: Some("NUC2024X9000".into()),
            smbios_board_serial: None,
            smbios_product_name: None,
            smbios_bios_version: Some("ABL.1.0".into()),
            embedded_key: Vec::new(),
            user_key: None,
            memory_cleared: false,
            diskbus: None,
            framebuffer: None,
        }
    }

    pub fn add_partition(&mut self, label: &str, data: Vec<u8>) {
        self.partitions.retain(|(l, _)| l != label);
        self.partitions.push((label.into(), data));
    }

    /// Returns the backing bytes of `label`, creating a zeroed partition on
    /// first use.
    pub fn partition_mut(&mut self, label: &str) -> &mut [u8] {
        if !self.partitions.iter().any(|(l, _)| l == label) {
            self.partitions.push((label.into(), vec![0u8; DEFAULT_PARTITION_SIZE]));
        }
        self.partitions.iter_mut().find(|(l, _)| l == label).map(|(_, d)| &mut d[..]).unwrap()
    }

    fn find_partition(&mut self, label: &str) -> Option<&mut Vec<u8>> {
        self.partitions.iter_mut().find(|(l, _)| l == label).map(|(_, d)| d)
    }

    fn smbios_value(field: &Option<String>) -> Option<SmbiosString> {
        field.as_ref().and_then(|s| SmbiosString::from(s).ok())
    }
}

impl AblOps for FakeOps {
    fn console_out(&mut self) -> Option<&mut dyn Write> {
        Some(&mut self.console)
    }

    fn read_from_partition(&mut self, part: &str, off: u64, out: &mut [u8]) -> Result<()> {
        let data = self.find_partition(part).ok_or(Error::NotFound)?;
        let off = usize::try_from(off)?;
        let end = off.checked_add(out.len()).ok_or(Error::BadIndex(off))?;
        out.copy_from_slice(data.get(off..end).ok_or(Error::BadIndex(end))?);
        Ok(())
    }

    fn write_to_partition(&mut self, part: &str, off: u64, data: &[u8]) -> Result<()> {
        let backing = self.find_partition(part).ok_or(Error::NotFound)?;
        let off = usize::try_from(off)?;
        let end = off.checked_add(data.len()).ok_or(Error::BadIndex(off))?;
        backing
            .get_mut(off..end)
            .ok_or(Error::BadIndex(end))?
            .copy_from_slice(data);
        Ok(())
    }

    fn partition_size(&mut self, part: &str) -> Result<Option<u64>> {
        Ok(self.find_partition(part).map(|d| d.len() as u64))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn vars(&mut self) -> &mut dyn VarStore {
        &mut self.vars
    }

    fn now_wall(&mut self) -> Result<WallTime> {
        Ok(self.wall)
    }

    fn now_monotonic_us(&mut self) -> u64 {
        self.mono_us += 1000;
        self.mono_us
    }

    fn fill_random(&mut self, out: &mut [u8]) -> Result<()> {
        for (i, b) in out.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(7);
        }
        Ok(())
    }

    fn choose_crash_target(&mut self) -> BootTarget {
        self.crash_prompted = true;
        self.crash_choice.clone()
    }

    fn choose_boot_target(&mut self, _reason_code: u32) -> BootTarget {
        BootTarget::NormalBoot
    }

    fn display_low_battery(&mut self) {
        self.low_battery_displayed = true;
    }

    fn display_empty_battery(&mut self) {}

    fn reboot(&mut self, target: BootTarget) -> ! {
        panic!("reboot requested: {}", target);
    }

    fn wake_source(&mut self) -> WakeSource {
        self.wake
    }

    fn reset_source(&mut self) -> ResetSource {
        self.reset
    }

    fn reset_type(&mut self) -> ResetType {
        self.reset_kind
    }

    fn reset_extra_u32(&mut self) -> u32 {
        0
    }

    fn install_acpi_from_image(&mut self, _tables: &[u8]) -> Result<()> {
        Ok(())
    }

    fn install_acpi_from_partitions(&mut self, _labels: &[&str]) -> Result<()> {
        Ok(())
    }

    fn system_serial(&mut self) -> Option<SmbiosString> {
        Self::smbios_value(&self.smbios_system_serial)
    }

    fn board_serial(&mut self) -> Option<SmbiosString> {
        Self::smbios_value(&self.smbios_board_serial)
    }

    fn product_name(&mut self) -> Option<SmbiosString> {
        Self::smbios_value(&self.smbios_product_name)
    }

    fn bios_version(&mut self) -> Option<SmbiosString> {
        Self::smbios_value(&self.smbios_bios_version)
    }

    fn poll_key(&mut self, _timeout_ms: u32) -> Option<Key> {
        self.pending_key.take()
    }

    fn key_held(&mut self, _key: Key, _duration_ms: u32) -> bool {
        self.key_held_result
    }

    fn battery_below_boot_threshold(&mut self) -> bool {
        self.battery_low
    }

    fn charger_plugged(&mut self) -> bool {
        self.charger
    }

    fn esp_file_exists(&mut self, path: &str) -> bool {
        self.esp_files.iter().any(|f| f == path)
    }

    fn clear_memory(&mut self) -> Result<()> {
        self.memory_cleared = true;
        Ok(())
    }

    fn embedded_public_key(&self) -> &[u8] {
        &self.embedded_key
    }

    fn user_public_key(&self) -> Option<&[u8]> {
        self.user_key.as_deref()
    }

    fn bootloader_version(&self) -> &str {
        "abl-test-1.0"
    }

    fn boot_device_diskbus(&mut self) -> Option<SmbiosString> {
        Self::smbios_value(&self.diskbus)
    }

    fn framebuffer_info(&mut self) -> Option<FramebufferInfo> {
        self.framebuffer
    }

    fn memory_map(&mut self, regions: &mut [MemoryRegion]) -> Result<(usize, u64)> {
        regions[0] =
            MemoryRegion { start: 0x10_0000, size: 0x4000_0000, kind: MemoryKind::Conventional };
        Ok((1, 42))
    }

    fn exit_boot_services(&mut self, _map_key: u64) -> Result<()> {
        // Tests never actually leave boot services; succeeding here would
        // send the caller into the jump path.
        Err(Error::DeviceError)
    }
}
