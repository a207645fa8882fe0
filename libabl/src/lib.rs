// Copyright 2023, The Android Open Source Project
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

//! Android bootloader core library.
//!
//! This library is the policy-carrying heart of the bootloader: it decides
//! the boot target, verifies the selected Android boot image against the
//! on-device roots of trust, manages A/B slots, assembles the Linux boot
//! parameters and hands control to the kernel. All hardware access goes
//! through the [ops::AblOps] trait and the [devstate::DeviceState] store;
//! the UEFI (or other firmware) adapter lives outside this crate.

#![cfg_attr(not(test), no_std)]

use arrayvec::ArrayString;
use core::fmt::{Display, Formatter, Write};

use devstate::{BuildVariant, DeviceState, LockState};
use liberror::Result;

pub mod android_boot;
pub mod avb;
pub mod boot_reason;
pub mod flow;
pub mod handover;
pub mod ops;
pub mod policy;
pub mod slot_manager;
pub mod smbios;

#[cfg(test)]
mod test_support;

pub use ops::AblOps;

/// Storage for an ESP file path carried inside a [BootTarget].
pub type TargetPath = ArrayString<128>;

/// The destination of this boot, decided exactly once per power cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootTarget {
    /// Boot the active slot normally.
    NormalBoot,
    /// Boot the recovery image of the active slot.
    Recovery,
    /// Stop in bootloader fastboot mode.
    Fastboot,
    /// Off-mode charging UI.
    Charger,
    /// Shut the machine down.
    PowerOff,
    /// Chainload an EFI binary from the EFI system partition.
    EspEfiBinary(TargetPath),
    /// Boot an Android boot image stored as a file on the EFI system
    /// partition.
    EspBootImage(TargetPath),
    /// Let the user pick a target after a crash loop.
    CrashMode,
    /// Download-and-execute platform recovery mode.
    Dnx,
    /// Return to the firmware shell.
    ExitShell,
    /// Boot an image already loaded in RAM.
    Memory,
}

impl BootTarget {
    /// Maps a boot target name, as used in the BCB command and the one-shot
    /// variable, to a target.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "normal" => Self::NormalBoot,
            "recovery" => Self::Recovery,
            "fastboot" | "bootloader" => Self::Fastboot,
            "charging" => Self::Charger,
            "crashmode" => Self::CrashMode,
            "dnx" => Self::Dnx,
            "power_off" => Self::PowerOff,
            _ => return None,
        })
    }

    /// Maps the low 5 bits of the platform `fw.boot` boot-mode word to a
    /// target. Codes follow the firmware's numbering; unknown codes boot
    /// normally.
    pub fn from_platform_code(code: u16) -> Self {
        match code & 0x1f {
            1 => Self::Recovery,
            2 => Self::Fastboot,
            5 => Self::Memory,
            6 => Self::Charger,
            7 => Self::PowerOff,
            8 => Self::CrashMode,
            9 => Self::Dnx,
            _ => Self::NormalBoot,
        }
    }
}

impl Display for BootTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::NormalBoot => "boot",
            Self::Recovery => "recovery",
            Self::Fastboot => "fastboot",
            Self::Charger => "charging",
            Self::PowerOff => "power off",
            Self::EspEfiBinary(_) => "ESP efi binary",
            Self::EspBootImage(_) => "ESP boot image",
            Self::CrashMode => "crashmode",
            Self::Dnx => "dnx",
            Self::ExitShell => "exit shell",
            Self::Memory => "RAM boot",
        })
    }
}

/// Strength of the chain of trust established for this boot.
///
/// https://source.android.com/docs/security/features/verifiedboot/boot-flow
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootState {
    /// Verified against the embedded root key.
    Green,
    /// Verified against a user-installed key.
    Yellow,
    /// Device is unlocked; verification was skipped.
    Orange,
    /// Verification failed.
    Red,
}

/// To use in `androidboot.verifiedbootstate`.
impl Display for BootState {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            BootState::Green => "green",
            BootState::Yellow => "yellow",
            BootState::Orange => "orange",
            BootState::Red => "red",
        })
    }
}

/// Prints to the platform console, if there is one.
#[macro_export]
macro_rules! abl_print {
    ( $ops:expr, $( $x:expr ),* $(,)? ) => {
        {
            if let Some(console) = $crate::ops::AblOps::console_out($ops) {
                let _ = ::core::fmt::Write::write_fmt(console, ::core::format_args!($($x),*));
            }
        }
    };
}

/// Prints to the platform console with a newline, if there is one.
#[macro_export]
macro_rules! abl_println {
    ( $ops:expr, $( $x:expr ),* $(,)? ) => {
        {
            if let Some(console) = $crate::ops::AblOps::console_out($ops) {
                let _ = ::core::fmt::Write::write_fmt(console, ::core::format_args!($($x),*));
                let _ = ::core::fmt::Write::write_str(console, "\r\n");
            }
        }
    };
}

/// Per-boot state threaded through every entry point: the platform ops, the
/// device state store, and the lazily cached policy inputs that the original
/// implementation kept in globals.
pub struct Context<'a, O: AblOps, D: DeviceState> {
    /// Platform backend.
    pub ops: &'a mut O,
    /// Lock state and rollback store.
    pub device_state: &'a mut D,
    /// Software build variant.
    pub build: BuildVariant,
    lock_state: Option<LockState>,
    off_mode_charge: Option<bool>,
    secure_boot: bool,
    boot_start_us: u64,
}

impl<'a, O: AblOps, D: DeviceState> Context<'a, O, D> {
    /// Creates a context. `ops` and `state` outlive the whole boot flow.
    pub fn new(ops: &'a mut O, device_state: &'a mut D, build: BuildVariant) -> Self {
        let boot_start_us = ops.now_monotonic_us();
        Self {
            ops,
            device_state,
            build,
            lock_state: None,
            off_mode_charge: None,
            secure_boot: false,
            boot_start_us,
        }
    }

    /// The device lock state, read once and cached for the boot.
    pub fn lock_state(&mut self) -> LockState {
        if let Some(state) = self.lock_state {
            return state;
        }
        let state = self
            .device_state
            .read_lock_state()
            .unwrap_or_else(|_| self.build.fallback_lock_state());
        self.lock_state = Some(state);
        state
    }

    /// Whether off-mode charging is enabled; defaults to true when the
    /// variable is absent.
    pub fn off_mode_charge(&mut self) -> bool {
        if let Some(enabled) = self.off_mode_charge {
            return enabled;
        }
        let enabled = ops::get_var_bool(
            self.ops.vars(),
            devstate::FASTBOOT_NAMESPACE,
            ops::OFF_MODE_CHARGE_VAR,
            true,
        );
        self.off_mode_charge = Some(enabled);
        enabled
    }

    /// The platform secure boot flag, as reported by the loader command
    /// line.
    pub fn secure_boot(&self) -> bool {
        self.secure_boot
    }

    /// Records the platform secure boot flag.
    pub fn set_secure_boot(&mut self, enabled: bool) {
        self.secure_boot = enabled;
    }

    /// Milliseconds elapsed since context creation.
    pub fn elapsed_ms(&mut self) -> u64 {
        (self.ops.now_monotonic_us() - self.boot_start_us) / 1000
    }

    /// Formats the boot time profile value for `androidboot.boottime`.
    pub fn boottime_profile(&mut self) -> Result<ArrayString<64>> {
        let mut profile = ArrayString::new();
        let elapsed = self.elapsed_ms();
        write!(profile, "firmware:{},loader:{}", self.boot_start_us / 1000, elapsed)?;
        Ok(profile)
    }
}
