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

//! `AblOps` trait that defines the platform callbacks of the bootloader
//! core, plus small helpers for the firmware variable conventions.

use arrayvec::ArrayString;
use core::fmt::Write;

use boot::{FramebufferInfo, MemoryRegion};
use devstate::VarStore;
use liberror::{Error, Result};

use crate::BootTarget;

/// Value type for strings copied out of SMBIOS/DMI tables.
pub type SmbiosString = ArrayString<64>;

// Variables in the `loader` namespace.
/// Override for the magic key poll window, in milliseconds.
pub const MAGIC_KEY_TIMEOUT_VAR: &str = "MagicKeyTimeout";
/// Console port specification for the kernel command line.
pub const SERIAL_PORT_VAR: &str = "SerialPort";
/// Replaces the image command line (non-user builds only).
pub const CMDLINE_REPLACE_VAR: &str = "CmdlineReplace";
/// Appended to the image command line (non-user builds only).
pub const CMDLINE_APPEND_VAR: &str = "CmdlineAppend";
/// Prepended to the image command line (non-user builds only).
pub const CMDLINE_PREPEND_VAR: &str = "CmdlinePrepend";
/// One-shot boot target, consumed on read.
pub const LOADER_ENTRY_ONESHOT_VAR: &str = "LoaderEntryOneShot";
/// Reboot reason saved by the OS, overrides `os_initiated`.
pub const LOADER_ENTRY_REBOOT_REASON_VAR: &str = "LoaderEntryRebootReason";
/// Whether the splash is drawn.
pub const UI_DISPLAY_SPLASH_VAR: &str = "UIDisplaySplash";

// Variables in the `fastboot` namespace.
/// Whether the device charges when off.
pub const OFF_MODE_CHARGE_VAR: &str = "off-mode-charge";
/// Whether the crash event menu is offered.
pub const CRASH_EVENT_MENU_VAR: &str = "CrashEventMenu";
/// Consecutive watchdog reset counter.
pub const WATCHDOG_COUNTER_VAR: &str = "WatchdogCounter";
/// Override for the watchdog counter threshold.
pub const WATCHDOG_COUNTER_MAX_VAR: &str = "WatchdogCounterMax";
/// Wall time of the first watchdog reset of the current burst.
pub const WATCHDOG_TIME_REFERENCE_VAR: &str = "WatchdogTimeReference";
/// Appends the TCO disable option to the command line (userdebug only).
pub const DISABLE_WATCHDOG_VAR: &str = "DisableWatchdog";
/// Whether A/B fallback is exercised (userdebug only).
pub const SLOT_FALLBACK_VAR: &str = "SlotFallback";
/// Slot the previous loader stage booted from.
pub const LOADED_SLOT_VAR: &str = "LoadedSlot";
/// Whether OEM variables are refreshed on next boot.
pub const UPDATE_OEM_VARS_VAR: &str = "UpdateOemVars";

/// Default magic key poll window in milliseconds.
pub const RESET_WAIT_MS_DEFAULT: u32 = 200;
/// Upper bound on the configurable poll window.
pub const RESET_WAIT_MS_MAX: u32 = 1000;
/// How long the magic key must stay held to select fastboot.
pub const FASTBOOT_HOLD_DELAY_MS: u32 = 2000;

/// Console keys the boot policy can sense.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Key {
    /// Volume/arrow up.
    Up,
    /// Volume/arrow down; the magic key.
    Down,
    /// Enter / select.
    Enter,
    /// Escape / back.
    Escape,
    /// Power button.
    Power,
}

/// The event that woke the machine, as reported by the power management
/// controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WakeSource {
    /// No wake event recorded.
    NotApplicable,
    /// A battery was inserted.
    BatteryInserted,
    /// A USB charger was plugged.
    UsbChargerInserted,
    /// A wall charger was plugged.
    AcdcChargerInserted,
    /// The power button was pressed.
    PowerButtonPressed,
    /// The RTC alarm fired.
    RtcTimer,
    /// The battery charged past the boot threshold.
    BatteryReachedIaThreshold,
    /// Anything else.
    Unknown,
}

/// The cause of the last reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetSource {
    /// No reset source recorded.
    NotApplicable,
    /// The OS requested the reset.
    OsInitiated,
    /// Forced hardware reset.
    Forced,
    /// A firmware update completed.
    FirmwareUpdate,
    /// The kernel watchdog fired.
    KernelWatchdog,
    /// The converged security engine watchdog fired.
    SecurityWatchdog,
    /// The security engine requested the reset.
    SecurityInitiated,
    /// The embedded controller watchdog fired.
    EcWatchdog,
    /// The PMIC watchdog fired.
    PmicWatchdog,
    /// Power was lost briefly.
    ShortPowerLoss,
    /// Platform specific cause; see [AblOps::reset_extra_u32].
    PlatformSpecific,
    /// Anything else.
    Unknown,
}

/// The kind of the last reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetType {
    /// Not recorded.
    NotApplicable,
    /// Warm reset.
    Warm,
    /// Cold reset.
    Cold,
    /// Global platform reset.
    Global,
}

/// Wall clock time, as read from the platform RTC.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WallTime {
    /// Full year, e.g. 2024.
    pub year: u16,
    /// Month, 1..=12.
    pub month: u8,
    /// Day of month, 1..=31.
    pub day: u8,
    /// Hour, 0..=23.
    pub hour: u8,
    /// Minute, 0..=59.
    pub minute: u8,
    /// Second, 0..=59.
    pub second: u8,
}

impl WallTime {
    /// Seconds since the Unix epoch, ignoring leap seconds. Used only for
    /// wall time differences.
    pub fn to_unix_seconds(&self) -> u64 {
        // Days-from-civil, Howard Hinnant's algorithm.
        let year = self.year as i64 - i64::from(self.month < 3);
        let era = year.div_euclid(400);
        let yoe = (year - era * 400) as u64;
        let mp = (self.month as u64 + 9) % 12;
        let doy = (153 * mp + 2) / 5 + self.day as u64 - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        let days = (era * 146097 + doe as i64 - 719468) as u64;
        days * 86400 + self.hour as u64 * 3600 + self.minute as u64 * 60 + self.second as u64
    }

    /// Serializes for the watchdog time reference variable.
    pub fn to_wire(&self) -> [u8; 8] {
        let mut wire = [0u8; 8];
        wire[..2].copy_from_slice(&self.year.to_le_bytes());
        wire[2] = self.month;
        wire[3] = self.day;
        wire[4] = self.hour;
        wire[5] = self.minute;
        wire[6] = self.second;
        wire
    }

    /// Deserializes from the watchdog time reference variable.
    pub fn from_wire(wire: &[u8; 8]) -> Self {
        Self {
            year: u16::from_le_bytes(wire[..2].try_into().unwrap()),
            month: wire[2],
            day: wire[3],
            hour: wire[4],
            minute: wire[5],
            second: wire[6],
        }
    }
}

/// Trait that defines the platform callbacks the bootloader core needs.
///
/// One implementation exists per firmware host; tests use in-memory fakes.
pub trait AblOps {
    /// Returns the console writer for log output, if the platform has one.
    fn console_out(&mut self) -> Option<&mut dyn Write>;

    /// Reads data from a partition found by GPT label.
    fn read_from_partition(&mut self, part: &str, off: u64, out: &mut [u8]) -> Result<()>;

    /// Writes data to a partition found by GPT label.
    fn write_to_partition(&mut self, part: &str, off: u64, data: &[u8]) -> Result<()>;

    /// Returns the size of a partition, or `Ok(None)` if it doesn't exist.
    fn partition_size(&mut self, part: &str) -> Result<Option<u64>>;

    /// Flushes buffered partition writes to the medium.
    fn flush(&mut self) -> Result<()>;

    /// Returns the firmware variable store.
    fn vars(&mut self) -> &mut dyn VarStore;

    /// Reads the RTC.
    fn now_wall(&mut self) -> Result<WallTime>;

    /// Monotonic microsecond counter.
    fn now_monotonic_us(&mut self) -> u64;

    /// Fills `out` with hardware random bytes.
    fn fill_random(&mut self, out: &mut [u8]) -> Result<()>;

    /// Asks the user which target to boot after a crash loop. Only
    /// `Fastboot` and `NormalBoot` come back.
    fn choose_crash_target(&mut self) -> BootTarget;

    /// Asks the user which target to boot, showing `reason_code`.
    fn choose_boot_target(&mut self, reason_code: u32) -> BootTarget;

    /// Shows the low battery splash.
    fn display_low_battery(&mut self);

    /// Shows the empty battery splash.
    fn display_empty_battery(&mut self);

    /// Cold-resets into `target`. All failure exits funnel through here.
    fn reboot(&mut self, target: BootTarget) -> !;

    /// The recorded wake source.
    fn wake_source(&mut self) -> WakeSource;

    /// The recorded reset source.
    fn reset_source(&mut self) -> ResetSource;

    /// The recorded reset type.
    fn reset_type(&mut self) -> ResetType;

    /// Extra platform-specific reset information.
    fn reset_extra_u32(&mut self) -> u32;

    /// Installs ACPI tables carried by the boot image.
    fn install_acpi_from_image(&mut self, tables: &[u8]) -> Result<()>;

    /// Installs ACPI tables from the given partition labels.
    fn install_acpi_from_partitions(&mut self, labels: &[&str]) -> Result<()>;

    /// SMBIOS system serial number.
    fn system_serial(&mut self) -> Option<SmbiosString>;

    /// SMBIOS board serial number.
    fn board_serial(&mut self) -> Option<SmbiosString>;

    /// SMBIOS product name.
    fn product_name(&mut self) -> Option<SmbiosString>;

    /// SMBIOS BIOS version.
    fn bios_version(&mut self) -> Option<SmbiosString>;

    /// Polls the console for a key, waiting at most `timeout_ms`.
    fn poll_key(&mut self, timeout_ms: u32) -> Option<Key>;

    /// Reports whether `key` stays held for `duration_ms`.
    fn key_held(&mut self, key: Key, duration_ms: u32) -> bool;

    /// Whether the battery is below the boot-OS threshold.
    fn battery_below_boot_threshold(&mut self) -> bool;

    /// Whether a charger is currently plugged.
    fn charger_plugged(&mut self) -> bool;

    /// Whether `path` exists on the EFI system volume.
    fn esp_file_exists(&mut self, path: &str) -> bool;

    /// Zeroises conventional RAM before an unlocked boot.
    fn clear_memory(&mut self) -> Result<()>;

    /// The verified boot root of trust baked into the bootloader, in AVB
    /// public key format.
    fn embedded_public_key(&self) -> &[u8];

    /// An optional user-installed verification key.
    fn user_public_key(&self) -> Option<&[u8]> {
        None
    }

    /// The bootloader version reported on the command line.
    fn bootloader_version(&self) -> &str;

    /// PARTUUID of the hibernation slot, when one is configured.
    fn resume_partuuid(&mut self) -> Option<SmbiosString> {
        None
    }

    /// The PCI device.function of the boot disk, e.g. "02.0".
    fn boot_device_diskbus(&mut self) -> Option<SmbiosString>;

    /// Framebuffer description for the kernel `screen_info`, if a display
    /// is present.
    fn framebuffer_info(&mut self) -> Option<FramebufferInfo>;

    /// Samples the firmware memory map. See
    /// [boot::HandoverPlatform::memory_map].
    fn memory_map(&mut self, regions: &mut [MemoryRegion]) -> Result<(usize, u64)>;

    /// Terminates firmware boot services. See
    /// [boot::HandoverPlatform::exit_boot_services].
    fn exit_boot_services(&mut self, map_key: u64) -> Result<()>;
}

/// Adapter exposing an [AblOps] as the [boot::HandoverPlatform] the jump
/// code wants.
pub struct HandoverAdapter<'a, O: AblOps>(pub &'a mut O);

impl<O: AblOps> boot::HandoverPlatform for HandoverAdapter<'_, O> {
    fn memory_map(&mut self, regions: &mut [MemoryRegion]) -> Result<(usize, u64)> {
        self.0.memory_map(regions)
    }

    fn exit_boot_services(&mut self, map_key: u64) -> Result<()> {
        self.0.exit_boot_services(map_key)
    }
}

/// Reads a boolean variable stored as a single 0/1 byte.
pub fn get_var_bool(vars: &mut dyn VarStore, namespace: &str, name: &str, default: bool) -> bool {
    let mut wire = [0u8; 1];
    match vars.get_var(namespace, name, &mut wire) {
        Ok(1) => wire[0] != 0,
        _ => default,
    }
}

/// Writes a boolean variable as a single 0/1 byte.
pub fn set_var_bool(
    vars: &mut dyn VarStore,
    namespace: &str,
    name: &str,
    value: bool,
) -> Result<()> {
    vars.set_var(namespace, name, &[value as u8], false)
}

/// Reads a u8 variable.
pub fn get_var_u8(vars: &mut dyn VarStore, namespace: &str, name: &str) -> Option<u8> {
    let mut wire = [0u8; 1];
    match vars.get_var(namespace, name, &mut wire) {
        Ok(1) => Some(wire[0]),
        _ => None,
    }
}

/// Writes a u8 variable.
pub fn set_var_u8(vars: &mut dyn VarStore, namespace: &str, name: &str, value: u8) -> Result<()> {
    vars.set_var(namespace, name, &[value], false)
}

/// Reads a u32 variable stored little-endian.
pub fn get_var_u32(vars: &mut dyn VarStore, namespace: &str, name: &str) -> Option<u32> {
    let mut wire = [0u8; 4];
    match vars.get_var(namespace, name, &mut wire) {
        Ok(4) => Some(u32::from_le_bytes(wire)),
        _ => None,
    }
}

/// Reads a string variable into `buf`, returning the decoded prefix.
pub fn get_var_str<'a>(
    vars: &mut dyn VarStore,
    namespace: &str,
    name: &str,
    buf: &'a mut [u8],
) -> Result<&'a str> {
    let len = vars.get_var(namespace, name, buf)?;
    // Tolerate a trailing NUL from firmware tooling.
    let bytes = match buf[..len].split_last() {
        Some((&0, head)) => head,
        _ => &buf[..len],
    };
    core::str::from_utf8(bytes).map_err(Error::from)
}
