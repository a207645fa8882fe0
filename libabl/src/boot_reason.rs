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

//! The `androidboot.bootreason` vocabulary and its derivation from the
//! platform wake/reset information.
//!
//! The wake source wins over the reset source. An `os_initiated` reset is
//! refined by the reason string the OS saved in `LoaderEntryRebootReason`;
//! the variable is consumed either way so a stale reason cannot leak into a
//! later boot.

use arrayvec::ArrayString;

use devstate::LOADER_NAMESPACE;

use crate::ops::{
    self, AblOps, ResetSource, WakeSource, LOADER_ENTRY_REBOOT_REASON_VAR,
};

/// Reason reported when nothing better is known.
pub const UNKNOWN_REASON: &str = "unknown";

/// Buffer type for a sanitised reboot reason.
pub type ReasonString = ArrayString<64>;

fn wake_reason(source: WakeSource) -> Option<&'static str> {
    Some(match source {
        WakeSource::BatteryInserted => "battery_inserted",
        WakeSource::UsbChargerInserted => "usb_charger_inserted",
        WakeSource::AcdcChargerInserted => "acdc_charger_inserted",
        WakeSource::PowerButtonPressed => "power_button_pressed",
        WakeSource::RtcTimer => "rtc_timer",
        WakeSource::BatteryReachedIaThreshold => "battery_reached_ia_threshold",
        WakeSource::NotApplicable | WakeSource::Unknown => return None,
    })
}

fn reset_reason(source: ResetSource) -> &'static str {
    match source {
        ResetSource::NotApplicable => "not_applicable",
        ResetSource::OsInitiated => "os_initiated",
        ResetSource::Forced => "forced",
        ResetSource::FirmwareUpdate => "firmware_update",
        ResetSource::KernelWatchdog => "watchdog",
        ResetSource::SecurityWatchdog => "security_watchdog",
        ResetSource::SecurityInitiated => "security_initiated",
        ResetSource::EcWatchdog => "ec_watchdog",
        ResetSource::PmicWatchdog => "pmic_watchdog",
        ResetSource::ShortPowerLoss => "short_power_loss",
        ResetSource::PlatformSpecific => "platform_specific",
        ResetSource::Unknown => UNKNOWN_REASON,
    }
}

/// Whether the saved reboot reason equals `expected`. Does not consume the
/// variable; the watchdog policy peeks at the reason before the command
/// line is assembled.
pub fn saved_reason_is<O: AblOps>(ops: &mut O, expected: &str) -> bool {
    let mut buf = [0u8; 64];
    matches!(
        ops::get_var_str(ops.vars(), LOADER_NAMESPACE, LOADER_ENTRY_REBOOT_REASON_VAR, &mut buf),
        Ok(reason) if reason == expected
    )
}

/// Removes the saved reboot reason.
pub fn clear_saved_reason<O: AblOps>(ops: &mut O) {
    let _ = ops.vars().del_var(LOADER_NAMESPACE, LOADER_ENTRY_REBOOT_REASON_VAR);
}

/// Derives the boot reason for the kernel command line and consumes the
/// saved OS reason.
pub fn boot_reason<O: AblOps>(ops: &mut O) -> ReasonString {
    let mut reason = ReasonString::new();

    if let Some(wake) = wake_reason(ops.wake_source()) {
        reason.push_str(wake);
        clear_saved_reason(ops);
        return reason;
    }

    let reset = reset_reason(ops.reset_source());
    if reset == "os_initiated" {
        let mut buf = [0u8; 64];
        let saved = ops::get_var_str(
            ops.vars(),
            LOADER_NAMESPACE,
            LOADER_ENTRY_REBOOT_REASON_VAR,
            &mut buf,
        );
        if let Ok(saved) = saved {
            if !saved.is_empty() && is_valid_reason(saved) && reason.try_push_str(saved).is_ok() {
                clear_saved_reason(ops);
                return reason;
            }
        }
    }

    reason.push_str(reset);
    clear_saved_reason(ops);
    reason
}

/// Only lower-case alphanumerics and underscores may reach the kernel.
fn is_valid_reason(reason: &str) -> bool {
    reason.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}
