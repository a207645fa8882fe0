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

//! The boot target decision engine.
//!
//! Signals are evaluated in a fixed order, short-circuiting on the first
//! one that asks for anything other than a normal boot: loader command
//! line, fastboot sentinel file, magic key, watchdog policy, battery
//! insertion, bootloader control block, one-shot variable, battery level,
//! charger wake. Read errors never propagate out of a check; a corrupt
//! signal source degrades to a normal boot so NV damage cannot brick the
//! device.

use devstate::{DeviceState, FASTBOOT_NAMESPACE, LOADER_NAMESPACE};
use liberror::Result;
use misc::{BcbCommand, BootloaderMessage};

use crate::ops::{
    self, AblOps, Key, ResetSource, WakeSource, WallTime, CRASH_EVENT_MENU_VAR,
    FASTBOOT_HOLD_DELAY_MS, LOADER_ENTRY_ONESHOT_VAR, LOADER_ENTRY_REBOOT_REASON_VAR,
    MAGIC_KEY_TIMEOUT_VAR, RESET_WAIT_MS_DEFAULT, RESET_WAIT_MS_MAX, WATCHDOG_COUNTER_MAX_VAR,
    WATCHDOG_COUNTER_VAR, WATCHDOG_TIME_REFERENCE_VAR,
};
use crate::slot_manager::MISC_LABEL;
use crate::{abl_println, boot_reason, slot_manager, BootTarget, Context, TargetPath};

/// Path of the fastboot sentinel file on the EFI system volume.
pub const FASTBOOT_SENTINEL: &str = "\\force_fastboot";

/// Maximum time between the first and the last watchdog reset. If the
/// current difference exceeds this constant, the watchdog counter is
/// restarted.
pub const WATCHDOG_DELAY_SECONDS: u64 = 600;

/// Consecutive watchdog resets tolerated before the crash event menu,
/// unless overridden by the `WatchdogCounterMax` variable.
pub const WATCHDOG_COUNTER_MAX_DEFAULT: u8 = 2;

/// Produces the boot target for this power cycle.
///
/// `cmdline_args` are the arguments the image loader was invoked with.
/// Exactly one target is returned and the decision is a pure function of
/// the consumed signals.
pub fn choose_boot_target<O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    cmdline_args: &[&str],
) -> BootTarget {
    let mut target = check_command_line(ctx, cmdline_args);

    if target == BootTarget::NormalBoot {
        target = check_fastboot_sentinel(ctx);
    }
    if target == BootTarget::NormalBoot {
        target = check_magic_key(ctx);
    }
    if target == BootTarget::NormalBoot {
        target = check_watchdog(ctx);
    }
    if target == BootTarget::NormalBoot {
        target = check_battery_inserted(ctx);
    }
    if target == BootTarget::NormalBoot {
        target = check_bcb(ctx);
    }
    if target == BootTarget::NormalBoot {
        target = check_loader_entry_one_shot(ctx);
    }
    if target == BootTarget::NormalBoot {
        target = check_battery(ctx);
    }
    if target == BootTarget::NormalBoot {
        target = check_charge_mode(ctx);
    }

    if target == BootTarget::CrashMode {
        target = ctx.ops.choose_crash_target();
    }

    abl_println!(ctx.ops, "Bootlogic: selected '{}'", target);
    target
}

/// Signal 1: flags and parameters on the loader command line.
fn check_command_line<O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    args: &[&str],
) -> BootTarget {
    let mut target = BootTarget::NormalBoot;

    for arg in args {
        if *arg == "-f" || *arg == "-a" {
            // "-a <address>" historically selected a RAM image; both forms
            // drop to fastboot now.
            target = BootTarget::Fastboot;
        } else if let Some(reason) = arg.strip_prefix("reset=") {
            let _ = ctx.ops.vars().set_var(
                LOADER_NAMESPACE,
                LOADER_ENTRY_REBOOT_REASON_VAR,
                reason.as_bytes(),
                false,
            );
        } else if let Some(mode) = arg.strip_prefix("boot_target=") {
            // Only CRASHMODE is honored here; everything else is decided by
            // the boot-mode word.
            if mode == "CRASHMODE" {
                return BootTarget::CrashMode;
            }
        } else if let Some(word) = arg.strip_prefix("fw.boot=") {
            if let Ok(bits) = u16::from_str_radix(word, 16) {
                target = BootTarget::from_platform_code(bits);
            }
        } else if let Some(val) = arg.strip_prefix("SecureBoot=") {
            if let Ok(val) = val.parse::<u8>() {
                ctx.set_secure_boot(val != 0);
            }
        } else if let Some(word) = arg.strip_prefix("fw.status=") {
            if let Ok(status) = u32::from_str_radix(word, 16) {
                ctx.set_secure_boot(status & 1 != 0);
            }
        }
    }
    target
}

/// Signal 2: the `\force_fastboot` sentinel file. Used by bootable media.
fn check_fastboot_sentinel<O: AblOps, D: DeviceState>(ctx: &mut Context<O, D>) -> BootTarget {
    match ctx.ops.esp_file_exists(FASTBOOT_SENTINEL) {
        true => BootTarget::Fastboot,
        false => BootTarget::NormalBoot,
    }
}

/// Signal 3: the magic key. A short press is ignored; a hold of
/// [FASTBOOT_HOLD_DELAY_MS] selects fastboot.
fn check_magic_key<O: AblOps, D: DeviceState>(ctx: &mut Context<O, D>) -> BootTarget {
    // Some systems need a short stall before the console input is
    // trustworthy after reset; the window is tunable per platform.
    let wait_ms = match ops::get_var_u32(ctx.ops.vars(), LOADER_NAMESPACE, MAGIC_KEY_TIMEOUT_VAR) {
        Some(ms) if ms <= RESET_WAIT_MS_MAX => ms,
        _ => RESET_WAIT_MS_DEFAULT,
    };

    match ctx.ops.poll_key(wait_ms) {
        Some(Key::Down) if ctx.ops.key_held(Key::Down, FASTBOOT_HOLD_DELAY_MS) => {
            BootTarget::Fastboot
        }
        _ => BootTarget::NormalBoot,
    }
}

fn reset_is_due_to_watchdog_or_panic<O: AblOps>(ops: &mut O) -> bool {
    matches!(
        ops.reset_source(),
        ResetSource::KernelWatchdog
            | ResetSource::SecurityWatchdog
            | ResetSource::PmicWatchdog
            | ResetSource::EcWatchdog
    ) || boot_reason::saved_reason_is(ops, "kernel_panic")
        || boot_reason::saved_reason_is(ops, "watchdog")
}

fn reset_watchdog_status<O: AblOps>(ops: &mut O) -> Result<()> {
    ops::set_var_u8(ops.vars(), FASTBOOT_NAMESPACE, WATCHDOG_COUNTER_VAR, 0)?;
    ops.vars().del_var(FASTBOOT_NAMESPACE, WATCHDOG_TIME_REFERENCE_VAR)
}

/// Signal 4: the watchdog policy. If more than the configured number of
/// watchdog (or kernel panic) resets happen in a row within
/// [WATCHDOG_DELAY_SECONDS], the crash event menu decides the target.
fn check_watchdog<O: AblOps, D: DeviceState>(ctx: &mut Context<O, D>) -> BootTarget {
    let ops = &mut *ctx.ops;
    if !ops::get_var_bool(ops.vars(), FASTBOOT_NAMESPACE, CRASH_EVENT_MENU_VAR, true) {
        return BootTarget::NormalBoot;
    }

    let mut counter =
        ops::get_var_u8(ops.vars(), FASTBOOT_NAMESPACE, WATCHDOG_COUNTER_VAR).unwrap_or(0);

    if !reset_is_due_to_watchdog_or_panic(ops) {
        if counter != 0 {
            if let Err(e) = reset_watchdog_status(ops) {
                abl_println!(ops, "Failed to reset the watchdog status: {}", e);
            }
        }
        return BootTarget::NormalBoot;
    }

    let now = match ops.now_wall() {
        Ok(now) => now,
        Err(e) => {
            abl_println!(ops, "Failed to get the current time: {}", e);
            return BootTarget::NormalBoot;
        }
    };

    if counter > 0 {
        let mut wire = [0u8; 8];
        let reference = match ops.vars().get_var(
            FASTBOOT_NAMESPACE,
            WATCHDOG_TIME_REFERENCE_VAR,
            &mut wire,
        ) {
            Ok(8) => WallTime::from_wire(&wire),
            _ => WallTime::default(),
        };
        let now_s = now.to_unix_seconds();
        let ref_s = reference.to_unix_seconds();
        if now_s < ref_s || now_s - ref_s > WATCHDOG_DELAY_SECONDS {
            counter = 0;
        }
    }

    if counter == 0 {
        if let Err(e) = ops.vars().set_var(
            FASTBOOT_NAMESPACE,
            WATCHDOG_TIME_REFERENCE_VAR,
            &now.to_wire(),
            false,
        ) {
            abl_println!(ops, "Failed to set the watchdog time reference: {}", e);
            return BootTarget::NormalBoot;
        }
    }

    counter += 1;
    abl_println!(ops, "Incrementing watchdog counter ({})", counter);

    let max = ops::get_var_u8(ops.vars(), FASTBOOT_NAMESPACE, WATCHDOG_COUNTER_MAX_VAR)
        .unwrap_or(WATCHDOG_COUNTER_MAX_DEFAULT);
    if counter <= max {
        if let Err(e) = ops::set_var_u8(ops.vars(), FASTBOOT_NAMESPACE, WATCHDOG_COUNTER_VAR, counter)
        {
            abl_println!(ops, "Failed to set the watchdog counter: {}", e);
        }
        return BootTarget::NormalBoot;
    }

    if let Err(e) = reset_watchdog_status(ops) {
        abl_println!(ops, "Failed to reset the watchdog status: {}", e);
    }
    ops.choose_crash_target()
}

/// Signal 5: battery insertion wake. Without off-mode charging there is
/// nothing useful to do with a machine that only woke because a battery
/// appeared.
fn check_battery_inserted<O: AblOps, D: DeviceState>(ctx: &mut Context<O, D>) -> BootTarget {
    if ctx.ops.wake_source() == WakeSource::BatteryInserted && !ctx.off_mode_charge() {
        return BootTarget::PowerOff;
    }
    BootTarget::NormalBoot
}

/// Signal 6: the bootloader control block on the misc partition.
fn check_bcb<O: AblOps, D: DeviceState>(ctx: &mut Context<O, D>) -> BootTarget {
    let ops = &mut *ctx.ops;
    let mut bcb_bytes = [0u8; BootloaderMessage::SIZE_BYTES];
    if let Err(e) = ops.read_from_partition(MISC_LABEL, 0, &mut bcb_bytes) {
        abl_println!(ops, "Unable to read BCB: {}", e);
        return BootTarget::NormalBoot;
    }
    let Ok(bcb) = BootloaderMessage::from_bytes_mut(&mut bcb_bytes) else {
        return BootTarget::NormalBoot;
    };

    // We own the status field; clear any stale data.
    let mut dirty = bcb.status_dirty();
    bcb.clear_status();

    let mut oneshot = false;
    let target = match bcb.command() {
        Ok(BcbCommand::None) => BootTarget::NormalBoot,
        Ok(BcbCommand::Boot(name)) => {
            BootTarget::from_name(name).unwrap_or(BootTarget::NormalBoot)
        }
        Ok(BcbCommand::BootOnce(name)) => {
            oneshot = true;
            BootTarget::from_name(name).unwrap_or(BootTarget::NormalBoot)
        }
        Ok(BcbCommand::EspPath(path)) => esp_path_target(ops, path),
        Err(e) => {
            abl_println!(ops, "Unreadable BCB command: {}", e);
            BootTarget::NormalBoot
        }
    };

    if oneshot {
        bcb.clear_command();
        dirty = true;
        // Clear the one-shot variable as well, so an unexpected target
        // cannot come back on the next boot.
        let _ = ops.vars().del_var(LOADER_NAMESPACE, LOADER_ENTRY_ONESHOT_VAR);
    }

    if dirty {
        let written = ops.write_to_partition(MISC_LABEL, 0, &bcb_bytes);
        if let Err(e) = written.and_then(|_| ops.flush()) {
            abl_println!(ops, "Unable to update BCB contents: {}", e);
        }
    }

    match (oneshot, target) {
        // fastbootd lives in the recovery ramdisk; a persistent
        // "boot-fastboot" request boots recovery, which then parses the BCB
        // itself and switches to fastbootd.
        (false, BootTarget::Fastboot) => BootTarget::Recovery,
        (_, target) => target,
    }
}

fn esp_path_target<O: AblOps>(ops: &mut O, path: &str) -> BootTarget {
    if !ops.esp_file_exists(path) {
        abl_println!(ops, "Specified BCB file '{}' doesn't exist", path);
        return BootTarget::NormalBoot;
    }
    let Ok(path) = TargetPath::from(path) else {
        abl_println!(ops, "BCB file path too long");
        return BootTarget::NormalBoot;
    };
    match is_efi_path(&path) {
        true => BootTarget::EspEfiBinary(path),
        false => BootTarget::EspBootImage(path),
    }
}

fn is_efi_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 4 && bytes[bytes.len() - 4..].eq_ignore_ascii_case(b".efi")
}

/// Signal 7: the `LoaderEntryOneShot` variable, consumed on read.
fn check_loader_entry_one_shot<O: AblOps, D: DeviceState>(ctx: &mut Context<O, D>) -> BootTarget {
    let mut buf = [0u8; 128];
    let target = {
        let ops = &mut *ctx.ops;
        let target =
            ops::get_var_str(ops.vars(), LOADER_NAMESPACE, LOADER_ENTRY_ONESHOT_VAR, &mut buf);
        let _ = ops.vars().del_var(LOADER_NAMESPACE, LOADER_ENTRY_ONESHOT_VAR);
        match target {
            Ok(target) => target,
            Err(_) => return BootTarget::NormalBoot,
        }
    };

    match BootTarget::from_name(target) {
        Some(BootTarget::Charger) if !ctx.off_mode_charge() => BootTarget::PowerOff,
        Some(target) => target,
        None if target == "dm-verity device corrupted" => {
            if let Ok(Some(slot)) = slot_manager::active_slot(ctx.ops) {
                if let Err(e) = slot_manager::set_verity_corrupted(ctx.ops, slot, true) {
                    abl_println!(ctx.ops, "Failed to set the verity corrupted flag: {}", e);
                }
            }
            BootTarget::NormalBoot
        }
        None => {
            abl_println!(ctx.ops, "Unknown oneshot boot target: '{}'", target);
            BootTarget::NormalBoot
        }
    }
}

/// Signal 8: battery level against the boot-OS threshold.
fn check_battery<O: AblOps, D: DeviceState>(ctx: &mut Context<O, D>) -> BootTarget {
    if !ctx.ops.battery_below_boot_threshold() {
        return BootTarget::NormalBoot;
    }
    match ctx.ops.charger_plugged() {
        true => BootTarget::Charger,
        false => {
            ctx.ops.display_low_battery();
            BootTarget::PowerOff
        }
    }
}

/// Signal 9: charger insertion wake.
fn check_charge_mode<O: AblOps, D: DeviceState>(ctx: &mut Context<O, D>) -> BootTarget {
    match ctx.ops.wake_source() {
        WakeSource::UsbChargerInserted | WakeSource::AcdcChargerInserted => BootTarget::Charger,
        _ => BootTarget::NormalBoot,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{FakeOps, FakeState};
    use devstate::BuildVariant;
    use devstate::VarStore;

    fn decide(ops: &mut FakeOps, args: &[&str]) -> BootTarget {
        let mut state = FakeState::default();
        let mut ctx = Context::new(ops, &mut state, BuildVariant::User);
        choose_boot_target(&mut ctx, args)
    }

    fn write_bcb_command(ops: &mut FakeOps, command: &str) {
        let misc = ops.partition_mut(MISC_LABEL);
        misc[..32].fill(0);
        misc[..command.len()].copy_from_slice(command.as_bytes());
    }

    fn bcb_command_bytes(ops: &mut FakeOps) -> [u8; 32] {
        ops.partition_mut(MISC_LABEL)[..32].try_into().unwrap()
    }

    #[test]
    fn test_default_is_normal_boot() {
        let mut ops = FakeOps::new();
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
    }

    #[test]
    fn test_dash_f_forces_fastboot() {
        let mut ops = FakeOps::new();
        assert_eq!(decide(&mut ops, &["-f"]), BootTarget::Fastboot);
    }

    #[test]
    fn test_boot_target_crashmode_prompts_user() {
        let mut ops = FakeOps::new();
        ops.crash_choice = BootTarget::Fastboot;
        assert_eq!(decide(&mut ops, &["boot_target=CRASHMODE"]), BootTarget::Fastboot);
        assert!(ops.crash_prompted);
    }

    #[test]
    fn test_fw_boot_word_decodes_target() {
        let mut ops = FakeOps::new();
        assert_eq!(decide(&mut ops, &["fw.boot=2"]), BootTarget::Fastboot);
        let mut ops = FakeOps::new();
        assert_eq!(decide(&mut ops, &["fw.boot=41"]), BootTarget::Recovery);
    }

    #[test]
    fn test_fw_status_sets_secure_boot() {
        let mut ops = FakeOps::new();
        let mut state = FakeState::default();
        let mut ctx = Context::new(&mut ops, &mut state, BuildVariant::User);
        choose_boot_target(&mut ctx, &["fw.status=5"]);
        assert!(ctx.secure_boot());
    }

    #[test]
    fn test_sentinel_file_forces_fastboot() {
        let mut ops = FakeOps::new();
        ops.esp_files.push(FASTBOOT_SENTINEL.into());
        assert_eq!(decide(&mut ops, &[]), BootTarget::Fastboot);
    }

    #[test]
    fn test_magic_key_held_forces_fastboot() {
        let mut ops = FakeOps::new();
        ops.pending_key = Some(Key::Down);
        ops.key_held_result = true;
        assert_eq!(decide(&mut ops, &[]), BootTarget::Fastboot);
    }

    #[test]
    fn test_magic_key_released_boots_normally() {
        let mut ops = FakeOps::new();
        ops.pending_key = Some(Key::Down);
        ops.key_held_result = false;
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
    }

    #[test]
    fn test_watchdog_storm_triggers_crash_menu() {
        let mut ops = FakeOps::new();
        ops.reset = ResetSource::KernelWatchdog;
        ops.crash_choice = BootTarget::Fastboot;

        // First and second watchdog boots increment the counter.
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
        assert!(!ops.crash_prompted);

        // The third crosses the threshold of two.
        assert_eq!(decide(&mut ops, &[]), BootTarget::Fastboot);
        assert!(ops.crash_prompted);

        // And the counter was reset for the next cycle.
        assert_eq!(
            ops::get_var_u8(&mut ops.vars, FASTBOOT_NAMESPACE, WATCHDOG_COUNTER_VAR),
            Some(0)
        );
    }

    #[test]
    fn test_watchdog_counter_expires_after_delay() {
        let mut ops = FakeOps::new();
        ops.reset = ResetSource::KernelWatchdog;
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);

        // More than WATCHDOG_DELAY_SECONDS later the burst is forgotten.
        ops.wall.hour += 1;
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
        assert_eq!(
            ops::get_var_u8(&mut ops.vars, FASTBOOT_NAMESPACE, WATCHDOG_COUNTER_VAR),
            Some(1)
        );
    }

    #[test]
    fn test_clean_boot_resets_watchdog_counter() {
        let mut ops = FakeOps::new();
        ops::set_var_u8(&mut ops.vars, FASTBOOT_NAMESPACE, WATCHDOG_COUNTER_VAR, 2).unwrap();
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
        assert_eq!(
            ops::get_var_u8(&mut ops.vars, FASTBOOT_NAMESPACE, WATCHDOG_COUNTER_VAR),
            Some(0)
        );
    }

    #[test]
    fn test_crash_event_menu_disabled_skips_watchdog() {
        let mut ops = FakeOps::new();
        ops.reset = ResetSource::KernelWatchdog;
        ops::set_var_bool(&mut ops.vars, FASTBOOT_NAMESPACE, CRASH_EVENT_MENU_VAR, false)
            .unwrap();
        for _ in 0..5 {
            assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
        }
        assert!(!ops.crash_prompted);
    }

    #[test]
    fn test_battery_inserted_powers_off_without_off_mode_charge() {
        let mut ops = FakeOps::new();
        ops.wake = WakeSource::BatteryInserted;
        ops::set_var_bool(&mut ops.vars, FASTBOOT_NAMESPACE, ops::OFF_MODE_CHARGE_VAR, false)
            .unwrap();
        assert_eq!(decide(&mut ops, &[]), BootTarget::PowerOff);
    }

    #[test]
    fn test_battery_inserted_with_off_mode_charge_continues() {
        let mut ops = FakeOps::new();
        ops.wake = WakeSource::BatteryInserted;
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
    }

    #[test]
    fn test_bcb_persistent_recovery() {
        let mut ops = FakeOps::new();
        write_bcb_command(&mut ops, "boot-recovery");
        assert_eq!(decide(&mut ops, &[]), BootTarget::Recovery);
        // Persistent commands stay for the OS to clear.
        assert_eq!(&bcb_command_bytes(&mut ops)[..13], b"boot-recovery");
    }

    #[test]
    fn test_bcb_oneshot_recovery_clears_command() {
        let mut ops = FakeOps::new();
        write_bcb_command(&mut ops, "bootonce-recovery");
        assert_eq!(decide(&mut ops, &[]), BootTarget::Recovery);
        assert_eq!(bcb_command_bytes(&mut ops), [0u8; 32]);
    }

    #[test]
    fn test_bcb_fastboot_canonicalises_to_recovery() {
        let mut ops = FakeOps::new();
        write_bcb_command(&mut ops, "boot-fastboot");
        assert_eq!(decide(&mut ops, &[]), BootTarget::Recovery);
    }

    #[test]
    fn test_bcb_oneshot_fastboot_stays_fastboot() {
        let mut ops = FakeOps::new();
        write_bcb_command(&mut ops, "bootonce-fastboot");
        assert_eq!(decide(&mut ops, &[]), BootTarget::Fastboot);
    }

    #[test]
    fn test_bcb_esp_paths() {
        let mut ops = FakeOps::new();
        ops.esp_files.push("\\update.EFI".into());
        write_bcb_command(&mut ops, "\\update.EFI");
        match decide(&mut ops, &[]) {
            BootTarget::EspEfiBinary(path) => assert_eq!(path.as_str(), "\\update.EFI"),
            other => panic!("unexpected target {:?}", other),
        }

        let mut ops = FakeOps::new();
        ops.esp_files.push("\\ram.img".into());
        write_bcb_command(&mut ops, "\\ram.img");
        match decide(&mut ops, &[]) {
            BootTarget::EspBootImage(path) => assert_eq!(path.as_str(), "\\ram.img"),
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_bcb_esp_path_missing_file_ignored() {
        let mut ops = FakeOps::new();
        write_bcb_command(&mut ops, "\\gone.efi");
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
    }

    #[test]
    fn test_bcb_status_cleared_on_read() {
        let mut ops = FakeOps::new();
        ops.partition_mut(MISC_LABEL)[32..37].copy_from_slice(b"stale");
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
        assert_eq!(ops.partition_mut(MISC_LABEL)[32..64], [0u8; 32]);
    }

    #[test]
    fn test_oneshot_variable_recovery() {
        let mut ops = FakeOps::new();
        ops.vars
            .set_var(LOADER_NAMESPACE, LOADER_ENTRY_ONESHOT_VAR, b"recovery", false)
            .unwrap();
        assert_eq!(decide(&mut ops, &[]), BootTarget::Recovery);
        // Consumed either way.
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
    }

    #[test]
    fn test_oneshot_charger_without_off_mode_charge_powers_off() {
        let mut ops = FakeOps::new();
        ops::set_var_bool(&mut ops.vars, FASTBOOT_NAMESPACE, ops::OFF_MODE_CHARGE_VAR, false)
            .unwrap();
        ops.vars
            .set_var(LOADER_NAMESPACE, LOADER_ENTRY_ONESHOT_VAR, b"charging", false)
            .unwrap();
        assert_eq!(decide(&mut ops, &[]), BootTarget::PowerOff);
    }

    #[test]
    fn test_oneshot_dm_verity_corruption_marks_slot() {
        let mut ops = FakeOps::new();
        slot_manager::init(&mut ops).unwrap();
        ops.vars
            .set_var(
                LOADER_NAMESPACE,
                LOADER_ENTRY_ONESHOT_VAR,
                b"dm-verity device corrupted",
                false,
            )
            .unwrap();
        assert_eq!(decide(&mut ops, &[]), BootTarget::NormalBoot);
        assert!(slot_manager::slot_info(&mut ops, avbab::SlotIndex::A)
            .unwrap()
            .verity_corrupted);
    }

    #[test]
    fn test_low_battery_with_charger_goes_charger_mode() {
        let mut ops = FakeOps::new();
        ops.battery_low = true;
        ops.charger = true;
        assert_eq!(decide(&mut ops, &[]), BootTarget::Charger);
    }

    #[test]
    fn test_low_battery_without_charger_powers_off() {
        let mut ops = FakeOps::new();
        ops.battery_low = true;
        ops.charger = false;
        assert_eq!(decide(&mut ops, &[]), BootTarget::PowerOff);
        assert!(ops.low_battery_displayed);
    }

    #[test]
    fn test_charger_wake_selects_charger_mode() {
        let mut ops = FakeOps::new();
        ops.wake = WakeSource::UsbChargerInserted;
        assert_eq!(decide(&mut ops, &[]), BootTarget::Charger);
        let mut ops = FakeOps::new();
        ops.wake = WakeSource::AcdcChargerInserted;
        assert_eq!(decide(&mut ops, &[]), BootTarget::Charger);
    }

    #[test]
    fn test_decision_is_stable_for_identical_signals() {
        let mut first = FakeOps::new();
        let mut second = FakeOps::new();
        for ops in [&mut first, &mut second] {
            ops.wake = WakeSource::UsbChargerInserted;
            write_bcb_command(ops, "boot-recovery");
        }
        assert_eq!(decide(&mut first, &[]), decide(&mut second, &[]));
    }

    #[test]
    fn test_escalating_signals_are_monotonic() {
        // NormalBoot < Charger < Recovery < Fastboot < CrashMode < PowerOff
        fn rank(target: &BootTarget) -> u8 {
            match target {
                BootTarget::NormalBoot => 0,
                BootTarget::Charger => 1,
                BootTarget::Recovery => 2,
                BootTarget::Fastboot => 3,
                BootTarget::CrashMode => 4,
                BootTarget::PowerOff => 5,
                _ => u8::MAX,
            }
        }

        let baseline = {
            let mut ops = FakeOps::new();
            decide(&mut ops, &[])
        };

        // Turning on exactly one escalating signal never lowers the target.
        let with_sentinel = {
            let mut ops = FakeOps::new();
            ops.esp_files.push(FASTBOOT_SENTINEL.into());
            decide(&mut ops, &[])
        };
        let with_magic_key = {
            let mut ops = FakeOps::new();
            ops.pending_key = Some(Key::Down);
            ops.key_held_result = true;
            decide(&mut ops, &[])
        };
        let with_bcb = {
            let mut ops = FakeOps::new();
            write_bcb_command(&mut ops, "boot-recovery");
            decide(&mut ops, &[])
        };

        for escalated in [with_sentinel, with_magic_key, with_bcb] {
            assert!(rank(&escalated) >= rank(&baseline));
        }
    }
}
