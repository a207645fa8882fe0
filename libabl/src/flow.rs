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

//! The main boot flow: pick a target, verify, assemble, jump.
//!
//! Targets the core owns (normal, recovery, charger) are booted here and
//! [run] does not return on success. Everything else (fastboot, ESP
//! chainload, DNX, power off) is returned to the platform shell, which owns
//! those services.

use boot::{BootParams, Gdt, MemoryKind, MemoryRegion};
use devstate::DeviceState;
use liberror::{Error, Result};
use zerocopy::FromZeroes;

use crate::handover::MEMORY_MAP_CAPACITY;
use crate::ops::AblOps;
use crate::{
    abl_println, android_boot, avb, handover, policy, slot_manager, BootState, BootTarget,
    Context,
};

/// Reason code shown by the user prompt when verification failed.
pub const BOOT_ERROR_EVENT_CODE: u32 = 0x0b00;

/// The partitions every boot must find covered by the verified vbmeta
/// chain.
const REQUIRED_PARTITIONS: &[&str] = &["boot"];

// The descriptor table must survive the jump; keeping it in the loader
// image's data section satisfies that.
static GDT: Gdt = Gdt::new();

/// Decides the boot target and, for the targets this core owns, carries the
/// boot through to the kernel jump.
///
/// `load` provides all working memory: verification scratch on one side,
/// image loading on the other. On a successful jump this never returns; a
/// returned target is one the caller (fastboot shell, ESP chainloader)
/// must handle, and an error is a platform failure worth a cold reset.
pub fn run<O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    cmdline_args: &[&str],
    load: &mut [u8],
) -> Result<BootTarget> {
    if let Err(e) = ctx.device_state.init() {
        abl_println!(ctx.ops, "device state init failed: {}", e);
    }
    slot_manager::init(ctx.ops)?;

    let target = policy::choose_boot_target(ctx, cmdline_args);
    match target {
        BootTarget::NormalBoot | BootTarget::Recovery | BootTarget::Charger => {}
        other => return Ok(other),
    }

    let (scratch, load) = load.split_at_mut(load.len() / 2);
    let (slot, verified) = avb::load_and_verify(ctx, REQUIRED_PARTITIONS, scratch)?;

    if verified.boot_state == BootState::Red {
        abl_println!(ctx.ops, "boot verification failed on slot {}", verified.slot_suffix);
        if ctx.lock_state().is_locked() {
            let choice = ctx.ops.choose_boot_target(BOOT_ERROR_EVENT_CODE);
            ctx.ops.reboot(choice);
        }
        return Err(Error::VerificationFailed);
    }

    // The try is burned right before the jump; the OS marks the slot
    // successful once it comes up.
    slot_manager::mark_boot_attempt(ctx.ops, slot)?;

    let images = android_boot::load_and_assemble(ctx, &target, slot, &verified, load)?;
    let mut params = BootParams::new_zeroed();
    let framebuffer = ctx.ops.framebuffer_info();
    let entry = handover::prepare_boot_params(&images, &mut params, framebuffer)?;

    let mut regions =
        [MemoryRegion { start: 0, size: 0, kind: MemoryKind::Reserved }; MEMORY_MAP_CAPACITY];
    handover::boot_kernel(ctx, &images, &mut params, &GDT, &mut regions, entry)?;
    // boot_kernel only comes back on failure.
    Err(Error::BootFailed)
}
