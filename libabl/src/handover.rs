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

//! The final stretch: seal the device state, populate the Linux boot
//! parameters, leave firmware boot services and jump to the kernel.
//!
//! Sealing happens first, strictly after every rollback index write of the
//! verification stage; after the boot services exit nothing here allocates
//! or calls back into firmware.

use boot::{exit_boot_services_with_retry, BootParams, Gdt, MemoryRegion};
use devstate::DeviceState;
use liberror::Result;

use crate::android_boot::LoadedImages;
use crate::ops::{AblOps, HandoverAdapter};
use crate::Context;

/// Number of memory map regions the snapshot buffer holds.
pub const MEMORY_MAP_CAPACITY: usize = 256;

/// Populates `params` from the kernel blob and the assembled artifacts.
/// Returns the kernel entry address.
pub fn prepare_boot_params(
    images: &LoadedImages,
    params: &mut BootParams,
    framebuffer: Option<boot::FramebufferInfo>,
) -> Result<usize> {
    let source = BootParams::from_bytes_ref(images.kernel)?;
    source.check()?;

    // Only the setup header is carried over; the rest of the zero page
    // stays zero and is filled in by the loader below.
    params.hdr = { source.hdr };
    let entry = images.kernel.as_ptr() as usize + source.kernel_off();

    params.setup_loader(
        images.cmdline.as_ptr() as u32,
        images.cmdline.len() as u32,
        images.ramdisk.as_ptr() as u32,
        images.ramdisk.len() as u32,
        entry as u32,
    );
    if let Some(fb) = framebuffer {
        params.set_screen_info(&fb);
    }
    Ok(entry)
}

/// Seals the device state and transfers control to the kernel. Returns only
/// on failure; once boot services are gone every error is fatal and the
/// caller must halt.
pub fn boot_kernel<O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    images: &LoadedImages,
    params: &mut BootParams,
    gdt: &Gdt,
    regions: &mut [MemoryRegion; MEMORY_MAP_CAPACITY],
    kernel_entry: usize,
) -> Result<()> {
    // All rollback writes precede this point; the store stays locked until
    // the next platform reset.
    ctx.device_state.seal()?;

    exit_boot_services_with_retry(&mut HandoverAdapter(ctx.ops), params, &mut regions[..])?;

    // Boot services are gone: no logging, no allocation, no firmware
    // callback from here on.
    #[cfg(target_arch = "x86_64")]
    // SAFETY: `images` holds a checked kernel; `params` was populated by
    // `prepare_boot_params`; the GDT outlives the jump by contract.
    unsafe {
        boot::x86::handover_jump(params, gdt, kernel_entry);
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (gdt, kernel_entry);
        Err(liberror::Error::Unsupported)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{FakeOps, FakeState};
    use devstate::BuildVariant;
    use zerocopy::{AsBytes, FromZeroes};

    fn fake_kernel_blob() -> Vec<u8> {
        let mut header = BootParams::new_zeroed();
        header.hdr.setup_sects = 3;
        header.hdr.boot_flag = 0xAA55;
        header.hdr.header = u32::from_le_bytes(*b"HdrS");
        header.hdr.version = 0x020c;
        header.hdr.loadflags = 0x1;
        let mut blob = header.as_bytes().to_vec();
        blob.resize(64 * 1024, 0xcc);
        blob
    }

    #[test]
    fn test_prepare_boot_params() {
        let mut kernel = fake_kernel_blob();
        let mut ramdisk = vec![0u8; 4096];
        let images = LoadedImages {
            kernel: &mut kernel,
            ramdisk: &mut ramdisk,
            cmdline: "androidboot.slot_suffix=_a ro",
        };

        let mut params = BootParams::new_zeroed();
        let entry = prepare_boot_params(&images, &mut params, None).unwrap();

        // Entry skips the legacy boot sector plus 3 setup sectors.
        assert_eq!(entry, images.kernel.as_ptr() as usize + 4 * 512);
        assert_eq!({ params.hdr.type_of_loader }, 0xff);
        assert_eq!({ params.hdr.ramdisk_size }, 4096);
        assert_eq!({ params.hdr.cmdline_size }, images.cmdline.len() as u32);
        assert_eq!({ params.hdr.boot_flag }, 0xAA55);
    }

    #[test]
    fn test_prepare_rejects_non_kernel() {
        let mut kernel = vec![0u8; 8192];
        let mut ramdisk = vec![0u8; 16];
        let images =
            LoadedImages { kernel: &mut kernel, ramdisk: &mut ramdisk, cmdline: "" };
        let mut params = BootParams::new_zeroed();
        assert!(prepare_boot_params(&images, &mut params, None).is_err());
    }

    #[test]
    fn test_boot_kernel_seals_before_exit() {
        // The fake platform refuses to leave boot services, so the jump is
        // never reached, but the device state must already be sealed.
        let mut ops = FakeOps::new();
        let mut state = FakeState::default();
        let mut ctx = Context::new(&mut ops, &mut state, BuildVariant::User);

        let mut kernel = fake_kernel_blob();
        let mut ramdisk = vec![0u8; 16];
        let images =
            LoadedImages { kernel: &mut kernel, ramdisk: &mut ramdisk, cmdline: "ro" };
        let mut params = BootParams::new_zeroed();
        let entry = prepare_boot_params(&images, &mut params, None).unwrap();

        let gdt = Gdt::new();
        let mut regions =
            [boot::MemoryRegion { start: 0, size: 0, kind: boot::MemoryKind::Reserved };
                MEMORY_MAP_CAPACITY];
        let err = boot_kernel(&mut ctx, &images, &mut params, &gdt, &mut regions, entry)
            .unwrap_err();
        assert_eq!(err, liberror::Error::DeviceError);
        assert!(state.sealed);
    }
}
