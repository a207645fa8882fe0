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

//! Boot protocol implementation for x86 platforms.
//!
//! The library supports bzimage with boot protocol version 2.06+: modern
//! memory layout, protected mode kernel loaded high, command line longer
//! than 255 characters.
//!
//! See https://www.kernel.org/doc/html/v5.11/x86/boot.html#the-linux-x86-boot-protocol
//! for the `boot_params` / `setup_header` layout reproduced here.

#[cfg(target_arch = "x86_64")]
use core::arch::asm;
use core::mem::size_of;

use liberror::{Error, Result};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Ref};

/// Sector size is fixed to 512.
const SECTOR_SIZE: usize = 512;
/// Flag value for a protected mode kernel loaded at high address.
const LOAD_FLAG_LOADED_HIGH: u8 = 0x1;
/// The 64-bit kernel entry is this far past the 32-bit one.
const ENTRY_OFFSET_64: usize = 512;

/// E820 RAM address range type.
pub const E820_ADDRESS_TYPE_RAM: u32 = 1;
/// E820 reserved address range type.
pub const E820_ADDRESS_TYPE_RESERVED: u32 = 2;
/// E820 ACPI address range type.
pub const E820_ADDRESS_TYPE_ACPI: u32 = 3;
/// E820 NVS address range type.
pub const E820_ADDRESS_TYPE_NVS: u32 = 4;
/// E820 unusable address range type.
pub const E820_ADDRESS_TYPE_UNUSABLE: u32 = 5;

/// Capacity of the E820 table embedded in [BootParams].
pub const E820_MAX_ENTRIES: usize = 128;

/// Rounds of ExitBootServices attempts before giving up. Firmware may do a
/// partial shutdown on the first call and invalidate the map key, so the
/// map is resampled and the call retried.
pub const EXIT_BOOT_SERVICES_RETRIES: usize = 10;

/// Linux `screen_info` video type for an EFI framebuffer.
const VIDEO_TYPE_EFI: u8 = 0x70;
/// `screen_info.capabilities` bit: lfb_base is 64-bit.
const VIDEO_CAPABILITY_64BIT_BASE: u32 = 1 << 1;

/// The `setup_header` portion of `boot_params`, protocol 2.11 layout.
#[repr(C, packed)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct SetupHeader {
    /// Size of the setup code in sectors.
    pub setup_sects: u8,
    /// Deprecated.
    pub root_flags: u16,
    /// Size of the 32-bit code in 16-byte paragraphs.
    pub syssize: u32,
    /// Deprecated.
    pub ram_size: u16,
    /// Video mode control.
    pub vid_mode: u16,
    /// Deprecated.
    pub root_dev: u16,
    /// 0xAA55 magic.
    pub boot_flag: u16,
    /// Jump instruction.
    pub jump: u16,
    /// "HdrS" magic.
    pub header: u32,
    /// Boot protocol version.
    pub version: u16,
    /// Deprecated hook.
    pub realmode_swtch: u32,
    /// Deprecated.
    pub start_sys: u16,
    /// Pointer to the kernel version string.
    pub kernel_version: u16,
    /// Boot loader identifier; 0xFF is "undefined special loader".
    pub type_of_loader: u8,
    /// Boot protocol option flags.
    pub loadflags: u8,
    /// Real-mode code move size.
    pub setup_move_size: u16,
    /// Entry point of the 32-bit kernel.
    pub code32_start: u32,
    /// Ramdisk load address.
    pub ramdisk_image: u32,
    /// Ramdisk size in bytes.
    pub ramdisk_size: u32,
    /// Obsolete.
    pub bootsect_kludge: u32,
    /// End of the setup heap.
    pub heap_end_ptr: u16,
    /// Extended loader version.
    pub ext_loader_ver: u8,
    /// Extended loader type.
    pub ext_loader_type: u8,
    /// Pointer to the command line.
    pub cmd_line_ptr: u32,
    /// Highest address usable for the ramdisk.
    pub initrd_addr_max: u32,
    /// Physical address alignment required for the kernel.
    pub kernel_alignment: u32,
    /// Whether the kernel is relocatable.
    pub relocatable_kernel: u8,
    /// Minimum alignment as a power of two.
    pub min_alignment: u8,
    /// Boot protocol option flags (64-bit).
    pub xloadflags: u16,
    /// Maximum size of the command line.
    pub cmdline_size: u32,
    /// Paravirtualised subarchitecture.
    pub hardware_subarch: u32,
    /// Subarchitecture data.
    pub hardware_subarch_data: u64,
    /// Offset of the compressed payload.
    pub payload_offset: u32,
    /// Size of the compressed payload.
    pub payload_length: u32,
    /// setup_data linked list head.
    pub setup_data: u64,
    /// Preferred load address.
    pub pref_address: u64,
    /// Memory the kernel needs to initialise itself.
    pub init_size: u32,
    /// Offset of the EFI handover entry point.
    pub handover_offset: u32,
}
static_assertions::const_assert_eq!(size_of::<SetupHeader>(), 0x77);

/// Linux `screen_info`, filled from the firmware graphics output.
#[repr(C, packed)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct ScreenInfo {
    /// Legacy cursor column.
    pub orig_x: u8,
    /// Legacy cursor row.
    pub orig_y: u8,
    /// Legacy extended memory size.
    pub ext_mem_k: u16,
    /// Legacy video page.
    pub orig_video_page: u16,
    /// Legacy video mode.
    pub orig_video_mode: u8,
    /// Legacy text columns.
    pub orig_video_cols: u8,
    /// Flags.
    pub flags: u8,
    /// Unused.
    pub unused2: u8,
    /// Legacy EGA bx.
    pub orig_video_ega_bx: u16,
    /// Unused.
    pub unused3: u16,
    /// Legacy text lines.
    pub orig_video_lines: u8,
    /// Video type; [VIDEO_TYPE_EFI] for an EFI framebuffer.
    pub orig_video_is_vga: u8,
    /// Legacy font height.
    pub orig_video_points: u16,
    /// Framebuffer width in pixels.
    pub lfb_width: u16,
    /// Framebuffer height in pixels.
    pub lfb_height: u16,
    /// Bits per pixel.
    pub lfb_depth: u16,
    /// Framebuffer base address, low 32 bits.
    pub lfb_base: u32,
    /// Framebuffer size in bytes.
    pub lfb_size: u32,
    /// Legacy command line magic.
    pub cl_magic: u16,
    /// Legacy command line offset.
    pub cl_offset: u16,
    /// Bytes per scanline.
    pub lfb_linelength: u16,
    /// Red channel bit size.
    pub red_size: u8,
    /// Red channel bit position.
    pub red_pos: u8,
    /// Green channel bit size.
    pub green_size: u8,
    /// Green channel bit position.
    pub green_pos: u8,
    /// Blue channel bit size.
    pub blue_size: u8,
    /// Blue channel bit position.
    pub blue_pos: u8,
    /// Reserved channel bit size.
    pub rsvd_size: u8,
    /// Reserved channel bit position.
    pub rsvd_pos: u8,
    /// VESA PM segment.
    pub vesapm_seg: u16,
    /// VESA PM offset.
    pub vesapm_off: u16,
    /// Video pages.
    pub pages: u16,
    /// VESA attributes.
    pub vesa_attributes: u16,
    /// Capability flags.
    pub capabilities: u32,
    /// Framebuffer base address, high 32 bits.
    pub ext_lfb_base: u32,
    /// Reserved.
    pub _reserved: [u8; 2],
}
static_assertions::const_assert_eq!(size_of::<ScreenInfo>(), 0x40);

/// The EFI firmware info block of `boot_params`.
#[repr(C, packed)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct EfiInfo {
    /// "EL64" loader signature.
    pub efi_loader_signature: u32,
    /// System table address, low 32 bits.
    pub efi_systab: u32,
    /// Size of one memory descriptor.
    pub efi_memdesc_size: u32,
    /// Memory descriptor version.
    pub efi_memdesc_version: u32,
    /// Memory map address, low 32 bits.
    pub efi_memmap: u32,
    /// Memory map size in bytes.
    pub efi_memmap_size: u32,
    /// System table address, high 32 bits.
    pub efi_systab_hi: u32,
    /// Memory map address, high 32 bits.
    pub efi_memmap_hi: u32,
}
static_assertions::const_assert_eq!(size_of::<EfiInfo>(), 0x20);

/// One E820 address range entry.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct E820Entry {
    /// Range start address.
    pub addr: u64,
    /// Range size in bytes.
    pub size: u64,
    /// One of the `E820_ADDRESS_TYPE_*` values.
    pub typ: u32,
}
static_assertions::const_assert_eq!(size_of::<E820Entry>(), 20);

/// Linux `struct boot_params`, the "zero page".
#[repr(C, packed)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct BootParams {
    /// Video information for the kernel console.
    pub screen_info: ScreenInfo,
    /// Legacy APM BIOS info.
    pub apm_bios_info: [u8; 0x14],
    _pad2: [u8; 4],
    /// Physical address of the tboot shared page.
    pub tboot_addr: u64,
    /// Intel SpeedStep IST info.
    pub ist_info: [u8; 0x10],
    _pad3: [u8; 16],
    /// Legacy hd0 disk parameters.
    pub hd0_info: [u8; 16],
    /// Legacy hd1 disk parameters.
    pub hd1_info: [u8; 16],
    /// Legacy MCA system description table.
    pub sys_desc_table: [u8; 0x10],
    /// OLPC firmware header.
    pub olpc_ofw_header: [u8; 0x10],
    _pad4: [u8; 128],
    /// EDID display data.
    pub edid_info: [u8; 0x80],
    /// EFI firmware information.
    pub efi_info: EfiInfo,
    /// Legacy alternative memory size.
    pub alt_mem_k: u32,
    /// Scratch field for the kernel setup code.
    pub scratch: u32,
    /// Number of valid entries in `e820_map`.
    pub e820_entries: u8,
    /// Number of valid entries in `eddbuf`.
    pub eddbuf_entries: u8,
    /// Number of valid entries in `edd_mbr_sig_buffer`.
    pub edd_mbr_sig_buf_entries: u8,
    _pad6: [u8; 6],
    /// The setup header, copied from the kernel image and fixed up.
    pub hdr: SetupHeader,
    _pad7: [u8; 0x290 - 0x1f1 - size_of::<SetupHeader>()],
    /// EDD MBR signatures.
    pub edd_mbr_sig_buffer: [u32; 16],
    /// The system memory map.
    pub e820_map: [E820Entry; E820_MAX_ENTRIES],
    _pad8: [u8; 48],
    /// EDD data.
    pub eddbuf: [u8; 0x1ec],
    _pad9: [u8; 276],
}
static_assertions::const_assert_eq!(size_of::<BootParams>(), 4096);

impl BootParams {
    /// Casts bytes into a reference of BootParams.
    pub fn from_bytes_ref(buffer: &[u8]) -> Result<&BootParams> {
        Ok(Ref::<_, BootParams>::new_from_prefix(buffer)
            .ok_or(Error::BufferTooSmall(Some(size_of::<BootParams>())))?
            .0
            .into_ref())
    }

    /// Casts bytes into a mutable reference of BootParams.
    pub fn from_bytes_mut(buffer: &mut [u8]) -> Result<&mut BootParams> {
        Ok(Ref::<_, BootParams>::new_from_prefix(buffer)
            .ok_or(Error::BufferTooSmall(Some(size_of::<BootParams>())))?
            .0
            .into_mut())
    }

    /// Checks whether the image is a bzimage of a supported protocol
    /// version.
    pub fn check(&self) -> Result<()> {
        if !(self.hdr.boot_flag == 0xAA55 && self.hdr.header.to_le_bytes() == *b"HdrS") {
            return Err(Error::BadMagic);
        }
        if !(self.hdr.version >= 0x0206 && (self.hdr.loadflags & LOAD_FLAG_LOADED_HIGH) != 0) {
            return Err(Error::UnsupportedVersion);
        }
        Ok(())
    }

    /// Gets the number of sectors in the setup code section.
    pub fn setup_sects(&self) -> usize {
        match self.hdr.setup_sects {
            0 => 4,
            v => v as usize,
        }
    }

    /// Gets the offset to the protected mode kernel in the image: one legacy
    /// boot sector plus the setup sectors.
    pub fn kernel_off(&self) -> usize {
        (1 + self.setup_sects()) * SECTOR_SIZE
    }

    /// Populates the loader-owned header fields.
    pub fn setup_loader(
        &mut self,
        cmdline_ptr: u32,
        cmdline_size: u32,
        ramdisk_ptr: u32,
        ramdisk_len: u32,
        code32_start: u32,
    ) {
        self.hdr.cmd_line_ptr = cmdline_ptr;
        self.hdr.cmdline_size = cmdline_size;
        self.hdr.ramdisk_image = ramdisk_ptr;
        self.hdr.ramdisk_size = ramdisk_len;
        self.hdr.code32_start = code32_start;
        // Anything other than 0, otherwise the kernel ignores the ramdisk.
        self.hdr.type_of_loader = 0xff;
    }

    /// Copies firmware framebuffer information into `screen_info`.
    pub fn set_screen_info(&mut self, fb: &FramebufferInfo) {
        let info = &mut self.screen_info;
        info.orig_video_is_vga = VIDEO_TYPE_EFI;
        info.lfb_width = fb.width;
        info.lfb_height = fb.height;
        info.lfb_depth = 32;
        info.lfb_linelength = fb.stride_bytes;
        info.lfb_base = fb.base as u32;
        info.lfb_size = fb.size as u32;
        info.red_size = fb.red_size;
        info.red_pos = fb.red_pos;
        info.green_size = fb.green_size;
        info.green_pos = fb.green_pos;
        info.blue_size = fb.blue_size;
        info.blue_pos = fb.blue_pos;
        info.rsvd_size = fb.rsvd_size;
        info.rsvd_pos = fb.rsvd_pos;
        if fb.base > u32::MAX as u64 {
            info.ext_lfb_base = (fb.base >> 32) as u32;
            info.capabilities |= VIDEO_CAPABILITY_64BIT_BASE;
        }
    }
}

/// Firmware framebuffer description used to fill [ScreenInfo].
#[derive(Copy, Clone, Debug, Default)]
pub struct FramebufferInfo {
    /// Physical base address.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Bytes per scanline.
    pub stride_bytes: u16,
    /// Red channel bit size.
    pub red_size: u8,
    /// Red channel bit position.
    pub red_pos: u8,
    /// Green channel bit size.
    pub green_size: u8,
    /// Green channel bit position.
    pub green_pos: u8,
    /// Blue channel bit size.
    pub blue_size: u8,
    /// Blue channel bit position.
    pub blue_pos: u8,
    /// Reserved channel bit size.
    pub rsvd_size: u8,
    /// Reserved channel bit position.
    pub rsvd_pos: u8,
}

/// Classified firmware memory range. The platform adapter reduces its native
/// memory descriptor types to this set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    /// Loader code, reclaimable by the OS.
    LoaderCode,
    /// Loader data, reclaimable by the OS.
    LoaderData,
    /// Boot services code, reclaimable by the OS.
    BootServicesCode,
    /// Boot services data, reclaimable by the OS.
    BootServicesData,
    /// Free conventional memory.
    Conventional,
    /// ACPI tables, reclaimable after the OS has consumed them.
    AcpiReclaim,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Memory with detected errors.
    Unusable,
    /// Anything else: runtime services, MMIO, vendor reserved.
    Reserved,
}

impl MemoryKind {
    fn e820_type(&self) -> u32 {
        match self {
            MemoryKind::LoaderCode
            | MemoryKind::LoaderData
            | MemoryKind::BootServicesCode
            | MemoryKind::BootServicesData
            | MemoryKind::Conventional => E820_ADDRESS_TYPE_RAM,
            MemoryKind::AcpiReclaim => E820_ADDRESS_TYPE_ACPI,
            MemoryKind::AcpiNvs => E820_ADDRESS_TYPE_NVS,
            MemoryKind::Unusable => E820_ADDRESS_TYPE_UNUSABLE,
            MemoryKind::Reserved => E820_ADDRESS_TYPE_RESERVED,
        }
    }
}

/// One firmware memory map region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: u64,
    /// Size in bytes.
    pub size: u64,
    /// Classified type.
    pub kind: MemoryKind,
}

/// Converts a firmware memory map into an E820 table, coalescing adjacent
/// ranges of equal type. Returns the number of entries used.
pub fn fill_e820_map(regions: &[MemoryRegion], map: &mut [E820Entry]) -> Result<u8> {
    let mut used: usize = 0;
    for region in regions {
        let typ = region.kind.e820_type();
        if used > 0 {
            let last = &mut map[used - 1];
            if last.typ == typ && last.addr + last.size == region.start {
                last.size += region.size;
                continue;
            }
        }
        if used == map.len() {
            return Err(Error::OutOfResources);
        }
        map[used] = E820Entry { addr: region.start, size: region.size, typ };
        used += 1;
    }
    Ok(used.try_into()?)
}

/// Firmware services needed between the final memory map snapshot and the
/// jump.
pub trait HandoverPlatform {
    /// Samples the current firmware memory map into `regions`. Returns the
    /// number of regions used and the map key for ExitBootServices.
    ///
    /// Must not allocate: the map key is invalidated by any allocation.
    fn memory_map(&mut self, regions: &mut [MemoryRegion]) -> Result<(usize, u64)>;

    /// Terminates firmware boot services. A stale map key fails with
    /// [Error::InvalidState]; the caller resamples and retries.
    fn exit_boot_services(&mut self, map_key: u64) -> Result<()>;
}

/// Snapshots the memory map into `params` and exits boot services, retrying
/// with a fresh map up to [EXIT_BOOT_SERVICES_RETRIES] times when the key
/// has gone stale.
///
/// `regions` is caller-provided scratch so this function performs no
/// allocation. After a successful return no firmware service may be called.
pub fn exit_boot_services_with_retry<P: HandoverPlatform>(
    platform: &mut P,
    params: &mut BootParams,
    regions: &mut [MemoryRegion],
) -> Result<()> {
    for _ in 0..EXIT_BOOT_SERVICES_RETRIES {
        let (used, key) = platform.memory_map(regions)?;
        params.e820_entries = fill_e820_map(&regions[..used], &mut params.e820_map[..])?;

        // No code may run between the snapshot above and this call, or the
        // map key might be invalidated.
        match platform.exit_boot_services(key) {
            Ok(()) => return Ok(()),
            Err(Error::InvalidState) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Timeout)
}

/// A minimal GDT for the protected mode entry: null, flat 32-bit code, flat
/// 32-bit data, 16-bit task.
#[repr(C, align(8))]
pub struct Gdt {
    entries: [u64; 4],
}

/// Packed operand for `lgdt`.
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

const fn gdt_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    (limit as u64 & 0xffff)
        | ((base as u64 & 0xffff) << 16)
        | (((base as u64 >> 16) & 0xff) << 32)
        | ((access as u64) << 40)
        | (((limit as u64 >> 16) & 0xf) << 48)
        | ((flags as u64 & 0xf) << 52)
        | (((base as u64 >> 24) & 0xff) << 56)
}

// Access byte: present | code/data | exec-read or read-write.
const GDT_ACCESS_CODE: u8 = 0x9a;
const GDT_ACCESS_DATA: u8 = 0x92;
// Access byte: present | system | 32-bit TSS (available).
const GDT_ACCESS_TASK: u8 = 0x89;
// Flags: 4 KiB granularity, 32-bit operation size.
const GDT_FLAGS_32: u8 = 0xc;
// Flags: 4 KiB granularity, 16-bit operation size.
const GDT_FLAGS_16: u8 = 0x8;

impl Gdt {
    /// Builds the descriptor table. The allocation holding it must survive
    /// the jump; callers place it in loader data.
    pub const fn new() -> Self {
        Self {
            entries: [
                0,
                gdt_descriptor(0, 0xf_ffff, GDT_ACCESS_CODE, GDT_FLAGS_32),
                gdt_descriptor(0, 0xf_ffff, GDT_ACCESS_DATA, GDT_FLAGS_32),
                gdt_descriptor(0, 0, GDT_ACCESS_TASK, GDT_FLAGS_16),
            ],
        }
    }

    /// Raw descriptor values, for inspection.
    pub fn entries(&self) -> &[u64; 4] {
        &self.entries
    }

    /// Loads the table into GDTR.
    ///
    /// # Safety
    ///
    /// `self` must stay alive and in place for as long as the table is
    /// active; the segment registers must be compatible with the flat
    /// layout installed here.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn load(&self) {
        let pointer = GdtPointer {
            limit: (size_of::<[u64; 4]>() - 1) as u16,
            base: self.entries.as_ptr() as u64,
        };
        // SAFETY: `pointer` describes a valid descriptor table by
        // construction; liveness is the caller's obligation.
        unsafe {
            asm!("lgdt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
        }
    }
}

impl Default for Gdt {
    fn default() -> Self {
        Self::new()
    }
}

/// Jumps to a loaded Linux kernel. Boot services must already have been
/// exited via [exit_boot_services_with_retry].
///
/// On x86-64 the entry point is 512 bytes past `kernel_start`. Interrupts
/// are masked, the GDT is loaded, and control transfers with
/// `rsi = &boot_params`, `rdi = 0`, `rax = 0`. Never returns.
///
/// # Safety
///
/// * `params` must be fully populated and `kernel_start` must point to a
///   valid protected mode kernel.
/// * `gdt` must live until the kernel installs its own descriptor tables.
#[cfg(target_arch = "x86_64")]
pub unsafe fn handover_jump(params: &mut BootParams, gdt: &Gdt, kernel_start: usize) -> ! {
    let entry = kernel_start + ENTRY_OFFSET_64;
    // SAFETY: By the safety requirements of this function the entry point
    // and boot params are valid; nothing after the jump executes here.
    unsafe {
        gdt.load();
        asm!(
            "cli",
            "xor edi, edi",
            "xor eax, eax",
            "jmp {ep}",
            ep = in(reg) entry,
            in("rsi") params as *mut BootParams as usize,
            options(noreturn),
        );
    }
}
