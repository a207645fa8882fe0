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

//! Typed, bounds-checked views over Android boot images.
//!
//! Header versions 0 through 4 of the boot partition image and versions 3/4
//! of the vendor_boot image are supported. Section offsets are computed with
//! checked arithmetic; a layout that would run past the declared image size
//! surfaces as an error instead of a wild offset.
//!
//! Layout reference:
//! https://source.android.com/docs/core/architecture/bootloader/boot-image-header

#![cfg_attr(not(test), no_std)]

use core::mem::size_of;

use liberror::{Error, Result};
use safemath::SafeNum;
use zerocopy::{AsBytes, ByteSlice, FromBytes, FromZeroes, Ref};

/// Magic prefix of every boot image header.
pub const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
/// Magic prefix of every vendor boot image header.
pub const VENDOR_BOOT_MAGIC: &[u8; 8] = b"VNDRBOOT";
/// v3+ images have a fixed 4096 byte page size.
pub const PAGE_SIZE_V3: u32 = 4096;

const BOOT_NAME_SIZE: usize = 16;
const BOOT_ARGS_SIZE: usize = 512;
const BOOT_EXTRA_ARGS_SIZE: usize = 1024;
const BOOT_ARGS_SIZE_V3: usize = BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE;
const VENDOR_BOOT_ARGS_SIZE: usize = 2048;

/// Version 0 boot image header.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct BootImgHdrV0 {
    /// Must be [BOOT_MAGIC].
    pub magic: [u8; 8],
    /// Kernel size in bytes.
    pub kernel_size: u32,
    /// Kernel physical load address (unused by this loader).
    pub kernel_addr: u32,
    /// Ramdisk size in bytes.
    pub ramdisk_size: u32,
    /// Ramdisk physical load address (unused).
    pub ramdisk_addr: u32,
    /// Second stage size in bytes.
    pub second_size: u32,
    /// Second stage physical load address (unused).
    pub second_addr: u32,
    /// Kernel tags physical address (unused).
    pub tags_addr: u32,
    /// Flash page size the image sections are padded to.
    pub page_size: u32,
    /// Header version.
    pub header_version: u32,
    /// OS version and patch level.
    pub os_version: u32,
    /// Product name.
    pub name: [u8; BOOT_NAME_SIZE],
    /// Kernel command line.
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    /// Timestamp / checksum of the image.
    pub id: [u32; 8],
    /// Command line overflow area.
    pub extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}
static_assertions::const_assert_eq!(size_of::<BootImgHdrV0>(), 1632);

/// Version 1 boot image header. Adds the recovery ACPI override blob.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct BootImgHdrV1 {
    /// Common v0 fields.
    pub base: BootImgHdrV0,
    /// Size of the recovery ACPI table overlay.
    pub recovery_acpio_size: u32,
    /// Offset of the overlay in the boot partition.
    pub recovery_acpio_offset: u64,
    /// Total header size in bytes.
    pub header_size: u32,
}
static_assertions::const_assert_eq!(size_of::<BootImgHdrV1>(), 1648);

/// Version 2 boot image header. Adds DTB and ACPI sections.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct BootImgHdrV2 {
    /// Common v0/v1 fields.
    pub base: BootImgHdrV1,
    /// Device tree blob size.
    pub dtb_size: u32,
    /// Device tree blob physical load address (unused).
    pub dtb_addr: u64,
    /// ACPI table blob size.
    pub acpi_size: u32,
    /// ACPI table physical load address (unused).
    pub acpi_addr: u64,
}
static_assertions::const_assert_eq!(size_of::<BootImgHdrV2>(), 1672);

/// Version 3 boot image header. The boot image carries only kernel, ramdisk
/// and command line; everything else moved to vendor_boot.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct BootImgHdrV3 {
    /// Must be [BOOT_MAGIC].
    pub magic: [u8; 8],
    /// Kernel size in bytes.
    pub kernel_size: u32,
    /// Ramdisk size in bytes.
    pub ramdisk_size: u32,
    /// OS version and patch level.
    pub os_version: u32,
    /// Total header size in bytes.
    pub header_size: u32,
    /// Reserved; zero.
    pub reserved: [u32; 4],
    /// Header version.
    pub header_version: u32,
    /// Kernel command line.
    pub cmdline: [u8; BOOT_ARGS_SIZE_V3],
}
static_assertions::const_assert_eq!(size_of::<BootImgHdrV3>(), 1580);

/// Version 4 boot image header. Adds the boot signature used by GKI.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct BootImgHdrV4 {
    /// Common v3 fields.
    pub base: BootImgHdrV3,
    /// Size of the GKI boot signature.
    pub signature_size: u32,
}
static_assertions::const_assert_eq!(size_of::<BootImgHdrV4>(), 1584);

/// Version 3 vendor boot image header.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct VendorImgHdrV3 {
    /// Must be [VENDOR_BOOT_MAGIC].
    pub magic: [u8; 8],
    /// Header version.
    pub header_version: u32,
    /// Flash page size the image sections are padded to.
    pub page_size: u32,
    /// Kernel physical load address (unused).
    pub kernel_addr: u32,
    /// Ramdisk physical load address (unused).
    pub ramdisk_addr: u32,
    /// Vendor ramdisk size in bytes.
    pub vendor_ramdisk_size: u32,
    /// Vendor command line.
    pub cmdline: [u8; VENDOR_BOOT_ARGS_SIZE],
    /// Kernel tags physical address (unused).
    pub tags_addr: u32,
    /// Product name.
    pub name: [u8; BOOT_NAME_SIZE],
    /// Total header size in bytes.
    pub header_size: u32,
    /// Device tree blob size.
    pub dtb_size: u32,
    /// Device tree blob physical load address (unused).
    pub dtb_addr: u64,
}
static_assertions::const_assert_eq!(size_of::<VendorImgHdrV3>(), 2112);

/// Version 4 vendor boot image header. Adds the ramdisk table and the
/// bootconfig section.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct VendorImgHdrV4 {
    /// Common v3 fields.
    pub base: VendorImgHdrV3,
    /// Size of the vendor ramdisk table.
    pub vendor_ramdisk_table_size: u32,
    /// Number of entries in the vendor ramdisk table.
    pub vendor_ramdisk_table_entry_num: u32,
    /// Size of one vendor ramdisk table entry.
    pub vendor_ramdisk_table_entry_size: u32,
    /// Size of the bootconfig section.
    pub bootconfig_size: u32,
}
static_assertions::const_assert_eq!(size_of::<VendorImgHdrV4>(), 2128);

/// A helper to convert a NUL-padded byte field to `str`. The field may be
/// full, in which case the whole slice is taken.
fn cstr_field_to_str(data: &[u8]) -> Result<&str> {
    let end = data.iter().position(|c| *c == 0).unwrap_or(data.len());
    Ok(core::str::from_utf8(&data[..end])?)
}

/// Generalized boot image header from a backing store of bytes.
#[derive(Debug)]
pub enum BootImage<B: ByteSlice> {
    /// Version 0 header.
    V0(Ref<B, BootImgHdrV0>),
    /// Version 1 header.
    V1(Ref<B, BootImgHdrV1>),
    /// Version 2 header.
    V2(Ref<B, BootImgHdrV2>),
    /// Version 3 header.
    V3(Ref<B, BootImgHdrV3>),
    /// Version 4 header.
    V4(Ref<B, BootImgHdrV4>),
}

fn parse_header<B: ByteSlice, T: FromBytes>(buffer: B) -> Result<Ref<B, T>> {
    Ok(Ref::<B, T>::new_from_prefix(buffer).ok_or(Error::BufferTooSmall(Some(size_of::<T>())))?.0)
}

impl<B: ByteSlice> BootImage<B> {
    /// Parses a boot image header out of `buffer`, dispatching on the
    /// version field.
    pub fn parse(buffer: B) -> Result<Self> {
        // Enough for the magic and the version probe; the per-version struct
        // size is enforced when the header reference is taken.
        if buffer.len() < 44 {
            return Err(Error::BufferTooSmall(Some(size_of::<BootImgHdrV3>())));
        }
        if buffer[..8] != BOOT_MAGIC[..] {
            return Err(Error::BadMagic);
        }
        // In all versions the header version is a 32 bit integer at byte 40.
        let version = u32::from_le_bytes(buffer[40..44].try_into().unwrap());
        Ok(match version {
            0 => Self::V0(parse_header(buffer)?),
            1 => Self::V1(parse_header(buffer)?),
            2 => Self::V2(parse_header(buffer)?),
            3 => Self::V3(parse_header(buffer)?),
            4 => Self::V4(parse_header(buffer)?),
            _ => return Err(Error::UnsupportedVersion),
        })
    }

    /// Gets the header version.
    pub fn header_version(&self) -> u32 {
        match self {
            Self::V0(_) => 0,
            Self::V1(_) => 1,
            Self::V2(_) => 2,
            Self::V3(_) => 3,
            Self::V4(_) => 4,
        }
    }

    fn v0(&self) -> Option<&BootImgHdrV0> {
        match self {
            Self::V0(hdr) => Some(hdr),
            Self::V1(hdr) => Some(&hdr.base),
            Self::V2(hdr) => Some(&hdr.base.base),
            _ => None,
        }
    }

    /// Gets the page size the image sections are padded to.
    pub fn page_size(&self) -> u32 {
        match self.v0() {
            Some(hdr) => hdr.page_size,
            None => PAGE_SIZE_V3,
        }
    }

    /// Gets the kernel size in bytes.
    pub fn kernel_size(&self) -> u32 {
        match self {
            Self::V0(hdr) => hdr.kernel_size,
            Self::V1(hdr) => hdr.base.kernel_size,
            Self::V2(hdr) => hdr.base.base.kernel_size,
            Self::V3(hdr) => hdr.kernel_size,
            Self::V4(hdr) => hdr.base.kernel_size,
        }
    }

    /// Gets the ramdisk size in bytes.
    pub fn ramdisk_size(&self) -> u32 {
        match self {
            Self::V0(hdr) => hdr.ramdisk_size,
            Self::V1(hdr) => hdr.base.ramdisk_size,
            Self::V2(hdr) => hdr.base.base.ramdisk_size,
            Self::V3(hdr) => hdr.ramdisk_size,
            Self::V4(hdr) => hdr.base.ramdisk_size,
        }
    }

    /// Gets the second stage size in bytes. Zero for v3+.
    pub fn second_size(&self) -> u32 {
        match self.v0() {
            Some(hdr) => hdr.second_size,
            None => 0,
        }
    }

    /// Gets the DTB size in bytes. Only v2 carries one.
    pub fn dtb_size(&self) -> u32 {
        match self {
            Self::V2(hdr) => hdr.dtb_size,
            _ => 0,
        }
    }

    /// Gets the ACPI blob size in bytes. Only v2 carries one.
    pub fn acpi_size(&self) -> u32 {
        match self {
            Self::V2(hdr) => hdr.acpi_size,
            _ => 0,
        }
    }

    /// Gets the recovery ACPI overlay size in bytes. Only v1/v2 carry one.
    pub fn recovery_acpio_size(&self) -> u32 {
        match self {
            Self::V1(hdr) => hdr.recovery_acpio_size,
            Self::V2(hdr) => hdr.base.recovery_acpio_size,
            _ => 0,
        }
    }

    /// Gets the kernel command line.
    pub fn cmdline(&self) -> Result<&str> {
        match self {
            Self::V0(hdr) => cstr_field_to_str(&hdr.cmdline[..]),
            Self::V1(hdr) => cstr_field_to_str(&hdr.base.cmdline[..]),
            Self::V2(hdr) => cstr_field_to_str(&hdr.base.base.cmdline[..]),
            Self::V3(hdr) => cstr_field_to_str(&hdr.cmdline[..]),
            Self::V4(hdr) => cstr_field_to_str(&hdr.base.cmdline[..]),
        }
    }

    /// Gets the command line overflow area. Empty for v3+, where the main
    /// field is large enough.
    pub fn extra_cmdline(&self) -> Result<&str> {
        match self.v0() {
            Some(hdr) => cstr_field_to_str(&hdr.extra_cmdline[..]),
            None => Ok(""),
        }
    }

    /// Gets the offset of the kernel section.
    pub fn kernel_offset(&self) -> usize {
        self.page_size() as usize
    }

    /// Gets the offset of the ramdisk section.
    pub fn ramdisk_offset(&self) -> Result<usize> {
        let page = self.page_size();
        Ok((SafeNum::from(self.kernel_offset())
            + SafeNum::from(self.kernel_size()).round_up(page))
        .try_into()?)
    }

    /// Gets the offset of the second stage section.
    pub fn second_offset(&self) -> Result<usize> {
        let page = self.page_size();
        Ok((SafeNum::from(self.ramdisk_offset()?)
            + SafeNum::from(self.ramdisk_size()).round_up(page))
        .try_into()?)
    }

    /// Computes the total size of the image as declared by the header.
    ///
    /// This is the value that must be checked against the partition size
    /// before any section is read.
    pub fn image_size(&self) -> Result<usize> {
        let page = self.page_size();
        let mut size = SafeNum::from(self.page_size())
            + SafeNum::from(self.kernel_size()).round_up(page)
            + SafeNum::from(self.ramdisk_size()).round_up(page)
            + SafeNum::from(self.second_size()).round_up(page);
        if self.header_version() >= 1 {
            size += SafeNum::from(self.recovery_acpio_size()).round_up(page);
        }
        if self.header_version() == 2 {
            size += SafeNum::from(self.dtb_size()).round_up(page);
            size += SafeNum::from(self.acpi_size()).round_up(page);
        }
        Ok(size.try_into()?)
    }
}

/// Generalized vendor boot header from a backing store of bytes.
#[derive(Debug)]
pub enum VendorImageHeader<B: ByteSlice> {
    /// Version 3 header.
    V3(Ref<B, VendorImgHdrV3>),
    /// Version 4 header.
    V4(Ref<B, VendorImgHdrV4>),
}

impl<B: ByteSlice> VendorImageHeader<B> {
    /// Parses a vendor boot image header out of `buffer`.
    pub fn parse(buffer: B) -> Result<Self> {
        if buffer.len() < 12 {
            return Err(Error::BufferTooSmall(Some(size_of::<VendorImgHdrV3>())));
        }
        if buffer[..8] != VENDOR_BOOT_MAGIC[..] {
            return Err(Error::BadMagic);
        }
        let version = u32::from_le_bytes(buffer[8..12].try_into().unwrap());
        Ok(match version {
            3 => Self::V3(parse_header(buffer)?),
            4 => Self::V4(parse_header(buffer)?),
            _ => return Err(Error::UnsupportedVersion),
        })
    }

    /// Gets the header version.
    pub fn header_version(&self) -> u32 {
        match self {
            Self::V3(_) => 3,
            Self::V4(_) => 4,
        }
    }

    fn v3(&self) -> &VendorImgHdrV3 {
        match self {
            Self::V3(hdr) => hdr,
            Self::V4(hdr) => &hdr.base,
        }
    }

    /// Gets the page size the image sections are padded to.
    pub fn page_size(&self) -> u32 {
        self.v3().page_size
    }

    /// Gets the vendor ramdisk size in bytes.
    pub fn vendor_ramdisk_size(&self) -> u32 {
        self.v3().vendor_ramdisk_size
    }

    /// Gets the DTB size in bytes.
    pub fn dtb_size(&self) -> u32 {
        self.v3().dtb_size
    }

    /// Gets the vendor ramdisk table size. Zero for v3.
    pub fn vendor_ramdisk_table_size(&self) -> u32 {
        match self {
            Self::V3(_) => 0,
            Self::V4(hdr) => hdr.vendor_ramdisk_table_size,
        }
    }

    /// Gets the bootconfig section size. Zero for v3.
    pub fn bootconfig_size(&self) -> u32 {
        match self {
            Self::V3(_) => 0,
            Self::V4(hdr) => hdr.bootconfig_size,
        }
    }

    /// Gets the vendor command line.
    pub fn cmdline(&self) -> Result<&str> {
        cstr_field_to_str(&self.v3().cmdline[..])
    }

    /// Gets the header size rounded up to the page size, i.e. the offset of
    /// the vendor ramdisk section.
    pub fn vendor_ramdisk_offset(&self) -> Result<usize> {
        let hdr_size = match self {
            Self::V3(_) => size_of::<VendorImgHdrV3>(),
            Self::V4(_) => size_of::<VendorImgHdrV4>(),
        };
        Ok(SafeNum::from(hdr_size).round_up(self.page_size()).try_into()?)
    }

    /// Gets the offset of the DTB section.
    pub fn dtb_offset(&self) -> Result<usize> {
        let page = self.page_size();
        Ok((SafeNum::from(self.vendor_ramdisk_offset()?)
            + SafeNum::from(self.vendor_ramdisk_size()).round_up(page))
        .try_into()?)
    }

    /// Gets the offset of the bootconfig section. The section is last in the
    /// image.
    pub fn bootconfig_offset(&self) -> Result<usize> {
        let page = self.page_size();
        Ok((SafeNum::from(self.dtb_offset()?)
            + SafeNum::from(self.dtb_size()).round_up(page)
            + SafeNum::from(self.vendor_ramdisk_table_size()).round_up(page))
        .try_into()?)
    }

    /// Computes the total size of the image as declared by the header.
    pub fn image_size(&self) -> Result<usize> {
        Ok((SafeNum::from(self.bootconfig_offset()?) + self.bootconfig_size()).try_into()?)
    }
}
