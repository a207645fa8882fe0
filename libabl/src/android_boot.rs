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

//! Android boot image loading and boot parameter assembly.
//!
//! Turns the verified boot/vendor_boot partitions into the memory layout
//! the Linux handover expects: the kernel blob, the concatenated ramdisk
//! (vendor, then boot, then for v4 the bootconfig section with its
//! trailer), and the composed kernel command line. For v4 images,
//! `androidboot.*` parameters produced here go into the bootconfig section
//! instead of the command line.

use arrayvec::ArrayString;
use core::fmt::Write as _;

use avbab::SlotIndex;
use bootimg::{BootImage, VendorImageHeader};
use bootparams::bootconfig::{self, BootConfigBuilder, BOOTCONFIG_TRAILER_SIZE};
use bootparams::commandline::CommandlineBuilder;
use devstate::{BuildVariant, DeviceState, LOADER_NAMESPACE};
use liberror::{Error, Result};
use safemath::SafeNum;

use crate::avb::VerificationResult;
use crate::ops::{
    self, AblOps, CMDLINE_APPEND_VAR, CMDLINE_PREPEND_VAR, CMDLINE_REPLACE_VAR,
    DISABLE_WATCHDOG_VAR, SERIAL_PORT_VAR,
};
use crate::{abl_println, boot_reason, smbios, BootTarget, Context};

/// Space reserved for bootconfig parameters generated by the bootloader.
const EXTRA_BOOTCONFIG_CAPACITY: usize = 2048;
/// Size of the command line work buffer.
const CMDLINE_CAPACITY: usize = 4096;
/// Size of a header peek buffer; every supported header fits in one page.
const HEADER_PEEK_SIZE: usize = 4096;

/// The loaded artifacts, borrowed out of the caller's load buffer.
pub struct LoadedImages<'a> {
    /// Kernel blob.
    pub kernel: &'a mut [u8],
    /// Assembled ramdisk, bootconfig included for v4.
    pub ramdisk: &'a mut [u8],
    /// Composed kernel command line.
    pub cmdline: &'a str,
}

/// Selects the partition the target boots from. Recovery uses a dedicated
/// partition when one exists, otherwise the recovery ramdisk lives in the
/// boot image.
fn boot_partition<O: AblOps>(
    ops: &mut O,
    target: &BootTarget,
    slot: SlotIndex,
) -> Result<(ArrayString<72>, bool)> {
    let mut recovery = ArrayString::<72>::new();
    let _ = write!(recovery, "recovery{}", slot.suffix());
    let has_recovery_partition = ops.partition_size(&recovery)?.is_some();

    let name = match (target, has_recovery_partition) {
        (BootTarget::Recovery, true) => recovery,
        _ => {
            let mut boot = ArrayString::<72>::new();
            let _ = write!(boot, "boot{}", slot.suffix());
            boot
        }
    };
    Ok((name, !has_recovery_partition))
}

/// Loads the boot images of `slot`, assembles the ramdisk and composes the
/// command line.
pub fn load_and_assemble<'a, O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    target: &BootTarget,
    slot: SlotIndex,
    verify: &VerificationResult,
    load: &'a mut [u8],
) -> Result<LoadedImages<'a>> {
    let (boot_part, recovery_in_boot) = boot_partition(ctx.ops, target, slot)?;

    // Boot image header.
    let mut peek = [0u8; HEADER_PEEK_SIZE];
    ctx.ops.read_from_partition(&boot_part, 0, &mut peek)?;
    let header = BootImage::parse(&peek[..])?;
    let version = header.header_version();
    let boot_part_size = ctx
        .ops
        .partition_size(&boot_part)?
        .ok_or(Error::NotFound)?;
    if u64::try_from(header.image_size()?)? > boot_part_size {
        return Err(Error::BadIndex(header.image_size()?));
    }

    let kernel_size = header.kernel_size() as usize;
    let kernel_offset = header.kernel_offset() as u64;
    let boot_ramdisk_size = header.ramdisk_size() as usize;
    let boot_ramdisk_offset = header.ramdisk_offset()? as u64;
    let mut image_cmdline = ArrayString::<2048>::new();
    image_cmdline.try_push_str(header.cmdline()?).map_err(|_| Error::OutOfResources)?;
    if !header.extra_cmdline()?.is_empty() {
        let _ = image_cmdline.try_push(' ');
        image_cmdline
            .try_push_str(header.extra_cmdline()?)
            .map_err(|_| Error::OutOfResources)?;
    }

    // ACPI tables carried by v1/v2 images are installed before handover.
    install_image_acpi(ctx, target, &boot_part, &header)?;

    // Vendor boot image header, v3 onwards.
    let mut vendor_part = ArrayString::<72>::new();
    let _ = write!(vendor_part, "vendor_boot{}", slot.suffix());
    let mut vendor_cmdline = ArrayString::<2048>::new();
    let mut vendor_ramdisk = None;
    let mut vendor_bootconfig = None;
    if version >= 3 {
        if let Some(vendor_size) = ctx.ops.partition_size(&vendor_part)? {
            let mut vendor_peek = [0u8; HEADER_PEEK_SIZE];
            ctx.ops.read_from_partition(&vendor_part, 0, &mut vendor_peek)?;
            let vendor = VendorImageHeader::parse(&vendor_peek[..])?;
            if u64::try_from(vendor.image_size()?)? > vendor_size {
                return Err(Error::BadIndex(vendor.image_size()?));
            }
            vendor_cmdline
                .try_push_str(vendor.cmdline()?)
                .map_err(|_| Error::OutOfResources)?;
            vendor_ramdisk = Some((
                vendor.vendor_ramdisk_offset()? as u64,
                vendor.vendor_ramdisk_size() as usize,
            ));
            if vendor.header_version() >= 4 {
                vendor_bootconfig = Some((
                    vendor.bootconfig_offset()? as u64,
                    vendor.bootconfig_size() as usize,
                ));
            }
        }
    }

    let vendor_ramdisk_size = vendor_ramdisk.map(|(_, size)| size).unwrap_or(0);
    let with_bootconfig = version >= 4;
    let bootconfig_capacity = match with_bootconfig {
        true => {
            let vendor_size = vendor_bootconfig.map(|(_, size)| size).unwrap_or(0);
            vendor_size + EXTRA_BOOTCONFIG_CAPACITY + BOOTCONFIG_TRAILER_SIZE
        }
        false => 0,
    };

    let ramdisk_capacity: usize = (SafeNum::from(vendor_ramdisk_size)
        + boot_ramdisk_size
        + bootconfig_capacity)
        .try_into()?;
    let needed: usize =
        (SafeNum::from(kernel_size) + ramdisk_capacity + CMDLINE_CAPACITY).try_into()?;
    if load.len() < needed {
        return Err(Error::BufferTooSmall(Some(needed)));
    }

    let (kernel_buf, rest) = load.split_at_mut(kernel_size);
    let (ramdisk_area, rest) = rest.split_at_mut(ramdisk_capacity);
    let (cmdline_buf, _) = rest.split_at_mut(CMDLINE_CAPACITY);

    ctx.ops.read_from_partition(&boot_part, kernel_offset, kernel_buf)?;

    // Ramdisk assembly: vendor, then boot.
    let mut ramdisk_len = 0usize;
    if let Some((offset, size)) = vendor_ramdisk {
        ctx.ops.read_from_partition(&vendor_part, offset, &mut ramdisk_area[..size])?;
        ramdisk_len += size;
    }
    if boot_ramdisk_size > 0 {
        ctx.ops.read_from_partition(
            &boot_part,
            boot_ramdisk_offset,
            &mut ramdisk_area[ramdisk_len..][..boot_ramdisk_size],
        )?;
        ramdisk_len += boot_ramdisk_size;
    }

    // Bootconfig section, v4 only. The vendor parameters come first; the
    // trailer is stripped and resynthesised so bootloader parameters can
    // extend the section.
    let (_, bootconfig_area) = ramdisk_area.split_at_mut(ramdisk_len);
    let cmdline;
    if with_bootconfig {
        let mut builder = BootConfigBuilder::new(bootconfig_area)?;
        if let Some((offset, size)) = vendor_bootconfig {
            if size > 0 {
                builder.add_with(|_, out| {
                    let section = out
                        .get_mut(..size)
                        .ok_or(Error::BufferTooSmall(Some(size)))?;
                    ctx.ops.read_from_partition(&vendor_part, offset, section)?;
                    // A well-formed section ends with a trailer to strip; a
                    // trailerless one is accepted as raw parameters.
                    Ok(bootconfig::parameters_size(section).unwrap_or(size))
                })?;
            }
        }
        cmdline = compose_cmdline(
            ctx,
            target,
            verify,
            &image_cmdline,
            &vendor_cmdline,
            recovery_in_boot,
            cmdline_buf,
            Some(&mut builder),
        )?;
        ramdisk_len += builder.config_bytes().len();
    } else {
        cmdline = compose_cmdline(
            ctx,
            target,
            verify,
            &image_cmdline,
            &vendor_cmdline,
            recovery_in_boot,
            cmdline_buf,
            None,
        )?;
    }

    let (ramdisk_used, _) = { ramdisk_area }.split_at_mut(ramdisk_len);
    Ok(LoadedImages { kernel: kernel_buf, ramdisk: ramdisk_used, cmdline })
}

fn install_image_acpi<O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    target: &BootTarget,
    boot_part: &str,
    header: &BootImage<&[u8]>,
) -> Result<()> {
    if header.acpi_size() == 0 && header.recovery_acpio_size() == 0 {
        // Modern layouts keep ACPI tables in their own partitions.
        return ctx.ops.install_acpi_from_partitions(&["acpi", "acpio"]);
    }

    let page = header.page_size();
    if header.acpi_size() > 0 {
        let offset: u64 = (SafeNum::from(header.second_offset()?)
            + SafeNum::from(header.second_size()).round_up(page))
        .try_into()?;
        let mut tables = [0u8; HEADER_PEEK_SIZE];
        let size = (header.acpi_size() as usize).min(tables.len());
        ctx.ops.read_from_partition(boot_part, offset, &mut tables[..size])?;
        ctx.ops.install_acpi_from_image(&tables[..size])?;
    }
    if *target == BootTarget::Recovery && header.recovery_acpio_size() > 0 {
        let offset: u64 = (SafeNum::from(header.second_offset()?)
            + SafeNum::from(header.second_size()).round_up(page)
            + SafeNum::from(header.acpi_size()).round_up(page))
        .try_into()?;
        let mut tables = [0u8; HEADER_PEEK_SIZE];
        let size = (header.recovery_acpio_size() as usize).min(tables.len());
        ctx.ops.read_from_partition(boot_part, offset, &mut tables[..size])?;
        ctx.ops.install_acpi_from_image(&tables[..size])?;
    }
    Ok(())
}

/// Routes `androidboot.*` parameters: bootconfig for v4, command line
/// prepend otherwise.
struct ParamSink<'a, 'b, 'c> {
    cmdline: &'a mut CommandlineBuilder<'b>,
    bootconfig: Option<&'a mut BootConfigBuilder<'c>>,
}

impl ParamSink<'_, '_, '_> {
    fn add_androidboot(&mut self, args: core::fmt::Arguments) -> Result<()> {
        let mut formatted = ArrayString::<512>::new();
        formatted.write_fmt(args)?;
        match self.bootconfig.as_mut() {
            Some(bootconfig) => {
                bootconfig.add(&formatted)?;
                bootconfig.add("\n")
            }
            None => self.cmdline.prepend(&formatted),
        }
    }
}

fn write_entry(out: &mut ArrayString<512>, entry: &bootparams::commandline::Entry) -> Result<()> {
    match entry.value {
        Some(value) if value.contains(' ') => write!(out, "{}=\"{}\"", entry.key, value)?,
        Some(value) => write!(out, "{}={}", entry.key, value)?,
        None => write!(out, "{}", entry.key)?,
    }
    Ok(())
}

/// Whether the base command line already configures a console of the same
/// type, e.g. `ttyS` for `ttyS0,115200n8`.
fn console_already_configured(base: &str, port: &str) -> bool {
    let port_type: &str =
        &port[..port.find(|c: char| c.is_ascii_digit()).unwrap_or(port.len())];
    bootparams::commandline::CommandlineParser::new(base).any(|entry| match entry {
        Ok(entry) if entry.key == "console" => {
            entry.value.map(|v| v.starts_with(port_type)).unwrap_or(false)
        }
        _ => false,
    })
}

/// Composes the kernel command line in the §4.5 order; every later item is
/// prepended so it ends up in front of the earlier ones.
#[allow(clippy::too_many_arguments)]
fn compose_cmdline<'a, O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    target: &BootTarget,
    verify: &VerificationResult,
    image_cmdline: &str,
    vendor_cmdline: &str,
    recovery_in_boot: bool,
    cmdline_buf: &'a mut [u8],
    mut bootconfig: Option<&mut BootConfigBuilder>,
) -> Result<&'a str> {
    let mut builder = CommandlineBuilder::new(cmdline_buf)?;

    // Base: the image command line, the vendor command line, and whatever
    // the verified vbmeta chain demands. Development builds may override
    // the image part.
    let mut replaced = false;
    let mut override_buf = [0u8; 1024];
    if ctx.build == BuildVariant::Userdebug {
        if let Ok(replace) =
            ops::get_var_str(ctx.ops.vars(), LOADER_NAMESPACE, CMDLINE_REPLACE_VAR, &mut override_buf)
        {
            abl_println!(ctx.ops, "Boot image command line overridden with '{}'", replace);
            add_relocated(&mut builder, bootconfig.as_deref_mut(), replace)?;
            replaced = true;
        }
    }
    if !replaced {
        add_relocated(&mut builder, bootconfig.as_deref_mut(), image_cmdline)?;
    }
    add_relocated(&mut builder, bootconfig.as_deref_mut(), vendor_cmdline)?;
    if ctx.build == BuildVariant::Userdebug {
        let mut append_buf = [0u8; 512];
        if let Ok(append) =
            ops::get_var_str(ctx.ops.vars(), LOADER_NAMESPACE, CMDLINE_APPEND_VAR, &mut append_buf)
        {
            abl_println!(ctx.ops, "Appending '{}' to command line", append);
            builder.add(append)?;
        }
        let mut prepend_buf = [0u8; 512];
        if let Ok(prepend) =
            ops::get_var_str(ctx.ops.vars(), LOADER_NAMESPACE, CMDLINE_PREPEND_VAR, &mut prepend_buf)
        {
            abl_println!(ctx.ops, "Prepending '{}' to command line", prepend);
            builder.prepend(prepend)?;
        }
    }
    builder.add(&verify.vbmeta_cmdline)?;

    let mut sink = ParamSink { cmdline: &mut builder, bootconfig: bootconfig.as_deref_mut() };

    // Serial number from DMI; also handed to the USB gadget.
    let serial = smbios::serial_number(ctx.ops);
    sink.add_androidboot(format_args!("androidboot.serialno={}", serial))?;
    sink.cmdline.prepend(&{
        let mut segment = ArrayString::<64>::new();
        let _ = write!(segment, "g_ffs.iSerialNumber={}", serial);
        segment
    })?;

    if *target == BootTarget::Charger {
        sink.add_androidboot(format_args!("androidboot.mode=charger"))?;
    }

    let reason = boot_reason::boot_reason(ctx.ops);
    sink.add_androidboot(format_args!("androidboot.bootreason={}", reason))?;

    sink.add_androidboot(format_args!(
        "androidboot.verifiedbootstate={}",
        verify.boot_state
    ))?;

    if let Some(partuuid) = ctx.ops.resume_partuuid() {
        sink.cmdline.prepend(&{
            let mut segment = ArrayString::<128>::new();
            let _ = write!(segment, "resume=PARTUUID={}", partuuid);
            segment
        })?;
    }

    let mut port_buf = [0u8; 64];
    if let Ok(port) =
        ops::get_var_str(ctx.ops.vars(), LOADER_NAMESPACE, SERIAL_PORT_VAR, &mut port_buf)
    {
        if !console_already_configured(image_cmdline, port) {
            let mut segment = ArrayString::<80>::new();
            let _ = write!(segment, "console={}", port);
            sink.cmdline.prepend(&segment)?;
        }
    }

    if ctx.build == BuildVariant::Userdebug
        && ops::get_var_bool(
            ctx.ops.vars(),
            devstate::FASTBOOT_NAMESPACE,
            DISABLE_WATCHDOG_VAR,
            false,
        )
    {
        sink.cmdline.prepend("nowatchdog")?;
    }

    sink.add_androidboot(format_args!(
        "androidboot.bootloader={}",
        ctx.ops.bootloader_version()
    ))?;
    if let Some(diskbus) = ctx.ops.boot_device_diskbus() {
        sink.add_androidboot(format_args!(
            "androidboot.boot_devices=pci0000:00/0000:00:{}",
            diskbus
        ))?;
        sink.cmdline.prepend("pci=noaer")?;
    } else {
        abl_println!(
            ctx.ops,
            "Boot device not found, boot_devices parameter not set in the command line!"
        );
    }

    // The recovery image is built into boot.img on this layout, so a normal
    // boot must say so explicitly.
    if recovery_in_boot && *target != BootTarget::Recovery {
        sink.add_androidboot(format_args!("androidboot.force_normal_boot=1"))?;
    }

    sink.add_androidboot(format_args!("androidboot.slot_suffix={}", verify.slot_suffix))?;

    let boottime = ctx.boottime_profile()?;
    let mut sink = ParamSink { cmdline: &mut builder, bootconfig: bootconfig.as_deref_mut() };
    sink.add_androidboot(format_args!("androidboot.boottime={}", boottime))?;

    // The vbmeta commitment, one androidboot entry at a time so v4 routing
    // holds.
    let locked = ctx.lock_state().is_locked();
    let mut sink = ParamSink { cmdline: &mut builder, bootconfig };
    let commitment = verify.vbmeta_commitment(locked);
    // Prepending the whole group keeps its internal order on the command
    // line path; bootconfig order is append-only anyway.
    match sink.bootconfig.as_mut() {
        Some(bootconfig) => {
            for entry in commitment.split(' ') {
                bootconfig.add(entry)?;
                bootconfig.add("\n")?;
            }
        }
        None => sink.cmdline.prepend(&commitment)?,
    }

    Ok(builder.into_str())
}

/// Adds a command line fragment, relocating `androidboot.*` entries into
/// the bootconfig section when one is in play.
fn add_relocated(
    builder: &mut CommandlineBuilder,
    mut bootconfig: Option<&mut BootConfigBuilder>,
    fragment: &str,
) -> Result<()> {
    let Some(bootconfig) = bootconfig.as_deref_mut() else {
        return builder.add(fragment);
    };
    for entry in bootparams::commandline::CommandlineParser::new(fragment) {
        let entry = entry?;
        let mut formatted = ArrayString::<512>::new();
        write_entry(&mut formatted, &entry)?;
        match entry.key.starts_with("androidboot.") {
            true => {
                bootconfig.add(&formatted)?;
                bootconfig.add("\n")?;
            }
            false => builder.add(&formatted)?,
        }
    }
    Ok(())
}
