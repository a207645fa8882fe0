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

//! This library provides APIs to work with the bootloader control block
//! (BCB) stored at the head of the Android misc partition.
//!
//! Reference code:
//! https://cs.android.com/android/platform/superproject/main/+/main:bootable/recovery/bootloader_message/include/bootloader_message/bootloader_message.h

#![cfg_attr(not(test), no_std)]

use core::ffi::CStr;

use zerocopy::{AsBytes, FromBytes, FromZeroes, Ref};

use liberror::{Error, Result};

/// Parsed view of the BCB `command` field.
///
/// The next-stage OS owns the command field; the bootloader only consumes it
/// and, for the one-shot form, clears it.
#[derive(PartialEq, Debug)]
pub enum BcbCommand<'a> {
    /// Empty command; boot normally.
    None,
    /// `boot-<target>`. Persistent: the command stays in place until the OS
    /// clears it.
    Boot(&'a str),
    /// `bootonce-<target>`. Cleared by the bootloader before booting.
    BootOnce(&'a str),
    /// `\path\to\image` on the EFI system partition. `.efi` suffixes select
    /// EFI chainload; anything else is treated as a boot image.
    EspPath(&'a str),
}

/// Android bootloader message structure occupying the first kilobyte of the
/// misc partition.
#[repr(C, packed)]
#[derive(AsBytes, FromBytes, FromZeroes, PartialEq, Copy, Clone, Debug)]
pub struct BootloaderMessage {
    command: [u8; 32],
    status: [u8; 32],
    recovery: [u8; 768],
    reserved: [u8; 192],
}

impl BootloaderMessage {
    /// BCB size in bytes.
    pub const SIZE_BYTES: usize = 1024;

    /// Extracts a mutable BootloaderMessage reference from bytes.
    pub fn from_bytes_mut(buffer: &mut [u8]) -> Result<&mut BootloaderMessage> {
        Ok(Ref::<_, BootloaderMessage>::new_from_prefix(buffer)
            .ok_or(Error::BufferTooSmall(Some(core::mem::size_of::<BootloaderMessage>())))?
            .0
            .into_mut())
    }

    /// Extracts a BootloaderMessage reference from bytes.
    pub fn from_bytes_ref(buffer: &[u8]) -> Result<&BootloaderMessage> {
        Ok(Ref::<_, BootloaderMessage>::new_from_prefix(buffer)
            .ok_or(Error::BufferTooSmall(Some(core::mem::size_of::<BootloaderMessage>())))?
            .0
            .into_ref())
    }

    /// Parses the command field.
    pub fn command(&self) -> Result<BcbCommand> {
        let command = CStr::from_bytes_until_nul(&self.command)?.to_str()?;
        Ok(match command {
            "" => BcbCommand::None,
            c if c.starts_with('\\') => BcbCommand::EspPath(c),
            c => match c.strip_prefix("bootonce-") {
                Some(target) => BcbCommand::BootOnce(target),
                None => match c.strip_prefix("boot-") {
                    Some(target) => BcbCommand::Boot(target),
                    None => return Err(Error::InvalidInput),
                },
            },
        })
    }

    /// Clears the command field. Used after consuming a `bootonce-` command.
    pub fn clear_command(&mut self) {
        self.command = [0u8; 32];
    }

    /// Returns whether the status field holds stale data. The status field
    /// is owned by the bootloader and must be cleared on every read.
    pub fn status_dirty(&self) -> bool {
        self.status[0] != 0
    }

    /// Clears the status field.
    pub fn clear_status(&mut self) {
        self.status = [0u8; 32];
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::AsBytes;

    impl Default for BootloaderMessage {
        fn default() -> Self {
            BootloaderMessage {
                command: [0; 32],
                status: [0; 32],
                recovery: [0; 768],
                reserved: [0; 192],
            }
        }
    }

    fn bcb_with_command(command: &str) -> BootloaderMessage {
        let mut bcb = BootloaderMessage::default();
        bcb.command[..command.len()].copy_from_slice(command.as_bytes());
        bcb
    }

    #[test]
    fn test_bcb_size() {
        assert_eq!(core::mem::size_of::<BootloaderMessage>(), BootloaderMessage::SIZE_BYTES);
    }

    #[test]
    fn test_bcb_empty_parsed_as_none() {
        let bcb = BootloaderMessage::default();
        assert_eq!(
            BootloaderMessage::from_bytes_ref(bcb.as_bytes()).unwrap().command().unwrap(),
            BcbCommand::None
        );
    }

    #[test]
    fn test_bcb_with_unknown_command_failed() {
        let bcb = bcb_with_command("reboot-wrong");
        assert!(BootloaderMessage::from_bytes_ref(bcb.as_bytes()).unwrap().command().is_err());
    }

    #[test]
    fn test_bcb_persistent_target() {
        let bcb = bcb_with_command("boot-recovery");
        assert_eq!(
            BootloaderMessage::from_bytes_ref(bcb.as_bytes()).unwrap().command().unwrap(),
            BcbCommand::Boot("recovery")
        );
    }

    #[test]
    fn test_bcb_oneshot_target() {
        let bcb = bcb_with_command("bootonce-fastboot");
        assert_eq!(
            BootloaderMessage::from_bytes_ref(bcb.as_bytes()).unwrap().command().unwrap(),
            BcbCommand::BootOnce("fastboot")
        );
    }

    #[test]
    fn test_bcb_esp_path() {
        let bcb = bcb_with_command("\\loader.efi");
        assert_eq!(
            BootloaderMessage::from_bytes_ref(bcb.as_bytes()).unwrap().command().unwrap(),
            BcbCommand::EspPath("\\loader.efi")
        );
    }

    #[test]
    fn test_bcb_clear_command_round_trip() {
        let mut bcb = bcb_with_command("bootonce-recovery");
        let mut bytes = bcb.as_bytes_mut().to_vec();
        let view = BootloaderMessage::from_bytes_mut(&mut bytes).unwrap();
        view.clear_command();
        assert_eq!(view.command().unwrap(), BcbCommand::None);
    }

    #[test]
    fn test_bcb_status_lifecycle() {
        let mut bcb = BootloaderMessage::default();
        bcb.status[..5].copy_from_slice(b"stale");
        assert!(bcb.status_dirty());
        bcb.clear_status();
        assert!(!bcb.status_dirty());
    }

    #[test]
    fn test_bcb_buffer_too_small() {
        let buffer = [0u8; 100];
        assert!(BootloaderMessage::from_bytes_ref(&buffer).is_err());
    }
}
