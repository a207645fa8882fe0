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

//! Module for constructing the bootconfig section. See the following for
//! more details:
//!
//! https://source.android.com/docs/core/architecture/bootloader/implementing-bootconfig#bootloader-changes
//!
//! The section ends with a 16 byte trailer carrying the parameter size, a
//! CRC32 of the parameter bytes, and a magic string. Every mutation of the
//! parameters rewrites the trailer in place so the buffer always holds a
//! valid section.

use crc32fast::Hasher;
use liberror::{Error, Result};

const BOOTCONFIG_MAGIC: &str = "#BOOTCONFIG\n";
// Trailer structure:
// struct {
//     param_size: u32,
//     checksum: u32,
//     bootconfig_magic: [u8; 12]
// }
/// Size of the bootconfig trailer.
pub const BOOTCONFIG_TRAILER_SIZE: usize = 4 + 4 + BOOTCONFIG_MAGIC.len();

/// A class for constructing a bootconfig section.
pub struct BootConfigBuilder<'a> {
    current_size: usize,
    buffer: &'a mut [u8],
}

impl<'a> BootConfigBuilder<'a> {
    /// Initialize with a given buffer.
    pub fn new(buffer: &'a mut [u8]) -> Result<Self> {
        if buffer.len() < BOOTCONFIG_TRAILER_SIZE {
            return Err(Error::BufferTooSmall(Some(BOOTCONFIG_TRAILER_SIZE)));
        }
        let mut ret = Self { current_size: 0, buffer };
        ret.update_trailer();
        Ok(ret)
    }

    /// Gets the remaining capacity for adding new bootconfig.
    pub fn remaining_capacity(&self) -> usize {
        self.buffer.len() - self.current_size - BOOTCONFIG_TRAILER_SIZE
    }

    /// Gets the whole section bytes including the trailer.
    pub fn config_bytes(&self) -> &[u8] {
        &self.buffer[..self.current_size + BOOTCONFIG_TRAILER_SIZE]
    }

    /// Appends new parameters via a reader callback.
    ///
    /// A `&mut [u8]` covering the remaining space is passed to the callback
    /// for reading the parameter bytes. It should return the total size read
    /// if the operation is successful or
    /// `Error::BufferTooSmall(Some(<minimum_buffer_size>))`. Attempting to
    /// return a size greater than the input will cause a panic. Empty read
    /// is allowed. It is up to the caller to make sure the read content will
    /// eventually form valid bootconfig. The API is for situations where
    /// parameters are read from sources such as disk and a separate buffer
    /// is not desired.
    pub fn add_with<F>(&mut self, reader: F) -> Result<()>
    where
        F: FnOnce(&[u8], &mut [u8]) -> Result<usize>,
    {
        let remains = self.remaining_capacity();
        let (current, rest) = self.buffer.split_at_mut(self.current_size);
        let size = reader(&current[..], &mut rest[..remains])?;
        assert!(size <= remains);
        self.current_size += size;
        self.update_trailer();
        Ok(())
    }

    /// Appends new parameters from a string.
    pub fn add(&mut self, config: &str) -> Result<()> {
        if self.remaining_capacity() < config.len() {
            return Err(Error::BufferTooSmall(Some(config.len())));
        }
        self.add_with(|_, out| {
            out[..config.len()].clone_from_slice(config.as_bytes());
            Ok(config.len())
        })
    }

    /// Rewrites the trailer at the end of the parameter list.
    fn update_trailer(&mut self) {
        let size = u32::try_from(self.current_size).unwrap();
        let checksum = self.checksum();
        let trailer = &mut self.buffer[self.current_size..];
        trailer[..4].clone_from_slice(&size.to_le_bytes());
        trailer[4..8].clone_from_slice(&checksum.to_le_bytes());
        trailer[8..][..BOOTCONFIG_MAGIC.len()].clone_from_slice(BOOTCONFIG_MAGIC.as_bytes());
    }

    /// Computes the CRC32 of the current parameter bytes.
    fn checksum(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.buffer[..self.current_size]);
        hasher.finalize()
    }
}

impl core::fmt::Display for BootConfigBuilder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let bytes = self.config_bytes();
        for val in &bytes[..bytes.len() - BOOTCONFIG_TRAILER_SIZE] {
            write!(f, "{}", core::ascii::escape_default(*val))?;
        }
        Ok(())
    }
}

impl core::fmt::Write for BootConfigBuilder<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.add(s).map_err(|_| core::fmt::Error)
    }
}

/// Gets the parameter size of an existing bootconfig section by reading its
/// trailer.
///
/// Returns `None` when the section does not end with a recognizable trailer,
/// in which case the entire slice should be treated as raw parameters and a
/// fresh trailer synthesised. The checksum is not validated here; readers
/// are lenient, writers always produce a matching CRC32.
pub fn parameters_size(section: &[u8]) -> Option<usize> {
    let trailer_at = section.len().checked_sub(BOOTCONFIG_TRAILER_SIZE)?;
    let trailer = &section[trailer_at..];
    if &trailer[8..] != BOOTCONFIG_MAGIC.as_bytes() {
        return None;
    }
    let param_size = u32::from_le_bytes(trailer[..4].try_into().unwrap()) as usize;
    (param_size <= trailer_at).then_some(param_size)
}
