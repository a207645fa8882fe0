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

//! Module for constructing the kernel command line.
//!
//! https://www.kernel.org/doc/html/v4.14/admin-guide/kernel-parameters.html
//!
//! The builder keeps the buffer null terminated at all times. Parameters can
//! be appended or prepended; prepends stack, so the last prepended segment
//! ends up first in the final command line.

use core::ffi::CStr;
use core::fmt::{Display, Formatter};
use liberror::{Error, Error::BufferTooSmall, Result};

/// Null terminator.
const COMMANDLINE_TRAILING_SIZE: usize = 1;

/// A class for constructing a kernel command line.
pub struct CommandlineBuilder<'a> {
    current_size: usize,
    buffer: &'a mut [u8],
}

impl<'a> CommandlineBuilder<'a> {
    /// Initialize with a given buffer.
    pub fn new(buffer: &'a mut [u8]) -> Result<Self> {
        if buffer.len() < COMMANDLINE_TRAILING_SIZE {
            return Err(BufferTooSmall(Some(COMMANDLINE_TRAILING_SIZE)));
        }
        let mut ret = Self { current_size: 0, buffer };
        ret.update_null_terminator();
        Ok(ret)
    }

    /// Initialize with a buffer that already contains a null terminated
    /// command line.
    pub fn new_from_prefix(buffer: &'a mut [u8]) -> Result<Self> {
        let prefix = CStr::from_bytes_until_nul(buffer).map_err(Error::from)?;
        Ok(Self { current_size: prefix.to_bytes().len(), buffer })
    }

    /// Gets the remaining capacity.
    pub fn remaining_capacity(&self) -> usize {
        self.buffer.len() - self.current_size - COMMANDLINE_TRAILING_SIZE
    }

    /// Gets the current command line.
    pub fn as_str(&self) -> &str {
        // Maintained null terminated, so not expecting to fail.
        CStr::from_bytes_with_nul(&self.buffer[..self.current_size + 1])
            .unwrap()
            .to_str()
            .unwrap()
            .trim()
    }

    /// Appends a new segment at the end of the command line.
    pub fn add(&mut self, segment: &str) -> Result<()> {
        if segment.is_empty() {
            return Ok(());
        }
        // +1 for the space separator.
        let required = segment.len() + 1;
        if self.remaining_capacity() < required {
            return Err(BufferTooSmall(Some(required)));
        }
        if segment.as_bytes().contains(&0u8) {
            return Err(Error::InvalidInput);
        }

        // The existing null terminator becomes the separator. This leaves a
        // redundant leading space when the builder is empty; `as_str` trims.
        self.buffer[self.current_size] = b' ';
        self.buffer[self.current_size + 1..][..segment.len()]
            .clone_from_slice(segment.as_bytes());
        self.current_size += required;
        self.update_null_terminator();
        Ok(())
    }

    /// Inserts a new segment at the front of the command line. Successive
    /// prepends stack: the last one prepended appears first.
    pub fn prepend(&mut self, segment: &str) -> Result<()> {
        if segment.is_empty() {
            return Ok(());
        }
        let required = segment.len() + 1;
        if self.remaining_capacity() < required {
            return Err(BufferTooSmall(Some(required)));
        }
        if segment.as_bytes().contains(&0u8) {
            return Err(Error::InvalidInput);
        }

        self.buffer.copy_within(0..self.current_size, required);
        self.buffer[..segment.len()].clone_from_slice(segment.as_bytes());
        self.buffer[segment.len()] = b' ';
        self.current_size += required;
        self.update_null_terminator();
        Ok(())
    }

    /// Gets the parsed command line entries.
    pub fn entries(&self) -> CommandlineParser {
        CommandlineParser::new(self.as_str())
    }

    /// Consumes the builder, returning the command line with the lifetime
    /// of the underlying buffer.
    pub fn into_str(self) -> &'a str {
        CStr::from_bytes_with_nul(&self.buffer[..self.current_size + 1])
            .unwrap()
            .to_str()
            .unwrap()
            .trim()
    }

    /// Rewrites the null terminator at the end of the current content.
    fn update_null_terminator(&mut self) {
        self.buffer[self.current_size] = 0;
    }
}

impl Display for CommandlineBuilder<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl core::fmt::Write for CommandlineBuilder<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.add(s).map_err(|_| core::fmt::Error)
    }
}

/// A key-value entry inside a kernel command line or bootconfig.
#[derive(Debug, PartialEq, Eq)]
pub struct Entry<'a> {
    /// Entry key.
    pub key: &'a str,
    /// Entry value; `None` for bare flags such as `earlycon`.
    pub value: Option<&'a str>,
}

impl Display for Entry<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Iterator over kernel command line entries. Double-quoted values may
/// contain whitespace.
pub struct CommandlineParser<'a> {
    remains: &'a str,
}

impl<'a> CommandlineParser<'a> {
    /// Creates a new iterator from a raw command line.
    pub fn new(data: &'a str) -> Self {
        Self { remains: data }
    }
}

impl<'a> Iterator for CommandlineParser<'a> {
    type Item = Result<Entry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.remains = self.remains.trim_start();
        if self.remains.is_empty() {
            return None;
        }

        let key_end = self
            .remains
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(self.remains.len());
        let key = &self.remains[..key_end];
        let rest = &self.remains[key_end..];

        let Some(rest) = rest.strip_prefix('=') else {
            // Bare flag.
            self.remains = rest;
            return Some(Ok(Entry { key, value: None }));
        };

        if let Some(quoted) = rest.strip_prefix('"') {
            let Some(close) = quoted.find('"') else {
                // Unterminated quote poisons the remainder of the input.
                self.remains = "";
                return Some(Err(Error::InvalidInput));
            };
            self.remains = &quoted[close + 1..];
            return Some(Ok(Entry { key, value: Some(&quoted[..close]) }));
        }

        let value_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        self.remains = &rest[value_end..];
        Some(Ok(Entry { key, value: Some(&rest[..value_end]) }))
    }
}
