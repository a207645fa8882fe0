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

//! Sanitisation of identity strings read from SMBIOS/DMI tables.
//!
//! Nothing read from DMI is trusted: fields may hold placeholder junk
//! ("System Serial Number", "To be filled by O.E.M."), non-ASCII bytes, or
//! nothing at all. Every value is normalised before it is allowed anywhere
//! near the kernel command line.

use arrayvec::ArrayString;

use crate::ops::AblOps;

/// Serial numbers shorter than this are rejected.
pub const SERIALNO_MIN_SIZE: usize = 6;
/// Serial numbers are truncated to this length.
pub const SERIALNO_MAX_SIZE: usize = 20;

/// The deterministic sentinel reported when the firmware serial number is
/// unusable.
pub const SERIALNO_SENTINEL: &str = "00badbios00badbios00";

/// A sanitised serial number.
pub type SerialNumber = ArrayString<SERIALNO_MAX_SIZE>;

/// Normalises a DMI property value: characters outside `[a-zA-Z0-9,._-]`
/// become underscores, the result is lower-cased and stripped of trailing
/// underscores and dots.
pub fn clean_dmi_field(raw: &str) -> ArrayString<64> {
    let mut cleaned = ArrayString::<64>::new();
    for c in raw.chars() {
        if cleaned.is_full() {
            break;
        }
        let c = match c {
            'a'..='z' | '0'..='9' | ',' | '.' | '_' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        };
        cleaned.push(c);
    }
    while cleaned.ends_with('_') || cleaned.ends_with('.') {
        cleaned.pop();
    }
    cleaned
}

fn looks_like_placeholder(serial: &str) -> bool {
    // Not intended to be exhaustive, just the classics: "System Serial
    // Number", "To be filled by O.E.M.", keyboard-mash digit runs.
    let lower = clean_dmi_field(serial);
    lower.contains("serial")
        || lower.contains("filled")
        || lower.contains("11111111")
        || lower.contains("22222222")
        || lower.contains("12345678")
}

/// Derives the device serial number from the SMBIOS fields, in preference
/// order: system serial, board serial, product name. Returns the sentinel
/// when every candidate is missing or conspicuous.
///
/// Per the Android CDD the value must match `^[a-zA-Z0-9]{6,20}$`; foreign
/// characters are replaced with zeroes and the result is rejected if it is
/// too short or all zeroes.
pub fn serial_number<O: AblOps>(ops: &mut O) -> SerialNumber {
    let candidates = [ops.system_serial(), ops.board_serial(), ops.product_name()];
    for candidate in candidates.iter().flatten() {
        if let Some(serial) = sanitise_serial(candidate) {
            return serial;
        }
    }
    SerialNumber::from(SERIALNO_SENTINEL).unwrap()
}

fn sanitise_serial(raw: &str) -> Option<SerialNumber> {
    if raw.is_empty() || looks_like_placeholder(raw) {
        return None;
    }

    let mut serial = SerialNumber::new();
    let mut zeroes = 0usize;
    for c in raw.chars().take(SERIALNO_MAX_SIZE) {
        let c = match c {
            'a'..='z' | 'A'..='Z' | '1'..='9' => c,
            _ => '0',
        };
        if c == '0' {
            zeroes += 1;
        }
        serial.push(c);
    }

    if serial.len() < SERIALNO_MIN_SIZE || serial.len() == zeroes {
        return None;
    }
    Some(serial)
}
