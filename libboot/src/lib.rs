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

//! Library for booting a Linux kernel from firmware on x86 platforms.

#![cfg_attr(not(test), no_std)]

/// x86 boot protocol implementation.
pub mod x86;

pub use x86::{
    exit_boot_services_with_retry, fill_e820_map, BootParams, E820Entry, FramebufferInfo, Gdt,
    HandoverPlatform, MemoryKind, MemoryRegion, ScreenInfo, SetupHeader,
    EXIT_BOOT_SERVICES_RETRIES, E820_MAX_ENTRIES,
};
