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

//! Unified error type library
//!
//! This crate defines a common error type for the whole bootloader workspace.
//! It is intended to reduce conversion boilerplate and to make the various
//! libraries interoperate more cleanly.
//!
//! Because of its intended broad application, certain error types will be
//! highly specific to particular libraries. More specific errors can be
//! useful when writing unit tests or when defining APIs that third party
//! code may interact with. It's a judgement call whether a new variant
//! should be added, but if possible try to use an existing variant.
//!
//! New error variants should be inserted alphabetically.

#![cfg_attr(not(test), no_std)]

use core::{
    ffi::{FromBytesUntilNulError, FromBytesWithNulError},
    panic::Location,
    str::Utf8Error,
};

/// Common, universal error type
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An operation has been aborted.
    Aborted,
    /// Access was denied. Covers TPM attribute mismatches, locked NV indices
    /// and unauthenticated variable writes.
    AccessDenied,
    /// A checked arithmetic operation has overflowed.
    ArithmeticOverflow(safemath::Error),
    /// Data verification has encountered an invalid checksum.
    BadChecksum,
    /// An operation attempted to access data outside of the valid range.
    /// Includes the problematic index.
    BadIndex(usize),
    /// Data verification has encountered an invalid magic number.
    BadMagic,
    /// Generic block IO error.
    BlockIoError,
    /// Generic boot failure has occurred.
    BootFailed,
    /// The provided buffer is too small.
    /// If Some(n), provides the minimum required buffer size.
    BufferTooSmall(Option<usize>),
    /// A relevant device encountered an error.
    DeviceError,
    /// At least one parameter fails preconditions.
    InvalidInput,
    /// A state machine has entered an invalid state.
    InvalidState,
    /// Memory map retrieval error with a platform error code.
    MemoryMapCallbackError(i64),
    /// An image required for system boot is missing.
    MissingImage,
    /// The requested element (e.g. partition, variable, or NV index) was not
    /// found.
    NotFound,
    /// The default implementation for a trait method has not been overridden.
    NotImplemented,
    /// The polled device is not ready.
    NotReady,
    /// The provided name does not uniquely describe a partition.
    NotUnique,
    /// Generic permissions failure.
    OperationProhibited,
    /// Catch-all error with optional debugging string.
    Other(Option<&'static str>),
    /// A resource has run out.
    OutOfResources,
    /// A caller request contradicts a security policy, e.g. an attempt to
    /// decrease a rollback index or to provision without secure boot.
    PolicyViolation,
    /// Operation has timed out.
    Timeout,
    /// Operation is unsupported.
    Unsupported,
    /// Data verification has encountered a version number that is not
    /// supported.
    UnsupportedVersion,
    /// Image verification against the root of trust failed.
    VerificationFailed,
    /// The device cannot be written to.
    WriteProtected,
}

impl From<Option<&'static str>> for Error {
    fn from(val: Option<&'static str>) -> Self {
        Self::Other(val)
    }
}

impl From<&'static str> for Error {
    fn from(val: &'static str) -> Self {
        Self::Other(Some(val))
    }
}

impl From<safemath::Error> for Error {
    fn from(err: safemath::Error) -> Self {
        Self::ArithmeticOverflow(err)
    }
}

impl From<core::num::TryFromIntError> for Error {
    #[track_caller]
    fn from(_: core::num::TryFromIntError) -> Self {
        Self::ArithmeticOverflow(Location::caller())
    }
}

impl From<FromBytesUntilNulError> for Error {
    fn from(_: FromBytesUntilNulError) -> Self {
        Self::InvalidInput
    }
}

impl From<FromBytesWithNulError> for Error {
    fn from(_: FromBytesWithNulError) -> Self {
        Self::InvalidInput
    }
}

impl From<Utf8Error> for Error {
    fn from(_: Utf8Error) -> Self {
        Self::InvalidInput
    }
}

impl From<core::fmt::Error> for Error {
    fn from(_: core::fmt::Error) -> Self {
        Self::BufferTooSmall(None)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#?}", self)
    }
}

/// Helper type alias.
pub type Result<T> = core::result::Result<T, Error>;
