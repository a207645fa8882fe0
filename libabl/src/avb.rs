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

//! Android Verified Boot flow: vbmeta parsing, signature and hash
//! verification, rollback bookkeeping, and the boot state classification
//! handed to the kernel.
//!
//! The vbmeta image is a 256 byte big-endian header followed by an
//! authentication block (hash + signature over header and auxiliary block)
//! and an auxiliary block (descriptors + public key). Hash descriptors bind
//! partitions, kernel-cmdline descriptors contribute command line
//! fragments, and chain descriptors delegate partitions to further signed
//! vbmeta images.

use arrayvec::{ArrayString, ArrayVec};
use core::fmt::Write as _;

use avbab::SlotIndex;
use devstate::{DeviceState, ROLLBACK_SLOTS};
use liberror::{Error, Result};
use ring::{digest, signature::RsaPublicKeyComponents};
use safemath::SafeNum;

use crate::ops::AblOps;
use crate::{abl_println, slot_manager, BootState, Context};

/// Magic prefix of a vbmeta image.
pub const VBMETA_MAGIC: &[u8; 4] = b"AVB0";
/// Size of the vbmeta image header.
pub const VBMETA_HEADER_SIZE: usize = 256;
/// Maximum depth of the chain partition recursion.
const MAX_CHAIN_DEPTH: usize = 4;
/// Highest vbmeta format major version understood here.
const VBMETA_MAX_VERSION_MAJOR: u32 = 1;
/// Upper bound on hash descriptors across the whole chain.
const MAX_COVERED_PARTITIONS: usize = 8;

/// RSA public exponent used by all supported algorithms.
const RSA_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// Signature algorithms of the vbmeta header, by wire value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Algorithm {
    Sha256Rsa2048,
    Sha256Rsa4096,
    Sha512Rsa4096,
}

impl Algorithm {
    fn from_wire(val: u32) -> Result<Self> {
        match val {
            1 => Ok(Self::Sha256Rsa2048),
            2 => Ok(Self::Sha256Rsa4096),
            5 => Ok(Self::Sha512Rsa4096),
            _ => Err(Error::Unsupported),
        }
    }

    fn digest_algorithm(&self) -> &'static digest::Algorithm {
        match self {
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 => &digest::SHA256,
            Self::Sha512Rsa4096 => &digest::SHA512,
        }
    }

    fn rsa_parameters(&self) -> &'static ring::signature::RsaParameters {
        match self {
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 => {
                &ring::signature::RSA_PKCS1_2048_8192_SHA256
            }
            Self::Sha512Rsa4096 => &ring::signature::RSA_PKCS1_2048_8192_SHA512,
        }
    }
}

fn be32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(data[off..off + 4].try_into().unwrap())
}

fn be64(data: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(data[off..off + 8].try_into().unwrap())
}

fn subslice(data: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    let end: usize = (SafeNum::from(off) + len).try_into()?;
    data.get(off..end).ok_or(Error::BadIndex(end))
}

/// Parsed vbmeta header fields this flow consumes.
struct VbmetaHeader {
    authentication_size: usize,
    auxiliary_size: usize,
    algorithm: u32,
    hash_offset: usize,
    hash_size: usize,
    signature_offset: usize,
    signature_size: usize,
    public_key_offset: usize,
    public_key_size: usize,
    descriptors_offset: usize,
    descriptors_size: usize,
    rollback_index: u64,
    rollback_index_location: usize,
}

impl VbmetaHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < VBMETA_HEADER_SIZE {
            return Err(Error::BufferTooSmall(Some(VBMETA_HEADER_SIZE)));
        }
        if data[..4] != VBMETA_MAGIC[..] {
            return Err(Error::BadMagic);
        }
        if be32(data, 4) > VBMETA_MAX_VERSION_MAJOR {
            return Err(Error::UnsupportedVersion);
        }
        Ok(Self {
            authentication_size: be64(data, 12).try_into()?,
            auxiliary_size: be64(data, 20).try_into()?,
            algorithm: be32(data, 28),
            hash_offset: be64(data, 32).try_into()?,
            hash_size: be64(data, 40).try_into()?,
            signature_offset: be64(data, 48).try_into()?,
            signature_size: be64(data, 56).try_into()?,
            public_key_offset: be64(data, 64).try_into()?,
            public_key_size: be64(data, 72).try_into()?,
            descriptors_offset: be64(data, 96).try_into()?,
            descriptors_size: be64(data, 104).try_into()?,
            rollback_index: be64(data, 112),
            rollback_index_location: be32(data, 124).try_into()?,
        })
    }

    fn total_size(&self) -> Result<usize> {
        Ok((SafeNum::from(VBMETA_HEADER_SIZE) + self.authentication_size + self.auxiliary_size)
            .try_into()?)
    }
}

/// Borrowed view of a structurally valid vbmeta image.
struct Vbmeta<'a> {
    header: VbmetaHeader,
    authentication: &'a [u8],
    auxiliary: &'a [u8],
    /// The full image: header, authentication block, auxiliary block.
    whole: &'a [u8],
}

impl<'a> Vbmeta<'a> {
    fn parse(data: &'a [u8]) -> Result<Self> {
        let header = VbmetaHeader::parse(data)?;
        let total = header.total_size()?;
        let whole = data.get(..total).ok_or(Error::BufferTooSmall(Some(total)))?;
        let authentication = subslice(whole, VBMETA_HEADER_SIZE, header.authentication_size)?;
        let auxiliary = subslice(
            whole,
            VBMETA_HEADER_SIZE + header.authentication_size,
            header.auxiliary_size,
        )?;
        Ok(Self { header, authentication, auxiliary, whole })
    }

    fn public_key(&self) -> Result<&'a [u8]> {
        subslice(self.auxiliary, self.header.public_key_offset, self.header.public_key_size)
    }

    fn descriptors(&self) -> Result<DescriptorIter<'a>> {
        let remains = subslice(
            self.auxiliary,
            self.header.descriptors_offset,
            self.header.descriptors_size,
        )?;
        Ok(DescriptorIter { remains })
    }

    /// Validates the authentication block: the stored digest must match the
    /// signed content (header and auxiliary block) and the signature must
    /// check out against the public key stored in the auxiliary block.
    /// Returns that key.
    ///
    /// `scratch` holds the reassembled signed message; the authentication
    /// block sits between its two halves in the image.
    fn verify_signature(&self, scratch: &mut [u8]) -> Result<&'a [u8]> {
        let algorithm = Algorithm::from_wire(self.header.algorithm)
            .map_err(|_| Error::VerificationFailed)?;

        let mut hash = digest::Context::new(algorithm.digest_algorithm());
        hash.update(&self.whole[..VBMETA_HEADER_SIZE]);
        hash.update(self.auxiliary);
        let stored_hash =
            subslice(self.authentication, self.header.hash_offset, self.header.hash_size)?;
        if stored_hash != hash.finish().as_ref() {
            return Err(Error::VerificationFailed);
        }

        let signature = subslice(
            self.authentication,
            self.header.signature_offset,
            self.header.signature_size,
        )?;
        let public_key = self.public_key()?;
        let modulus = avb_key_modulus(public_key)?;

        let message_len = VBMETA_HEADER_SIZE + self.auxiliary.len();
        let message = scratch
            .get_mut(..message_len)
            .ok_or(Error::BufferTooSmall(Some(message_len)))?;
        message[..VBMETA_HEADER_SIZE].copy_from_slice(&self.whole[..VBMETA_HEADER_SIZE]);
        message[VBMETA_HEADER_SIZE..].copy_from_slice(self.auxiliary);

        let components = RsaPublicKeyComponents { n: modulus, e: &RSA_EXPONENT[..] };
        components
            .verify(algorithm.rsa_parameters(), message, signature)
            .map_err(|_| Error::VerificationFailed)?;
        Ok(public_key)
    }
}

/// Extracts the modulus from an AVB format public key:
/// `(key_num_bits: u32, n0inv: u32, modulus, montgomery_rr)`.
fn avb_key_modulus(key: &[u8]) -> Result<&[u8]> {
    if key.len() < 8 {
        return Err(Error::InvalidInput);
    }
    let bits: usize = be32(key, 0).try_into()?;
    if bits == 0 || bits % 8 != 0 {
        return Err(Error::InvalidInput);
    }
    subslice(key, 8, bits / 8)
}

// Descriptor tags.
const DESCRIPTOR_TAG_HASH: u64 = 2;
const DESCRIPTOR_TAG_KERNEL_CMDLINE: u64 = 3;
const DESCRIPTOR_TAG_CHAIN_PARTITION: u64 = 4;

const HASH_DESC_FIXED_SIZE: usize = 116;
const CHAIN_DESC_FIXED_SIZE: usize = 76;

/// Payload of a hash descriptor.
struct HashDescriptor<'a> {
    image_size: u64,
    hash_algorithm: &'a str,
    partition_name: &'a str,
    salt: &'a [u8],
    digest: &'a [u8],
}

impl<'a> HashDescriptor<'a> {
    fn parse(payload: &'a [u8]) -> Result<Self> {
        if payload.len() < HASH_DESC_FIXED_SIZE {
            return Err(Error::InvalidInput);
        }
        let name_len: usize = be32(payload, 40).try_into()?;
        let salt_len: usize = be32(payload, 44).try_into()?;
        let digest_len: usize = be32(payload, 48).try_into()?;
        let name = subslice(payload, HASH_DESC_FIXED_SIZE, name_len)?;
        let salt = subslice(payload, HASH_DESC_FIXED_SIZE + name_len, salt_len)?;
        let digest = subslice(payload, HASH_DESC_FIXED_SIZE + name_len + salt_len, digest_len)?;
        let algo_field = &payload[8..40];
        let algo_end = algo_field.iter().position(|b| *b == 0).unwrap_or(algo_field.len());
        Ok(Self {
            image_size: be64(payload, 0),
            hash_algorithm: core::str::from_utf8(&algo_field[..algo_end])?,
            partition_name: core::str::from_utf8(name)?,
            salt,
            digest,
        })
    }
}

/// Payload of a chain partition descriptor.
struct ChainDescriptor<'a> {
    rollback_index_location: usize,
    partition_name: &'a str,
    public_key: &'a [u8],
}

impl<'a> ChainDescriptor<'a> {
    fn parse(payload: &'a [u8]) -> Result<Self> {
        if payload.len() < CHAIN_DESC_FIXED_SIZE {
            return Err(Error::InvalidInput);
        }
        let name_len: usize = be32(payload, 4).try_into()?;
        let key_len: usize = be32(payload, 8).try_into()?;
        let name = subslice(payload, CHAIN_DESC_FIXED_SIZE, name_len)?;
        let key = subslice(payload, CHAIN_DESC_FIXED_SIZE + name_len, key_len)?;
        Ok(Self {
            rollback_index_location: be32(payload, 0).try_into()?,
            partition_name: core::str::from_utf8(name)?,
            public_key: key,
        })
    }
}

enum Descriptor<'a> {
    Hash(HashDescriptor<'a>),
    KernelCmdline(&'a str),
    ChainPartition(ChainDescriptor<'a>),
    Unknown,
}

/// Iterator over the descriptor region of the auxiliary block. Descriptors
/// are `(tag: u64, num_bytes_following: u64, payload)`, 8 byte aligned.
struct DescriptorIter<'a> {
    remains: &'a [u8],
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<Descriptor<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remains.is_empty() {
            return None;
        }
        if self.remains.len() < 16 {
            self.remains = &[];
            return Some(Err(Error::InvalidInput));
        }
        let tag = be64(self.remains, 0);
        let Ok(payload_size) = usize::try_from(be64(self.remains, 8)) else {
            self.remains = &[];
            return Some(Err(Error::InvalidInput));
        };
        let Ok(payload) = subslice(self.remains, 16, payload_size) else {
            self.remains = &[];
            return Some(Err(Error::InvalidInput));
        };
        let advance: usize =
            match SafeNum::from(16usize + payload_size).round_up(8u32).try_into() {
                Ok(v) => v,
                Err(_) => {
                    self.remains = &[];
                    return Some(Err(Error::InvalidInput));
                }
            };
        self.remains = self.remains.get(advance..).unwrap_or(&[]);

        Some(match tag {
            DESCRIPTOR_TAG_HASH => HashDescriptor::parse(payload).map(Descriptor::Hash),
            DESCRIPTOR_TAG_KERNEL_CMDLINE => {
                if payload.len() < 8 {
                    return Some(Err(Error::InvalidInput));
                }
                let len = be32(payload, 4) as usize;
                subslice(payload, 8, len)
                    .and_then(|raw| core::str::from_utf8(raw).map_err(Error::from))
                    .map(Descriptor::KernelCmdline)
            }
            DESCRIPTOR_TAG_CHAIN_PARTITION => {
                ChainDescriptor::parse(payload).map(Descriptor::ChainPartition)
            }
            _ => Ok(Descriptor::Unknown),
        })
    }
}

/// Everything the verifier learned about this boot.
pub struct VerificationResult {
    /// The boot state classification.
    pub boot_state: BootState,
    /// SHA-256 of the top-level vbmeta image.
    pub vbmeta_digest: [u8; 32],
    /// Size in bytes of the top-level vbmeta image.
    pub vbmeta_size: usize,
    /// Command line fragments contributed by kernel cmdline descriptors.
    pub vbmeta_cmdline: ArrayString<1024>,
    /// Suffix of the verified slot.
    pub slot_suffix: &'static str,
    /// Rollback indices carried by the image chain, per location.
    pub rollback_indices: [Option<u64>; ROLLBACK_SLOTS],
}

impl VerificationResult {
    /// A result carrying no verification evidence, for exercising the
    /// assembly stages in isolation.
    #[cfg(test)]
    pub(crate) fn new_for_test(slot: SlotIndex) -> Self {
        Self::new(slot)
    }

    fn new(slot: SlotIndex) -> Self {
        Self {
            boot_state: BootState::Red,
            vbmeta_digest: [0u8; 32],
            vbmeta_size: 0,
            vbmeta_cmdline: ArrayString::new(),
            slot_suffix: slot.suffix(),
            rollback_indices: [None; ROLLBACK_SLOTS],
        }
    }

    /// The commitment string appended to the kernel command line, binding
    /// the lock state and the vbmeta content this boot was verified
    /// against.
    pub fn vbmeta_commitment(&self, locked: bool) -> ArrayString<320> {
        let mut out = ArrayString::new();
        let device_state = match locked {
            true => "locked",
            false => "unlocked",
        };
        let _ = write!(
            out,
            "androidboot.vbmeta.device_state={} androidboot.vbmeta.hash_alg=sha256 \
             androidboot.vbmeta.size={} androidboot.vbmeta.digest=",
            device_state, self.vbmeta_size
        );
        for byte in &self.vbmeta_digest {
            let _ = write!(out, "{:02x}", byte);
        }
        let _ = write!(out, " androidboot.vbmeta.invalidate_on_error=yes");
        out
    }
}

/// Rolling state threaded through the vbmeta chain walk.
struct VerifyState {
    cmdline: ArrayString<1024>,
    rollback: [Option<u64>; ROLLBACK_SLOTS],
    covered: ArrayVec<ArrayString<36>, MAX_COVERED_PARTITIONS>,
    yellow: bool,
}

impl VerifyState {
    fn new() -> Self {
        Self {
            cmdline: ArrayString::new(),
            rollback: [None; ROLLBACK_SLOTS],
            covered: ArrayVec::new(),
            yellow: false,
        }
    }

    fn append_cmdline(&mut self, fragment: &str) -> Result<()> {
        if !self.cmdline.is_empty() {
            self.cmdline.try_push(' ').map_err(|_| Error::OutOfResources)?;
        }
        self.cmdline.try_push_str(fragment).map_err(|_| Error::OutOfResources)
    }

    fn record_coverage(&mut self, partition: &str) -> Result<()> {
        let name = ArrayString::from(partition).map_err(|_| Error::OutOfResources)?;
        self.covered.try_push(name).map_err(|_| Error::OutOfResources)
    }

    fn set_rollback(&mut self, location: usize, index: u64) -> Result<()> {
        if location >= ROLLBACK_SLOTS {
            return Err(Error::VerificationFailed);
        }
        // Two images claiming one location keep the larger requirement.
        self.rollback[location] = Some(self.rollback[location].unwrap_or(0).max(index));
        Ok(())
    }
}

/// Who is allowed to have signed a vbmeta image, and where its rollback
/// index lives.
enum ChainRole<'a> {
    /// The top-level image: the embedded key (green) or the user key
    /// (yellow); rollback location from its own header.
    Root,
    /// A chained image: exactly the key and location the parent descriptor
    /// named.
    Chained {
        public_key: &'a [u8],
        rollback_location: usize,
    },
}

/// Loads and verifies the vbmeta chain of `slot` and every partition bound
/// by it, emitting the boot state for the kernel command line.
///
/// `partitions` names the partitions (without suffix) that must end up
/// covered by a hash descriptor; a chain that omits one fails verification.
/// `scratch` provides the working memory for vbmeta images, the signature
/// message and partition loads.
///
/// Verification trouble is reported through `boot_state` in the result,
/// never as an error; errors are reserved for platform failures such as an
/// unreadable disk.
pub fn verify_slot<O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    slot: SlotIndex,
    partitions: &[&str],
    scratch: &mut [u8],
) -> Result<VerificationResult> {
    let mut result = VerificationResult::new(slot);

    let mut name = ArrayString::<72>::new();
    let _ = write!(name, "vbmeta{}", slot.suffix());
    let vbmeta_size = match ctx.ops.partition_size(&name)? {
        Some(size) => usize::try_from(size)?,
        None => {
            abl_println!(ctx.ops, "No vbmeta partition for slot {}", slot.suffix());
            return Ok(result);
        }
    };
    if vbmeta_size > scratch.len() {
        return Err(Error::BufferTooSmall(Some(vbmeta_size)));
    }
    let (vbmeta_buf, scratch) = scratch.split_at_mut(vbmeta_size);
    ctx.ops.read_from_partition(&name, 0, vbmeta_buf)?;

    if !ctx.lock_state().is_locked() {
        // Unlocked devices skip verification entirely but owe the next
        // stage a clean RAM image.
        ctx.ops.clear_memory()?;
        result.boot_state = BootState::Orange;
        if let Ok(vbmeta) = Vbmeta::parse(vbmeta_buf) {
            record_digest(&mut result, &vbmeta);
            let mut state = VerifyState::new();
            // Unverified, but the cmdline descriptors still carry the
            // dm-verity configuration the OS expects.
            let _ = collect_cmdline_only(&vbmeta, &mut state);
            result.vbmeta_cmdline = state.cmdline;
        }
        return Ok(result);
    }

    let mut state = VerifyState::new();
    let verified =
        process_vbmeta(ctx, slot, vbmeta_buf, scratch, 0, ChainRole::Root, &mut state, &mut result);
    match verified {
        Ok(()) => {}
        Err(Error::VerificationFailed) => {
            abl_println!(ctx.ops, "slot {} failed verification", slot.suffix());
            return Ok(result);
        }
        Err(e) => return Err(e),
    }

    if !partitions.iter().all(|p| state.covered.iter().any(|c| c.as_str() == *p)) {
        abl_println!(ctx.ops, "vbmeta covers no hash descriptor for a required partition");
        return Ok(result);
    }

    result.vbmeta_cmdline = state.cmdline;
    result.rollback_indices = state.rollback;

    // Rollback protection: a stored index above the image's means a
    // replayed old image; an image index above the stored one is persisted,
    // but only once the whole boot is green.
    let mut pending = [None; ROLLBACK_SLOTS];
    for (location, index) in state.rollback.iter().enumerate() {
        let Some(index) = *index else { continue };
        let stored = ctx.device_state.read_rollback_index(location)?;
        if stored > index {
            abl_println!(
                ctx.ops,
                "rollback index {} regressed: stored {} image {}",
                location,
                stored,
                index
            );
            result.boot_state = BootState::Red;
            return Ok(result);
        }
        if index > stored {
            pending[location] = Some(index);
        }
    }

    result.boot_state = match state.yellow {
        true => BootState::Yellow,
        false => BootState::Green,
    };

    if result.boot_state == BootState::Green {
        for (location, index) in pending.iter().enumerate() {
            if let Some(index) = *index {
                ctx.device_state.write_rollback_index(location, index)?;
            }
        }
    }

    Ok(result)
}

fn record_digest(result: &mut VerificationResult, vbmeta: &Vbmeta) {
    let mut hash = digest::Context::new(&digest::SHA256);
    hash.update(vbmeta.whole);
    result.vbmeta_digest.copy_from_slice(hash.finish().as_ref());
    result.vbmeta_size = vbmeta.whole.len();
}

/// Collects cmdline descriptors without verifying anything. Unlocked boots
/// only.
fn collect_cmdline_only(vbmeta: &Vbmeta, state: &mut VerifyState) -> Result<()> {
    for descriptor in vbmeta.descriptors()? {
        if let Descriptor::KernelCmdline(cmdline) = descriptor? {
            state.append_cmdline(cmdline)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_vbmeta<O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    slot: SlotIndex,
    vbmeta_buf: &[u8],
    scratch: &mut [u8],
    depth: usize,
    role: ChainRole,
    state: &mut VerifyState,
    result: &mut VerificationResult,
) -> Result<()> {
    if depth > MAX_CHAIN_DEPTH {
        return Err(Error::VerificationFailed);
    }

    let vbmeta = Vbmeta::parse(vbmeta_buf).map_err(|_| Error::VerificationFailed)?;
    let public_key = vbmeta.verify_signature(scratch)?;

    let rollback_location = match role {
        ChainRole::Root => {
            record_digest(result, &vbmeta);
            if public_key == ctx.ops.embedded_public_key() {
                // Green candidate.
            } else if ctx.ops.user_public_key() == Some(public_key) {
                state.yellow = true;
            } else {
                return Err(Error::VerificationFailed);
            }
            vbmeta.header.rollback_index_location
        }
        ChainRole::Chained { public_key: expected, rollback_location } => {
            if public_key != expected {
                return Err(Error::VerificationFailed);
            }
            rollback_location
        }
    };
    state.set_rollback(rollback_location, vbmeta.header.rollback_index)?;

    let mut remaining_scratch = &mut *scratch;
    for descriptor in vbmeta.descriptors().map_err(|_| Error::VerificationFailed)? {
        match descriptor.map_err(|_| Error::VerificationFailed)? {
            Descriptor::Hash(desc) => {
                verify_hash_descriptor(ctx.ops, slot, &desc, remaining_scratch)?;
                state.record_coverage(desc.partition_name)?;
            }
            Descriptor::KernelCmdline(cmdline) => state.append_cmdline(cmdline)?,
            Descriptor::ChainPartition(chain) => {
                let mut name = ArrayString::<72>::new();
                let _ = write!(name, "vbmeta_{}{}", chain.partition_name, slot.suffix());
                let size = match ctx.ops.partition_size(&name)? {
                    Some(size) => usize::try_from(size)?,
                    None => return Err(Error::VerificationFailed),
                };
                if size > remaining_scratch.len() {
                    return Err(Error::BufferTooSmall(Some(size)));
                }
                let (chain_buf, rest) = core::mem::take(&mut remaining_scratch).split_at_mut(size);
                remaining_scratch = rest;
                ctx.ops.read_from_partition(&name, 0, chain_buf)?;
                process_vbmeta(
                    ctx,
                    slot,
                    chain_buf,
                    remaining_scratch,
                    depth + 1,
                    ChainRole::Chained {
                        public_key: chain.public_key,
                        rollback_location: chain.rollback_index_location,
                    },
                    state,
                    result,
                )?;
            }
            Descriptor::Unknown => {}
        }
    }
    Ok(())
}

/// Loads the partition bound by a hash descriptor and compares
/// `hash(salt || image)` against the descriptor digest.
fn verify_hash_descriptor<O: AblOps>(
    ops: &mut O,
    slot: SlotIndex,
    desc: &HashDescriptor,
    scratch: &mut [u8],
) -> Result<()> {
    let algorithm: &'static digest::Algorithm = match desc.hash_algorithm {
        "sha256" => &digest::SHA256,
        "sha512" => &digest::SHA512,
        _ => return Err(Error::VerificationFailed),
    };

    let image_size = usize::try_from(desc.image_size)?;
    let mut name = ArrayString::<72>::new();
    let _ = write!(name, "{}{}", desc.partition_name, slot.suffix());

    let partition_size = ops.partition_size(&name)?.ok_or(Error::VerificationFailed)?;
    if desc.image_size > partition_size {
        return Err(Error::VerificationFailed);
    }
    let image =
        scratch.get_mut(..image_size).ok_or(Error::BufferTooSmall(Some(image_size)))?;
    ops.read_from_partition(&name, 0, image)?;

    let mut hash = digest::Context::new(algorithm);
    hash.update(desc.salt);
    hash.update(image);
    match hash.finish().as_ref() == desc.digest {
        true => Ok(()),
        false => Err(Error::VerificationFailed),
    }
}

/// Verifies the active slot, falling back to the other slot once when the
/// active one fails with its retry budget exhausted.
pub fn load_and_verify<O: AblOps, D: DeviceState>(
    ctx: &mut Context<O, D>,
    partitions: &[&str],
    scratch: &mut [u8],
) -> Result<(SlotIndex, VerificationResult)> {
    let mut slot = slot_manager::active_slot(ctx.ops)?.ok_or(Error::BootFailed)?;

    for _ in 0..2 {
        let result = verify_slot(ctx, slot, partitions, scratch)?;
        if result.boot_state != BootState::Red {
            return Ok((slot, result));
        }

        let info = slot_manager::slot_info(ctx.ops, slot)?;
        if !info.successful && info.tries_remaining > 0 {
            // Retryable: burn one try and let the caller reboot into the
            // same slot.
            slot_manager::mark_boot_attempt(ctx.ops, slot)?;
            return Ok((slot, result));
        }

        abl_println!(ctx.ops, "slot {} is out of retries, disabling", slot.suffix());
        slot_manager::mark_boot_failed(ctx.ops, slot)?;
        match slot_manager::active_slot(ctx.ops)? {
            Some(next) if next != slot => slot = next,
            _ => return Ok((slot, result)),
        }
    }

    let result = verify_slot(ctx, slot, partitions, scratch)?;
    Ok((slot, result))
}
