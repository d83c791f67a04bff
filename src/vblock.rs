// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Just enough of the vblock format to find out how big a firmware body is.
//!
//! A vblock is a key block followed by a firmware preamble. The verified boot
//! library checks both signatures; all we need is the size of the body the
//! preamble signs, so that we read exactly that much of the (larger) body
//! region. The headers are packed little-endian structures.

use core::mem::size_of;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

pub const KEY_BLOCK_MAGIC: [u8; 8] = *b"CHROMEOS";

#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct Signature {
    pub sig_offset: u64,
    pub sig_size: u64,
    /// Size of the data the signature covers.
    pub data_size: u64,
}

#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct PublicKey {
    pub key_offset: u64,
    pub key_size: u64,
    pub algorithm: u64,
    pub key_version: u64,
}

#[derive(Copy, Clone, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct KeyBlockHeader {
    pub magic: [u8; 8],
    pub header_version_major: u32,
    pub header_version_minor: u32,
    /// Size of the whole key block; the preamble starts right after it.
    pub key_block_size: u64,
    pub key_block_signature: Signature,
    pub key_block_checksum: Signature,
    pub key_block_flags: u64,
    pub data_key: PublicKey,
}

/// The leading, version 2.0 part of the firmware preamble. Later minor
/// versions only append fields.
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct FirmwarePreambleHeader {
    pub preamble_size: u64,
    pub preamble_signature: Signature,
    pub header_version_major: u32,
    pub header_version_minor: u32,
    pub firmware_version: u64,
    pub kernel_subkey: PublicKey,
    pub body_signature: Signature,
}

const_assert_eq!(size_of::<KeyBlockHeader>(), 112);
const_assert_eq!(size_of::<FirmwarePreambleHeader>(), 104);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VblockError {
    BadMagic,
    /// The key block or preamble runs past the end of the vblock.
    Truncated,
    /// The body is bigger than the u32 sizes the flash layer deals in.
    BodyTooLarge,
}

/// The signed body size recorded in `vblock`'s preamble.
pub fn firmware_body_size(vblock: &[u8]) -> Result<u32, VblockError> {
    let key_block = KeyBlockHeader::read_from_prefix(vblock).ok_or(VblockError::Truncated)?;
    if key_block.magic != KEY_BLOCK_MAGIC {
        return Err(VblockError::BadMagic);
    }
    let preamble_at = usize::try_from(key_block.key_block_size)
        .ok()
        .filter(|&at| at >= size_of::<KeyBlockHeader>() && at <= vblock.len())
        .ok_or(VblockError::Truncated)?;
    let preamble = FirmwarePreambleHeader::read_from_prefix(&vblock[preamble_at..])
        .ok_or(VblockError::Truncated)?;
    u32::try_from(preamble.body_signature.data_size).map_err(|_| VblockError::BodyTooLarge)
}
