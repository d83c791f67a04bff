// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The GBB (Google Binary Block): hardware ID, root key, recovery key and
//! screen bitmaps, in the read-only part of the flash.
//!
//! The bootstub copies the GBB to a fixed place in RAM, but only the parts
//! every boot needs (header, hardware ID, root key). The recovery key and
//! bitmaps are large and only needed in recovery or when the display comes
//! up, so they are read on demand. The read-write firmware inherits the RAM
//! copy and checks its header before using it.

use core::mem::size_of;

use hex_literal::hex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::fmap::FmapEntry;
use crate::minirt::c_field;
use crate::storage::{FirmwareStorage, StorageError};

/// "$GBB"
pub const GBB_SIGNATURE: [u8; 4] = hex!("24474242");
pub const GBB_MAJOR_VERSION: u16 = 1;
pub const GBB_HEADER_SIZE: u32 = 128;

#[derive(Copy, Clone, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct GbbHeader {
    pub signature: [u8; 4],
    pub major_version: u16,
    pub minor_version: u16,
    pub header_size: u32,
    pub flags: u32,
    pub hwid_offset: u32,
    pub hwid_size: u32,
    pub rootkey_offset: u32,
    pub rootkey_size: u32,
    pub bmpfv_offset: u32,
    pub bmpfv_size: u32,
    pub recovery_key_offset: u32,
    pub recovery_key_size: u32,
    _pad: [u8; 80],
}

const_assert_eq!(size_of::<GbbHeader>(), GBB_HEADER_SIZE as usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GbbError {
    Storage(StorageError),
    /// The GBB region is bigger than the RAM set aside for it.
    TooLarge,
    BadSignature,
    BadVersion,
    BadHeaderSize,
    /// A section points outside the GBB.
    SectionOutOfBounds,
}

impl From<StorageError> for GbbError {
    fn from(e: StorageError) -> Self {
        GbbError::Storage(e)
    }
}

impl GbbHeader {
    pub fn new(minor_version: u16) -> Self {
        let mut header = Self::new_zeroed();
        header.signature = GBB_SIGNATURE;
        header.major_version = GBB_MAJOR_VERSION;
        header.minor_version = minor_version;
        header.header_size = GBB_HEADER_SIZE;
        header
    }

    fn sections(&self) -> [(u32, u32); 4] {
        [
            (self.hwid_offset, self.hwid_size),
            (self.rootkey_offset, self.rootkey_size),
            (self.bmpfv_offset, self.bmpfv_size),
            (self.recovery_key_offset, self.recovery_key_size),
        ]
    }

    /// Structural check against a GBB of `gbb_size` bytes.
    pub fn validate(&self, gbb_size: usize) -> Result<(), GbbError> {
        if self.signature != GBB_SIGNATURE {
            return Err(GbbError::BadSignature);
        }
        if self.major_version != GBB_MAJOR_VERSION {
            return Err(GbbError::BadVersion);
        }
        if self.header_size != GBB_HEADER_SIZE {
            return Err(GbbError::BadHeaderSize);
        }
        for (offset, size) in self.sections() {
            let end = u64::from(offset) + u64::from(size);
            if u64::from(offset) < u64::from(GBB_HEADER_SIZE) && size != 0 {
                return Err(GbbError::SectionOutOfBounds);
            }
            if end > gbb_size as u64 {
                return Err(GbbError::SectionOutOfBounds);
            }
        }
        Ok(())
    }
}

/// Parses and checks the header of a GBB already in memory.
pub fn check(gbb: &[u8]) -> Result<GbbHeader, GbbError> {
    let header = GbbHeader::read_from_prefix(gbb).ok_or(GbbError::BadHeaderSize)?;
    header.validate(gbb.len())?;
    Ok(header)
}

fn load_section(
    storage: &mut dyn FirmwareStorage,
    region: FmapEntry,
    gbb: &mut [u8],
    (offset, size): (u32, u32),
) -> Result<(), GbbError> {
    // `validate` already placed the section inside the region, and the region
    // fits in `gbb`.
    let dest = &mut gbb[offset as usize..(offset + size) as usize];
    storage.read(region.offset + offset, dest)?;
    Ok(())
}

/// Copies the GBB header, hardware ID and root key from flash into `gbb`.
/// Everything else in `gbb` is left alone.
pub fn load(
    storage: &mut dyn FirmwareStorage,
    region: FmapEntry,
    gbb: &mut [u8],
) -> Result<GbbHeader, GbbError> {
    if region.length as usize > gbb.len() || region.length < GBB_HEADER_SIZE {
        return Err(GbbError::TooLarge);
    }
    let gbb = &mut gbb[..region.length as usize];
    storage.read(region.offset, &mut gbb[..GBB_HEADER_SIZE as usize])?;
    let header = check(gbb)?;
    load_section(storage, region, gbb, (header.hwid_offset, header.hwid_size))?;
    load_section(storage, region, gbb, (header.rootkey_offset, header.rootkey_size))?;
    log::debug!(
        "GBB {}.{} loaded, hwid {:#x}+{:#x}",
        header.major_version,
        header.minor_version,
        header.hwid_offset,
        header.hwid_size
    );
    Ok(header)
}

/// Reads the recovery key into the RAM copy of the GBB.
pub fn load_recovery_key(
    storage: &mut dyn FirmwareStorage,
    region: FmapEntry,
    gbb: &mut [u8],
) -> Result<(), GbbError> {
    let header = check(&gbb[..gbb.len().min(region.length as usize)])?;
    load_section(
        storage,
        region,
        gbb,
        (header.recovery_key_offset, header.recovery_key_size),
    )
}

/// Reads the bitmap block (screens shown in recovery and developer mode)
/// into the RAM copy of the GBB.
pub fn load_bmp_block(
    storage: &mut dyn FirmwareStorage,
    region: FmapEntry,
    gbb: &mut [u8],
) -> Result<(), GbbError> {
    let header = check(&gbb[..gbb.len().min(region.length as usize)])?;
    load_section(storage, region, gbb, (header.bmpfv_offset, header.bmpfv_size))
}

/// The hardware ID, without its terminator.
pub fn hardware_id(gbb: &[u8]) -> Result<&[u8], GbbError> {
    let header = check(gbb)?;
    let start = header.hwid_offset as usize;
    Ok(c_field(&gbb[start..start + header.hwid_size as usize]))
}
