// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The embedded controller, from the point of view of verified boot.
//!
//! The EC has its own read-only and read-write images. Its read-only image is
//! as trustworthy as ours; its read-write image is only trustworthy once
//! we've checked its hash against the image that ships with the main
//! firmware we selected (software sync). The verified boot library drives
//! that process through callbacks that land here.
//!
//! The command framing belongs to the EC driver. [`EcChannel`] is the handful
//! of commands we send.

use alloc::borrow::Cow;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::fmap::{FlashMap, FmapEntry};
use crate::storage::{self, FirmwareStorage, StorageError};
use crate::Selection;

/// Reboot commands.
pub mod reboot_cmd {
    pub const JUMP_RW: u8 = 2;
    /// Stay in the current image: refuse any further jump until the EC
    /// reboots.
    pub const DISABLE_JUMP: u8 = 5;
}

/// Flash protect flags.
pub mod protect {
    pub const ALL_NOW: u32 = 1 << 2;
    pub const ALL_AT_BOOT: u32 = 1 << 6;
}

/// Asks the EC to hash its read-write image, wherever it is.
pub const HASH_OFFSET_RW: u32 = 0xffff_fffe;

pub const SHA256_DIGEST_SIZE: usize = 32;

/// How many times we ask a busy EC whether its hash is done.
pub const HASH_POLL_LIMIT: u32 = 50;
pub const HASH_POLL_INTERVAL_MS: u32 = 10;

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum EcImage {
    Unknown = 0,
    Ro = 1,
    Rw = 2,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum HashKind {
    Sha256 = 0,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum HashState {
    None = 0,
    Done = 1,
    Busy = 2,
}

/// The EC's answer to a hash command, still in wire codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HashResponse {
    pub status: u8,
    pub hash_type: u8,
    pub digest_size: u8,
    pub digest: [u8; 64],
}

impl Default for HashResponse {
    fn default() -> Self {
        Self {
            status: HashState::None as u8,
            hash_type: 0,
            digest_size: 0,
            digest: [0; 64],
        }
    }
}

/// The read-write image hash.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EcHash {
    pub kind: HashKind,
    pub digest: [u8; SHA256_DIGEST_SIZE],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EcError {
    /// No EC, or it didn't answer.
    Channel,
    /// The EC answered with a code we don't know.
    BadResponse,
    /// The EC doesn't know which image it's running.
    UnknownImage,
    /// The hash stayed busy for longer than we're willing to wait.
    Timeout,
    /// The EC hashed with an algorithm we didn't ask for.
    WrongHashType,
    /// There's no EC image for this selection.
    NoImage,
    /// The expected image doesn't fit the EC's read-write region.
    TooLarge,
    Storage(StorageError),
}

impl From<StorageError> for EcError {
    fn from(e: StorageError) -> Self {
        EcError::Storage(e)
    }
}

/// Outcome of a failed `protect_rw`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtectError {
    /// Protection is latched by the hardware until the EC reboots. The
    /// library answers this by rebooting the EC, not by giving up.
    NeedsReboot,
    Unknown,
}

/// The commands we send to the EC.
pub trait EcChannel {
    /// Raw image code, see [`EcImage`].
    fn current_image(&mut self) -> Result<u32, EcError>;
    fn reboot(&mut self, cmd: u8, flags: u8) -> Result<(), EcError>;
    /// Changes the protect flags in `mask` to their value in `flags` and
    /// returns the resulting flags. A zero mask is a pure query.
    fn flash_protect(&mut self, mask: u32, flags: u32) -> Result<u32, EcError>;
    fn hash_status(&mut self) -> Result<HashResponse, EcError>;
    fn hash_start(&mut self, hash_type: u8, offset: u32) -> Result<HashResponse, EcError>;
    /// Offset and size of the read-write image in the EC's own flash.
    fn rw_region(&mut self) -> Result<(u32, u32), EcError>;
    fn flash_erase(&mut self, offset: u32, size: u32) -> Result<(), EcError>;
    fn flash_write(&mut self, offset: u32, data: &[u8]) -> Result<(), EcError>;

    fn delay_ms(&mut self, _ms: u32) {}
}

/// Where the expected EC image comes from.
pub enum ImageSource<'a> {
    /// The whole firmware image was loaded alongside this firmware; regions
    /// can be sliced out of it directly.
    Resident(&'a [u8]),
    Storage(&'a mut dyn FirmwareStorage),
}

pub struct EcTrust<'a> {
    channel: &'a mut dyn EcChannel,
    #[cfg(any(test, feature = "ec-fault-injection"))]
    corrupt_byte: Option<usize>,
}

impl<'a> EcTrust<'a> {
    pub fn new(channel: &'a mut dyn EcChannel) -> Self {
        Self {
            channel,
            #[cfg(any(test, feature = "ec-fault-injection"))]
            corrupt_byte: None,
        }
    }

    pub fn is_running_rw(&mut self) -> Result<bool, EcError> {
        let code = self.channel.current_image()?;
        match EcImage::from_u32(code) {
            Some(EcImage::Ro) => Ok(false),
            Some(EcImage::Rw) => Ok(true),
            Some(EcImage::Unknown) => Err(EcError::UnknownImage),
            None => Err(EcError::BadResponse),
        }
    }

    /// Only an EC we know to be in read-only code is trusted.
    pub fn is_ec_trusted(&mut self) -> bool {
        match self.is_running_rw() {
            Ok(running_rw) => !running_rw,
            Err(e) => {
                log::warn!("can't tell which EC image is running ({:?}), not trusting it", e);
                false
            }
        }
    }

    pub fn request_jump_to_rw(&mut self) -> Result<(), EcError> {
        log::info!("EC: jumping to RW");
        self.channel.reboot(reboot_cmd::JUMP_RW, 0)
    }

    pub fn request_stay_in_ro(&mut self) -> Result<(), EcError> {
        log::info!("EC: staying in RO");
        self.channel.reboot(reboot_cmd::DISABLE_JUMP, 0)
    }

    /// Reads the hash of the EC's read-write image, starting the hash if the
    /// EC hasn't got one. Anything but a hash of `kind` is an error.
    pub fn read_rw_hash(&mut self, kind: HashKind) -> Result<EcHash, EcError> {
        let mut response = self.channel.hash_status()?;
        let mut polls = 0;
        loop {
            match HashState::from_u8(response.status).ok_or(EcError::BadResponse)? {
                HashState::Done => break,
                HashState::None => {
                    log::debug!("EC has no hash, starting one");
                    response = self.channel.hash_start(kind as u8, HASH_OFFSET_RW)?;
                }
                HashState::Busy => {
                    if polls == HASH_POLL_LIMIT {
                        log::error!("EC hash still busy after {} polls", polls);
                        return Err(EcError::Timeout);
                    }
                    polls += 1;
                    self.channel.delay_ms(HASH_POLL_INTERVAL_MS);
                    response = self.channel.hash_status()?;
                }
            }
        }

        if HashKind::from_u8(response.hash_type) != Some(kind) {
            return Err(EcError::WrongHashType);
        }
        if usize::from(response.digest_size) != SHA256_DIGEST_SIZE {
            return Err(EcError::BadResponse);
        }
        let mut digest = [0; SHA256_DIGEST_SIZE];
        digest.copy_from_slice(&response.digest[..SHA256_DIGEST_SIZE]);
        Ok(EcHash { kind, digest })
    }

    /// Turns write protection of the EC's read-write image on or off.
    pub fn protect_rw(&mut self, enable: bool) -> Result<(), ProtectError> {
        let unknown = |e: EcError| {
            log::error!("EC flash protect failed: {:?}", e);
            ProtectError::Unknown
        };
        if enable {
            let flags = self
                .channel
                .flash_protect(
                    protect::ALL_AT_BOOT | protect::ALL_NOW,
                    protect::ALL_AT_BOOT | protect::ALL_NOW,
                )
                .map_err(unknown)?;
            if flags & protect::ALL_NOW == 0 {
                log::error!("EC refused to protect RW, flags {:#x}", flags);
                return Err(ProtectError::Unknown);
            }
        } else {
            let flags = self
                .channel
                .flash_protect(protect::ALL_AT_BOOT, 0)
                .map_err(unknown)?;
            if flags & protect::ALL_NOW != 0 {
                log::info!("EC RW protection is latched until reboot");
                return Err(ProtectError::NeedsReboot);
            }
        }
        Ok(())
    }

    /// The EC read-write image that goes with `selection`.
    pub fn get_expected_rw<'s>(
        &mut self,
        fmap: &FlashMap,
        selection: Selection,
        source: ImageSource<'s>,
    ) -> Result<Cow<'s, [u8]>, EcError> {
        let region = selection
            .index()
            .and_then(|index| fmap.slot(index).ec_rw)
            .filter(|region| !region.is_empty())
            .ok_or(EcError::NoImage)?;

        let image = match source {
            ImageSource::Resident(flash) => Cow::Borrowed(resident_region(flash, region)?),
            ImageSource::Storage(storage) => {
                Cow::Owned(storage::read_vec(storage, region.offset, region.length)?)
            }
        };
        Ok(self.apply_fault(image))
    }

    /// Replaces the EC's read-write image with `image`.
    pub fn update_rw(&mut self, image: &[u8]) -> Result<(), EcError> {
        let (offset, size) = self.channel.rw_region()?;
        if image.len() > size as usize {
            return Err(EcError::TooLarge);
        }
        log::info!("EC: updating RW ({:#x} bytes at {:#x})", image.len(), offset);
        self.channel.flash_erase(offset, size)?;
        self.channel.flash_write(offset, image)
    }

    /// Corrupts byte `offset` of every expected image handed out from now
    /// on, so that software sync sees a mismatch.
    #[cfg(any(test, feature = "ec-fault-injection"))]
    pub fn inject_fault(&mut self, offset: usize) {
        log::warn!("EC fault injection armed at byte {:#x}", offset);
        self.corrupt_byte = Some(offset);
    }

    #[cfg(any(test, feature = "ec-fault-injection"))]
    fn apply_fault<'s>(&self, image: Cow<'s, [u8]>) -> Cow<'s, [u8]> {
        match self.corrupt_byte {
            Some(at) if at < image.len() => {
                let mut image = image.into_owned();
                image[at] ^= 0xff;
                Cow::Owned(image)
            }
            _ => image,
        }
    }

    #[cfg(not(any(test, feature = "ec-fault-injection")))]
    fn apply_fault<'s>(&self, image: Cow<'s, [u8]>) -> Cow<'s, [u8]> {
        image
    }
}

fn resident_region(flash: &[u8], region: FmapEntry) -> Result<&[u8], EcError> {
    let start = region.offset as usize;
    start
        .checked_add(region.length as usize)
        .and_then(|end| flash.get(start..end))
        .ok_or(EcError::Storage(StorageError::OutOfBounds))
}
