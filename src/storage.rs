// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware storage: bounded access to the SPI flash holding the firmware
//! image.
//!
//! The flash driver itself lives in U-Boot and is reached through [`SpiFlash`].
//! [`SpiStorage`] layers the rules the boot flow relies on over it: every
//! access is bounds-checked before any I/O happens, and writes preserve the
//! bytes around the requested window even though NOR flash can only be erased
//! a whole sector at a time.

use alloc::{vec, vec::Vec};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageError {
    /// The flash device could not be found or initialised.
    Open,
    /// The access falls (partly) outside the device. No I/O was done.
    OutOfBounds,
    /// The driver reported a failure part way through.
    Io,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashGeometry {
    pub size: u32,
    /// Erase granularity. Always a power of two.
    pub sector_size: u32,
}

/// Raw SPI NOR flash, as provided by the driver.
///
/// `program` can only clear bits; getting a byte back to `0xff` takes an
/// `erase` of the whole sector around it.
pub trait SpiFlash {
    fn probe(&mut self) -> Result<FlashGeometry, StorageError>;
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError>;
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError>;
}

/// An open firmware storage device.
pub trait FirmwareStorage {
    fn size(&self) -> u32;
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError>;
}

/// Reads `len` bytes at `offset` into a new buffer.
pub fn read_vec(
    storage: &mut dyn FirmwareStorage,
    offset: u32,
    len: u32,
) -> Result<Vec<u8>, StorageError> {
    check_bounds(storage.size(), offset, len as usize)?;
    let mut buf = vec![0; len as usize];
    storage.read(offset, &mut buf)?;
    Ok(buf)
}

fn check_bounds(size: u32, offset: u32, len: usize) -> Result<(), StorageError> {
    let end = u64::from(offset) + len as u64;
    if end > u64::from(size) {
        return Err(StorageError::OutOfBounds);
    }
    Ok(())
}

/// Firmware storage over a SPI flash device.
///
/// Opening borrows the device for as long as the handle lives. Handles are
/// closed before jumping to another firmware image; that image opens its own.
pub struct SpiStorage<'a> {
    flash: &'a mut dyn SpiFlash,
    geometry: FlashGeometry,
}

impl<'a> SpiStorage<'a> {
    pub fn open(flash: &'a mut dyn SpiFlash) -> Result<Self, StorageError> {
        let geometry = flash.probe()?;
        if geometry.sector_size == 0 || !geometry.sector_size.is_power_of_two() {
            log::error!("flash reports unusable sector size {:#x}", geometry.sector_size);
            return Err(StorageError::Open);
        }
        if geometry.size % geometry.sector_size != 0 {
            log::error!(
                "flash size {:#x} isn't a whole number of {:#x} byte sectors",
                geometry.size,
                geometry.sector_size
            );
            return Err(StorageError::Open);
        }
        log::debug!(
            "flash opened: {:#x} bytes, {:#x} byte sectors",
            geometry.size,
            geometry.sector_size
        );
        Ok(Self { flash, geometry })
    }

    pub fn close(self) {
        log::debug!("flash closed");
    }
}

impl FirmwareStorage for SpiStorage<'_> {
    fn size(&self) -> u32 {
        self.geometry.size
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(self.geometry.size, offset, buf.len())?;
        self.flash.read(offset, buf)
    }

    /// Read, erase, modify, write, one sector at a time.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(self.geometry.size, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let sector = self.geometry.sector_size;
        let mask = !(sector - 1);
        // Both in bounds by the check above; `open` made sure the device is a
        // whole number of sectors.
        let write_end = u64::from(offset) + data.len() as u64;
        let first = offset & mask;

        let mut backup = vec![0; sector as usize];
        let mut base = u64::from(first);
        while base < write_end {
            let base32 = base as u32;
            // Save the whole sector before erasing anything in it.
            self.flash.read(base32, &mut backup)?;

            // The part of `data` that lands in this sector.
            let lo = base.max(u64::from(offset));
            let hi = (base + u64::from(sector)).min(write_end);
            let src = &data[(lo - u64::from(offset)) as usize..(hi - u64::from(offset)) as usize];
            let dst = &mut backup[(lo - base) as usize..(hi - base) as usize];

            if dst != src {
                dst.copy_from_slice(src);
                self.flash.erase(base32, sector)?;
                self.flash.program(base32, &backup)?;
            }

            base += u64::from(sector);
        }
        Ok(())
    }
}
