// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The verified boot library's entry points and callbacks, as we see them.
//!
//! The library makes every security decision (which firmware, which kernel,
//! whether the EC needs updating) and we treat it as an oracle: we hand it
//! the GBB, the shared data buffer and the vblocks, it calls back into us
//! for the things only firmware can do, and it tells us what it decided.
//! Only the call contract lives here; the library itself is C and is bound in
//! the firmware binary.

use alloc::borrow::Cow;

use crate::ec::{EcError, EcHash, ProtectError};
use crate::hasher::HashError;
use crate::Selection;

/// Flags passed into `init`.
pub mod init_flags {
    pub const DEV_SWITCH_ON: u32 = 0x0000_0001;
    pub const REC_BUTTON_PRESSED: u32 = 0x0000_0002;
    pub const WP_ENABLED: u32 = 0x0000_0004;
    pub const S3_RESUME: u32 = 0x0000_0008;
    pub const PREVIOUS_BOOT_FAIL: u32 = 0x0000_0010;
    pub const RO_NORMAL_SUPPORT: u32 = 0x0000_0020;
    pub const EC_SOFTWARE_SYNC: u32 = 0x0000_0200;
}

/// Flags `init` hands back, asking us to do things before firmware
/// selection.
pub mod init_out_flags {
    pub const ENABLE_RECOVERY: u32 = 0x0000_0001;
    pub const CLEAR_RAM: u32 = 0x0000_0002;
    pub const ENABLE_DISPLAY: u32 = 0x0000_0004;
}

/// The library's `VBERROR_SHUTDOWN_REQUESTED`.
pub const VBERROR_SHUTDOWN_REQUESTED: u32 = 0x0001_0022;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VbError {
    /// The user asked to power off (e.g. by pressing the power button at a
    /// recovery screen). Not a failure, and handled differently from one.
    ShutdownRequested,
    /// Any other library error code.
    Code(u32),
}

impl VbError {
    pub fn from_code(code: u32) -> Self {
        if code == VBERROR_SHUTDOWN_REQUESTED {
            VbError::ShutdownRequested
        } else {
            VbError::Code(code)
        }
    }
}

/// Parameters shared by every entry point.
pub struct CommonParams<'a> {
    pub gbb: &'a [u8],
    /// The library's shared data area. It lives inside the crossystem data
    /// and we forward it without looking at it.
    pub shared_data: &'a mut [u8],
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InitParams {
    pub flags: u32,
    pub out_flags: u32,
}

pub struct SelectFirmwareParams<'a> {
    pub vblock_a: &'a [u8],
    pub vblock_b: &'a [u8],
}

/// An opaque handle to the disk the kernel was found on.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DiskHandle {
    /// Device number in the block device table, the `%D` of the command
    /// line.
    pub device: u32,
    /// Whatever else the binding needs to find the disk again.
    pub cookie: usize,
}

/// In/out parameters of kernel selection.
pub struct KernelParams<'a> {
    /// Where the library loads the kernel partition.
    pub kernel_buffer: &'a mut [u8],
    /// Physical address of `kernel_buffer`.
    pub kernel_buffer_address: u64,
    pub disk: DiskHandle,
    /// 1-based partition number on `disk`.
    pub partition_number: u32,
    /// Physical address and size of the bootloader inside the loaded kernel
    /// partition.
    pub bootloader_address: u64,
    pub bootloader_size: u32,
    pub partition_guid: [u8; 16],
}

/// Things the library asks the firmware to do while it decides. Each maps to
/// one of its `VbEx*` callbacks.
pub trait VbootCallbacks {
    /// Returns the bytes of firmware body `index` for hashing. `index` uses
    /// the library's numbering; anything but A or B is a contract violation.
    fn hash_firmware_body(&mut self, index: u32) -> Result<&[u8], HashError>;
    /// False unless the EC is known to be running its read-only image.
    fn ec_trusted(&mut self) -> bool;
    fn ec_running_rw(&mut self) -> Result<bool, EcError>;
    fn ec_jump_to_rw(&mut self) -> Result<(), EcError>;
    fn ec_stay_in_ro(&mut self) -> Result<(), EcError>;
    fn ec_hash_rw(&mut self) -> Result<EcHash, EcError>;
    fn ec_expected_rw(&mut self, selection: Selection) -> Result<Cow<'_, [u8]>, EcError>;
    fn ec_update_rw(&mut self, image: &[u8]) -> Result<(), EcError>;
    fn ec_protect_rw(&mut self, enable: bool) -> Result<(), ProtectError>;
}

/// The verified boot library entry points.
pub trait VbootOracle {
    fn init(&mut self, common: &mut CommonParams<'_>, params: &mut InitParams) -> Result<(), VbError>;

    /// Picks a firmware. May call `callbacks.hash_firmware_body` any number
    /// of times first.
    fn select_firmware(
        &mut self,
        common: &mut CommonParams<'_>,
        params: &SelectFirmwareParams<'_>,
        callbacks: &mut dyn VbootCallbacks,
    ) -> Result<Selection, VbError>;

    /// Finds, verifies and loads a kernel into `params.kernel_buffer`,
    /// filling in the rest of `params` on success.
    fn select_and_load_kernel(
        &mut self,
        common: &mut CommonParams<'_>,
        params: &mut KernelParams<'_>,
        callbacks: &mut dyn VbootCallbacks,
    ) -> Result<(), VbError>;
}
