// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chrome OS "twostop" verified boot flow.
//!
//! The read-only bootstub decides which firmware to trust (recovery, its own
//! read-only copy, or one of the two read-write copies A and B), records the
//! decision in the crossystem data blob, and either jumps into the chosen
//! read-write body or goes on to select a kernel. The read-write firmware
//! re-validates what the bootstub left in RAM and then selects a kernel
//! itself.
//!
//! Everything in this crate is decision logic and data handling. The things
//! that actually touch hardware (flash, GPIOs, the EC, the verified boot
//! library, the kernel loader, and the final jump) sit behind the traits in
//! the relevant modules and are supplied by the firmware binary.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bsp;
pub mod crossystem;
pub mod ec;
pub mod fdt;
pub mod fmap;
pub mod gbb;
pub mod hasher;
pub mod kernel;
pub mod memory_wipe;
pub mod minirt;
pub mod oracle;
pub mod storage;
pub mod switches;
pub mod twostop;
pub mod vblock;

#[cfg(test)]
mod testing;

use num_derive::FromPrimitive;

/// One of the two read-write firmware copies.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FirmwareIndex {
    A,
    B,
}

impl FirmwareIndex {
    /// Decodes the index the verified boot library passes to its hash
    /// callback. Those use the same numbering as [`Selection`].
    pub fn from_oracle(index: u32) -> Option<Self> {
        match index {
            1 => Some(Self::A),
            2 => Some(Self::B),
            _ => None,
        }
    }

    pub fn slot(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Which firmware the verified boot library decided to run.
///
/// The discriminants are the library's own `VB_SELECT_FIRMWARE_*` values.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Selection {
    Recovery = 0,
    FirmwareA = 1,
    FirmwareB = 2,
    ReadOnly = 3,
}

impl Selection {
    /// The read-write copy this selection refers to, if any.
    pub fn index(self) -> Option<FirmwareIndex> {
        match self {
            Selection::FirmwareA => Some(FirmwareIndex::A),
            Selection::FirmwareB => Some(FirmwareIndex::B),
            Selection::Recovery | Selection::ReadOnly => None,
        }
    }
}
