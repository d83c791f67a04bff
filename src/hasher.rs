// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The firmware body cache.
//!
//! Firmware selection needs the vblocks of both read-write copies up front,
//! and the bodies only when the verified boot library asks to hash them. A
//! body's real size is only known from its (already verified) preamble, so
//! each body is read lazily, exactly once, at exactly that size. The body
//! that wins is kept for the jump; the other is dropped as soon as the
//! selection is known.

use alloc::vec::Vec;

use crate::fmap::{FlashMap, FmapEntry};
use crate::storage::{self, FirmwareStorage, StorageError};
use crate::vblock::{self, VblockError};
use crate::{FirmwareIndex, Selection};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HashError {
    /// Asked to hash before the vblocks were loaded, or after the selection
    /// was resolved.
    NotLoaded,
    Vblock(VblockError),
    /// The preamble claims a body bigger than its flash region.
    BodyTooLarge,
    Storage(StorageError),
}

impl From<StorageError> for HashError {
    fn from(e: StorageError) -> Self {
        HashError::Storage(e)
    }
}

impl From<VblockError> for HashError {
    fn from(e: VblockError) -> Self {
        HashError::Vblock(e)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheState {
    Uninitialized,
    VerificationLoaded,
    Resolved(Selection),
}

#[derive(Default)]
struct Slot {
    vblock: Vec<u8>,
    body_region: FmapEntry,
    body: Option<Vec<u8>>,
}

pub struct FirmwareBodyCache {
    state: CacheState,
    slots: [Slot; 2],
}

impl Default for FirmwareBodyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareBodyCache {
    pub fn new() -> Self {
        Self {
            state: CacheState::Uninitialized,
            slots: [Slot::default(), Slot::default()],
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Reads both vblocks and notes where both bodies live.
    pub fn load_vblocks(
        &mut self,
        storage: &mut dyn FirmwareStorage,
        fmap: &FlashMap,
    ) -> Result<(), StorageError> {
        for index in [FirmwareIndex::A, FirmwareIndex::B] {
            let regions = fmap.slot(index);
            let vblock = storage::read_vec(storage, regions.vblock.offset, regions.vblock.length)?;
            self.slots[index.slot()] = Slot {
                vblock,
                body_region: regions.boot,
                body: None,
            };
        }
        self.state = CacheState::VerificationLoaded;
        Ok(())
    }

    pub fn vblock(&self, index: FirmwareIndex) -> &[u8] {
        &self.slots[index.slot()].vblock
    }

    /// Returns body `index` (in the verified boot library's numbering),
    /// reading it from storage the first time it's asked for.
    ///
    /// # Panics
    ///
    /// If `index` is neither A nor B. The library never asks for anything
    /// else.
    pub fn hash_body(
        &mut self,
        storage: &mut dyn FirmwareStorage,
        index: u32,
    ) -> Result<&[u8], HashError> {
        let Some(index) = FirmwareIndex::from_oracle(index) else {
            panic!("asked to hash firmware body {}", index);
        };
        if self.state != CacheState::VerificationLoaded {
            return Err(HashError::NotLoaded);
        }

        let slot = &mut self.slots[index.slot()];
        if slot.body.is_none() {
            let size = vblock::firmware_body_size(&slot.vblock)?;
            if size > slot.body_region.length {
                log::error!(
                    "body {:?} claims {:#x} bytes, region holds {:#x}",
                    index,
                    size,
                    slot.body_region.length
                );
                return Err(HashError::BodyTooLarge);
            }
            log::debug!("reading body {:?}: {:#x} bytes", index, size);
            slot.body = Some(storage::read_vec(storage, slot.body_region.offset, size)?);
        }
        Ok(slot.body.as_deref().unwrap_or(&[]))
    }

    /// Records the final selection and drops every body except the selected
    /// one, which is returned if it was read.
    pub fn resolve(&mut self, selection: Selection) -> Option<&[u8]> {
        let keep = selection.index();
        for index in [FirmwareIndex::A, FirmwareIndex::B] {
            if Some(index) != keep {
                self.slots[index.slot()].body = None;
            }
        }
        self.state = CacheState::Resolved(selection);
        keep.and_then(|index| self.body(index))
    }

    /// The cached body, if it has been read (and not released).
    pub fn body(&self, index: FirmwareIndex) -> Option<&[u8]> {
        self.slots[index.slot()].body.as_deref()
    }
}
