// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash map: where each firmware region lives in the SPI flash.
//!
//! The layout is described in the device tree as one node per region under
//! `/flash`, each with `reg = <offset size>`. Read-only regions are prefixed
//! `ro-`, the two read-write copies `rw-a-` and `rw-b-`.

use crate::fdt::{self, DeviceTree, FdtError};
use crate::FirmwareIndex;

/// A region of the flash.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FmapEntry {
    pub offset: u32,
    pub length: u32,
}

impl FmapEntry {
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadOnlyRegions {
    /// The FMAP structure itself. Only its offset is passed on, so the kernel
    /// side can re-locate everything else.
    pub fmap: FmapEntry,
    pub gbb: FmapEntry,
    pub firmware_id: FmapEntry,
}

/// One read-write firmware copy.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadWriteRegions {
    /// Key block plus preamble.
    pub vblock: FmapEntry,
    /// The firmware body. The region is usually larger than the body; the
    /// real size is in the preamble.
    pub boot: FmapEntry,
    pub firmware_id: FmapEntry,
    /// The EC read-write image that goes with this firmware, when the board
    /// has an EC.
    pub ec_rw: Option<FmapEntry>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlashMap {
    pub readonly: ReadOnlyRegions,
    pub readwrite_a: ReadWriteRegions,
    pub readwrite_b: ReadWriteRegions,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// A required node or property is missing or malformed. Carries the
    /// name we were looking for.
    Missing(&'static str, FdtError),
    /// Reading a switch GPIO failed.
    Gpio(&'static str),
}

fn region(fdt: &dyn DeviceTree, path: &'static str) -> Result<FmapEntry, ConfigError> {
    let node = fdt.path_offset(path).map_err(|e| ConfigError::Missing(path, e))?;
    let (offset, length) = fdt::read_reg(fdt, node).map_err(|e| ConfigError::Missing(path, e))?;
    if u64::from(offset) + u64::from(length) > u64::from(u32::MAX) {
        return Err(ConfigError::Missing(path, FdtError::BadValue));
    }
    Ok(FmapEntry { offset, length })
}

fn optional_region(
    fdt: &dyn DeviceTree,
    path: &'static str,
) -> Result<Option<FmapEntry>, ConfigError> {
    match region(fdt, path) {
        Ok(entry) => Ok(Some(entry)),
        Err(ConfigError::Missing(_, FdtError::NotFound)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl FlashMap {
    pub fn decode(fdt: &dyn DeviceTree) -> Result<Self, ConfigError> {
        let fmap = FlashMap {
            readonly: ReadOnlyRegions {
                fmap: region(fdt, "/flash/ro-fmap")?,
                gbb: region(fdt, "/flash/ro-gbb")?,
                firmware_id: region(fdt, "/flash/ro-firmware-id")?,
            },
            readwrite_a: ReadWriteRegions {
                vblock: region(fdt, "/flash/rw-a-vblock")?,
                boot: region(fdt, "/flash/rw-a-boot")?,
                firmware_id: region(fdt, "/flash/rw-a-firmware-id")?,
                ec_rw: optional_region(fdt, "/flash/rw-a-ec-rw")?,
            },
            readwrite_b: ReadWriteRegions {
                vblock: region(fdt, "/flash/rw-b-vblock")?,
                boot: region(fdt, "/flash/rw-b-boot")?,
                firmware_id: region(fdt, "/flash/rw-b-firmware-id")?,
                ec_rw: optional_region(fdt, "/flash/rw-b-ec-rw")?,
            },
        };
        log::debug!("flash map: {:x?}", fmap);
        Ok(fmap)
    }

    pub fn slot(&self, index: FirmwareIndex) -> &ReadWriteRegions {
        match index {
            FirmwareIndex::A => &self.readwrite_a,
            FirmwareIndex::B => &self.readwrite_b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{standard_tree, ImageBuilder, MemTree};

    #[test]
    fn decodes_every_region() {
        let image = ImageBuilder::new().build();
        let tree = standard_tree(&image.fmap);
        let fmap = FlashMap::decode(&tree).unwrap();
        assert_eq!(fmap, image.fmap);
        assert_eq!(fmap.slot(FirmwareIndex::B).boot, image.fmap.readwrite_b.boot);
    }

    #[test]
    fn missing_required_region_is_fatal() {
        let mut tree = MemTree::new(8192);
        let image = ImageBuilder::new().build();
        crate::testing::add_fmap(&mut tree, &image.fmap);
        tree.remove_node("/flash/rw-b-vblock");

        assert_eq!(
            FlashMap::decode(&tree),
            Err(ConfigError::Missing("/flash/rw-b-vblock", FdtError::NotFound))
        );
    }

    #[test]
    fn ec_regions_are_optional() {
        let image = ImageBuilder::new().without_ec().build();
        let tree = standard_tree(&image.fmap);
        let fmap = FlashMap::decode(&tree).unwrap();
        assert_eq!(fmap.readwrite_a.ec_rw, None);
        assert_eq!(fmap.readwrite_b.ec_rw, None);
    }
}
