// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BSP for the Exynos5250 SMDK and the Chromebooks derived from it.
//!
//! 2 GiB of DRAM at 0x4000_0000, an EC on I2C that takes part in software
//! sync, and the non-volatile context on the eMMC.

use super::{Bsp, RamLayout};
use crate::crossystem::{ArchData, NvContextLocation};

pub struct Board;

impl Bsp for Board {
    const LAYOUT: RamLayout = RamLayout {
        dram: 0x4000_0000..0xc000_0000,
        kernel_buffer: 0x4200_0000,
        kernel_buffer_size: 0x0080_0000,
        firmware_text_base: 0x43e0_0000,
        stack_margin: 0x1_0000,
        gbb_max_size: 0x0008_0000,
    };

    const HAS_EC: bool = true;

    fn arch_data() -> ArchData {
        ArchData {
            nvcontext: Some(NvContextLocation {
                lba: 0,
                offset: 0,
                size: 16,
            }),
        }
    }
}
