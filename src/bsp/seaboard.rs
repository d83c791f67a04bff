// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// BSP for Seaboard (Tegra2).
///
/// No EC, 1 GiB of DRAM at zero. The non-volatile context lives on the
/// boot disk like every other ARM board.

use super::{Bsp, RamLayout};
use crate::crossystem::{ArchData, NvContextLocation};

pub struct Board;

impl Bsp for Board {
    const LAYOUT: RamLayout = RamLayout {
        dram: 0x0000_0000..0x4000_0000,
        kernel_buffer: 0x0010_0000,
        kernel_buffer_size: 0x0080_0000,
        firmware_text_base: 0x00e0_8000,
        stack_margin: 0x1_0000,
        gbb_max_size: 0x0008_0000,
    };

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
