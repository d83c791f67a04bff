// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{Bsp, RamLayout};

// x86 Chromebooks running U-Boot as a coreboot payload.
//
// coreboot has already done the memory init and owns everything below 1 MiB,
// so the wipe starts above it. The non-volatile context is in CMOS, which
// the crossystem data doesn't describe. The keyboard is behind an i8042 that
// the EC emulates; the EC already initialised it, so U-Boot leaves it alone.

pub struct Board;

impl Bsp for Board {
    const LAYOUT: RamLayout = RamLayout {
        dram: 0x0010_0000..0x8000_0000,
        kernel_buffer: 0x0200_0000,
        kernel_buffer_size: 0x0080_0000,
        firmware_text_base: 0x0111_0000,
        stack_margin: 0x1_0000,
        gbb_max_size: 0x0008_0000,
    };

    const HAS_EC: bool = true;

    fn skip_i8042() -> bool {
        true
    }
}
