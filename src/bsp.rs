// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types and hooks for implementing Board Support Packages (BSPs).
//!
//! The verified boot flow mostly doesn't care about the board. What it does
//! need (where RAM is, where the two boot stages meet in RAM, whether there
//! is an EC, and a few board quirks) is described by the `Bsp` trait below.
//! Hooks that most boards leave alone have default implementations; a board
//! overrides only what differs.
//!
//! To implement a BSP:
//!
//! 1. Create a module within `twostop::bsp` named after your board.
//! 2. Define a type in the module called `Board`. This type will never be
//!    instantiated, so it can be arbitrary; a unit struct is easy.
//! 3. Implement `twostop::bsp::Bsp` for your `Board` type.
//! 4. Add a `target-board-*` feature to `Cargo.toml`.
//! 5. Add a branch to the `cfg_if` in `src/bin/twostop/main.rs` to detect your
//!    board and select the right `Board` type.

// Note that these modules are not conditionally included. We always compile
// every BSP because none are mutually exclusive or need different build
// settings, and this helps to ensure that everything actually builds.
pub mod coreboot;
pub mod seaboard;
pub mod smdk5250;

use core::ops::Range;

use crate::crossystem::{ArchData, CROSSYSTEM_DATA_MAX_SIZE};

/// Where things live in RAM.
///
/// The read-only and read-write firmware are separate builds that must agree
/// on the crossystem data and GBB addresses to the bit, so both are derived
/// here from the kernel buffer rather than configured separately.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RamLayout {
    /// The DRAM region the memory wipe covers.
    pub dram: Range<u64>,
    /// Kernel load buffer handed to the verified boot library.
    pub kernel_buffer: u64,
    pub kernel_buffer_size: u64,
    /// Where a read-write firmware body is copied before we jump to it.
    pub firmware_text_base: u64,
    /// Room kept below the current stack pointer when wiping memory.
    pub stack_margin: u64,
    /// Maximum size of the in-RAM GBB copy.
    pub gbb_max_size: u64,
}

impl RamLayout {
    /// The crossystem data sits immediately after the kernel buffer.
    pub const fn crossystem_data(&self) -> u64 {
        self.kernel_buffer + self.kernel_buffer_size
    }

    /// The GBB sits immediately after the largest crossystem data we allow.
    pub const fn gbb(&self) -> u64 {
        self.crossystem_data() + CROSSYSTEM_DATA_MAX_SIZE as u64
    }
}

/// Requirements placed upon a BSP type.
pub trait Bsp {
    const LAYOUT: RamLayout;

    /// Whether the board has an EC whose firmware vboot keeps in sync.
    const HAS_EC: bool = false;

    /// Board-specific words stored in the crossystem data. ARM boards keep
    /// the location of the non-volatile context on disk here; others leave it
    /// empty.
    fn arch_data() -> ArchData {
        ArchData::default()
    }

    /// Indicate a boot failure. No information is provided as to _what_
    /// failure; most boards have no way to show it anyway, so by default this
    /// does nothing.
    fn indicate_fault() {}

    /// Whether keyboard controller init should be skipped. Only boards with
    /// an i8042 care.
    fn skip_i8042() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossystem::CrossystemData;

    fn check_layout(layout: &RamLayout) {
        assert!(core::mem::size_of::<CrossystemData>() <= CROSSYSTEM_DATA_MAX_SIZE);
        // Everything the two stages share must be in DRAM and must not
        // collide with the image we jump to.
        assert!(layout.dram.contains(&layout.kernel_buffer));
        assert!(layout.gbb() + layout.gbb_max_size <= layout.dram.end);
        let shared = layout.kernel_buffer..layout.gbb() + layout.gbb_max_size;
        assert!(!shared.contains(&layout.firmware_text_base));
        assert_eq!(layout.crossystem_data() % 8, 0);
    }

    #[test]
    fn board_layouts_are_consistent() {
        check_layout(&smdk5250::Board::LAYOUT);
        check_layout(&seaboard::Board::LAYOUT);
        check_layout(&coreboot::Board::LAYOUT);
    }

    #[test]
    fn gbb_follows_crossystem_data() {
        let layout = smdk5250::Board::LAYOUT;
        assert_eq!(
            layout.gbb() - layout.crossystem_data(),
            CROSSYSTEM_DATA_MAX_SIZE as u64
        );
    }

    #[test]
    fn only_arm_boards_record_nvcontext() {
        assert!(smdk5250::Board::arch_data().nvcontext.is_some());
        assert!(seaboard::Board::arch_data().nvcontext.is_some());
        assert!(coreboot::Board::arch_data().nvcontext.is_none());
        assert!(coreboot::Board::skip_i8042());
        assert!(!smdk5250::Board::skip_i8042());
    }
}
