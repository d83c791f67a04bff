// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clearing whatever a previous boot left in RAM.
//!
//! The caller describes a base region and carves out the parts that are in
//! use (our stack, the data handed to the next stage). Exclusions may
//! overlap and arrive in any order; they are kept sorted and merged, so the
//! wipe zeroes each gap between them exactly once, lowest address first.

use alloc::vec::Vec;
use core::ops::Range;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WipeError {
    /// A range whose end is below its start.
    Inverted { start: u64, end: u64 },
}

fn checked(start: u64, end: u64) -> Result<Range<u64>, WipeError> {
    if end < start {
        return Err(WipeError::Inverted { start, end });
    }
    Ok(start..end)
}

#[derive(Clone, Debug)]
pub struct MemoryWipe {
    base: Range<u64>,
    /// Sorted, disjoint, non-adjacent, non-empty, all within `base`.
    excluded: Vec<Range<u64>>,
}

impl MemoryWipe {
    pub fn init(start: u64, end: u64) -> Result<Self, WipeError> {
        Ok(Self {
            base: checked(start, end)?,
            excluded: Vec::new(),
        })
    }

    /// Keeps `[start, end)` from being wiped. Anything outside the base
    /// region is ignored.
    pub fn exclude(&mut self, start: u64, end: u64) -> Result<(), WipeError> {
        let range = checked(start, end)?;
        let mut new = range.start.max(self.base.start)..range.end.min(self.base.end);
        if new.is_empty() {
            return Ok(());
        }

        // Swallow every existing exclusion that overlaps or touches the new
        // one, then put the union back in order.
        let mut merged = Vec::with_capacity(self.excluded.len() + 1);
        for r in self.excluded.drain(..) {
            if r.end < new.start || r.start > new.end {
                merged.push(r);
            } else {
                new = new.start.min(r.start)..new.end.max(r.end);
            }
        }
        let at = merged.partition_point(|r| r.start < new.start);
        merged.insert(at, new);
        self.excluded = merged;
        Ok(())
    }

    /// The ranges `execute` will zero, in ascending order.
    pub fn gaps(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        let mut cursor = self.base.start;
        self.excluded
            .iter()
            .map(Some)
            .chain(core::iter::once(None))
            .filter_map(move |next| {
                let gap_end = next.map_or(self.base.end, |r| r.start);
                let gap = cursor..gap_end;
                if let Some(r) = next {
                    cursor = r.end;
                }
                (!gap.is_empty()).then_some(gap)
            })
    }

    /// Zeroes every gap with `zero`, which must clear exactly the range it is
    /// given.
    pub fn execute(&self, mut zero: impl FnMut(Range<u64>)) {
        for gap in self.gaps() {
            log::debug!("wiping {:#x}..{:#x}", gap.start, gap.end);
            zero(gap);
        }
    }
}
