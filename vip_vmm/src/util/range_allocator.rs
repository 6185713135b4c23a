/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::util::round_up;

/// First fit allocator over an address range that does not live in our own memory
/// (physical addresses of a simulated device window).
///
/// Holes are kept sorted by start address and merged with their neighbours on free.
#[derive(Debug, Clone)]
pub(crate) struct RangeAllocator {
    /// `(start, size)` of every free hole
    holes: Vec<(u64, u64)>,
}

impl RangeAllocator {
    /// Creates an allocator that manages `[start, start + size)`
    pub(crate) fn new(start: u64, size: u64) -> Self {
        let mut holes = Vec::new();
        if size > 0 {
            holes.push((start, size));
        }

        Self { holes }
    }

    /// Allocates `size` bytes aligned to `align` (power of two), first fit
    pub(crate) fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        debug_assert!(align.is_power_of_two());
        if size == 0 {
            return None;
        }

        for i in 0..self.holes.len() {
            let (start, hole_size) = self.holes[i];
            let aligned = round_up(start, align);
            let padding = aligned - start;

            if padding.checked_add(size).map_or(true, |needed| needed > hole_size) {
                continue;
            }

            let rest = hole_size - padding - size;
            self.holes.remove(i);

            // keep holes sorted: back part first, so front part ends up before it
            if rest > 0 {
                self.holes.insert(i, (aligned + size, rest));
            }
            if padding > 0 {
                self.holes.insert(i, (start, padding));
            }

            return Some(aligned);
        }

        None
    }

    /// Returns `[start, start + size)` to the allocator
    pub(crate) fn free(&mut self, start: u64, size: u64) {
        let pos = self.holes.partition_point(|(hole, _)| *hole < start);

        debug_assert!(
            pos == 0 || self.holes[pos - 1].0 + self.holes[pos - 1].1 <= start,
            "double free of range {:#x}+{:#x}",
            start,
            size
        );
        debug_assert!(
            pos == self.holes.len() || start + size <= self.holes[pos].0,
            "double free of range {:#x}+{:#x}",
            start,
            size
        );

        self.holes.insert(pos, (start, size));

        // merge with next hole
        if pos + 1 < self.holes.len() && start + size == self.holes[pos + 1].0 {
            self.holes[pos].1 += self.holes[pos + 1].1;
            self.holes.remove(pos + 1);
        }

        // merge with previous hole
        if pos > 0 && self.holes[pos - 1].0 + self.holes[pos - 1].1 == start {
            self.holes[pos - 1].1 += self.holes[pos].1;
            self.holes.remove(pos);
        }
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.holes.iter().map(|(_, size)| size).sum()
    }

    #[cfg(test)]
    pub(crate) fn hole_count(&self) -> usize {
        self.holes.len()
    }
}
