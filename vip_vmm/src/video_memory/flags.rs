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

use core::ops::{BitOr, BitOrAssign};

use crate::mmu::PageType;

/// Options of a video memory allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);

    /// One physically contiguous run
    pub const CONTIGUOUS: AllocFlags = AllocFlags(1 << 0);

    /// Physically contiguous in 64K (1M, 16M) aligned units
    pub const CONTIGUOUS_64K: AllocFlags = AllocFlags(1 << 1);
    pub const CONTIGUOUS_1M: AllocFlags = AllocFlags(1 << 2);
    pub const CONTIGUOUS_16M: AllocFlags = AllocFlags(1 << 3);

    /// Use the physical address directly instead of an MMU mapping
    pub const NO_MMU_PAGE: AllocFlags = AllocFlags(1 << 4);

    pub const MAP_KERNEL: AllocFlags = AllocFlags(1 << 5);
    pub const MAP_USER: AllocFlags = AllocFlags(1 << 6);
    pub const CACHEABLE: AllocFlags = AllocFlags(1 << 7);

    /// Place the device-virtual range at or above 4GiB
    pub const AVOID_4G: AllocFlags = AllocFlags(1 << 8);
    pub const READ_ONLY: AllocFlags = AllocFlags(1 << 9);

    /// Skip the contiguous heaps and use the dynamic page allocator
    pub const NO_HEAP: AllocFlags = AllocFlags(1 << 10);

    const UNIT_MASK: u32 = Self::CONTIGUOUS_64K.0 | Self::CONTIGUOUS_1M.0 | Self::CONTIGUOUS_16M.0;

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        AllocFlags(bits)
    }

    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: AllocFlags) -> Self {
        AllocFlags(self.0 & !other.0)
    }

    /// Size of the physically contiguous units the allocation has to consist of.
    ///
    /// `None` if there is no contiguity requirement beyond single pages.
    pub fn contiguous_unit(self) -> Option<PageType> {
        if self.contains(Self::CONTIGUOUS_16M) {
            Some(PageType::Page16M)
        } else if self.contains(Self::CONTIGUOUS_1M) {
            Some(PageType::Page1M)
        } else if self.contains(Self::CONTIGUOUS_64K) {
            Some(PageType::Page64K)
        } else {
            None
        }
    }

    /// Relaxes the unit requirement by one step (16M to 1M to 64K to none).
    ///
    /// Returns `None` if there is nothing left to relax.
    pub fn weaken(self) -> Option<Self> {
        let unit = match self.contiguous_unit()? {
            PageType::Page16M => Self::CONTIGUOUS_1M.0,
            PageType::Page1M => Self::CONTIGUOUS_64K.0,
            _ => 0,
        };
        Some(AllocFlags((self.0 & !Self::UNIT_MASK) | unit))
    }
}

impl BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        AllocFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AllocFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Cache maintenance operation on a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Write dirty lines back
    Clean,

    /// Drop cached lines
    Invalidate,

    /// Clean and invalidate
    Flush,
}
