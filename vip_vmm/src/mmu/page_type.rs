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

use log::warn;
use static_assertions::const_assert;

use crate::{VmmError, VmmResult};

/// Page granularities of the device MMU, finest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageType {
    Page4K,
    Page64K,
    Page1M,
    Page16M,
}

// every step of the ladder is a factor of 16
const_assert!(PageType::Page64K.shift() - PageType::Page4K.shift() == 4);
const_assert!(PageType::Page1M.shift() - PageType::Page64K.shift() == 4);
const_assert!(PageType::Page16M.shift() - PageType::Page1M.shift() == 4);

const COARSEST_FIRST_40BIT: [PageType; 4] = [
    PageType::Page16M,
    PageType::Page1M,
    PageType::Page64K,
    PageType::Page4K,
];

const COARSEST_FIRST_32BIT: [PageType; 3] =
    [PageType::Page1M, PageType::Page64K, PageType::Page4K];

impl PageType {
    /// All page types, finest first
    pub const LADDER: [PageType; 4] = [
        PageType::Page4K,
        PageType::Page64K,
        PageType::Page1M,
        PageType::Page16M,
    ];

    pub const fn shift(self) -> u32 {
        match self {
            PageType::Page4K => 12,
            PageType::Page64K => 16,
            PageType::Page1M => 20,
            PageType::Page16M => 24,
        }
    }

    #[inline]
    pub const fn size(self) -> u64 {
        1 << self.shift()
    }

    /// Value of the page size field in a committed MTLB entry
    pub const fn commit_code(self) -> u32 {
        match self {
            PageType::Page4K => 0,
            PageType::Page64K => 1,
            PageType::Page1M => 2,
            PageType::Page16M => 3,
        }
    }

    pub fn from_code(code: u32) -> VmmResult<Self> {
        match code {
            0 => Ok(PageType::Page4K),
            1 => Ok(PageType::Page64K),
            2 => Ok(PageType::Page1M),
            3 => Ok(PageType::Page16M),
            _ => {
                warn!("Unknown page type code {}", code);
                Err(VmmError::InvalidArgument)
            }
        }
    }

    pub(crate) const fn ladder_index(self) -> usize {
        self.commit_code() as usize
    }

    pub const fn finer(self) -> Option<Self> {
        match self {
            PageType::Page4K => None,
            PageType::Page64K => Some(PageType::Page4K),
            PageType::Page1M => Some(PageType::Page64K),
            PageType::Page16M => Some(PageType::Page1M),
        }
    }

    pub const fn coarser(self) -> Option<Self> {
        match self {
            PageType::Page4K => Some(PageType::Page64K),
            PageType::Page64K => Some(PageType::Page1M),
            PageType::Page1M => Some(PageType::Page16M),
            PageType::Page16M => None,
        }
    }

    /// Page types available in an addressing mode, in the order `map` tries them
    pub fn coarsest_first(va_40bit: bool) -> &'static [PageType] {
        if va_40bit {
            &COARSEST_FIRST_40BIT
        } else {
            &COARSEST_FIRST_32BIT
        }
    }

    pub fn parameters(self, va_40bit: bool) -> VmmResult<PageSizeParameters> {
        let mtlb_shift = if va_40bit {
            MTLB_SHIFT_40BIT
        } else {
            MTLB_SHIFT_32BIT
        };

        if self.shift() > mtlb_shift {
            warn!("{:?} pages need 40 bit addressing", self);
            return Err(VmmError::NotSupported);
        }

        let stlb_entry_count = 1usize << (mtlb_shift - self.shift());
        Ok(PageSizeParameters {
            mtlb_commit_code: self.commit_code(),
            stlb_entry_count,
            stlb_index_shift: self.shift(),
            stlb_index_mask: ((stlb_entry_count as u64) - 1) << self.shift(),
            page_offset_mask: self.size() - 1,
            page_byte_size: self.size(),
        })
    }
}

/// Each MTLB entry covers 16MB with 40 bit addressing
pub(crate) const MTLB_SHIFT_40BIT: u32 = 24;

/// and 1MB with 32 bit addressing
pub(crate) const MTLB_SHIFT_32BIT: u32 = 20;

const_assert!(MTLB_SHIFT_40BIT == PageType::Page16M.shift());
const_assert!(MTLB_SHIFT_32BIT == PageType::Page1M.shift());

/// Layout of one page type inside an MTLB entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizeParameters {
    pub mtlb_commit_code: u32,

    /// STLB slots per MTLB entry
    pub stlb_entry_count: usize,
    pub stlb_index_shift: u32,
    pub stlb_index_mask: u64,
    pub page_offset_mask: u64,
    pub page_byte_size: u64,
}

/// Looks up the parameters of a raw page type code
pub fn page_size_parameters(code: u32, va_40bit: bool) -> VmmResult<PageSizeParameters> {
    PageType::from_code(code)?.parameters(va_40bit)
}

#[cfg(test)]
mod test {
    use super::{page_size_parameters, PageType};
    use crate::VmmError;

    #[test]
    fn test_parameters_40bit() {
        let params = page_size_parameters(0, true).unwrap();
        assert_eq!(params.stlb_entry_count, 4096);
        assert_eq!(params.stlb_index_mask, 0xff_f000);
        assert_eq!(params.page_offset_mask, 0xfff);

        let params = page_size_parameters(1, true).unwrap();
        assert_eq!(params.stlb_entry_count, 256);
        assert_eq!(params.stlb_index_mask, 0xff_0000);

        let params = page_size_parameters(2, true).unwrap();
        assert_eq!(params.stlb_entry_count, 16);
        assert_eq!(params.page_byte_size, 0x10_0000);

        let params = page_size_parameters(3, true).unwrap();
        assert_eq!(params.stlb_entry_count, 1);
        assert_eq!(params.stlb_index_mask, 0);
        assert_eq!(params.mtlb_commit_code, 3);
    }

    #[test]
    fn test_parameters_32bit() {
        assert_eq!(page_size_parameters(0, false).unwrap().stlb_entry_count, 256);
        assert_eq!(page_size_parameters(1, false).unwrap().stlb_entry_count, 16);
        assert_eq!(page_size_parameters(2, false).unwrap().stlb_entry_count, 1);
        assert_eq!(
            page_size_parameters(3, false).err(),
            Some(VmmError::NotSupported)
        );
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(
            page_size_parameters(4, true).err(),
            Some(VmmError::InvalidArgument)
        );
    }

    #[test]
    fn test_ladder() {
        for page_type in PageType::LADDER {
            assert_eq!(PageType::from_code(page_type.commit_code()), Ok(page_type));
            if let Some(coarser) = page_type.coarser() {
                assert_eq!(coarser.finer(), Some(page_type));
                assert_eq!(coarser.size(), page_type.size() * 16);
            }
        }
        assert_eq!(PageType::coarsest_first(false)[0], PageType::Page1M);
        assert_eq!(PageType::coarsest_first(true).len(), 4);
    }
}
