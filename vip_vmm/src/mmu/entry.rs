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

//! Bit layout of MTLB and STLB words

use super::page_type::PageType;

pub const ENTRY_PRESENT: u32 = 1 << 0;
pub const ENTRY_EXCEPTION: u32 = 1 << 1;
pub const ENTRY_WRITABLE: u32 = 1 << 2;

/// Unused STLB slot
pub const STLB_FREE: u32 = ENTRY_EXCEPTION;

/// Allocated STLB slot that was not filled yet
pub const STLB_DEFAULT: u32 = 0;

pub const MTLB_EMPTY: u32 = 0;

/// STLB blocks are addressed with 64 byte granularity
pub const STLB_MIN_ALIGN: u64 = 64;

const STLB_ADDRESS_MASK: u32 = 0xffff_f000;
const STLB_EXTENSION_SHIFT: u32 = 4;
const MTLB_ADDRESS_MASK: u32 = !(STLB_MIN_ALIGN as u32 - 1);
const MTLB_CODE_SHIFT: u32 = 2;

/// Highest physical address bit an STLB entry can carry
pub const PHYSICAL_ADDRESS_BITS: u32 = 40;

/// Encodes a page of `physical` (bits 39..12 are used)
pub fn stlb_entry(physical: u64, writable: bool) -> u32 {
    debug_assert!(physical >> PHYSICAL_ADDRESS_BITS == 0);

    let extension = ((physical >> 32) as u32 & 0xff) << STLB_EXTENSION_SHIFT;
    let mut entry = (physical as u32 & STLB_ADDRESS_MASK) | extension | ENTRY_PRESENT;
    if writable {
        entry |= ENTRY_WRITABLE;
    }
    entry
}

/// Page address of a present STLB entry
pub fn stlb_entry_physical(entry: u32) -> Option<u64> {
    if entry & ENTRY_PRESENT == 0 {
        return None;
    }

    let extension = ((entry >> STLB_EXTENSION_SHIFT) & 0xff) as u64;
    Some((extension << 32) | (entry & STLB_ADDRESS_MASK) as u64)
}

/// Encodes an MTLB entry that points to the STLB block at `stlb_physical`.
///
/// Only the low 32 bits of the address are stored, the upper bits are shared with the MTLB.
pub fn mtlb_entry(stlb_physical: u64, page_type: PageType) -> u32 {
    debug_assert!(stlb_physical % STLB_MIN_ALIGN == 0);

    (stlb_physical as u32 & MTLB_ADDRESS_MASK)
        | (page_type.commit_code() << MTLB_CODE_SHIFT)
        | ENTRY_PRESENT
}

/// Low 32 bits of the STLB address and page type code of a present MTLB entry
pub fn decode_mtlb_entry(entry: u32) -> Option<(u32, u32)> {
    if entry & ENTRY_PRESENT == 0 {
        return None;
    }

    Some((entry & MTLB_ADDRESS_MASK, (entry >> MTLB_CODE_SHIFT) & 0x3))
}
