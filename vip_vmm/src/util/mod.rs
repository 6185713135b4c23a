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

pub(crate) mod bit_array;
pub(crate) mod range_allocator;
pub(crate) mod reentrant_lock;
pub(crate) mod spin;

/// Rounds `value` up to the next multiple of `align` (power of two)
#[inline]
pub(crate) const fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// `round_up` that returns `None` instead of overflowing
#[inline]
pub(crate) const fn checked_round_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(value) => Some(value & !(align - 1)),
        None => None,
    }
}

/// Rounds `value` down to a multiple of `align` (power of two)
#[inline]
pub(crate) const fn round_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
pub(crate) const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

#[cfg(test)]
mod test {
    use crate::util::{checked_round_up, is_aligned, round_down, round_up};

    #[test]
    fn test_rounding() {
        assert_eq!(round_up(0, 0x1000), 0);
        assert_eq!(round_up(1, 0x1000), 0x1000);
        assert_eq!(round_up(0x1000, 0x1000), 0x1000);
        assert_eq!(round_up(0x2001, 0x1000), 0x3000);
        assert_eq!(round_down(0x2fff, 0x1000), 0x2000);
        assert_eq!(round_down(0x100_0000, 0x100_0000), 0x100_0000);
        assert!(is_aligned(0x10_0000, 0x10_0000));
        assert!(!is_aligned(0x10_1000, 0x10_0000));

        assert_eq!(checked_round_up(0x2001, 0x1000), Some(0x3000));
        assert_eq!(checked_round_up(u64::MAX - 0xfff, 0x1000), Some(u64::MAX - 0xfff));
        assert_eq!(checked_round_up(u64::MAX - 0xffe, 0x1000), None);
    }
}
