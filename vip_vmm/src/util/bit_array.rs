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

/// Fixed size bit set, used to track which STLB slots of an MTLB entry are in use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BitArray {
    words: Vec<u32>,
    len: usize,
}

impl BitArray {
    /// Creates a bit array with `len` bits, all unset
    pub(crate) fn new(len: usize) -> Self {
        BitArray {
            words: vec![0; (len + 31) / 32],
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / 32] |= 1u32 << (index % 32);
    }

    pub(crate) fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / 32] &= !(1u32 << (index % 32));
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.words[index / 32] & (1u32 << (index % 32)) != 0
    }

    pub(crate) fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Indices of all set bits in ascending order
    pub(crate) fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.is_set(*i))
    }
}
