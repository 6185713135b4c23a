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

mod simulated;

pub use simulated::SimulatedDeviceMemory;

use crate::VmmResult;

/// Physically contiguous device memory that holds page table words.
///
/// `words` is the CPU side view of `[physical, physical + size_bytes())`.
#[derive(Debug)]
pub struct DeviceBlock {
    physical: u64,
    words: Box<[u32]>,
}

impl DeviceBlock {
    pub fn new(physical: u64, words: Box<[u32]>) -> Self {
        Self { physical, words }
    }

    #[inline]
    pub fn physical(&self) -> u64 {
        self.physical
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.words.len() * 4
    }

    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[inline]
    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    /// Whether `physical` points into this block
    pub fn contains(&self, physical: u64) -> bool {
        physical >= self.physical && physical < self.physical + self.size_bytes() as u64
    }

    /// Word at `physical`, `None` if it is outside this block or unaligned
    pub fn word_at(&self, physical: u64) -> Option<u32> {
        if !self.contains(physical) || physical % 4 != 0 {
            return None;
        }
        Some(self.words[((physical - self.physical) / 4) as usize])
    }
}

/// Provider of the memory page tables live in
pub trait DeviceMemoryModule: Send + Sync {
    /// Allocates `bytes` of physically contiguous, zeroed memory aligned to `align`
    fn allocate(&self, bytes: usize, align: u64) -> VmmResult<DeviceBlock>;

    /// Returns a block to the provider
    fn free(&self, block: DeviceBlock);

    /// Writes `[physical, physical + bytes)` back so the device sees the CPU's writes
    fn flush(&self, physical: u64, bytes: usize) -> VmmResult<()>;
}
