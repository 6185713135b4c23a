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

use core::{array, cmp::max};
use std::sync::Arc;

use log::{debug, error, trace};

use super::{entry::STLB_MIN_ALIGN, Geometry, PageType};
use crate::{
    modules::device_memory::{DeviceBlock, DeviceMemoryModule},
    VmmError, VmmResult,
};

/// Alignment of the device memory chunks the pool carves from
const CHUNK_ALIGN: u64 = 0x1000;

/// Location of one STLB block inside the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StlbBlock {
    chunk: usize,

    /// in words, relative to the chunk
    offset: usize,
    physical: u64,
}

impl StlbBlock {
    pub(crate) fn physical(&self) -> u64 {
        self.physical
    }
}

/// Pool of STLB blocks for all page types.
///
/// Only 4K-type blocks are allocated from device memory, `chunk_blocks` at a time.
/// Blocks of every coarser type are carved from one block of the next finer type.
/// Chunks are kept until the pool is dropped.
pub(crate) struct StlbPool<D: DeviceMemoryModule> {
    device: Arc<D>,
    geometry: Geometry,
    chunk_blocks: usize,

    /// upper 32 address bits every block has to share with the MTLB
    high_bits: u64,
    chunks: Vec<DeviceBlock>,
    free: [Vec<StlbBlock>; 4],
}

impl<D: DeviceMemoryModule> StlbPool<D> {
    pub(crate) fn new(device: Arc<D>, geometry: Geometry, chunk_blocks: usize, high_bits: u64) -> Self {
        debug_assert!(chunk_blocks > 0);
        Self {
            device,
            geometry,
            chunk_blocks,
            high_bits,
            chunks: Vec::new(),
            free: array::from_fn(|_| Vec::new()),
        }
    }

    /// Distance between two carved blocks of `page_type` in words
    fn stride_words(&self, page_type: PageType) -> usize {
        max(
            self.geometry.stlb_entries(page_type),
            (STLB_MIN_ALIGN / 4) as usize,
        )
    }

    /// Takes a free block of `page_type`, refilling the pool along the ladder if needed
    pub(crate) fn reserve(&mut self, page_type: PageType) -> VmmResult<StlbBlock> {
        if !self.geometry.supports(page_type) {
            return Err(VmmError::NotSupported);
        }

        if let Some(block) = self.free[page_type.ladder_index()].pop() {
            return Ok(block);
        }

        // walk down the ladder until some type has a free block
        let mut source = page_type;
        loop {
            match source.finer() {
                None => {
                    self.refill()?;
                    break;
                }
                Some(finer) => {
                    source = finer;
                    if !self.free[source.ladder_index()].is_empty() {
                        break;
                    }
                }
            }
        }

        // and carve back up
        while source != page_type {
            let target = source.coarser().ok_or(VmmError::Failure)?;
            let block = self.free[source.ladder_index()]
                .pop()
                .ok_or(VmmError::Failure)?;
            self.split(block, source, target);
            source = target;
        }

        self.free[page_type.ladder_index()]
            .pop()
            .ok_or(VmmError::Failure)
    }

    /// Returns a block of `page_type` to the free list
    pub(crate) fn release(&mut self, page_type: PageType, block: StlbBlock) {
        debug_assert!(
            !self.free[page_type.ladder_index()].contains(&block),
            "STLB block {:#x} released twice",
            block.physical
        );
        self.free[page_type.ladder_index()].push(block);
    }

    /// Carves `block` of type `from` into blocks of the next coarser type `to`
    fn split(&mut self, block: StlbBlock, from: PageType, to: PageType) {
        let source_words = self.stride_words(from);
        let stride = self.stride_words(to);
        let count = max(source_words / stride, 1);

        trace!(
            "Carving STLB block {:#x} ({:?}) into {} {:?} block(s)",
            block.physical,
            from,
            count,
            to
        );

        // reversed, so the lowest address is handed out first
        for i in (0..count).rev() {
            self.free[to.ladder_index()].push(StlbBlock {
                chunk: block.chunk,
                offset: block.offset + i * stride,
                physical: block.physical + (i * stride * 4) as u64,
            });
        }
    }

    /// Allocates a new chunk of 4K-type blocks from device memory
    fn refill(&mut self) -> VmmResult<()> {
        let block_words = self.stride_words(PageType::Page4K);
        let bytes = block_words * 4 * self.chunk_blocks;
        let chunk = self.device.allocate(bytes, CHUNK_ALIGN)?;

        let first = chunk.physical() >> 32;
        let last = (chunk.physical() + bytes as u64 - 1) >> 32;
        if first != self.high_bits || last != self.high_bits {
            error!(
                "STLB chunk {:#x}+{:#x} does not share the upper address bits {:#x} of the MTLB",
                chunk.physical(),
                bytes,
                self.high_bits
            );
            self.device.free(chunk);
            return Err(VmmError::Failure);
        }

        debug!(
            "STLB pool refilled with {} blocks at {:#x}",
            self.chunk_blocks,
            chunk.physical()
        );

        let index = self.chunks.len();
        for i in (0..self.chunk_blocks).rev() {
            self.free[PageType::Page4K.ladder_index()].push(StlbBlock {
                chunk: index,
                offset: i * block_words,
                physical: chunk.physical() + (i * block_words * 4) as u64,
            });
        }
        self.chunks.push(chunk);

        Ok(())
    }

    pub(crate) fn words(&self, block: &StlbBlock, page_type: PageType) -> &[u32] {
        let len = self.geometry.stlb_entries(page_type);
        &self.chunks[block.chunk].words()[block.offset..block.offset + len]
    }

    pub(crate) fn words_mut(&mut self, block: &StlbBlock, page_type: PageType) -> &mut [u32] {
        let len = self.geometry.stlb_entries(page_type);
        &mut self.chunks[block.chunk].words_mut()[block.offset..block.offset + len]
    }

    /// Reads the page table word at `physical`, like the hardware would
    pub(crate) fn read(&self, physical: u64) -> Option<u32> {
        self.chunks
            .iter()
            .find(|chunk| chunk.contains(physical))
            .and_then(|chunk| chunk.word_at(physical))
    }

    pub(crate) fn free_blocks(&self, page_type: PageType) -> usize {
        self.free[page_type.ladder_index()].len()
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the block at `physical` is on the free list of `page_type`
    pub(crate) fn is_free(&self, page_type: PageType, physical: u64) -> bool {
        self.free[page_type.ladder_index()]
            .iter()
            .any(|block| block.physical == physical)
    }
}

impl<D: DeviceMemoryModule> Drop for StlbPool<D> {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.device.free(chunk);
        }
    }
}
