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

// code modified from: https://github.com/rcore-os/buddy_system_allocator

use core::{
    array,
    cmp::{max, min},
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use log::{debug, trace, warn};

use super::{AllocatorKind, Allocation, LogicalWindow, PhysicalAllocatorModule};
use crate::{
    video_memory::{AllocFlags, CacheOp},
    VmmError, VmmResult,
};

/// Smallest block the heap hands out
const MIN_BLOCK: u64 = 0x1000;

/// Free lists of physical blocks, one list per power of two
struct FreeLists<const ORDER: usize> {
    free_list: [Vec<u64>; ORDER],
}

impl<const ORDER: usize> FreeLists<ORDER> {
    fn new() -> Self {
        Self {
            free_list: array::from_fn(|_| Vec::new()),
        }
    }

    /// Adds `[start, end)` to the heap
    fn add_region(&mut self, start: u64, end: u64) {
        let mut current_start = start;

        while current_start + MIN_BLOCK <= end {
            let lowbit = if current_start == 0 {
                prev_power_of_two(end - current_start)
            } else {
                current_start & (!current_start + 1)
            };
            let size = min(
                min(lowbit, prev_power_of_two(end - current_start)),
                1 << (ORDER - 1),
            );

            self.free_list[size.trailing_zeros() as usize].push(current_start);
            current_start += size;
        }
    }

    fn alloc(&mut self, size: u64) -> Option<u64> {
        let class = size.trailing_zeros() as usize;
        for i in class..self.free_list.len() {
            // Find the first non-empty size class
            if !self.free_list[i].is_empty() {
                // Split buffers
                trace!("Allocate: Have to split {} bucket(s)", (class + 1..i + 1).len());
                for j in (class + 1..i + 1).rev() {
                    let block = self.free_list[j].pop()?;
                    self.free_list[j - 1].push(block + (1 << (j - 1)));
                    self.free_list[j - 1].push(block);
                }

                return self.free_list[class].pop();
            }
        }
        None
    }

    fn dealloc(&mut self, block: u64, size: u64) {
        let class = size.trailing_zeros() as usize;

        // Put back into free list
        self.free_list[class].push(block);

        // Merge free buddy lists
        let mut current = block;
        let mut current_class = class;

        while current_class < self.free_list.len() - 1 {
            let buddy = current ^ (1 << current_class);
            let found = self.free_list[current_class]
                .iter()
                .position(|other| *other == buddy);

            // Free buddy found
            if let Some(pos) = found {
                self.free_list[current_class].swap_remove(pos);
                if let Some(pos) = self.free_list[current_class]
                    .iter()
                    .position(|other| *other == current)
                {
                    self.free_list[current_class].swap_remove(pos);
                }
                current = min(current, buddy);
                current_class += 1;
                self.free_list[current_class].push(current);
            } else {
                break;
            }
        }
    }

    fn free_bytes(&self) -> u64 {
        self.free_list
            .iter()
            .enumerate()
            .map(|(class, list)| list.len() as u64 * (1 << class))
            .sum()
    }
}

/// Contiguous carve-out managed as a buddy system.
///
/// Every block is aligned to its own size, so contiguity units are satisfied
/// by aligning the block to the unit.
pub struct BuddyHeapModule<const ORDER: usize> {
    name: String,
    base: u64,
    size: u64,
    lists: Mutex<FreeLists<ORDER>>,
    kernel_window: u64,
    user_window: LogicalWindow,
    cache_ops: AtomicUsize,
}

impl<const ORDER: usize> BuddyHeapModule<ORDER> {
    /// Creates a heap over `[base, base + size)`.
    ///
    /// The kernel sees the heap linearly mapped at `kernel_window`.
    pub fn new(name: &str, base: u64, size: u64, kernel_window: u64) -> VmmResult<Self> {
        if size < MIN_BLOCK || base % MIN_BLOCK != 0 {
            warn!("Invalid heap {}: base={:#x}, size={:#x}", name, base, size);
            return Err(VmmError::InvalidArgument);
        }

        let mut lists = FreeLists::new();
        lists.add_region(base, base + size);
        debug!("Heap {} covers {:#x}+{:#x}", name, base, size);

        Ok(Self {
            name: name.to_string(),
            base,
            size,
            lists: Mutex::new(lists),
            kernel_window,
            user_window: LogicalWindow::new(0x7f00_0000_0000),
            cache_ops: AtomicUsize::new(0),
        })
    }

    pub fn free_bytes(&self) -> u64 {
        self.lists.lock().map(|lists| lists.free_bytes()).unwrap_or(0)
    }

    pub fn cache_op_count(&self) -> usize {
        self.cache_ops.load(Ordering::SeqCst)
    }

    fn block_size(size: u64, align: u64) -> Option<u64> {
        let size = size.checked_next_power_of_two()?;
        Some(max(size, max(align, MIN_BLOCK)))
    }
}

impl<const ORDER: usize> PhysicalAllocatorModule for BuddyHeapModule<ORDER> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Heap
    }

    fn allocate(&self, size: u64, align: u64, flags: AllocFlags) -> VmmResult<Allocation> {
        if size == 0 || !align.is_power_of_two() {
            return Err(VmmError::InvalidArgument);
        }

        let unit = flags.contiguous_unit().map_or(MIN_BLOCK, |unit| unit.size());
        let block_size = match Self::block_size(size, max(align, unit)) {
            Some(block_size) if block_size <= 1 << (ORDER - 1) && block_size <= self.size => {
                block_size
            }
            _ => {
                trace!("Heap {} cannot hold {:#x} bytes", self.name, size);
                return Err(VmmError::OutOfMemory);
            }
        };

        let block = self.lists.lock()?.alloc(block_size).ok_or_else(|| {
            trace!("Heap {} has no block of {:#x} bytes left", self.name, block_size);
            VmmError::OutOfMemory
        })?;

        debug!(
            "Heap {} allocated {:#x}+{:#x} (requested {:#x})",
            self.name, block, block_size, size
        );
        Ok(Allocation {
            physical: vec![block],
            sizes: vec![size],
            size,
            reserved: block_size,
        })
    }

    fn free(&self, allocation: &Allocation) -> VmmResult<()> {
        let block = *allocation.physical.first().ok_or(VmmError::InvalidArgument)?;
        if block < self.base || block + allocation.reserved > self.base + self.size {
            warn!("Block {:#x} does not belong to heap {}", block, self.name);
            return Err(VmmError::InvalidArgument);
        }

        self.lists.lock()?.dealloc(block, allocation.reserved);
        trace!("Heap {} freed {:#x}", self.name, block);
        Ok(())
    }

    fn flush_cache(&self, allocation: &Allocation, op: CacheOp) -> VmmResult<()> {
        trace!(
            "Heap {} cache {:?} on {:#x}",
            self.name,
            op,
            allocation.physical[0]
        );
        self.cache_ops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn map_logical(&self, allocation: &Allocation, user: bool) -> VmmResult<u64> {
        if user {
            Ok(self.user_window.map(allocation.reserved))
        } else {
            Ok(self.kernel_window + (allocation.physical[0] - self.base))
        }
    }

    fn unmap_logical(&self, _allocation: &Allocation, logical: u64) -> VmmResult<()> {
        trace!("Heap {} unmapped logical {:#x}", self.name, logical);
        Ok(())
    }
}

fn prev_power_of_two(num: u64) -> u64 {
    1 << (u64::BITS - num.leading_zeros() - 1)
}
