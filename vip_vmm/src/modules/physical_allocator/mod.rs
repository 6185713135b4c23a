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

mod buddy_heap;
mod dynamic;

pub use buddy_heap::BuddyHeapModule;
pub use dynamic::DynamicPageModule;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    util::round_up,
    video_memory::{AllocFlags, CacheOp},
    VmmResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    /// Carve-out that only hands out physically contiguous memory
    Heap,

    /// Pages from the system allocator, possibly scattered
    Dynamic,
}

/// Physical memory handed out by an allocator module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Start of every physically contiguous run, in device-virtual order
    pub physical: Vec<u64>,

    /// Size of every run
    pub sizes: Vec<u64>,

    /// Requested size
    pub size: u64,

    /// Bytes the allocator actually reserved for this allocation
    pub reserved: u64,
}

impl Allocation {
    pub fn is_contiguous(&self) -> bool {
        self.physical.len() == 1
    }
}

/// Source of physical video memory
pub trait PhysicalAllocatorModule: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> AllocatorKind;

    /// Allocates at least `size` bytes, the first run is aligned to `align`.
    ///
    /// Fails with `OutOfMemory` if this allocator cannot satisfy `flags`,
    /// the caller then tries the next allocator or weaker flags.
    fn allocate(&self, size: u64, align: u64, flags: AllocFlags) -> VmmResult<Allocation>;

    fn free(&self, allocation: &Allocation) -> VmmResult<()>;

    fn flush_cache(&self, allocation: &Allocation, op: CacheOp) -> VmmResult<()>;

    /// Maps the allocation into the kernel or user address space of the CPU
    fn map_logical(&self, allocation: &Allocation, user: bool) -> VmmResult<u64>;

    fn unmap_logical(&self, allocation: &Allocation, logical: u64) -> VmmResult<()>;
}

/// Bump allocator for simulated CPU mappings
pub(crate) struct LogicalWindow {
    next: AtomicU64,
}

impl LogicalWindow {
    pub(crate) const fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    pub(crate) fn map(&self, bytes: u64) -> u64 {
        self.next
            .fetch_add(round_up(bytes.max(1), 0x1000), Ordering::SeqCst)
    }
}
