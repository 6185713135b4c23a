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

use core::cmp::max;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use log::{debug, trace, warn};

use super::{AllocatorKind, Allocation, LogicalWindow, PhysicalAllocatorModule};
use crate::{
    util::{checked_round_up, range_allocator::RangeAllocator},
    video_memory::{AllocFlags, CacheOp},
    VmmError, VmmResult,
};

const PAGE_SIZE: u64 = 0x1000;

/// Allocates video memory page by page (or unit by unit) from system memory
pub struct DynamicPageModule {
    pages: Mutex<RangeAllocator>,
    size: u64,
    kernel_window: LogicalWindow,
    user_window: LogicalWindow,
    cache_ops: AtomicUsize,
}

impl DynamicPageModule {
    /// Simulates system memory `[base, base + size)`
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            pages: Mutex::new(RangeAllocator::new(base, size)),
            size,
            kernel_window: LogicalWindow::new(0xffff_8000_0000_0000),
            user_window: LogicalWindow::new(0x7e00_0000_0000),
            cache_ops: AtomicUsize::new(0),
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.pages.lock().map(|pages| pages.free_bytes()).unwrap_or(0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.size
    }

    pub fn cache_op_count(&self) -> usize {
        self.cache_ops.load(Ordering::SeqCst)
    }

    /// Appends a chunk, extending the last run if it is physically adjacent
    fn push_chunk(runs: &mut Vec<(u64, u64)>, start: u64, size: u64) {
        match runs.last_mut() {
            Some((run_start, run_size)) if *run_start + *run_size == start => *run_size += size,
            _ => runs.push((start, size)),
        }
    }
}

impl PhysicalAllocatorModule for DynamicPageModule {
    fn name(&self) -> &str {
        "dynamic"
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Dynamic
    }

    fn allocate(&self, size: u64, align: u64, flags: AllocFlags) -> VmmResult<Allocation> {
        if size == 0 || !align.is_power_of_two() {
            return Err(VmmError::InvalidArgument);
        }

        let unit = flags
            .contiguous_unit()
            .map_or(PAGE_SIZE, |unit| unit.size());
        let reserved = match checked_round_up(size, unit) {
            Some(reserved) if reserved <= self.size => reserved,
            _ => {
                trace!("{:#x} bytes exceed the {:#x} bytes of system memory", size, self.size);
                return Err(VmmError::OutOfMemory);
            }
        };

        let mut pages = self.pages.lock()?;
        let mut runs: Vec<(u64, u64)> = Vec::new();

        let res = if flags.contains(AllocFlags::CONTIGUOUS) {
            pages
                .allocate(reserved, max(align, unit))
                .map(|start| Self::push_chunk(&mut runs, start, reserved))
        } else {
            let mut res = Some(());
            for i in 0..reserved / unit {
                let chunk_align = if i == 0 { max(align, unit) } else { unit };
                match pages.allocate(unit, chunk_align) {
                    Some(start) => Self::push_chunk(&mut runs, start, unit),
                    None => {
                        res = None;
                        break;
                    }
                }
            }
            res
        };

        if res.is_none() {
            for (start, size) in runs {
                pages.free(start, size);
            }
            trace!("No {:#x} bytes in units of {:#x} left", reserved, unit);
            return Err(VmmError::OutOfMemory);
        }

        debug!(
            "Dynamic allocation of {:#x} bytes in {} run(s)",
            reserved,
            runs.len()
        );
        let (physical, sizes) = runs.into_iter().unzip();
        Ok(Allocation {
            physical,
            sizes,
            size,
            reserved,
        })
    }

    fn free(&self, allocation: &Allocation) -> VmmResult<()> {
        if allocation.physical.len() != allocation.sizes.len() {
            warn!("Malformed dynamic allocation");
            return Err(VmmError::InvalidArgument);
        }

        let mut pages = self.pages.lock()?;
        for (start, size) in allocation.physical.iter().zip(allocation.sizes.iter()) {
            pages.free(*start, *size);
        }
        Ok(())
    }

    fn flush_cache(&self, allocation: &Allocation, op: CacheOp) -> VmmResult<()> {
        trace!(
            "Cache {:?} on {} dynamic run(s)",
            op,
            allocation.physical.len()
        );
        self.cache_ops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn map_logical(&self, allocation: &Allocation, user: bool) -> VmmResult<u64> {
        let window = if user {
            &self.user_window
        } else {
            &self.kernel_window
        };
        Ok(window.map(allocation.reserved))
    }

    fn unmap_logical(&self, _allocation: &Allocation, logical: u64) -> VmmResult<()> {
        trace!("Unmapped dynamic logical {:#x}", logical);
        Ok(())
    }
}
