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

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use log::{error, trace, warn};

use super::{DeviceBlock, DeviceMemoryModule};
use crate::{util::range_allocator::RangeAllocator, VmmError, VmmResult};

/// Device memory window backed by host memory
pub struct SimulatedDeviceMemory {
    window: Mutex<RangeAllocator>,
    size: u64,
    flushed_bytes: AtomicUsize,
    flush_count: AtomicUsize,

    /// makes every following allocation fail
    exhausted: AtomicBool,
}

impl SimulatedDeviceMemory {
    /// Simulates the physical window `[base, base + size)`
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            window: Mutex::new(RangeAllocator::new(base, size)),
            size,
            flushed_bytes: AtomicUsize::new(0),
            flush_count: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Bytes currently handed out
    pub fn allocated_bytes(&self) -> u64 {
        match self.window.lock() {
            Ok(window) => self.size - window.free_bytes(),
            Err(_) => 0,
        }
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    pub fn flushed_bytes(&self) -> usize {
        self.flushed_bytes.load(Ordering::SeqCst)
    }

    /// Lets every allocation fail as if the window was full
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }
}

impl DeviceMemoryModule for SimulatedDeviceMemory {
    fn allocate(&self, bytes: usize, align: u64) -> VmmResult<DeviceBlock> {
        if bytes == 0 || bytes % 4 != 0 || !align.is_power_of_two() {
            warn!("Invalid device memory request: {} bytes, align {:#x}", bytes, align);
            return Err(VmmError::InvalidArgument);
        }

        if self.exhausted.load(Ordering::SeqCst) {
            warn!("Device memory exhausted (simulated)");
            return Err(VmmError::OutOfMemory);
        }

        let physical = self
            .window
            .lock()?
            .allocate(bytes as u64, align)
            .ok_or_else(|| {
                warn!("No device memory left for {} bytes", bytes);
                VmmError::OutOfMemory
            })?;

        trace!("Allocated device memory {:#x}+{:#x}", physical, bytes);
        Ok(DeviceBlock::new(
            physical,
            vec![0u32; bytes / 4].into_boxed_slice(),
        ))
    }

    fn free(&self, block: DeviceBlock) {
        trace!(
            "Freed device memory {:#x}+{:#x}",
            block.physical(),
            block.size_bytes()
        );
        match self.window.lock() {
            Ok(mut window) => window.free(block.physical(), block.size_bytes() as u64),
            Err(_) => error!("Device memory window poisoned, leaking {:#x}", block.physical()),
        }
    }

    fn flush(&self, physical: u64, bytes: usize) -> VmmResult<()> {
        trace!("Flush device memory {:#x}+{:#x}", physical, bytes);
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        self.flushed_bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }
}
