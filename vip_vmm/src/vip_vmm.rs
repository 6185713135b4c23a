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

use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::{
    mmu::{ContextMapping, MmuManager},
    modules::{
        device_memory::DeviceMemoryModule, mmu_hardware::MmuHardwareModule,
        physical_allocator::PhysicalAllocatorModule,
    },
    registry::Database,
    video_memory::{AllocFlags, CacheOp, MemoryInfo, VideoMemoryManager},
    VmmConfig, VmmError, VmmResult,
};

/// Device-virtual mapping of caller supplied pages, created by [`VipVmm::mmu_map`]
pub struct RawMapping<D: DeviceMemoryModule> {
    pid: u64,
    mapping: ContextMapping<D>,
}

impl<D: DeviceMemoryModule> RawMapping<D> {
    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn virtual_address(&self) -> u64 {
        self.mapping.virtual_address()
    }
}

/// Video memory and MMU core of one device.
///
/// Owns the MMU contexts, the memory database and the raw mapping database.
/// All entry points may be called from any thread.
pub struct VipVmm<D: DeviceMemoryModule + 'static> {
    mmu: Arc<MmuManager<D>>,
    memory: VideoMemoryManager<D>,
    raw_mappings: Database<RawMapping<D>>,
}

impl<D: DeviceMemoryModule + 'static> VipVmm<D> {
    /// `device` provides page table storage, `allocators` the video memory itself
    /// (heaps are tried before dynamic allocators)
    pub fn new(
        config: VmmConfig,
        device: Arc<D>,
        allocators: Vec<Arc<dyn PhysicalAllocatorModule>>,
    ) -> VmmResult<Self> {
        let mmu = Arc::new(MmuManager::new(device, &config)?);
        let memory = VideoMemoryManager::new(mmu.clone(), allocators)?;

        let recycler = mmu.clone();
        let raw_mappings = Database::with_callback(
            config.memory_capacity,
            config.memory_chunk,
            move |index: u32, raw: Arc<RawMapping<D>>| {
                trace!("Raw mapping {} is no longer used", index);
                if let Err(err) = recycler.unmap(&raw.mapping) {
                    warn!("Raw mapping {} stays in the page table: {}", index, err);
                }
            },
        )?;

        info!("VIP video memory core ready ({} core(s))", config.core_count);
        Ok(Self {
            mmu,
            memory,
            raw_mappings,
        })
    }

    pub fn config(&self) -> &VmmConfig {
        self.mmu.config()
    }

    pub fn mmu(&self) -> &Arc<MmuManager<D>> {
        &self.mmu
    }

    pub fn memory(&self) -> &VideoMemoryManager<D> {
        &self.memory
    }

    /// Maps caller owned physical runs into the MMU context of `pid`.
    ///
    /// Returns the handle for [`VipVmm::mmu_unmap`] and the device-virtual address.
    pub fn mmu_map(
        &self,
        pid: u64,
        physical: &[u64],
        sizes: &[u64],
        writable: bool,
        avoid_4g: bool,
    ) -> VmmResult<(u32, u64)> {
        let mapping = self.mmu.map(pid, physical, sizes, writable, avoid_4g)?;
        let virtual_address = mapping.virtual_address();

        let raw = Arc::new(RawMapping { pid, mapping });
        let handle = match self.raw_mappings.insert_or_expand_arc(raw.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                self.mmu.unmap(&raw.mapping)?;
                return Err(err);
            }
        };

        debug!(
            "Raw mapping {} of process {} at {:#x}",
            handle, pid, virtual_address
        );
        Ok((handle, virtual_address))
    }

    pub fn mmu_unmap(&self, handle: u32) -> VmmResult<()> {
        self.raw_mappings.remove(handle, false)
    }

    pub fn mem_allocate(
        &self,
        size: u64,
        align: u64,
        flags: AllocFlags,
        pid: u64,
    ) -> VmmResult<(u32, Option<u64>, u64)> {
        self.memory.allocate(size, align, flags, pid)
    }

    pub fn mem_free(&self, id: u32) -> VmmResult<()> {
        self.memory.free(id)
    }

    pub fn mem_wrap_physical(
        &self,
        physical: &[u64],
        sizes: &[u64],
        flags: AllocFlags,
        pid: u64,
    ) -> VmmResult<u32> {
        self.memory.wrap_user_physical(physical, sizes, flags, pid)
    }

    pub fn mem_flush_cache(&self, id: u32, op: CacheOp) -> VmmResult<()> {
        self.memory.flush_cache(id, op)
    }

    pub fn mem_get_info(&self, id: u32) -> VmmResult<MemoryInfo> {
        self.memory.get_info(id)
    }

    /// Cleans up after a dying process: frees its video memory and raw mappings
    /// and drops its MMU context once they are gone.
    ///
    /// Returns the number of freed video memory objects.
    pub fn mem_free_process(&self, pid: u64) -> VmmResult<usize> {
        let freed = self.memory.free_process(pid)?;

        for (handle, raw) in self.raw_mappings.collect_used()? {
            if raw.pid != pid {
                continue;
            }
            match self.raw_mappings.remove(handle, false) {
                Ok(()) | Err(VmmError::InvalidArgument) => {}
                Err(err) => return Err(err),
            }
        }

        if self.mmu.config().mmu_enabled() && !self.mmu.config().shared_page_table {
            self.release_context(pid)?;
        }

        Ok(freed)
    }

    /// Switches the MMU to the page table of `pid`
    pub fn activate_context<H: MmuHardwareModule>(&self, pid: u64, hardware: &H) -> VmmResult<()> {
        let (index, context) = self.mmu.acquire(pid)?;
        let res = context.activate(hardware);
        self.mmu.release(index)?;
        res
    }

    /// Drops the MMU context of `pid`, it stays alive until its last mapping is gone
    pub fn release_context(&self, pid: u64) -> VmmResult<()> {
        match self.mmu.remove(pid) {
            // the process never mapped anything
            Err(VmmError::InvalidArgument) => Ok(()),
            res => res,
        }
    }
}
