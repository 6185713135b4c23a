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

//! Video memory allocator facade.
//!
//! Turns buffer requests into physical allocations, device-virtual mappings and
//! database handles. A buffer is torn down (unmapped and returned to its allocator)
//! when its handle is freed and the last user let go of it.

mod flags;

use std::sync::Arc;

use log::{debug, error, info, trace, warn};

pub use flags::{AllocFlags, CacheOp};

use crate::{
    mmu::{ContextMapping, MmuManager, PHYSICAL_ADDRESS_BITS},
    modules::{
        device_memory::DeviceMemoryModule,
        physical_allocator::{AllocatorKind, Allocation, PhysicalAllocatorModule},
    },
    registry::{Database, Pinned},
    PremappedRegion, RegionKind, VmmError, VmmResult,
};

/// Where the pages of a buffer come from
enum Backing {
    Allocated {
        allocator: Arc<dyn PhysicalAllocatorModule>,
        allocation: Allocation,
        logical: Option<u64>,
    },

    /// Caller owned pages
    Wrapped { physical: Vec<u64>, sizes: Vec<u64> },
}

/// How the device reaches a buffer
enum DeviceMapping<D: DeviceMemoryModule> {
    /// Physical address used as is
    Direct,
    Premapped(RegionKind),
    Mmu(ContextMapping<D>),
}

/// One buffer registered in the memory database
pub struct VideoMemory<D: DeviceMemoryModule> {
    owner_pid: u64,
    flags: AllocFlags,
    size: u64,
    address: u64,
    backing: Backing,
    mapping: DeviceMapping<D>,
}

impl<D: DeviceMemoryModule> VideoMemory<D> {
    pub fn owner_pid(&self) -> u64 {
        self.owner_pid
    }

    pub fn flags(&self) -> AllocFlags {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Address the device uses for this buffer
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn logical(&self) -> Option<u64> {
        match &self.backing {
            Backing::Allocated { logical, .. } => *logical,
            Backing::Wrapped { .. } => None,
        }
    }

    /// Physical runs of the buffer
    pub fn physical(&self) -> (&[u64], &[u64]) {
        match &self.backing {
            Backing::Allocated { allocation, .. } => (&allocation.physical, &allocation.sizes),
            Backing::Wrapped { physical, sizes } => (physical, sizes),
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self.backing, Backing::Wrapped { .. })
    }

    pub fn is_mmu_mapped(&self) -> bool {
        matches!(self.mapping, DeviceMapping::Mmu(_))
    }

    pub fn premapped_region(&self) -> Option<RegionKind> {
        match self.mapping {
            DeviceMapping::Premapped(kind) => Some(kind),
            _ => None,
        }
    }

    /// Name of the allocator module that produced the pages
    pub fn allocator_name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Allocated { allocator, .. } => Some(allocator.name()),
            Backing::Wrapped { .. } => None,
        }
    }

    pub fn info(&self) -> MemoryInfo {
        MemoryInfo {
            logical: self.logical(),
            physical: self.physical().0[0],
            virtual_address: self.address,
            size: self.size,
            owner_pid: self.owner_pid,
        }
    }

    /// Undoes the device mapping and returns the pages, keeps going on errors
    fn release(&self, mmu: &MmuManager<D>) -> VmmResult<()> {
        let mut res = Ok(());

        if let DeviceMapping::Mmu(mapping) = &self.mapping {
            if let Err(err) = mmu.unmap(mapping) {
                error!(
                    "Could not unmap video memory at {:#x}: {}",
                    self.address, err
                );
                res = Err(err);
            }
        }

        if let Backing::Allocated {
            allocator,
            allocation,
            logical,
        } = &self.backing
        {
            if let Some(logical) = logical {
                if let Err(err) = allocator.unmap_logical(allocation, *logical) {
                    error!("Could not unmap logical {:#x}: {}", logical, err);
                    res = res.and(Err(err));
                }
            }
            if let Err(err) = allocator.free(allocation) {
                error!(
                    "Could not return video memory to {}: {}",
                    allocator.name(),
                    err
                );
                res = res.and(Err(err));
            }
        }

        trace!("Released video memory at {:#x}", self.address);
        res
    }
}

/// Snapshot of a buffer's addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub logical: Option<u64>,

    /// Start of the first physical run
    pub physical: u64,
    pub virtual_address: u64,
    pub size: u64,
    pub owner_pid: u64,
}

/// Allocates, wraps and frees video memory
pub struct VideoMemoryManager<D: DeviceMemoryModule + 'static> {
    mmu: Arc<MmuManager<D>>,

    /// heaps first, then dynamic allocators, each in registration order
    allocators: Vec<Arc<dyn PhysicalAllocatorModule>>,
    memories: Database<VideoMemory<D>>,
    premapped: Vec<PremappedRegion>,
    cache_coherent: bool,
}

impl<D: DeviceMemoryModule + 'static> VideoMemoryManager<D> {
    pub fn new(
        mmu: Arc<MmuManager<D>>,
        mut allocators: Vec<Arc<dyn PhysicalAllocatorModule>>,
    ) -> VmmResult<Self> {
        let config = mmu.config().clone();

        // stable, so the registration order within one kind stays
        allocators.sort_by_key(|allocator| match allocator.kind() {
            AllocatorKind::Heap => 0,
            AllocatorKind::Dynamic => 1,
        });

        let recycler = mmu.clone();
        let memories = Database::with_callback(
            config.memory_capacity,
            config.memory_chunk,
            move |index: u32, memory: Arc<VideoMemory<D>>| {
                debug!("Video memory {} is no longer used", index);
                if memory.release(&recycler).is_err() {
                    warn!("Video memory {} was only partially released", index);
                }
            },
        )?;

        info!(
            "Video memory manager with {} allocator(s) and {} premapped region(s)",
            allocators.len(),
            config.premapped_regions.len()
        );

        Ok(Self {
            mmu,
            allocators,
            memories,
            premapped: config.premapped_regions,
            cache_coherent: config.cache_coherent,
        })
    }

    pub fn mmu(&self) -> &Arc<MmuManager<D>> {
        &self.mmu
    }

    /// Tries every allocator for every weakening of `flags`, strongest first
    fn allocate_physical(
        &self,
        size: u64,
        align: u64,
        flags: AllocFlags,
    ) -> VmmResult<(Arc<dyn PhysicalAllocatorModule>, Allocation)> {
        let mut current = Some(flags);
        while let Some(flags) = current {
            for allocator in self.allocators.iter() {
                if allocator.kind() == AllocatorKind::Heap && flags.contains(AllocFlags::NO_HEAP) {
                    continue;
                }

                match allocator.allocate(size, align, flags) {
                    Ok(allocation) => {
                        debug!(
                            "{} allocated {:#x} bytes in {} run(s) (flags={:#x})",
                            allocator.name(),
                            size,
                            allocation.physical.len(),
                            flags.bits()
                        );
                        return Ok((allocator.clone(), allocation));
                    }
                    Err(VmmError::OutOfMemory) => {
                        trace!("{} is out of memory, trying the next one", allocator.name())
                    }
                    Err(err) => {
                        warn!("{} failed: {}", allocator.name(), err);
                        return Err(err);
                    }
                }
            }
            current = flags.weaken();
        }

        warn!(
            "No allocator can provide {:#x} bytes (flags={:#x})",
            size,
            flags.bits()
        );
        Err(VmmError::OutOfMemory)
    }

    /// Physical run as seen by a device that bypasses the MMU
    fn direct_address(&self, start: u64, size: u64) -> VmmResult<(u64, DeviceMapping<D>)> {
        let bits = if self.mmu.config().va_40bit() {
            PHYSICAL_ADDRESS_BITS
        } else {
            32
        };

        match start.checked_add(size) {
            Some(end) if end <= 1 << bits => Ok((start, DeviceMapping::Direct)),
            _ => {
                warn!(
                    "{:#x}+{:#x} is not reachable with {} bit addresses",
                    start, size, bits
                );
                Err(VmmError::NotSupported)
            }
        }
    }

    /// Chooses how the device reaches the physical runs and maps them if needed
    fn map_device(
        &self,
        pid: u64,
        physical: &[u64],
        sizes: &[u64],
        flags: AllocFlags,
    ) -> VmmResult<(u64, DeviceMapping<D>)> {
        let contiguous = physical.len() == 1;

        if flags.contains(AllocFlags::NO_MMU_PAGE) {
            if !contiguous {
                error!("Scattered video memory cannot bypass the MMU");
                return Err(VmmError::Failure);
            }
            return self.direct_address(physical[0], sizes[0]);
        }

        if !self.mmu.config().mmu_enabled() {
            if !contiguous {
                warn!("Scattered video memory needs an MMU");
                return Err(VmmError::NotSupported);
            }
            return self.direct_address(physical[0], sizes[0]);
        }

        let mapping = self.mmu.map(
            pid,
            physical,
            sizes,
            !flags.contains(AllocFlags::READ_ONLY),
            flags.contains(AllocFlags::AVOID_4G),
        )?;
        Ok((mapping.virtual_address(), DeviceMapping::Mmu(mapping)))
    }

    /// Returns a half built allocation, every step runs even if an earlier one fails
    fn undo_allocation(
        allocator: &dyn PhysicalAllocatorModule,
        allocation: &Allocation,
        logical: Option<u64>,
    ) {
        if let Some(logical) = logical {
            if let Err(err) = allocator.unmap_logical(allocation, logical) {
                error!("Could not unmap logical {:#x}: {}", logical, err);
            }
        }
        if let Err(err) = allocator.free(allocation) {
            error!(
                "Could not return {:#x} to {}: {}",
                allocation.physical[0],
                allocator.name(),
                err
            );
        }
    }

    fn register(&self, memory: VideoMemory<D>) -> VmmResult<u32> {
        let memory = Arc::new(memory);
        match self.memories.insert_or_expand_arc(memory.clone()) {
            Ok(id) => Ok(id),
            Err(err) => {
                warn!("Could not register video memory: {}", err);
                if let Err(release_err) = memory.release(&self.mmu) {
                    error!(
                        "Unregistered video memory at {:#x} leaked: {}",
                        memory.address, release_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Allocates `size` bytes of video memory for process `pid`.
    ///
    /// Returns the handle, the CPU logical address (if `MAP_KERNEL` or `MAP_USER` is set)
    /// and the address the device uses.
    pub fn allocate(
        &self,
        size: u64,
        align: u64,
        flags: AllocFlags,
        pid: u64,
    ) -> VmmResult<(u32, Option<u64>, u64)> {
        if size == 0
            || size > 1 << PHYSICAL_ADDRESS_BITS
            || !align.is_power_of_two()
            || align > 1 << PHYSICAL_ADDRESS_BITS
        {
            warn!("Invalid allocation: size={:#x}, align={:#x}", size, align);
            return Err(VmmError::InvalidArgument);
        }

        let (allocator, allocation) = self.allocate_physical(size, align, flags)?;

        let logical = if flags.contains(AllocFlags::MAP_KERNEL) || flags.contains(AllocFlags::MAP_USER) {
            match allocator.map_logical(&allocation, flags.contains(AllocFlags::MAP_USER)) {
                Ok(logical) => Some(logical),
                Err(err) => {
                    warn!("Could not map video memory for the CPU: {}", err);
                    Self::undo_allocation(allocator.as_ref(), &allocation, None);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let (address, mapping) =
            match self.map_device(pid, &allocation.physical, &allocation.sizes, flags) {
                Ok(res) => res,
                Err(err) => {
                    Self::undo_allocation(allocator.as_ref(), &allocation, logical);
                    return Err(err);
                }
            };

        let id = self.register(VideoMemory {
            owner_pid: pid,
            flags,
            size,
            address,
            backing: Backing::Allocated {
                allocator,
                allocation,
                logical,
            },
            mapping,
        })?;

        debug!(
            "Video memory {} for process {}: {:#x} bytes at {:#x}",
            id, pid, size, address
        );
        Ok((id, logical, address))
    }

    /// Registers caller owned pages as video memory
    pub fn wrap_user_physical(
        &self,
        physical: &[u64],
        sizes: &[u64],
        flags: AllocFlags,
        pid: u64,
    ) -> VmmResult<u32> {
        let total = sizes
            .iter()
            .try_fold(0u64, |total, size| total.checked_add(*size));
        let size = match total {
            Some(size)
                if !physical.is_empty()
                    && physical.len() == sizes.len()
                    && sizes.iter().all(|size| *size > 0) =>
            {
                size
            }
            _ => {
                warn!("Invalid physical table to wrap");
                return Err(VmmError::InvalidArgument);
            }
        };

        let premapped = if physical.len() == 1 {
            self.premapped
                .iter()
                .find(|region| region.contains(physical[0], sizes[0]))
        } else {
            None
        };

        let (address, mapping) = match premapped {
            Some(region) => {
                trace!("{:#x} lies in premapped {:?}", physical[0], region.kind);
                (
                    region.translate(physical[0]),
                    DeviceMapping::Premapped(region.kind),
                )
            }
            None => self.map_device(pid, physical, sizes, flags)?,
        };

        let id = self.register(VideoMemory {
            owner_pid: pid,
            flags,
            size,
            address,
            backing: Backing::Wrapped {
                physical: physical.to_vec(),
                sizes: sizes.to_vec(),
            },
            mapping,
        })?;

        debug!(
            "Wrapped {} run(s) as video memory {} at {:#x}",
            physical.len(),
            id,
            address
        );
        Ok(id)
    }

    /// Drops the handle, the buffer goes away once nobody uses it anymore
    pub fn free(&self, id: u32) -> VmmResult<()> {
        self.memories.remove(id, false)
    }

    /// References the buffer of `id` until the returned guard is dropped
    pub fn pin(&self, id: u32) -> VmmResult<Pinned<'_, VideoMemory<D>>> {
        self.memories.pin(id)
    }

    pub fn flush_cache(&self, id: u32, op: CacheOp) -> VmmResult<()> {
        let memory = self.memories.pin(id)?;
        if self.cache_coherent {
            return Ok(());
        }

        match &memory.backing {
            Backing::Allocated {
                allocator,
                allocation,
                ..
            } => allocator.flush_cache(allocation, op),
            Backing::Wrapped { .. } => {
                trace!("Skip cache {:?} on wrapped video memory {}", op, id);
                Ok(())
            }
        }
    }

    pub fn get_info(&self, id: u32) -> VmmResult<MemoryInfo> {
        Ok(self.memories.pin(id)?.info())
    }

    /// Frees every buffer owned by `pid`, returns how many there were
    pub fn free_process(&self, pid: u64) -> VmmResult<usize> {
        let mut freed = 0;
        for (id, memory) in self.memories.collect_used()? {
            if memory.owner_pid != pid {
                continue;
            }

            match self.memories.remove(id, false) {
                Ok(()) => freed += 1,
                // freed concurrently
                Err(VmmError::InvalidArgument) => {}
                Err(err) => return Err(err),
            }
        }

        debug!("Freed {} video memory object(s) of process {}", freed, pid);
        Ok(freed)
    }

    pub fn count(&self) -> VmmResult<usize> {
        self.memories.len()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{AllocFlags, CacheOp, VideoMemoryManager};
    use crate::{
        mmu::MmuManager,
        modules::{
            device_memory::SimulatedDeviceMemory,
            physical_allocator::{
                AllocatorKind, Allocation, BuddyHeapModule, DynamicPageModule,
                PhysicalAllocatorModule,
            },
        },
        FeatureSet, PremappedRegion, RegionKind, VmmConfig, VmmError, VmmResult,
    };

    const HEAP_BASE: u64 = 0x8000_0000;
    const HEAP_SIZE: u64 = 0x100_0000;
    const DYNAMIC_BASE: u64 = 0x1_0000_0000;
    const KERNEL_WINDOW: u64 = 0xffff_0000_0000_0000;

    struct Fixture {
        heap: Arc<BuddyHeapModule<32>>,
        dynamic: Arc<DynamicPageModule>,
        manager: VideoMemoryManager<SimulatedDeviceMemory>,
    }

    fn fixture(config: VmmConfig) -> Fixture {
        let device = Arc::new(SimulatedDeviceMemory::new(0x4000_0000, 0x400_0000));
        let mmu = Arc::new(MmuManager::new(device, &config).unwrap());

        let heap = Arc::new(
            BuddyHeapModule::<32>::new("heap", HEAP_BASE, HEAP_SIZE, KERNEL_WINDOW).unwrap(),
        );
        let dynamic = Arc::new(DynamicPageModule::new(DYNAMIC_BASE, 0x400_0000));

        // registered dynamic first, heaps are still tried first
        let allocators = vec![
            dynamic.clone() as Arc<dyn PhysicalAllocatorModule>,
            heap.clone(),
        ];
        let manager = VideoMemoryManager::new(mmu, allocators).unwrap();

        Fixture {
            heap,
            dynamic,
            manager,
        }
    }

    fn config() -> VmmConfig {
        VmmConfig {
            address_space_size: Some(0x1_0000_0000),
            ..Default::default()
        }
    }

    fn translate(fixture: &Fixture, pid: u64, address: u64) -> Option<u64> {
        let mmu = fixture.manager.mmu();
        let (index, context) = mmu.acquire(pid).unwrap();
        let res = context.translate(address).unwrap();
        mmu.release(index).unwrap();
        res
    }

    #[test]
    fn test_allocate_from_heap() {
        let fixture = fixture(config());
        let manager = &fixture.manager;

        let (id, logical, address) = manager
            .allocate(0x3000, 0x1000, AllocFlags::MAP_KERNEL, 1)
            .unwrap();
        assert_eq!(logical, Some(KERNEL_WINDOW));

        let info = manager.get_info(id).unwrap();
        assert_eq!(info.physical, HEAP_BASE);
        assert_eq!(info.virtual_address, address);
        assert_eq!(info.size, 0x3000);
        assert_eq!(info.owner_pid, 1);
        assert_eq!(translate(&fixture, 1, address + 0x2010), Some(HEAP_BASE + 0x2010));

        manager.free(id).unwrap();
        assert_eq!(fixture.heap.free_bytes(), HEAP_SIZE);
        assert_eq!(translate(&fixture, 1, address), None);
        assert_eq!(manager.get_info(id), Err(VmmError::InvalidArgument));
    }

    #[test]
    fn test_no_heap_uses_dynamic() {
        let fixture = fixture(config());
        let (id, _, _) = fixture
            .manager
            .allocate(0x2000, 0x1000, AllocFlags::NO_HEAP, 1)
            .unwrap();
        assert_eq!(fixture.manager.get_info(id).unwrap().physical, DYNAMIC_BASE);
        assert_eq!(fixture.heap.free_bytes(), HEAP_SIZE);
    }

    #[test]
    fn test_heap_exhausted_falls_back() {
        let fixture = fixture(config());
        let manager = &fixture.manager;

        manager
            .allocate(HEAP_SIZE, 0x1000, AllocFlags::CONTIGUOUS, 1)
            .unwrap();
        assert_eq!(fixture.heap.free_bytes(), 0);

        let (id, _, _) = manager
            .allocate(0x1000, 0x1000, AllocFlags::CONTIGUOUS, 1)
            .unwrap();
        let memory = manager.pin(id).unwrap();
        assert_eq!(memory.allocator_name(), Some("dynamic"));
    }

    #[test]
    fn test_weakens_contiguity() {
        let fixture = fixture(config());
        let manager = &fixture.manager;

        // neither the 16MB heap (taken) nor the 64MB dynamic window have a free 16M unit left
        manager
            .allocate(HEAP_SIZE, 0x1000, AllocFlags::CONTIGUOUS, 1)
            .unwrap();
        manager
            .allocate(0x380_0000, 0x1000, AllocFlags::NO_HEAP, 1)
            .unwrap();

        let (id, _, address) = manager
            .allocate(0x20_0000, 0x1000, AllocFlags::CONTIGUOUS_16M, 1)
            .unwrap();
        let physical = manager.get_info(id).unwrap().physical;
        assert_eq!(physical % 0x10_0000, 0);
        assert_eq!(translate(&fixture, 1, address + 0x1234), Some(physical + 0x1234));
    }

    #[test]
    fn test_no_mmu_page() {
        let fixture = fixture(config());
        let manager = &fixture.manager;

        let (id, _, address) = manager
            .allocate(0x1000, 0x1000, AllocFlags::NO_MMU_PAGE, 1)
            .unwrap();
        assert_eq!(address, HEAP_BASE);
        assert!(!manager.pin(id).unwrap().is_mmu_mapped());

        // scatter the dynamic window: pages at +0x0 and +0x2000 are free, +0x1000 is taken
        let flags = AllocFlags::NO_HEAP | AllocFlags::NO_MMU_PAGE;
        let ids: Vec<_> = (0..3)
            .map(|_| manager.allocate(0x1000, 0x1000, flags, 1).unwrap().0)
            .collect();
        manager.free(ids[0]).unwrap();
        manager.free(ids[2]).unwrap();
        let free_before = fixture.dynamic.free_bytes();

        assert_eq!(
            manager.allocate(0x2000, 0x1000, flags, 1).err(),
            Some(VmmError::Failure)
        );
        assert_eq!(fixture.dynamic.free_bytes(), free_before);

        // 40 bit addressing still bounds the physical address
        assert_eq!(
            manager
                .wrap_user_physical(&[0xff_ffff_f000], &[0x2000], AllocFlags::NO_MMU_PAGE, 1)
                .err(),
            Some(VmmError::NotSupported)
        );
        let id = manager
            .wrap_user_physical(&[0x80_0000_0000], &[0x1000], AllocFlags::NO_MMU_PAGE, 1)
            .unwrap();
        assert_eq!(manager.get_info(id).unwrap().virtual_address, 0x80_0000_0000);
    }

    #[test]
    fn test_without_mmu() {
        let fixture = fixture(VmmConfig {
            features: FeatureSet::empty(),
            ..config()
        });
        let manager = &fixture.manager;

        let (_, _, address) = manager
            .allocate(0x4000, 0x1000, AllocFlags::NONE, 1)
            .unwrap();
        assert_eq!(address, HEAP_BASE);

        let physical = [0x2000_0000, 0x3000_0000];
        let sizes = [0x1000, 0x1000];
        assert_eq!(
            manager
                .wrap_user_physical(&physical, &sizes, AllocFlags::NONE, 1)
                .err(),
            Some(VmmError::NotSupported)
        );
    }

    #[test]
    fn test_wrap_premapped_and_mapped() {
        let fixture = fixture(VmmConfig {
            premapped_regions: vec![PremappedRegion {
                kind: RegionKind::AxiSram,
                physical: 0x5000_0000,
                size: 0x10_0000,
                virtual_address: 0xf000_0000,
            }],
            ..config()
        });
        let manager = &fixture.manager;

        let sram = manager
            .wrap_user_physical(&[0x5000_1000], &[0x1000], AllocFlags::NONE, 3)
            .unwrap();
        let memory = manager.pin(sram).unwrap();
        assert_eq!(memory.address(), 0xf000_1000);
        assert_eq!(memory.premapped_region(), Some(RegionKind::AxiSram));
        drop(memory);

        let wrapped = manager
            .wrap_user_physical(&[0x6000_0000, 0x6000_3000], &[0x1000, 0x1000], AllocFlags::NONE, 3)
            .unwrap();
        let info = manager.get_info(wrapped).unwrap();
        assert_eq!(translate(&fixture, 3, info.virtual_address + 0x1000), Some(0x6000_3000));
        assert_eq!(info.size, 0x2000);

        manager.free(wrapped).unwrap();
        assert_eq!(translate(&fixture, 3, info.virtual_address), None);
        assert_eq!(fixture.heap.free_bytes(), HEAP_SIZE);
    }

    #[test]
    fn test_flush_cache() {
        let fixture = fixture(config());
        let manager = &fixture.manager;

        let (id, _, _) = manager.allocate(0x1000, 0x1000, AllocFlags::CACHEABLE, 1).unwrap();
        manager.flush_cache(id, CacheOp::Clean).unwrap();
        assert_eq!(fixture.heap.cache_op_count(), 1);

        let wrapped = manager
            .wrap_user_physical(&[0x6000_0000], &[0x1000], AllocFlags::NONE, 1)
            .unwrap();
        manager.flush_cache(wrapped, CacheOp::Flush).unwrap();
        assert_eq!(fixture.heap.cache_op_count(), 1);

        let coherent = super::test::fixture(VmmConfig {
            cache_coherent: true,
            ..config()
        });
        let (id, _, _) = coherent
            .manager
            .allocate(0x1000, 0x1000, AllocFlags::NONE, 1)
            .unwrap();
        coherent.manager.flush_cache(id, CacheOp::Invalidate).unwrap();
        assert_eq!(coherent.heap.cache_op_count(), 0);
    }

    #[test]
    fn test_deferred_free() {
        let fixture = fixture(config());
        let manager = &fixture.manager;

        let (id, _, address) = manager.allocate(0x1000, 0x1000, AllocFlags::NONE, 1).unwrap();
        let memory = manager.pin(id).unwrap();
        manager.free(id).unwrap();

        // still mapped while pinned
        assert_eq!(translate(&fixture, 1, address), Some(HEAP_BASE));
        assert_eq!(memory.address(), address);

        drop(memory);
        assert_eq!(translate(&fixture, 1, address), None);
        assert_eq!(fixture.heap.free_bytes(), HEAP_SIZE);
    }

    #[test]
    fn test_free_process() {
        let fixture = fixture(config());
        let manager = &fixture.manager;

        for _ in 0..3 {
            manager.allocate(0x1000, 0x1000, AllocFlags::NONE, 1).unwrap();
        }
        let (other, _, _) = manager.allocate(0x1000, 0x1000, AllocFlags::NONE, 2).unwrap();

        assert_eq!(manager.free_process(1), Ok(3));
        assert_eq!(manager.count(), Ok(1));
        assert_eq!(manager.get_info(other).unwrap().owner_pid, 2);
        assert_eq!(manager.free_process(1), Ok(0));
    }

    #[test]
    fn test_invalid_requests() {
        let fixture = fixture(config());
        let manager = &fixture.manager;

        assert_eq!(
            manager.allocate(0, 0x1000, AllocFlags::NONE, 1).err(),
            Some(VmmError::InvalidArgument)
        );
        assert_eq!(
            manager.allocate(0x1000, 0x1800, AllocFlags::NONE, 1).err(),
            Some(VmmError::InvalidArgument)
        );
        assert_eq!(
            manager
                .wrap_user_physical(&[0x1000], &[0], AllocFlags::NONE, 1)
                .err(),
            Some(VmmError::InvalidArgument)
        );
        assert_eq!(manager.free(5), Err(VmmError::InvalidArgument));
    }

    /// Dynamic pages whose CPU mappings cannot be removed
    struct StickyMappings(DynamicPageModule);

    impl PhysicalAllocatorModule for StickyMappings {
        fn name(&self) -> &str {
            "sticky"
        }

        fn kind(&self) -> AllocatorKind {
            AllocatorKind::Dynamic
        }

        fn allocate(&self, size: u64, align: u64, flags: AllocFlags) -> VmmResult<Allocation> {
            self.0.allocate(size, align, flags)
        }

        fn free(&self, allocation: &Allocation) -> VmmResult<()> {
            self.0.free(allocation)
        }

        fn flush_cache(&self, allocation: &Allocation, op: CacheOp) -> VmmResult<()> {
            self.0.flush_cache(allocation, op)
        }

        fn map_logical(&self, allocation: &Allocation, user: bool) -> VmmResult<u64> {
            self.0.map_logical(allocation, user)
        }

        fn unmap_logical(&self, _allocation: &Allocation, _logical: u64) -> VmmResult<()> {
            Err(VmmError::Failure)
        }
    }

    fn sticky_manager(
        config: VmmConfig,
    ) -> (Arc<StickyMappings>, VideoMemoryManager<SimulatedDeviceMemory>) {
        let device = Arc::new(SimulatedDeviceMemory::new(0x4000_0000, 0x400_0000));
        let mmu = Arc::new(MmuManager::new(device, &config).unwrap());
        let sticky = Arc::new(StickyMappings(DynamicPageModule::new(DYNAMIC_BASE, 0x10_0000)));
        let manager = VideoMemoryManager::new(
            mmu,
            vec![sticky.clone() as Arc<dyn PhysicalAllocatorModule>],
        )
        .unwrap();
        (sticky, manager)
    }

    #[test]
    fn test_failed_allocation_returns_pages() {
        // without an MMU the device only reaches the low 4GiB
        let (sticky, manager) = sticky_manager(VmmConfig {
            features: FeatureSet::empty(),
            ..config()
        });

        assert_eq!(
            manager
                .allocate(0x2000, 0x1000, AllocFlags::MAP_KERNEL, 1)
                .err(),
            Some(VmmError::NotSupported)
        );
        assert_eq!(sticky.0.free_bytes(), 0x10_0000);
        assert_eq!(manager.count(), Ok(0));
    }

    #[test]
    fn test_release_keeps_going() {
        let (sticky, manager) = sticky_manager(config());

        let (id, logical, _) = manager
            .allocate(0x2000, 0x1000, AllocFlags::MAP_KERNEL, 1)
            .unwrap();
        assert!(logical.is_some());
        assert_eq!(sticky.0.free_bytes(), 0x10_0000 - 0x2000);

        manager.free(id).unwrap();
        assert_eq!(sticky.0.free_bytes(), 0x10_0000);
        assert_eq!(manager.count(), Ok(0));
    }
}
