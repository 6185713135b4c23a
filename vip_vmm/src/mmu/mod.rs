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

//! Device MMU page tables.
//!
//! The device translates addresses through a two level table: an MTLB entry covers
//! 16MB (40 bit addressing) or 1MB and points to an STLB block whose slots map pages
//! of the one page type the MTLB entry is committed to.

mod context;
mod entry;
mod page_table;
mod page_type;
mod stlb_pool;

use std::sync::Arc;

use log::{info, warn};

pub use context::{ContextHold, MmuContext};
pub use entry::{
    decode_mtlb_entry, mtlb_entry, stlb_entry, stlb_entry_physical, ENTRY_EXCEPTION,
    ENTRY_PRESENT, ENTRY_WRITABLE, MTLB_EMPTY, PHYSICAL_ADDRESS_BITS, STLB_DEFAULT, STLB_FREE,
};
pub use page_table::{MappedRange, PageInfo, PageTable, SearchMode};
pub use page_type::{page_size_parameters, PageSizeParameters, PageType};

use crate::{
    modules::device_memory::DeviceMemoryModule,
    registry::HandleMap,
    VmmConfig, VmmError, VmmResult,
};
use page_type::{MTLB_SHIFT_32BIT, MTLB_SHIFT_40BIT};

/// 4K-type STLB blocks allocated from device memory per pool refill
pub const STLB_POOL_BLOCKS: usize = 16;

/// Shape of the device-virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    va_40bit: bool,
    mtlb_shift: u32,
    mtlb_count: usize,
}

impl Geometry {
    /// `address_space_size` limits the number of MTLB entries,
    /// it has to be a multiple of the range one MTLB entry covers
    pub fn new(va_40bit: bool, address_space_size: Option<u64>) -> VmmResult<Self> {
        let (mtlb_shift, va_bits) = if va_40bit {
            (MTLB_SHIFT_40BIT, 40)
        } else {
            (MTLB_SHIFT_32BIT, 32)
        };
        let full_size = 1u64 << va_bits;

        let size = address_space_size.unwrap_or(full_size);
        if size == 0 || size > full_size || size % (1 << mtlb_shift) != 0 {
            warn!(
                "Address space size {:#x} is not a multiple of {:#x} in [{:#x}, {:#x}]",
                size,
                1u64 << mtlb_shift,
                1u64 << mtlb_shift,
                full_size
            );
            return Err(VmmError::InvalidArgument);
        }

        Ok(Self {
            va_40bit,
            mtlb_shift,
            mtlb_count: (size >> mtlb_shift) as usize,
        })
    }

    #[inline]
    pub fn va_40bit(&self) -> bool {
        self.va_40bit
    }

    #[inline]
    pub fn mtlb_shift(&self) -> u32 {
        self.mtlb_shift
    }

    #[inline]
    pub fn mtlb_count(&self) -> usize {
        self.mtlb_count
    }

    pub fn address_space_size(&self) -> u64 {
        (self.mtlb_count as u64) << self.mtlb_shift
    }

    /// First MTLB entry at or above 4GiB
    pub fn index_4g(&self) -> usize {
        1 << (32 - self.mtlb_shift)
    }

    pub fn supports(&self, page_type: PageType) -> bool {
        page_type.shift() <= self.mtlb_shift
    }

    /// STLB slots of one MTLB entry committed to `page_type`
    pub fn stlb_entries(&self, page_type: PageType) -> usize {
        debug_assert!(self.supports(page_type));
        1 << (self.mtlb_shift - page_type.shift())
    }

    /// Page types `map` may choose from, coarsest first
    pub fn page_types(&self) -> &'static [PageType] {
        PageType::coarsest_first(self.va_40bit)
    }

    /// Device-virtual address of a slot
    pub fn slot_address(&self, page_type: PageType, mtlb: usize, stlb: usize) -> u64 {
        ((mtlb as u64) << self.mtlb_shift) | ((stlb as u64) << page_type.shift())
    }

    /// Slot that maps `virtual_address`
    pub fn slot_of(&self, page_type: PageType, virtual_address: u64) -> VmmResult<(usize, usize)> {
        let mtlb = (virtual_address >> self.mtlb_shift) as usize;
        if mtlb >= self.mtlb_count {
            warn!(
                "Virtual address {:#x} is outside of the address space",
                virtual_address
            );
            return Err(VmmError::InvalidArgument);
        }

        let offset = virtual_address & ((1 << self.mtlb_shift) - 1);
        Ok((mtlb, (offset >> page_type.shift()) as usize))
    }
}

/// A mapping in one MMU context, created by [`MmuManager::map`]
pub struct ContextMapping<D: DeviceMemoryModule> {
    context_index: u32,
    context: Arc<MmuContext<D>>,
    range: MappedRange,
}

impl<D: DeviceMemoryModule> ContextMapping<D> {
    pub fn virtual_address(&self) -> u64 {
        self.range.virtual_address
    }

    pub fn range(&self) -> &MappedRange {
        &self.range
    }

    pub fn context(&self) -> &Arc<MmuContext<D>> {
        &self.context
    }
}

/// Per process MMU contexts, keyed by process id
/// (or one shared context if all processes share a page table)
pub struct MmuManager<D: DeviceMemoryModule> {
    device: Arc<D>,
    config: VmmConfig,
    contexts: HandleMap<MmuContext<D>>,
}

impl<D: DeviceMemoryModule> MmuManager<D> {
    pub fn new(device: Arc<D>, config: &VmmConfig) -> VmmResult<Self> {
        config.validate()?;

        let contexts = HandleMap::new(
            config.context_capacity,
            config.context_chunk,
            config.context_buckets,
        )?;
        info!(
            "MMU manager ready (mmu={}, va_40bit={}, pd_mode={}, shared={})",
            config.mmu_enabled(),
            config.va_40bit(),
            config.pd_mode(),
            config.shared_page_table
        );

        Ok(Self {
            device,
            config: config.clone(),
            contexts,
        })
    }

    fn context_key(&self, pid: u64) -> u64 {
        if self.config.shared_page_table {
            0
        } else {
            pid
        }
    }

    /// Returns the context of `pid`, creating it on first use.
    ///
    /// The returned slot index has to be handed back with [`MmuManager::release`].
    pub fn acquire(&self, pid: u64) -> VmmResult<(u32, Arc<MmuContext<D>>)> {
        if !self.config.mmu_enabled() {
            warn!("MMU context requested without MMU support");
            return Err(VmmError::NotSupported);
        }

        let key = self.context_key(pid);
        loop {
            match self.contexts.get(key) {
                Err(VmmError::InvalidArgument) => {}
                res => return res,
            }

            let created = self.contexts.insert_or_expand_with(key, || {
                info!("Creating MMU context {:#x}", key);
                MmuContext::new(key, self.device.clone(), &self.config)
            });
            match created {
                // a concurrent caller inserted the same key, look it up again
                Ok(_) | Err(VmmError::InvalidArgument) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn release(&self, index: u32) -> VmmResult<()> {
        self.contexts.unuse(index)
    }

    /// Maps the physical runs into the context of `pid`.
    ///
    /// The mapping keeps the context referenced until [`MmuManager::unmap`].
    pub fn map(
        &self,
        pid: u64,
        physical: &[u64],
        sizes: &[u64],
        writable: bool,
        avoid_4g: bool,
    ) -> VmmResult<ContextMapping<D>> {
        let (context_index, context) = self.acquire(pid)?;

        match context.map(physical, sizes, writable, avoid_4g) {
            Ok(range) => Ok(ContextMapping {
                context_index,
                context,
                range,
            }),
            Err(err) => {
                self.release(context_index)?;
                Err(err)
            }
        }
    }

    pub fn unmap(&self, mapping: &ContextMapping<D>) -> VmmResult<()> {
        let res = mapping.context.unmap(&mapping.range);
        self.release(mapping.context_index)?;
        res
    }

    /// Drops the context of `pid` once nobody uses it anymore
    pub fn remove(&self, pid: u64) -> VmmResult<()> {
        self.contexts.remove(self.context_key(pid), false)
    }

    pub fn context_count(&self) -> VmmResult<usize> {
        self.contexts.len()
    }

    pub fn context_expansions(&self) -> usize {
        self.contexts.expansion_count()
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{Geometry, MmuManager, PageType};
    use crate::{
        modules::device_memory::SimulatedDeviceMemory, FeatureSet, VmmConfig, VmmError,
    };

    #[test]
    fn test_geometry() {
        let geometry = Geometry::new(true, None).unwrap();
        assert_eq!(geometry.mtlb_count(), 65536);
        assert_eq!(geometry.index_4g(), 256);
        assert_eq!(geometry.stlb_entries(PageType::Page4K), 4096);
        assert_eq!(geometry.slot_address(PageType::Page64K, 2, 3), 0x203_0000);
        assert_eq!(geometry.slot_of(PageType::Page64K, 0x203_1234), Ok((2, 3)));

        let geometry = Geometry::new(false, Some(0x1000_0000)).unwrap();
        assert_eq!(geometry.mtlb_count(), 256);
        assert!(!geometry.supports(PageType::Page16M));
        assert_eq!(
            geometry.slot_of(PageType::Page4K, 0x1000_0000),
            Err(VmmError::InvalidArgument)
        );

        assert_eq!(
            Geometry::new(false, Some(0x2_0000_0000)),
            Err(VmmError::InvalidArgument)
        );
    }

    #[test]
    fn test_shared_context() {
        let device = Arc::new(SimulatedDeviceMemory::new(0x1000_0000, 0x100_0000));
        let config = VmmConfig {
            shared_page_table: true,
            address_space_size: Some(0x1_0000_0000),
            ..Default::default()
        };
        let manager = MmuManager::new(device, &config).unwrap();

        let (a_index, a) = manager.acquire(1).unwrap();
        let (b_index, b) = manager.acquire(2).unwrap();
        assert_eq!(a_index, b_index);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.context_count().unwrap(), 1);

        manager.release(a_index).unwrap();
        manager.release(b_index).unwrap();
    }

    #[test]
    fn test_mapping_keeps_context_alive() {
        let device = Arc::new(SimulatedDeviceMemory::new(0x1000_0000, 0x100_0000));
        let config = VmmConfig {
            address_space_size: Some(0x1_0000_0000),
            ..Default::default()
        };
        let manager = MmuManager::new(device, &config).unwrap();

        let mapping = manager.map(5, &[0x4000], &[0x1000], true, false).unwrap();
        manager.remove(5).unwrap();

        // removal waits for the mapping
        assert_eq!(manager.context_count().unwrap(), 1);
        assert_eq!(
            mapping.context().translate(mapping.virtual_address()),
            Ok(Some(0x4000))
        );

        manager.unmap(&mapping).unwrap();
        assert_eq!(manager.context_count().unwrap(), 0);
    }

    #[test]
    fn test_context_per_process() {
        let device = Arc::new(SimulatedDeviceMemory::new(0x1000_0000, 0x400_0000));
        let config = VmmConfig {
            context_capacity: 2,
            context_chunk: 2,
            address_space_size: Some(0x1_0000_0000),
            ..Default::default()
        };
        let manager = MmuManager::new(device.clone(), &config).unwrap();

        let handles: Vec<_> = (1..=3u64).map(|pid| manager.acquire(pid).unwrap()).collect();
        assert_eq!(manager.context_count().unwrap(), 3);
        assert_eq!(manager.context_expansions(), 1);

        let before = device.allocated_bytes();
        for (index, _) in handles.iter() {
            manager.release(*index).unwrap();
        }
        manager.remove(3).unwrap();
        drop(handles);
        // the page table of process 3 was freed
        assert!(device.allocated_bytes() < before);
        assert_eq!(manager.context_count().unwrap(), 2);
    }

    #[test]
    fn test_no_mmu() {
        let device = Arc::new(SimulatedDeviceMemory::new(0, 0x10_0000));
        let config = VmmConfig {
            features: FeatureSet::empty(),
            ..Default::default()
        };
        let manager = MmuManager::new(device, &config).unwrap();
        assert_eq!(manager.acquire(1).err(), Some(VmmError::NotSupported));
    }
}
