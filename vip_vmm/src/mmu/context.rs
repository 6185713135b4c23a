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

use core::{cell::RefCell, ops::Deref};
use std::sync::Arc;

use log::{debug, error, warn};

use super::{MappedRange, PageInfo, PageTable, PageType, SearchMode};
use crate::{
    modules::{device_memory::DeviceMemoryModule, mmu_hardware::MmuHardwareModule},
    util::reentrant_lock::{ReentrantGuard, ReentrantLock},
    VmmConfig, VmmError, VmmResult,
};

/// Page table of one process (or of all processes if they share one).
///
/// Every operation takes the context lock. The lock is reentrant, so a caller
/// holding it through [`MmuContext::hold`] may keep calling into the context.
pub struct MmuContext<D: DeviceMemoryModule> {
    key: u64,
    table: ReentrantLock<RefCell<PageTable<D>>>,
    flush_poll_retries: u32,
}

/// Keeps the context locked for the current thread until dropped
pub struct ContextHold<'a, D: DeviceMemoryModule> {
    guard: ReentrantGuard<'a, RefCell<PageTable<D>>>,
}

impl<D: DeviceMemoryModule> ContextHold<'_, D> {
    /// Runs `f` on the page table while the hold is kept
    pub fn inspect<R>(&self, f: impl FnOnce(&PageTable<D>) -> R) -> VmmResult<R> {
        let table = self.guard.deref().try_borrow().map_err(|_| {
            error!("Page table is being modified");
            VmmError::Failure
        })?;
        Ok(f(&table))
    }
}

impl<D: DeviceMemoryModule> MmuContext<D> {
    pub fn new(key: u64, device: Arc<D>, config: &VmmConfig) -> VmmResult<Self> {
        let table = PageTable::new(device, config)?;
        Ok(Self {
            key,
            table: ReentrantLock::new(RefCell::new(table)),
            flush_poll_retries: config.flush_poll_retries,
        })
    }

    /// Process id this context belongs to, 0 for the shared context
    pub fn key(&self) -> u64 {
        self.key
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut PageTable<D>) -> VmmResult<R>) -> VmmResult<R> {
        let guard = self.table.lock()?;
        let mut table = guard.try_borrow_mut().map_err(|_| {
            error!("Page table of context {:#x} is already borrowed", self.key);
            VmmError::Failure
        })?;
        f(&mut table)
    }

    /// Locks the context for the current thread until the returned hold is dropped
    pub fn hold(&self) -> VmmResult<ContextHold<'_, D>> {
        Ok(ContextHold {
            guard: self.table.lock()?,
        })
    }

    pub fn map(
        &self,
        physical: &[u64],
        sizes: &[u64],
        writable: bool,
        avoid_4g: bool,
    ) -> VmmResult<MappedRange> {
        self.with_table(|table| table.map(physical, sizes, writable, avoid_4g))
    }

    pub fn map_at(
        &self,
        physical: &[u64],
        sizes: &[u64],
        writable: bool,
        virtual_address: u64,
    ) -> VmmResult<MappedRange> {
        self.with_table(|table| table.map_at(physical, sizes, writable, virtual_address))
    }

    pub fn unmap(&self, range: &MappedRange) -> VmmResult<()> {
        self.with_table(|table| table.unmap(range))
    }

    pub fn allocate_range(
        &self,
        page_type: PageType,
        count: usize,
        mode: SearchMode,
    ) -> VmmResult<PageInfo> {
        self.with_table(|table| table.allocate_range(page_type, count, mode))
    }

    pub fn free_range(&self, info: &PageInfo) -> VmmResult<()> {
        self.with_table(|table| {
            table.free_range(info)?;
            table.flush()
        })
    }

    pub fn translate(&self, virtual_address: u64) -> VmmResult<Option<u64>> {
        self.with_table(|table| Ok(table.translate(virtual_address)))
    }

    /// Points the MMU at this page table and waits until it picked it up
    pub fn activate<H: MmuHardwareModule>(&self, hardware: &H) -> VmmResult<()> {
        self.with_table(|table| {
            table.flush()?;
            hardware.set_page_table(table.page_table_address(), table.pd_mode())?;
            hardware.flush_mmu()?;

            for _ in 0..self.flush_poll_retries {
                if hardware.is_idle() {
                    debug!(
                        "Context {:#x} active (page table at {:#x})",
                        self.key,
                        table.page_table_address()
                    );
                    return Ok(());
                }
                core::hint::spin_loop();
            }

            warn!(
                "MMU did not become idle after {} polls",
                self.flush_poll_retries
            );
            Err(VmmError::Timeout)
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::MmuContext;
    use crate::{
        mmu::{PageType, SearchMode},
        modules::{device_memory::SimulatedDeviceMemory, mmu_hardware::SimulatedMmuHardware},
        Feature, FeatureSet, VmmConfig, VmmError,
    };

    fn context(config: &VmmConfig) -> MmuContext<SimulatedDeviceMemory> {
        let device = Arc::new(SimulatedDeviceMemory::new(0x2000_0000, 0x100_0000));
        MmuContext::new(7, device, config).unwrap()
    }

    fn small_config() -> VmmConfig {
        VmmConfig {
            address_space_size: Some(0x1_0000_0000),
            flush_poll_retries: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_map_translate_unmap() {
        let context = context(&small_config());
        assert_eq!(context.key(), 7);

        let range = context.map(&[0x3000], &[0x1000], true, false).unwrap();
        assert_eq!(context.translate(range.virtual_address), Ok(Some(0x3000)));

        context.unmap(&range).unwrap();
        assert_eq!(context.translate(range.virtual_address), Ok(None));
    }

    #[test]
    fn test_reentrant_hold() {
        let context = context(&small_config());

        let hold = context.hold().unwrap();
        // calls from the holding thread do not deadlock
        let info = context
            .allocate_range(PageType::Page64K, 2, SearchMode::Anywhere { avoid_4g: false })
            .unwrap();
        assert_eq!(hold.inspect(|table| table.used_count(0)), Ok(2));
        context.free_range(&info).unwrap();
        assert_eq!(hold.inspect(|table| table.mtlb_type(0)), Ok(None));
    }

    #[test]
    fn test_activate() {
        let config = VmmConfig {
            features: FeatureSet::empty()
                .with(Feature::Mmu)
                .with(Feature::Va40Bit)
                .with(Feature::PdMode),
            ..small_config()
        };
        let context = context(&config);

        let hardware = SimulatedMmuHardware::new(2);
        context.activate(&hardware).unwrap();

        let address = context.hold().unwrap().inspect(|table| table.page_table_address());
        assert_eq!(hardware.page_table(), Some((address.unwrap(), true)));
        assert_eq!(hardware.flush_count(), 1);
    }

    #[test]
    fn test_activate_timeout() {
        let context = context(&small_config());
        let hardware = SimulatedMmuHardware::new(10);
        assert_eq!(context.activate(&hardware), Err(VmmError::Timeout));
    }

    #[test]
    fn test_concurrent_maps_do_not_overlap() {
        let context = context(&small_config());

        let ranges: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4u64)
                .map(|i| {
                    let context = &context;
                    s.spawn(move || {
                        (0..8u64)
                            .map(|j| {
                                let physical = 0x10_0000 + (i * 8 + j) * 0x2000;
                                context.map(&[physical], &[0x2000], true, false).unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        let mut starts: Vec<_> = ranges.iter().map(|range| range.virtual_address).collect();
        starts.sort();
        starts.dedup();
        assert_eq!(starts.len(), 32);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= 0x2000);
        }
    }
}
