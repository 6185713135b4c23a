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

use crate::{
    modules::{
        device_memory::SimulatedDeviceMemory,
        physical_allocator::{BuddyHeapModule, DynamicPageModule, PhysicalAllocatorModule},
    },
    VipVmm, VmmConfig,
};

mod lifecycle;
mod registry;

pub(crate) const DEVICE_BASE: u64 = 0x4000_0000;
pub(crate) const HEAP_BASE: u64 = 0x8000_0000;
pub(crate) const HEAP_SIZE: u64 = 0x200_0000;
pub(crate) const DYNAMIC_BASE: u64 = 0x2_0000_0000;
pub(crate) const DYNAMIC_SIZE: u64 = 0x400_0000;

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 4GiB of 40 bit address space, small registries so expansions happen
pub(crate) fn get_test_config() -> VmmConfig {
    VmmConfig {
        address_space_size: Some(0x1_0000_0000),
        context_capacity: 2,
        context_chunk: 2,
        memory_capacity: 8,
        memory_chunk: 8,
        stlb_pool_blocks: 4,
        ..Default::default()
    }
}

pub(crate) struct TestVmm {
    pub(crate) device: Arc<SimulatedDeviceMemory>,
    pub(crate) heap: Arc<BuddyHeapModule<32>>,
    pub(crate) dynamic: Arc<DynamicPageModule>,
    pub(crate) vmm: VipVmm<SimulatedDeviceMemory>,
}

pub(crate) fn get_test_vmm(config: VmmConfig) -> TestVmm {
    init_logger();

    let device = Arc::new(SimulatedDeviceMemory::new(DEVICE_BASE, 0x400_0000));
    let heap = Arc::new(
        BuddyHeapModule::<32>::new("test_heap", HEAP_BASE, HEAP_SIZE, 0xffff_0000_0000_0000)
            .unwrap(),
    );
    let dynamic = Arc::new(DynamicPageModule::new(DYNAMIC_BASE, DYNAMIC_SIZE));

    let allocators = vec![
        heap.clone() as Arc<dyn PhysicalAllocatorModule>,
        dynamic.clone(),
    ];
    let vmm = VipVmm::new(config, device.clone(), allocators).unwrap();

    TestVmm {
        device,
        heap,
        dynamic,
        vmm,
    }
}
