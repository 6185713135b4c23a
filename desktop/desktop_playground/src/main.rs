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

use env_logger::{Builder, Env};
use log::info;
use vip_vmm::{
    modules::{
        device_memory::SimulatedDeviceMemory,
        mmu_hardware::SimulatedMmuHardware,
        physical_allocator::{BuddyHeapModule, DynamicPageModule, PhysicalAllocatorModule},
    },
    video_memory::{AllocFlags, CacheOp},
    Feature, FeatureSet, VipVmm, VmmConfig, VmmResult,
};

fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Trace)
        .format_module_path(false)
        .init();

    if let Err(err) = run() {
        eprintln!("playground failed: {}", err);
    }
}

fn run() -> VmmResult<()> {
    let config = VmmConfig {
        features: FeatureSet::empty()
            .with(Feature::Mmu)
            .with(Feature::Va40Bit)
            .with(Feature::PdMode),
        ..Default::default()
    };

    let device = Arc::new(SimulatedDeviceMemory::new(0x4000_0000, 0x100_0000));
    let heap = Arc::new(BuddyHeapModule::<32>::new(
        "reserved",
        0x8000_0000,
        0x100_0000,
        0xffff_0000_0000_0000,
    )?);
    let dynamic = Arc::new(DynamicPageModule::new(0x2_0000_0000, 0x400_0000));
    let allocators = vec![heap as Arc<dyn PhysicalAllocatorModule>, dynamic];

    let vmm = VipVmm::new(config, device, allocators)?;
    let hardware = SimulatedMmuHardware::new(3);

    let (buffer, logical, address) =
        vmm.mem_allocate(0x2_0000, 0x1000, AllocFlags::MAP_KERNEL | AllocFlags::CACHEABLE, 42)?;
    info!("buffer {} at {:#x} (cpu {:x?})", buffer, address, logical);
    vmm.mem_flush_cache(buffer, CacheOp::Clean)?;

    let scattered = vmm.mem_allocate(0x80_0000, 0x1000, AllocFlags::NO_HEAP, 42)?;
    info!("scattered buffer {} at {:#x}", scattered.0, scattered.2);

    let (handle, raw) = vmm.mmu_map(42, &[0x9000_0000, 0x9001_0000], &[0x1_0000, 0x4000], true, false)?;
    info!("raw mapping {} at {:#x}", handle, raw);

    vmm.activate_context(42, &hardware)?;
    info!("{:?}", vmm.mem_get_info(buffer)?);

    vmm.mmu_unmap(handle)?;
    vmm.mem_free(buffer)?;
    let freed = vmm.mem_free_process(42)?;
    info!("process 42 left {} buffer(s) behind", freed);

    Ok(())
}
