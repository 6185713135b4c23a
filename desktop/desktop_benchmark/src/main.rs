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

use std::{sync::Arc, time::Instant};

use env_logger::{Builder, Env};
use vip_vmm::{
    benchmarks::{run_all_benchmarks, BenchmarkRunOptions, RunAllBenchmarkOptions, Timer},
    modules::{
        device_memory::SimulatedDeviceMemory,
        physical_allocator::{BuddyHeapModule, DynamicPageModule, PhysicalAllocatorModule},
    },
    VipVmm, VmmConfig,
};

struct DesktopTimer {
    start_time: Instant,
}

impl Timer for DesktopTimer {
    fn get_ticks_per_ms() -> u32 {
        1000
    }

    #[inline]
    fn start() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    #[inline]
    fn stop(self) -> u32 {
        (Instant::now() - self.start_time).subsec_micros()
    }
}

fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Warn)
        .format_module_path(false)
        .init();

    run_all_benchmarks::<DesktopTimer, SimulatedDeviceMemory, _>(
        get_vmm,
        BenchmarkRunOptions {
            cold_start: 10,
            machine_name: "desktop",
            repetitions: 100,
            result_buffer: &mut [0; 100],
        },
        RunAllBenchmarkOptions::all(),
    );
}

fn get_vmm() -> VipVmm<SimulatedDeviceMemory> {
    let device = Arc::new(SimulatedDeviceMemory::new(0x4000_0000, 0x1000_0000));
    let heap = Arc::new(
        BuddyHeapModule::<32>::new("heap", 0x8000_0000, 0x1000_0000, 0xffff_0000_0000_0000)
            .unwrap(),
    );
    let dynamic = Arc::new(DynamicPageModule::new(0x2_0000_0000, 0x4000_0000));

    let allocators = vec![heap as Arc<dyn PhysicalAllocatorModule>, dynamic];
    VipVmm::new(VmmConfig::default(), device, allocators).unwrap()
}
