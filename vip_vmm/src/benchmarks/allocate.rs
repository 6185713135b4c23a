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

use core::hint::black_box;

use serde::Serialize;

use super::{Benchmark, ModuleOptions, Timer, BENCH_PID};
use crate::{modules::device_memory::DeviceMemoryModule, video_memory::AllocFlags, VipVmm};

#[derive(Serialize)]
pub struct AllocateBenchmarkOptions {
    size: u64,
    modules: ModuleOptions,
}

/// Allocates and maps a buffer, freeing it again outside the measurement
pub struct AllocateBenchmark<'a, D: DeviceMemoryModule + 'static> {
    vmm: &'a VipVmm<D>,
    size: u64,
}

impl<'a, D: DeviceMemoryModule + 'static> AllocateBenchmark<'a, D> {
    pub fn new(vmm: &'a VipVmm<D>, size: u64) -> Self {
        Self { vmm, size }
    }
}

impl<'a, D: DeviceMemoryModule + 'static> Benchmark<AllocateBenchmarkOptions>
    for AllocateBenchmark<'a, D>
{
    #[inline]
    fn get_name(&self) -> &'static str {
        "allocate"
    }

    #[inline]
    fn execute<T: Timer>(&mut self) -> u32 {
        let timer = T::start();
        let (id, _, _) = black_box(
            self.vmm
                .mem_allocate(self.size, 0x1000, AllocFlags::NONE, BENCH_PID)
                .unwrap(),
        );
        let res = timer.stop();

        self.vmm.mem_free(id).unwrap();
        res
    }

    #[inline]
    fn get_bench_options(&self) -> AllocateBenchmarkOptions {
        AllocateBenchmarkOptions {
            size: self.size,
            modules: ModuleOptions::new::<D>(),
        }
    }
}

/// Frees a buffer allocated outside the measurement
pub struct FreeBenchmark<'a, D: DeviceMemoryModule + 'static> {
    vmm: &'a VipVmm<D>,
    size: u64,
}

impl<'a, D: DeviceMemoryModule + 'static> FreeBenchmark<'a, D> {
    pub fn new(vmm: &'a VipVmm<D>, size: u64) -> Self {
        Self { vmm, size }
    }
}

impl<'a, D: DeviceMemoryModule + 'static> Benchmark<AllocateBenchmarkOptions>
    for FreeBenchmark<'a, D>
{
    #[inline]
    fn get_name(&self) -> &'static str {
        "free"
    }

    #[inline]
    fn execute<T: Timer>(&mut self) -> u32 {
        let (id, _, _) = self
            .vmm
            .mem_allocate(self.size, 0x1000, AllocFlags::NONE, BENCH_PID)
            .unwrap();

        let timer = T::start();
        black_box(self.vmm.mem_free(id)).unwrap();
        timer.stop()
    }

    #[inline]
    fn get_bench_options(&self) -> AllocateBenchmarkOptions {
        AllocateBenchmarkOptions {
            size: self.size,
            modules: ModuleOptions::new::<D>(),
        }
    }
}
