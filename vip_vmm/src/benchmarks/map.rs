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

use rand_xoshiro::{
    rand_core::{RngCore, SeedableRng},
    Xoshiro128StarStar,
};
use serde::Serialize;

use super::{Benchmark, ModuleOptions, Timer, BENCH_PID};
use crate::{modules::device_memory::DeviceMemoryModule, VipVmm};

const PAGE_SIZE: u64 = 0x1000;

/// 40 bit physical addresses
const PHYSICAL_MASK: u64 = 0xff_ffff_f000;

const LAYOUT_SEED: [u8; 16] = [
    83, 12, 201, 77, 140, 9, 250, 33, 61, 118, 4, 199, 87, 166, 42, 215,
];

/// Physical runs of `pages` pages: one contiguous run or one random page per run
fn physical_layout(pages: usize, scattered: bool) -> (Vec<u64>, Vec<u64>) {
    if !scattered {
        return (vec![0x1_0000_0000], vec![pages as u64 * PAGE_SIZE]);
    }

    let mut rng = Xoshiro128StarStar::from_seed(LAYOUT_SEED);
    let physical = (0..pages)
        .map(|_| ((rng.next_u32() as u64) << 12) & PHYSICAL_MASK)
        .collect();
    (physical, vec![PAGE_SIZE; pages])
}

#[derive(Serialize)]
pub struct MapBenchmarkOptions {
    pages: usize,
    scattered: bool,
    modules: ModuleOptions,
}

/// Maps a buffer into an existing context, unmapping it again outside the measurement
pub struct MapBenchmark<'a, D: DeviceMemoryModule + 'static> {
    vmm: &'a VipVmm<D>,
    pages: usize,
    physical: Vec<u64>,
    sizes: Vec<u64>,
    scattered: bool,
}

impl<'a, D: DeviceMemoryModule + 'static> MapBenchmark<'a, D> {
    pub fn new(vmm: &'a VipVmm<D>, pages: usize, scattered: bool) -> Self {
        let (physical, sizes) = physical_layout(pages, scattered);

        // create the context up front
        let mapping = vmm.mmu().map(BENCH_PID, &physical, &sizes, true, false).unwrap();
        vmm.mmu().unmap(&mapping).unwrap();

        Self {
            vmm,
            pages,
            physical,
            sizes,
            scattered,
        }
    }
}

impl<'a, D: DeviceMemoryModule + 'static> Benchmark<MapBenchmarkOptions> for MapBenchmark<'a, D> {
    #[inline]
    fn get_name(&self) -> &'static str {
        "map"
    }

    #[inline]
    fn execute<T: Timer>(&mut self) -> u32 {
        let mmu = self.vmm.mmu();
        let timer = T::start();

        let mapping = black_box(
            mmu.map(BENCH_PID, &self.physical, &self.sizes, true, false)
                .unwrap(),
        );
        let res = timer.stop();

        mmu.unmap(&mapping).unwrap();
        res
    }

    #[inline]
    fn get_bench_options(&self) -> MapBenchmarkOptions {
        MapBenchmarkOptions {
            pages: self.pages,
            scattered: self.scattered,
            modules: ModuleOptions::new::<D>(),
        }
    }
}

#[derive(Serialize)]
pub struct UnmapBenchmarkOptions {
    pages: usize,
    modules: ModuleOptions,
}

/// Unmaps a contiguous buffer mapped outside the measurement
pub struct UnmapBenchmark<'a, D: DeviceMemoryModule + 'static> {
    vmm: &'a VipVmm<D>,
    pages: usize,
    physical: Vec<u64>,
    sizes: Vec<u64>,
}

impl<'a, D: DeviceMemoryModule + 'static> UnmapBenchmark<'a, D> {
    pub fn new(vmm: &'a VipVmm<D>, pages: usize) -> Self {
        let (physical, sizes) = physical_layout(pages, false);
        Self {
            vmm,
            pages,
            physical,
            sizes,
        }
    }
}

impl<'a, D: DeviceMemoryModule + 'static> Benchmark<UnmapBenchmarkOptions>
    for UnmapBenchmark<'a, D>
{
    #[inline]
    fn get_name(&self) -> &'static str {
        "unmap"
    }

    #[inline]
    fn execute<T: Timer>(&mut self) -> u32 {
        let mmu = self.vmm.mmu();
        let mapping = mmu
            .map(BENCH_PID, &self.physical, &self.sizes, true, false)
            .unwrap();

        let timer = T::start();
        black_box(mmu.unmap(&mapping)).unwrap();
        timer.stop()
    }

    #[inline]
    fn get_bench_options(&self) -> UnmapBenchmarkOptions {
        UnmapBenchmarkOptions {
            pages: self.pages,
            modules: ModuleOptions::new::<D>(),
        }
    }
}
