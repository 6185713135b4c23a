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

use core::any::type_name;

#[cfg(not(test))]
use std::io::stdout;

use serde::Serialize;

mod allocate;
mod map;
mod registry;

pub use allocate::*;
pub use map::*;
pub use registry::*;

use crate::{modules::device_memory::DeviceMemoryModule, VipVmm};

pub struct RunAllBenchmarkOptions {
    pub run_map_benchmarks: bool,
    pub run_unmap_benchmarks: bool,
    pub run_registry_benchmarks: bool,
    pub run_allocate_benchmarks: bool,
}

impl Default for RunAllBenchmarkOptions {
    fn default() -> Self {
        Self {
            run_map_benchmarks: false,
            run_unmap_benchmarks: false,
            run_registry_benchmarks: false,
            run_allocate_benchmarks: false,
        }
    }
}

impl RunAllBenchmarkOptions {
    pub fn all() -> Self {
        Self {
            run_map_benchmarks: true,
            run_unmap_benchmarks: true,
            run_registry_benchmarks: true,
            run_allocate_benchmarks: true,
        }
    }
}

/// Process the benchmark buffers and mappings belong to
pub(crate) const BENCH_PID: u64 = 1;

/// Page counts of the mapping benchmarks
const MAP_PAGES: [usize; 5] = [1, 4, 16, 64, 256];

/// Element counts of the registry benchmarks
const REGISTRY_SIZES: [usize; 4] = [16, 64, 256, 1024];

/// Buffer sizes of the allocation benchmarks
const ALLOCATION_SIZES: [u64; 4] = [0x1000, 0x1_0000, 0x10_0000, 0x40_0000];

pub fn run_all_benchmarks<
    TIMER: Timer,
    D: DeviceMemoryModule + 'static,
    F: Fn() -> VipVmm<D>,
>(
    get_bench_vmm: F,
    mut run_options: BenchmarkRunOptions,
    options: RunAllBenchmarkOptions,
) {
    let mut curr_iteration = 0usize;
    let mut iteration_count = 0;

    if options.run_map_benchmarks {
        iteration_count += 2 * MAP_PAGES.len();
    }
    if options.run_unmap_benchmarks {
        iteration_count += MAP_PAGES.len();
    }
    if options.run_registry_benchmarks {
        iteration_count += 2 * REGISTRY_SIZES.len();
    }
    if options.run_allocate_benchmarks {
        iteration_count += 2 * ALLOCATION_SIZES.len();
    }

    fn handle_curr_iteration(curr_iteration: &mut usize, iteration_count: usize) {
        let percentage = (100 * *curr_iteration) / (iteration_count);
        print!("[{}%] ", percentage);

        *curr_iteration += 1;
    }

    if options.run_map_benchmarks {
        for scattered in [false, true] {
            for pages in MAP_PAGES {
                handle_curr_iteration(&mut curr_iteration, iteration_count);
                let vmm = get_bench_vmm();
                let bench = MapBenchmark::new(&vmm, pages, scattered);
                bench.run_benchmark::<TIMER>(&mut run_options);
            }
        }
    }

    if options.run_unmap_benchmarks {
        for pages in MAP_PAGES {
            handle_curr_iteration(&mut curr_iteration, iteration_count);
            let vmm = get_bench_vmm();
            let bench = UnmapBenchmark::new(&vmm, pages);
            bench.run_benchmark::<TIMER>(&mut run_options);
        }
    }

    if options.run_registry_benchmarks {
        for size in REGISTRY_SIZES {
            handle_curr_iteration(&mut curr_iteration, iteration_count);
            let bench = DatabaseGetBenchmark::new(size);
            bench.run_benchmark::<TIMER>(&mut run_options);
        }
        for size in REGISTRY_SIZES {
            handle_curr_iteration(&mut curr_iteration, iteration_count);
            let bench = HandleMapGetBenchmark::new(size);
            bench.run_benchmark::<TIMER>(&mut run_options);
        }
    }

    if options.run_allocate_benchmarks {
        for size in ALLOCATION_SIZES {
            handle_curr_iteration(&mut curr_iteration, iteration_count);
            let vmm = get_bench_vmm();
            let bench = AllocateBenchmark::new(&vmm, size);
            bench.run_benchmark::<TIMER>(&mut run_options);
        }
        for size in ALLOCATION_SIZES {
            handle_curr_iteration(&mut curr_iteration, iteration_count);
            let vmm = get_bench_vmm();
            let bench = FreeBenchmark::new(&vmm, size);
            bench.run_benchmark::<TIMER>(&mut run_options);
        }
    }
}

pub trait Benchmark<O: Serialize> {
    fn get_name(&self) -> &'static str;

    fn get_bench_options(&self) -> O;

    /// Runs one measured iteration and returns the elapsed ticks
    fn execute<T: Timer>(&mut self) -> u32;

    #[inline(never)]
    fn run_benchmark<T: Timer>(mut self, options: &mut BenchmarkRunOptions) -> BenchmarkRunResult
    where
        Self: Sized,
    {
        assert_eq!(options.repetitions as usize, options.result_buffer.len());

        let name = self.get_name();
        print!("Running Benchmark \"{}\" with options ", name);
        #[cfg(not(test))]
        serde_json::to_writer(stdout(), &self.get_bench_options()).unwrap();
        println!();

        (0..options.cold_start).for_each(|_| {
            self.execute::<T>();
        });
        for slot in options.result_buffer.iter_mut() {
            *slot = self.execute::<T>();
        }

        print!("[BENCH-INFO] ");
        #[cfg(not(test))]
        serde_json::to_writer(
            stdout(),
            &BenchmarkRunInfo {
                bench_name: name,
                bench_options: &self.get_bench_options(),
                machine_name: options.machine_name,
                cold_start: options.cold_start,
                repetitions: options.repetitions,
                ticks_per_ms: T::get_ticks_per_ms(),
                data: &options.result_buffer,
            },
        )
        .unwrap();
        println!();

        let res = BenchmarkRunResult::from_buffer(&options.result_buffer);
        println!(
            "-> Finished {}: mean={}, min={}, max={}\n",
            name, res.mean_latency, res.min_latency, res.max_latency
        );
        res
    }
}

pub struct BenchmarkRunOptions<'a> {
    pub repetitions: u32,
    pub result_buffer: &'a mut [u32],

    pub cold_start: u32,

    pub machine_name: &'static str,
}

/// Which device memory module a benchmark ran against
#[derive(Serialize)]
pub struct ModuleOptions {
    device_memory: &'static str,
}

impl ModuleOptions {
    pub fn new<D: DeviceMemoryModule>() -> Self {
        Self {
            device_memory: type_name::<D>(),
        }
    }
}

#[derive(Serialize)]
pub struct BenchmarkRunInfo<'a, O: Serialize> {
    bench_name: &'static str,
    bench_options: &'a O,
    machine_name: &'static str,
    cold_start: u32,
    repetitions: u32,
    ticks_per_ms: u32,
    data: &'a [u32],
}

pub struct BenchmarkRunResult {
    pub mean_latency: u32,
    pub min_latency: u32,
    pub max_latency: u32,
}

impl BenchmarkRunResult {
    fn from_buffer(buffer: &[u32]) -> Self {
        let sum: u64 = buffer.iter().map(|x| *x as u64).sum();
        Self {
            mean_latency: (sum / buffer.len().max(1) as u64) as u32,
            min_latency: buffer.iter().min().copied().unwrap_or(0),
            max_latency: buffer.iter().max().copied().unwrap_or(0),
        }
    }
}

pub trait Timer {
    fn get_ticks_per_ms() -> u32;

    fn start() -> Self;

    fn stop(self) -> u32;
}
