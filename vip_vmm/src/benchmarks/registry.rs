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

use super::{Benchmark, Timer};
use crate::registry::{Database, HandleMap};

const CONTROL_SEED: [u8; 16] = [
    201, 14, 96, 173, 58, 230, 7, 141, 99, 35, 188, 62, 17, 244, 120, 5,
];

#[derive(Serialize)]
pub struct RegistryBenchmarkOptions {
    elements: usize,
    buckets: usize,
}

/// Looks up a random handle and drops the reference again
pub struct DatabaseGetBenchmark {
    database: Database<u64>,
    indices: Vec<u32>,
    rng: Xoshiro128StarStar,
}

impl DatabaseGetBenchmark {
    pub fn new(elements: usize) -> Self {
        // grows a few times on the way
        let database = Database::new(16, 16).unwrap();
        let indices = (0..elements as u64)
            .map(|value| database.insert_or_expand(value).unwrap())
            .collect();

        Self {
            database,
            indices,
            rng: Xoshiro128StarStar::from_seed(CONTROL_SEED),
        }
    }
}

impl Benchmark<RegistryBenchmarkOptions> for DatabaseGetBenchmark {
    #[inline]
    fn get_name(&self) -> &'static str {
        "database_get"
    }

    #[inline]
    fn execute<T: Timer>(&mut self) -> u32 {
        let index = self.indices[self.rng.next_u32() as usize % self.indices.len()];
        let timer = T::start();

        let value = black_box(self.database.get(index).unwrap());
        self.database.unuse(index).unwrap();
        let res = timer.stop();

        drop(value);
        res
    }

    #[inline]
    fn get_bench_options(&self) -> RegistryBenchmarkOptions {
        RegistryBenchmarkOptions {
            elements: self.indices.len(),
            buckets: 0,
        }
    }
}

/// Looks up a random key, so the red-black tree of its bucket is searched
pub struct HandleMapGetBenchmark {
    map: HandleMap<u64>,
    keys: Vec<u64>,
    rng: Xoshiro128StarStar,
}

impl HandleMapGetBenchmark {
    const BUCKETS: usize = 4;

    pub fn new(elements: usize) -> Self {
        let mut rng = Xoshiro128StarStar::from_seed(CONTROL_SEED);
        let map = HandleMap::new(16, 16, Self::BUCKETS).unwrap();

        let mut keys = Vec::with_capacity(elements);
        while keys.len() < elements {
            let key = rng.next_u64();
            if map.insert_or_expand_with(key, || Ok(key)).is_ok() {
                keys.push(key);
            }
        }

        Self { map, keys, rng }
    }
}

impl Benchmark<RegistryBenchmarkOptions> for HandleMapGetBenchmark {
    #[inline]
    fn get_name(&self) -> &'static str {
        "handle_map_get"
    }

    #[inline]
    fn execute<T: Timer>(&mut self) -> u32 {
        let key = self.keys[self.rng.next_u32() as usize % self.keys.len()];
        let timer = T::start();

        let (index, value) = black_box(self.map.get(key).unwrap());
        self.map.unuse(index).unwrap();
        let res = timer.stop();

        drop(value);
        res
    }

    #[inline]
    fn get_bench_options(&self) -> RegistryBenchmarkOptions {
        RegistryBenchmarkOptions {
            elements: self.keys.len(),
            buckets: Self::BUCKETS,
        }
    }
}
