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

use log::warn;

use crate::{
    mmu::{Geometry, STLB_POOL_BLOCKS},
    VmmError, VmmResult,
};

/// Hardware features the core asks the device about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// The device translates addresses through its own MMU
    Mmu,

    /// 40 bit device-virtual addresses (16MB MTLB entries, 16M pages)
    Va40Bit,

    /// The hardware locates the MTLB through an in-memory entry block
    PdMode,
}

impl Feature {
    const fn bit(self) -> u32 {
        match self {
            Feature::Mmu => 1 << 0,
            Feature::Va40Bit => 1 << 1,
            Feature::PdMode => 1 << 2,
        }
    }
}

/// Set of features reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet(u32);

impl FeatureSet {
    pub const fn empty() -> Self {
        FeatureSet(0)
    }

    pub const fn with(self, feature: Feature) -> Self {
        FeatureSet(self.0 | feature.bit())
    }

    pub const fn supports(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    AxiSram,
    VipSram { core: u32 },
    Reserved,
    Heap,
}

/// A physical region that already has a fixed device-virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PremappedRegion {
    pub kind: RegionKind,
    pub physical: u64,
    pub size: u64,
    pub virtual_address: u64,
}

impl PremappedRegion {
    /// Whether `[physical, physical + size)` lies completely inside this region
    pub fn contains(&self, physical: u64, size: u64) -> bool {
        match physical.checked_add(size) {
            Some(end) => physical >= self.physical && end <= self.physical + self.size,
            None => false,
        }
    }

    pub fn translate(&self, physical: u64) -> u64 {
        debug_assert!(self.contains(physical, 1));
        self.virtual_address + (physical - self.physical)
    }
}

/// Process wide configuration of the video memory core
#[derive(Debug, Clone)]
pub struct VmmConfig {
    /// Features reported by the device
    pub features: FeatureSet,

    /// Number of NPU cores attached to this instance
    pub core_count: u32,

    /// Size of the device-virtual address space.
    ///
    /// `None` uses the whole range of the current addressing mode.
    /// Has to be a multiple of the range covered by one MTLB entry.
    pub address_space_size: Option<u64>,

    /// How many 4K-type STLB blocks are allocated from device memory at once
    pub stlb_pool_blocks: usize,

    /// Initial slot count of the MMU context map
    pub context_capacity: usize,

    /// Slots added to the MMU context map per expansion
    pub context_chunk: usize,

    /// Number of red-black trees the MMU context map hashes keys into
    pub context_buckets: usize,

    /// Initial slot count of the video memory database
    pub memory_capacity: usize,

    /// Slots added to the video memory database per expansion
    pub memory_chunk: usize,

    /// Video memory is cache coherent, page table flushes and
    /// cache maintenance are skipped
    pub cache_coherent: bool,

    /// All processes share one page table
    pub shared_page_table: bool,

    /// How often the idle state is polled after an MMU flush
    pub flush_poll_retries: u32,

    /// SRAM, carve-outs and heaps that already have device-virtual addresses
    pub premapped_regions: Vec<PremappedRegion>,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            features: FeatureSet::empty()
                .with(Feature::Mmu)
                .with(Feature::Va40Bit),
            core_count: 1,
            address_space_size: None,
            stlb_pool_blocks: STLB_POOL_BLOCKS,
            context_capacity: 16,
            context_chunk: 16,
            context_buckets: 16,
            memory_capacity: 256,
            memory_chunk: 256,
            cache_coherent: false,
            shared_page_table: false,
            flush_poll_retries: 100,
            premapped_regions: Vec::new(),
        }
    }
}

impl VmmConfig {
    pub fn mmu_enabled(&self) -> bool {
        self.features.supports(Feature::Mmu)
    }

    pub fn va_40bit(&self) -> bool {
        self.mmu_enabled() && self.features.supports(Feature::Va40Bit)
    }

    pub fn pd_mode(&self) -> bool {
        self.mmu_enabled() && self.features.supports(Feature::PdMode)
    }

    /// Page table geometry described by this configuration
    pub fn geometry(&self) -> VmmResult<Geometry> {
        Geometry::new(self.va_40bit(), self.address_space_size)
    }

    /// Checks that all values are consistent
    pub fn validate(&self) -> VmmResult<()> {
        if self.core_count == 0
            || self.stlb_pool_blocks == 0
            || self.context_capacity == 0
            || self.context_chunk == 0
            || self.context_buckets == 0
            || self.memory_capacity == 0
            || self.memory_chunk == 0
        {
            warn!("invalid configuration: counts and capacities have to be non zero");
            return Err(VmmError::InvalidArgument);
        }

        if self.context_capacity > u32::MAX as usize || self.memory_capacity > u32::MAX as usize {
            warn!("invalid configuration: registry capacity exceeds the handle range");
            return Err(VmmError::InvalidArgument);
        }

        for region in self.premapped_regions.iter() {
            if region.size == 0 || region.physical.checked_add(region.size).is_none() {
                warn!("invalid configuration: bad premapped region {:?}", region);
                return Err(VmmError::InvalidArgument);
            }
        }

        if self.mmu_enabled() {
            self.geometry()?;
        }

        Ok(())
    }
}
