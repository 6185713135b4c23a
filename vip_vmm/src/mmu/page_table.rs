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

use core::mem;
use std::sync::Arc;

use log::{debug, error, trace, warn};

use super::{
    entry::{
        decode_mtlb_entry, mtlb_entry, stlb_entry, stlb_entry_physical, MTLB_EMPTY,
        PHYSICAL_ADDRESS_BITS, STLB_DEFAULT, STLB_FREE,
    },
    stlb_pool::{StlbBlock, StlbPool},
    Geometry, PageType,
};
use crate::{
    modules::device_memory::{DeviceBlock, DeviceMemoryModule},
    util::{bit_array::BitArray, is_aligned, round_down, round_up},
    VmmConfig, VmmError, VmmResult,
};

/// Alignment of the MTLB in device memory
const MTLB_ALIGN: u64 = 0x1000;

/// MMU entry block: MTLB address low, MTLB address high, table mode, reserved
const ENTRY_BLOCK_WORDS: usize = 4;
const ENTRY_BLOCK_ALIGN: u64 = 64;
const TABLE_MODE_1M: u32 = 0;
const TABLE_MODE_16M: u32 = 1;

/// Where `allocate_range` looks for free slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// First fit from the start of the address space,
    /// or from the first MTLB entry at or above 4GiB if `avoid_4g` is set
    Anywhere { avoid_4g: bool },

    /// Exactly at the given slot, fails if it is not free
    AtHint { mtlb: usize, stlb: usize },
}

/// A run of STLB slots of one page type, ends are inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page_type: PageType,
    pub mtlb_start: usize,
    pub stlb_start: usize,
    pub mtlb_end: usize,
    pub stlb_end: usize,
}

impl PageInfo {
    fn new(page_type: PageType, start: (usize, usize), end: (usize, usize)) -> Self {
        Self {
            page_type,
            mtlb_start: start.0,
            stlb_start: start.1,
            mtlb_end: end.0,
            stlb_end: end.1,
        }
    }

    /// Number of slots, `entries` is the slot count of one MTLB entry
    pub fn slot_count(&self, entries: usize) -> usize {
        if self.mtlb_start == self.mtlb_end {
            self.stlb_end - self.stlb_start + 1
        } else {
            (entries - self.stlb_start)
                + (self.mtlb_end - self.mtlb_start - 1) * entries
                + self.stlb_end
                + 1
        }
    }

    /// `(mtlb, first_slot, last_slot)` for every MTLB entry of the run
    pub(crate) fn spans(self, entries: usize) -> impl Iterator<Item = (usize, usize, usize)> {
        (self.mtlb_start..=self.mtlb_end).map(move |mtlb| {
            let first = if mtlb == self.mtlb_start {
                self.stlb_start
            } else {
                0
            };
            let last = if mtlb == self.mtlb_end {
                self.stlb_end
            } else {
                entries - 1
            };
            (mtlb, first, last)
        })
    }
}

/// Everything `unmap` needs to tear a mapping down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// All allocated slots, including guard slots
    pub page_info: PageInfo,

    /// Device-virtual address of the first mapped byte
    pub virtual_address: u64,

    /// Mapped bytes, without the alignment slack of partial pages
    pub size: u64,
}

/// Where `map` places a mapping
#[derive(Debug, Clone, Copy)]
enum Placement {
    Anywhere { avoid_4g: bool },
    At { virtual_address: u64 },
}

struct MtlbCommit {
    page_type: PageType,
    block: StlbBlock,
    bitmap: BitArray,
    used_count: usize,
}

fn next_slot(slot: (usize, usize), entries: usize) -> (usize, usize) {
    if slot.1 + 1 < entries {
        (slot.0, slot.1 + 1)
    } else {
        (slot.0 + 1, 0)
    }
}

fn prev_slot(slot: (usize, usize), entries: usize) -> Option<(usize, usize)> {
    match slot {
        (0, 0) => None,
        (mtlb, 0) => Some((mtlb - 1, entries - 1)),
        (mtlb, stlb) => Some((mtlb, stlb - 1)),
    }
}

/// Pages of `page_size` a physical run touches
fn run_pages(physical: u64, size: u64, page_size: u64) -> usize {
    ((round_up(physical + size, page_size) - round_down(physical, page_size)) / page_size) as usize
}

/// Two level page table of one address space
pub struct PageTable<D: DeviceMemoryModule> {
    geometry: Geometry,
    device: Arc<D>,
    mtlb: DeviceBlock,
    commits: Vec<Option<MtlbCommit>>,
    pool: StlbPool<D>,
    entry_block: Option<DeviceBlock>,
    cache_coherent: bool,

    /// device memory written since the last flush
    dirty: Vec<(u64, usize)>,
}

impl<D: DeviceMemoryModule> PageTable<D> {
    pub fn new(device: Arc<D>, config: &VmmConfig) -> VmmResult<Self> {
        if !config.mmu_enabled() {
            warn!("Page table requested without MMU support");
            return Err(VmmError::NotSupported);
        }

        let geometry = config.geometry()?;
        let mtlb = device.allocate(geometry.mtlb_count() * 4, MTLB_ALIGN)?;

        let entry_block = if config.pd_mode() {
            match device.allocate(ENTRY_BLOCK_WORDS * 4, ENTRY_BLOCK_ALIGN) {
                Ok(mut block) => {
                    let mode = if geometry.va_40bit() {
                        TABLE_MODE_16M
                    } else {
                        TABLE_MODE_1M
                    };
                    block.words_mut().copy_from_slice(&[
                        mtlb.physical() as u32,
                        (mtlb.physical() >> 32) as u32,
                        mode,
                        0,
                    ]);
                    Some(block)
                }
                Err(err) => {
                    device.free(mtlb);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let pool = StlbPool::new(
            device.clone(),
            geometry,
            config.stlb_pool_blocks,
            mtlb.physical() >> 32,
        );

        let mut commits = Vec::new();
        commits.resize_with(geometry.mtlb_count(), || None);

        let mut table = Self {
            geometry,
            device,
            mtlb,
            commits,
            pool,
            entry_block,
            cache_coherent: config.cache_coherent,
            dirty: Vec::new(),
        };

        table.dirty.push((table.mtlb.physical(), table.mtlb.size_bytes()));
        if let Some(block) = table.entry_block.as_ref() {
            table.dirty.push((block.physical(), block.size_bytes()));
        }
        table.flush()?;

        debug!(
            "Page table with {} MTLB entries at {:#x}",
            geometry.mtlb_count(),
            table.mtlb.physical()
        );
        Ok(table)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn mtlb_address(&self) -> u64 {
        self.mtlb.physical()
    }

    /// Address the hardware is pointed at: the entry block in PD mode, the MTLB otherwise
    pub fn page_table_address(&self) -> u64 {
        self.entry_block
            .as_ref()
            .map_or(self.mtlb.physical(), |block| block.physical())
    }

    pub fn pd_mode(&self) -> bool {
        self.entry_block.is_some()
    }

    pub fn entry_block(&self) -> Option<&[u32]> {
        self.entry_block.as_ref().map(|block| block.words())
    }

    fn slot_available(&self, page_type: PageType, mtlb: usize, stlb: usize) -> bool {
        match &self.commits[mtlb] {
            None => true,
            Some(commit) => commit.page_type == page_type && !commit.bitmap.is_set(stlb),
        }
    }

    /// Reserves `count` consecutive slots of `page_type`
    pub fn allocate_range(
        &mut self,
        page_type: PageType,
        count: usize,
        mode: SearchMode,
    ) -> VmmResult<PageInfo> {
        if count == 0 {
            warn!("Empty range requested");
            return Err(VmmError::InvalidArgument);
        }
        if !self.geometry.supports(page_type) {
            warn!("{:?} pages are not supported in this addressing mode", page_type);
            return Err(VmmError::NotSupported);
        }

        let (start, end) = match mode {
            SearchMode::Anywhere { avoid_4g } => self.find_anywhere(page_type, count, avoid_4g)?,
            SearchMode::AtHint { mtlb, stlb } => self.find_at(page_type, count, (mtlb, stlb))?,
        };
        self.commit_range(page_type, start, end)?;

        trace!(
            "Allocated {} {:?} slot(s) from {:?} to {:?}",
            count,
            page_type,
            start,
            end
        );
        Ok(PageInfo::new(page_type, start, end))
    }

    fn find_anywhere(
        &self,
        page_type: PageType,
        count: usize,
        avoid_4g: bool,
    ) -> VmmResult<((usize, usize), (usize, usize))> {
        let entries = self.geometry.stlb_entries(page_type);
        let index_4g = self.geometry.index_4g();

        let first = if avoid_4g && index_4g < self.geometry.mtlb_count() {
            index_4g
        } else {
            if avoid_4g {
                debug!("Address space ends below 4GiB, searching from the start");
            }
            0
        };

        let mut run = 0;
        let mut run_start = (first, 0);
        for mtlb in first..self.geometry.mtlb_count() {
            // runs never cross 4GiB
            if mtlb == index_4g {
                run = 0;
            }

            match &self.commits[mtlb] {
                None => {
                    if run == 0 {
                        run_start = (mtlb, 0);
                    }
                    if count - run <= entries {
                        return Ok((run_start, (mtlb, count - run - 1)));
                    }
                    run += entries;
                }
                Some(commit) if commit.page_type == page_type => {
                    for stlb in 0..entries {
                        if commit.bitmap.is_set(stlb) {
                            run = 0;
                            continue;
                        }
                        if run == 0 {
                            run_start = (mtlb, stlb);
                        }
                        run += 1;
                        if run == count {
                            return Ok((run_start, (mtlb, stlb)));
                        }
                    }
                }
                Some(_) => run = 0,
            }
        }

        warn!("No run of {} free {:?} slots left", count, page_type);
        Err(VmmError::OutOfMemory)
    }

    fn find_at(
        &self,
        page_type: PageType,
        count: usize,
        start: (usize, usize),
    ) -> VmmResult<((usize, usize), (usize, usize))> {
        let entries = self.geometry.stlb_entries(page_type);
        if start.0 >= self.geometry.mtlb_count() || start.1 >= entries {
            warn!("Slot hint {:?} is outside of the page table", start);
            return Err(VmmError::InvalidArgument);
        }

        let index_4g = self.geometry.index_4g();
        let mut remaining = count;
        let (mut mtlb, mut stlb) = start;
        loop {
            if mtlb >= self.geometry.mtlb_count() || (mtlb == index_4g && mtlb != start.0) {
                warn!("{} {:?} slots at {:?} do not fit", count, page_type, start);
                return Err(VmmError::OutOfMemory);
            }

            while stlb < entries {
                if !self.slot_available(page_type, mtlb, stlb) {
                    warn!(
                        "Slot ({}, {}) is not available for {:?}",
                        mtlb, stlb, page_type
                    );
                    return Err(VmmError::OutOfMemory);
                }

                remaining -= 1;
                if remaining == 0 {
                    return Ok((start, (mtlb, stlb)));
                }
                stlb += 1;
            }

            mtlb += 1;
            stlb = 0;
        }
    }

    /// Commits every empty MTLB entry of the run and marks the slots as used
    fn commit_range(
        &mut self,
        page_type: PageType,
        start: (usize, usize),
        end: (usize, usize),
    ) -> VmmResult<()> {
        let entries = self.geometry.stlb_entries(page_type);

        // get all STLB blocks first, so a failing pool leaves the table untouched
        let mut reserved = Vec::new();
        for mtlb in start.0..=end.0 {
            if self.commits[mtlb].is_some() {
                continue;
            }
            match self.pool.reserve(page_type) {
                Ok(block) => reserved.push((mtlb, block)),
                Err(err) => {
                    for (_, block) in reserved.into_iter().rev() {
                        self.pool.release(page_type, block);
                    }
                    warn!("Could not get a {:?} STLB block: {}", page_type, err);
                    return Err(err);
                }
            }
        }

        for (mtlb, block) in reserved {
            self.pool.words_mut(&block, page_type).fill(STLB_DEFAULT);
            self.dirty.push((block.physical(), entries * 4));

            self.mtlb.words_mut()[mtlb] = mtlb_entry(block.physical(), page_type);
            self.dirty.push((self.mtlb.physical() + mtlb as u64 * 4, 4));

            self.commits[mtlb] = Some(MtlbCommit {
                page_type,
                block,
                bitmap: BitArray::new(entries),
                used_count: 0,
            });
            debug!(
                "MTLB entry {} committed to {:?} (STLB at {:#x})",
                mtlb,
                page_type,
                block.physical()
            );
        }

        for (mtlb, first, last) in PageInfo::new(page_type, start, end).spans(entries) {
            let commit = self.commits[mtlb].as_mut().ok_or(VmmError::Failure)?;
            for stlb in first..=last {
                debug_assert!(!commit.bitmap.is_set(stlb));
                commit.bitmap.set(stlb);
            }
            commit.used_count += last - first + 1;
            debug_assert_eq!(commit.used_count, commit.bitmap.count_ones());
        }

        Ok(())
    }

    fn check_range(&self, info: &PageInfo) -> VmmResult<usize> {
        if !self.geometry.supports(info.page_type) {
            return Err(VmmError::NotSupported);
        }

        let entries = self.geometry.stlb_entries(info.page_type);
        let ordered = (info.mtlb_start, info.stlb_start) <= (info.mtlb_end, info.stlb_end);
        if !ordered
            || info.mtlb_end >= self.geometry.mtlb_count()
            || info.stlb_start >= entries
            || info.stlb_end >= entries
        {
            warn!("Malformed page range {:?}", info);
            return Err(VmmError::InvalidArgument);
        }

        for mtlb in info.mtlb_start..=info.mtlb_end {
            match &self.commits[mtlb] {
                Some(commit) if commit.page_type == info.page_type => {}
                _ => {
                    error!(
                        "MTLB entry {} is not committed to {:?}",
                        mtlb, info.page_type
                    );
                    return Err(VmmError::Failure);
                }
            }
        }

        Ok(entries)
    }

    /// Releases the slots of `info`, drained MTLB entries return to empty
    pub fn free_range(&mut self, info: &PageInfo) -> VmmResult<()> {
        let entries = self.check_range(info)?;
        let page_type = info.page_type;

        for (mtlb, first, last) in info.spans(entries) {
            let Some(commit) = self.commits[mtlb].as_mut() else {
                return Err(VmmError::Failure);
            };

            let words = self.pool.words_mut(&commit.block, page_type);
            for stlb in first..=last {
                words[stlb] = STLB_FREE;
                debug_assert!(commit.bitmap.is_set(stlb), "slot ({}, {}) freed twice", mtlb, stlb);
                if commit.bitmap.is_set(stlb) {
                    commit.bitmap.clear(stlb);
                    commit.used_count -= 1;
                }
            }
            self.dirty.push((
                commit.block.physical() + first as u64 * 4,
                (last - first + 1) * 4,
            ));

            if commit.used_count == 0 {
                let block = commit.block;
                self.commits[mtlb] = None;
                self.pool.release(page_type, block);
                self.mtlb.words_mut()[mtlb] = MTLB_EMPTY;
                self.dirty.push((self.mtlb.physical() + mtlb as u64 * 4, 4));
                debug!("MTLB entry {} drained", mtlb);
            }
        }

        Ok(())
    }

    /// Writes one entry per page of the physical runs into the slots of `info`
    pub fn fill_entries(
        &mut self,
        info: &PageInfo,
        physical: &[u64],
        sizes: &[u64],
        writable: bool,
    ) -> VmmResult<()> {
        let entries = self.check_range(info)?;
        let page_type = info.page_type;
        let page_size = page_type.size();

        let mut slots = info
            .spans(entries)
            .flat_map(|(mtlb, first, last)| (first..=last).map(move |stlb| (mtlb, stlb)));

        for (start, size) in physical.iter().zip(sizes.iter()) {
            let mut page = round_down(*start, page_size);
            let end = round_up(*start + *size, page_size);

            while page < end {
                let Some((mtlb, stlb)) = slots.next() else {
                    error!("Physical runs need more than {} slots", info.slot_count(entries));
                    return Err(VmmError::Failure);
                };
                let Some(commit) = self.commits[mtlb].as_ref() else {
                    return Err(VmmError::Failure);
                };

                let block = commit.block;
                self.pool.words_mut(&block, page_type)[stlb] = stlb_entry(page, writable);
                page += page_size;
            }
        }
        debug_assert!(slots.next().is_none(), "slots left after filling {:?}", info);

        for (mtlb, first, last) in info.spans(entries) {
            if let Some(commit) = self.commits[mtlb].as_ref() {
                self.dirty.push((
                    commit.block.physical() + first as u64 * 4,
                    (last - first + 1) * 4,
                ));
            }
        }

        Ok(())
    }

    /// Coarsest page type the physical layout can be mapped with
    pub fn select_page_type(&self, physical: &[u64], sizes: &[u64]) -> VmmResult<PageType> {
        for page_type in self.geometry.page_types().iter().copied() {
            let page_size = page_type.size();

            if page_type == PageType::Page4K {
                if physical.len() == 1 || physical.iter().all(|start| is_aligned(*start, page_size)) {
                    return Ok(page_type);
                }
                break;
            }

            // a lone run only has to cover half a page, its offset goes into the guards
            let qualifies = if physical.len() == 1 {
                sizes[0] >= page_size / 2
            } else {
                physical.iter().enumerate().all(|(i, start)| {
                    is_aligned(*start, page_size)
                        && (i == 0 || *start == physical[i - 1] + round_up(sizes[i - 1], page_size))
                })
            };
            if qualifies {
                return Ok(page_type);
            }
        }

        warn!("No page type fits the physical layout {:x?}", physical);
        Err(VmmError::InvalidArgument)
    }

    fn check_runs(physical: &[u64], sizes: &[u64]) -> VmmResult<()> {
        if physical.is_empty() || physical.len() != sizes.len() {
            warn!(
                "Invalid physical table ({} addresses, {} sizes)",
                physical.len(),
                sizes.len()
            );
            return Err(VmmError::InvalidArgument);
        }

        for (start, size) in physical.iter().zip(sizes.iter()) {
            let Some(end) = start.checked_add(*size).filter(|_| *size > 0) else {
                warn!("Invalid physical run {:#x}+{:#x}", start, size);
                return Err(VmmError::InvalidArgument);
            };
            if end > 1 << PHYSICAL_ADDRESS_BITS {
                warn!("Physical run {:#x}+{:#x} exceeds 40 bits", start, size);
                return Err(VmmError::NotSupported);
            }
        }

        Ok(())
    }

    /// Maps the physical runs into one consecutive device-virtual range
    pub fn map(
        &mut self,
        physical: &[u64],
        sizes: &[u64],
        writable: bool,
        avoid_4g: bool,
    ) -> VmmResult<MappedRange> {
        self.map_with(physical, sizes, writable, Placement::Anywhere { avoid_4g })
    }

    /// Maps the physical runs again at a known device-virtual address
    pub fn map_at(
        &mut self,
        physical: &[u64],
        sizes: &[u64],
        writable: bool,
        virtual_address: u64,
    ) -> VmmResult<MappedRange> {
        self.map_with(physical, sizes, writable, Placement::At { virtual_address })
    }

    fn map_with(
        &mut self,
        physical: &[u64],
        sizes: &[u64],
        writable: bool,
        placement: Placement,
    ) -> VmmResult<MappedRange> {
        Self::check_runs(physical, sizes)?;

        let page_type = self.select_page_type(physical, sizes)?;
        let page_size = page_type.size();
        let entries = self.geometry.stlb_entries(page_type);

        let inner: usize = physical
            .iter()
            .zip(sizes.iter())
            .map(|(start, size)| run_pages(*start, *size, page_size))
            .sum();
        let last_end = physical[physical.len() - 1] + sizes[sizes.len() - 1];
        let leading_guard = !is_aligned(physical[0], page_size);
        let trailing_guard = !is_aligned(last_end, page_size);
        let total = inner + leading_guard as usize + trailing_guard as usize;

        if (total as u64).saturating_mul(page_size) > self.geometry.address_space_size() {
            warn!(
                "{} {:?} pages exceed the address space of {:#x}",
                total,
                page_type,
                self.geometry.address_space_size()
            );
            return Err(VmmError::NotSupported);
        }

        let mode = match placement {
            Placement::Anywhere { avoid_4g } => SearchMode::Anywhere { avoid_4g },
            Placement::At { virtual_address } => {
                if virtual_address & (page_size - 1) != physical[0] & (page_size - 1) {
                    warn!(
                        "Virtual address {:#x} does not match the page offset of {:#x}",
                        virtual_address, physical[0]
                    );
                    return Err(VmmError::InvalidArgument);
                }

                let slot = self
                    .geometry
                    .slot_of(page_type, round_down(virtual_address, page_size))?;
                let slot = if leading_guard {
                    prev_slot(slot, entries).ok_or(VmmError::InvalidArgument)?
                } else {
                    slot
                };
                SearchMode::AtHint {
                    mtlb: slot.0,
                    stlb: slot.1,
                }
            }
        };

        let range = self.allocate_range(page_type, total, mode)?;

        let mut inner_start = (range.mtlb_start, range.stlb_start);
        if leading_guard {
            inner_start = next_slot(inner_start, entries);
        }
        let mut inner_end = (range.mtlb_end, range.stlb_end);
        if trailing_guard {
            inner_end = prev_slot(inner_end, entries).ok_or(VmmError::Failure)?;
        }
        let inner_info = PageInfo::new(page_type, inner_start, inner_end);

        if let Err(err) = self.fill_entries(&inner_info, physical, sizes, writable) {
            self.free_range(&range)?;
            self.flush()?;
            return Err(err);
        }
        self.flush()?;

        let virtual_address = self
            .geometry
            .slot_address(page_type, inner_start.0, inner_start.1)
            + (physical[0] & (page_size - 1));
        let size = sizes.iter().sum();

        debug!(
            "Mapped {} run(s) ({:#x} bytes) as {} {:?} page(s) at {:#x}",
            physical.len(),
            size,
            inner,
            page_type,
            virtual_address
        );
        Ok(MappedRange {
            page_info: range,
            virtual_address,
            size,
        })
    }

    /// Removes a mapping created by `map`
    pub fn unmap(&mut self, range: &MappedRange) -> VmmResult<()> {
        self.free_range(&range.page_info)?;
        self.flush()?;

        debug!("Unmapped {:#x}", range.virtual_address);
        Ok(())
    }

    /// Physical address `virtual_address` translates to, walking the table like the hardware
    pub fn translate(&self, virtual_address: u64) -> Option<u64> {
        let mtlb = (virtual_address >> self.geometry.mtlb_shift()) as usize;
        if mtlb >= self.geometry.mtlb_count() {
            return None;
        }

        let (stlb_low, code) = decode_mtlb_entry(self.mtlb.words()[mtlb])?;
        let page_type = PageType::from_code(code).ok()?;
        let stlb_address = ((self.mtlb.physical() >> 32) << 32) | stlb_low as u64;

        let offset = virtual_address & ((1 << self.geometry.mtlb_shift()) - 1);
        let slot = offset >> page_type.shift();
        let word = self.pool.read(stlb_address + slot * 4)?;

        let page = stlb_entry_physical(word)?;
        Some(page + (virtual_address & (page_type.size() - 1)))
    }

    /// Writes all dirty page table memory back to the device
    pub fn flush(&mut self) -> VmmResult<()> {
        let dirty = mem::take(&mut self.dirty);
        if self.cache_coherent {
            return Ok(());
        }

        for (physical, bytes) in dirty {
            self.device.flush(physical, bytes)?;
        }
        Ok(())
    }

    pub fn mtlb_type(&self, mtlb: usize) -> Option<PageType> {
        self.commits
            .get(mtlb)
            .and_then(|commit| commit.as_ref().map(|commit| commit.page_type))
    }

    pub fn used_count(&self, mtlb: usize) -> usize {
        self.commits
            .get(mtlb)
            .and_then(|commit| commit.as_ref().map(|commit| commit.used_count))
            .unwrap_or(0)
    }

    /// Used slots of an MTLB entry in ascending order
    pub fn used_slots(&self, mtlb: usize) -> Vec<usize> {
        match self.commits.get(mtlb) {
            Some(Some(commit)) => commit.bitmap.iter_set().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_slot_used(&self, mtlb: usize, stlb: usize) -> bool {
        match self.commits.get(mtlb) {
            Some(Some(commit)) => stlb < commit.bitmap.len() && commit.bitmap.is_set(stlb),
            _ => false,
        }
    }

    pub fn mtlb_word(&self, mtlb: usize) -> u32 {
        self.mtlb.words().get(mtlb).copied().unwrap_or(MTLB_EMPTY)
    }

    pub fn stlb_word(&self, mtlb: usize, stlb: usize) -> Option<u32> {
        let commit = self.commits.get(mtlb)?.as_ref()?;
        self.pool
            .words(&commit.block, commit.page_type)
            .get(stlb)
            .copied()
    }

    /// Physical address of the STLB block of an MTLB entry
    pub fn stlb_address(&self, mtlb: usize) -> Option<u64> {
        let commit = self.commits.get(mtlb)?.as_ref()?;
        Some(commit.block.physical())
    }

    pub fn is_stlb_block_pooled(&self, page_type: PageType, physical: u64) -> bool {
        self.pool.is_free(page_type, physical)
    }

    pub fn pooled_stlb_blocks(&self, page_type: PageType) -> usize {
        self.pool.free_blocks(page_type)
    }

    pub fn stlb_chunk_count(&self) -> usize {
        self.pool.chunk_count()
    }

    /// Number of committed MTLB entries
    pub fn committed_entries(&self) -> usize {
        self.commits.iter().filter(|commit| commit.is_some()).count()
    }
}

impl<D: DeviceMemoryModule> Drop for PageTable<D> {
    fn drop(&mut self) {
        let mtlb = mem::replace(&mut self.mtlb, DeviceBlock::new(0, Box::new([])));
        self.device.free(mtlb);
        if let Some(block) = self.entry_block.take() {
            self.device.free(block);
        }
    }
}
