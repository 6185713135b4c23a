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

use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Mutex,
};

use log::trace;

use super::MmuHardwareModule;
use crate::VmmResult;

/// MMU that reports busy for a fixed number of polls after every flush
pub struct SimulatedMmuHardware {
    page_table: Mutex<Option<(u64, bool)>>,
    busy_polls_after_flush: u32,
    busy_polls_left: AtomicU32,
    flush_count: AtomicUsize,
}

impl SimulatedMmuHardware {
    pub fn new(busy_polls_after_flush: u32) -> Self {
        Self {
            page_table: Mutex::new(None),
            busy_polls_after_flush,
            busy_polls_left: AtomicU32::new(0),
            flush_count: AtomicUsize::new(0),
        }
    }

    /// Page table address and PD mode last handed to the MMU
    pub fn page_table(&self) -> Option<(u64, bool)> {
        self.page_table.lock().ok().and_then(|table| *table)
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }
}

impl MmuHardwareModule for SimulatedMmuHardware {
    fn set_page_table(&self, address: u64, pd_mode: bool) -> VmmResult<()> {
        trace!("MMU page table set to {:#x} (pd_mode={})", address, pd_mode);
        *self.page_table.lock()? = Some((address, pd_mode));
        Ok(())
    }

    fn flush_mmu(&self) -> VmmResult<()> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        self.busy_polls_left
            .store(self.busy_polls_after_flush, Ordering::SeqCst);
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.busy_polls_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err()
    }
}
