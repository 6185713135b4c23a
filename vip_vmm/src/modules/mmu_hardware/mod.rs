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

mod simulated;

pub use simulated::SimulatedMmuHardware;

use crate::VmmResult;

/// Register level control of the device MMU
pub trait MmuHardwareModule: Send + Sync {
    /// Points the MMU at a page table.
    ///
    /// `address` is the MTLB, or the MMU entry block if `pd_mode` is set.
    fn set_page_table(&self, address: u64, pd_mode: bool) -> VmmResult<()>;

    /// Invalidates all cached translations
    fn flush_mmu(&self) -> VmmResult<()>;

    /// Whether the device finished all pending MMU work
    fn is_idle(&self) -> bool;
}
