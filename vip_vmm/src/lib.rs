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

mod error;
mod util;
mod vip_vmm;
mod vmm_config;

pub mod mmu;
pub mod modules;
pub mod registry;
pub mod video_memory;

#[cfg(test)]
mod test;

#[cfg(feature = "benchmarks")]
pub mod benchmarks;

pub use crate::error::{VmmError, VmmResult};
pub use crate::vip_vmm::{RawMapping, VipVmm};
pub use vmm_config::{Feature, FeatureSet, PremappedRegion, RegionKind, VmmConfig};
