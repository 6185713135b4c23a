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

//! Reference counted object registries.
//!
//! Both registries share one slot table ([`table`]):
//! a growable array of slots with an idle list, guarded by a read/write lock
//! (`expand` is the only writer) plus a spinlock per slot for the reference count.
//!
//! - [`HandleMap`] indexes slots by an arbitrary 64 bit key through one red-black tree per hash bucket
//! - [`Database`] hands out dense positional indices

mod database;
mod hashmap;
mod rb_tree;
mod table;

use std::sync::Arc;

pub use database::Database;
pub use hashmap::HandleMap;
pub use table::{Inserted, Pinned};

/// Lifecycle of a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// On the idle list
    Free,

    /// Allocated and visible to `get`
    Used,

    /// Removal was requested while the slot was still referenced,
    /// the last `unuse` recycles it
    PendingRemoval,

    /// Element was handed to the cleanup callback, slot is about to return to the idle list
    Recycling,
}

/// Called exactly once per element when its slot is recycled
pub trait RemoveCallback<T>: Send + Sync {
    fn on_remove(&self, index: u32, element: Arc<T>);
}

impl<T, F: Fn(u32, Arc<T>) + Send + Sync> RemoveCallback<T> for F {
    fn on_remove(&self, index: u32, element: Arc<T>) {
        self(index, element)
    }
}
