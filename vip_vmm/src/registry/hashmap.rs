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

use std::sync::Arc;

use super::{
    rb_tree::RbForest,
    table::{Inserted, Pinned, SlotTable},
    RemoveCallback, SlotState,
};
use crate::VmmResult;

/// Reference counted map from 64 bit keys to elements.
///
/// Keys are hashed into a fixed number of buckets, each bucket is a red-black tree
/// over the slots. Slot indices stay valid across expansions.
pub struct HandleMap<T> {
    table: SlotTable<T, RbForest>,
}

impl<T: Send + Sync> HandleMap<T> {
    /// Creates a map with `capacity` slots that grows by `chunk_size` slots
    pub fn new(capacity: usize, chunk_size: usize, buckets: usize) -> VmmResult<Self> {
        Self::create(capacity, chunk_size, buckets, None)
    }

    /// Same as [`HandleMap::new`], `on_remove` is called for each recycled element
    pub fn with_callback<C: RemoveCallback<T> + 'static>(
        capacity: usize,
        chunk_size: usize,
        buckets: usize,
        on_remove: C,
    ) -> VmmResult<Self> {
        Self::create(capacity, chunk_size, buckets, Some(Box::new(on_remove)))
    }

    fn create(
        capacity: usize,
        chunk_size: usize,
        buckets: usize,
        on_remove: Option<Box<dyn RemoveCallback<T>>>,
    ) -> VmmResult<Self> {
        if buckets == 0 {
            log::warn!("HandleMap needs at least one bucket");
            return Err(crate::VmmError::InvalidArgument);
        }

        Ok(Self {
            table: SlotTable::new(capacity, chunk_size, RbForest::new(buckets), on_remove)?,
        })
    }

    /// Inserts `element` under `key`.
    ///
    /// If `key` is pending removal, it is revived and `element` is dropped.
    /// Fails with `OutOfResource` if no slot is idle.
    pub fn insert(&self, key: u64, element: T) -> VmmResult<Inserted> {
        self.table.insert_with(Some(key), move || Ok(Arc::new(element)))
    }

    /// Inserts the element `make` returns under `key`, `make` is only called if `key` is new
    pub fn insert_with<F>(&self, key: u64, make: F) -> VmmResult<Inserted>
    where
        F: FnOnce() -> VmmResult<T>,
    {
        self.table
            .insert_with(Some(key), move || make().map(Arc::new))
    }

    /// Like [`HandleMap::insert_with`], expands the map until a slot is available
    pub fn insert_or_expand_with<F>(&self, key: u64, make: F) -> VmmResult<Inserted>
    where
        F: FnOnce() -> VmmResult<T>,
    {
        self.table
            .insert_or_expand_with(Some(key), move || make().map(Arc::new))
    }

    /// Grows the map by one chunk, returns `false` if it was not full
    pub fn expand(&self) -> VmmResult<bool> {
        self.table.expand()
    }

    /// Looks up `key` and takes a reference, pair it with [`HandleMap::unuse`]
    pub fn get(&self, key: u64) -> VmmResult<(u32, Arc<T>)> {
        self.table.get_by_key(key)
    }

    /// Takes a reference on the slot at `index`
    pub fn get_by_index(&self, index: u32) -> VmmResult<Arc<T>> {
        self.table.get(index)
    }

    /// Looks up `key`, the reference is dropped with the returned guard
    pub fn pin(&self, key: u64) -> VmmResult<Pinned<'_, T>> {
        let (index, element) = self.table.get_by_key(key)?;
        Ok(Pinned::new(&self.table, index, element))
    }

    pub fn unuse(&self, index: u32) -> VmmResult<()> {
        self.table.unuse(index)
    }

    /// Removes `key`, deferred until the last reference is dropped unless `force` is set
    pub fn remove(&self, key: u64, force: bool) -> VmmResult<()> {
        self.table.remove_by_key(key, force)
    }

    /// All elements that are currently in use
    pub fn collect_used(&self) -> VmmResult<Vec<(u32, Arc<T>)>> {
        self.table.collect_used()
    }

    pub fn capacity(&self) -> VmmResult<usize> {
        self.table.capacity()
    }

    pub fn len(&self) -> VmmResult<usize> {
        self.table.len()
    }

    pub fn is_empty(&self) -> VmmResult<bool> {
        Ok(self.table.len()? == 0)
    }

    pub fn free_pos(&self) -> VmmResult<usize> {
        self.table.free_pos()
    }

    /// Number of successful expansions since creation
    pub fn expansion_count(&self) -> usize {
        self.table.expansion_count()
    }

    pub fn slot_state(&self, index: u32) -> VmmResult<(SlotState, u16)> {
        self.table.slot_state(index)
    }
}
