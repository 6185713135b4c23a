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
    table::{NoIndex, Pinned, SlotTable},
    RemoveCallback, SlotState,
};
use crate::VmmResult;

/// Reference counted table that hands out dense positional indices
pub struct Database<T> {
    table: SlotTable<T, NoIndex>,
}

impl<T: Send + Sync> Database<T> {
    pub fn new(capacity: usize, chunk_size: usize) -> VmmResult<Self> {
        Ok(Self {
            table: SlotTable::new(capacity, chunk_size, NoIndex, None)?,
        })
    }

    pub fn with_callback<C: RemoveCallback<T> + 'static>(
        capacity: usize,
        chunk_size: usize,
        on_remove: C,
    ) -> VmmResult<Self> {
        Ok(Self {
            table: SlotTable::new(capacity, chunk_size, NoIndex, Some(Box::new(on_remove)))?,
        })
    }

    /// Stores `element` in the lowest recently freed slot, `OutOfResource` if full
    pub fn insert(&self, element: T) -> VmmResult<u32> {
        self.insert_arc(Arc::new(element))
    }

    /// Stores a shared element, the caller may keep its own clone
    pub fn insert_arc(&self, element: Arc<T>) -> VmmResult<u32> {
        Ok(self.table.insert_with(None, move || Ok(element))?.index)
    }

    pub fn insert_or_expand(&self, element: T) -> VmmResult<u32> {
        self.insert_or_expand_arc(Arc::new(element))
    }

    pub fn insert_or_expand_arc(&self, element: Arc<T>) -> VmmResult<u32> {
        Ok(self
            .table
            .insert_or_expand_with(None, move || Ok(element))?
            .index)
    }

    /// Takes a reference on `index`, pair it with [`Database::unuse`]
    pub fn get(&self, index: u32) -> VmmResult<Arc<T>> {
        self.table.get(index)
    }

    pub fn pin(&self, index: u32) -> VmmResult<Pinned<'_, T>> {
        let element = self.table.get(index)?;
        Ok(Pinned::new(&self.table, index, element))
    }

    pub fn unuse(&self, index: u32) -> VmmResult<()> {
        self.table.unuse(index)
    }

    pub fn remove(&self, index: u32, force: bool) -> VmmResult<()> {
        self.table.remove(index, force)
    }

    pub fn expand(&self) -> VmmResult<bool> {
        self.table.expand()
    }

    /// All elements in use, only slots below `free_pos` are scanned
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

    /// Every slot at or above this position is unused
    pub fn free_pos(&self) -> VmmResult<usize> {
        self.table.free_pos()
    }

    pub fn expansion_count(&self) -> usize {
        self.table.expansion_count()
    }

    pub fn slot_state(&self, index: u32) -> VmmResult<(SlotState, u16)> {
        self.table.slot_state(index)
    }
}
