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

use core::{cmp::max, hint::spin_loop, ops::Deref};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, RwLock,
};

use log::{debug, error, trace, warn};
use try_lock::TryLock;

use super::{RemoveCallback, SlotState};
use crate::{util::spin::spin_lock, VmmError, VmmResult};

/// Upper bound for the number of slots, handles are `u32`
const MAX_CAPACITY: usize = u32::MAX as usize;

/// Index from keys to slots, maintained under the structure lock
pub(crate) trait SlotIndex: Send {
    /// Makes room for `capacity` slots
    fn grow(&mut self, capacity: usize);

    /// Slot that is linked with `key`
    fn find(&self, key: u64) -> Option<u32>;

    fn link(&mut self, index: u32, key: u64);

    fn unlink(&mut self, index: u32);
}

/// Positional tables have no keys
pub(crate) struct NoIndex;

impl SlotIndex for NoIndex {
    fn grow(&mut self, _capacity: usize) {}

    fn find(&self, _key: u64) -> Option<u32> {
        None
    }

    fn link(&mut self, _index: u32, _key: u64) {}

    fn unlink(&mut self, _index: u32) {}
}

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    pub index: u32,

    /// The key was pending removal and got revived instead of allocating a new slot
    pub resurrected: bool,
}

struct Slot<T> {
    state: SlotState,
    ref_count: u16,
    key: u64,
    element: Option<Arc<T>>,
}

impl<T> Slot<T> {
    const fn free() -> Self {
        Slot {
            state: SlotState::Free,
            ref_count: 0,
            key: 0,
            element: None,
        }
    }
}

/// Everything that changes when slots are allocated or recycled
struct Structure<X: SlotIndex> {
    index: X,

    /// idle list links
    next_free: Vec<Option<u32>>,
    free_head: Option<u32>,

    /// slot is not on the idle list
    allocated: Vec<bool>,

    /// all slots at or above `free_pos` are unused
    free_pos: usize,
    len: usize,
}

impl<X: SlotIndex> Structure<X> {
    fn new(index: X) -> Self {
        Self {
            index,
            next_free: Vec::new(),
            free_head: None,
            allocated: Vec::new(),
            free_pos: 0,
            len: 0,
        }
    }

    /// Appends slots `[old_capacity, capacity)` to the idle list
    fn grow(&mut self, capacity: usize) -> VmmResult<()> {
        let old_capacity = self.next_free.len();
        debug_assert!(capacity > old_capacity);

        let added = capacity - old_capacity;
        self.next_free
            .try_reserve(added)
            .map_err(|_| VmmError::OutOfMemory)?;
        self.allocated
            .try_reserve(added)
            .map_err(|_| VmmError::OutOfMemory)?;

        for i in old_capacity..capacity {
            let next = if i + 1 < capacity {
                Some((i + 1) as u32)
            } else {
                self.free_head
            };
            self.next_free.push(next);
            self.allocated.push(false);
        }
        self.free_head = Some(old_capacity as u32);
        self.index.grow(capacity);

        Ok(())
    }

    fn pop_free(&mut self) -> Option<u32> {
        let head = self.free_head?;
        self.free_head = self.next_free[head as usize].take();
        self.allocated[head as usize] = true;
        self.free_pos = max(self.free_pos, head as usize + 1);
        self.len += 1;

        Some(head)
    }

    fn push_free(&mut self, index: u32) {
        debug_assert!(self.allocated[index as usize], "slot {} freed twice", index);

        self.allocated[index as usize] = false;
        self.next_free[index as usize] = self.free_head;
        self.free_head = Some(index);
        self.len -= 1;

        while self.free_pos > 0 && !self.allocated[self.free_pos - 1] {
            self.free_pos -= 1;
        }
    }
}

struct Storage<T, X: SlotIndex> {
    slots: Vec<TryLock<Slot<T>>>,
    structure: Mutex<Structure<X>>,
}

/// Slot arena shared by [`super::HandleMap`] and [`super::Database`]
pub(crate) struct SlotTable<T, X: SlotIndex> {
    /// `expand` takes this exclusively, everything else shares it
    storage: RwLock<Storage<T, X>>,
    chunk_size: usize,
    on_remove: Option<Box<dyn RemoveCallback<T>>>,
    expansions: AtomicUsize,
}

impl<T, X: SlotIndex> SlotTable<T, X> {
    pub(crate) fn new(
        capacity: usize,
        chunk_size: usize,
        index: X,
        on_remove: Option<Box<dyn RemoveCallback<T>>>,
    ) -> VmmResult<Self> {
        if capacity == 0 || chunk_size == 0 || capacity > MAX_CAPACITY {
            warn!(
                "Invalid registry geometry: capacity={}, chunk_size={}",
                capacity, chunk_size
            );
            return Err(VmmError::InvalidArgument);
        }

        let mut structure = Structure::new(index);
        structure.grow(capacity)?;

        let mut slots = Vec::new();
        slots
            .try_reserve(capacity)
            .map_err(|_| VmmError::OutOfMemory)?;
        slots.extend((0..capacity).map(|_| TryLock::new(Slot::free())));

        Ok(Self {
            storage: RwLock::new(Storage {
                slots,
                structure: Mutex::new(structure),
            }),
            chunk_size,
            on_remove,
            expansions: AtomicUsize::new(0),
        })
    }

    /// Allocates a slot for `key`, or revives the slot of `key` if it is pending removal.
    ///
    /// `make` is only called when a new slot is allocated.
    pub(crate) fn insert_with<F>(&self, key: Option<u64>, make: F) -> VmmResult<Inserted>
    where
        F: FnOnce() -> VmmResult<Arc<T>>,
    {
        self.try_insert(key, &mut Some(make))
    }

    /// Same as `insert_with` but expands the table until a slot is available
    pub(crate) fn insert_or_expand_with<F>(&self, key: Option<u64>, make: F) -> VmmResult<Inserted>
    where
        F: FnOnce() -> VmmResult<Arc<T>>,
    {
        let mut make = Some(make);
        loop {
            match self.try_insert(key, &mut make) {
                Err(VmmError::OutOfResource) => {
                    // a concurrent caller might have expanded already, retry anyway
                    self.expand()?;
                }
                res => return res,
            }
        }
    }

    fn try_insert<F>(&self, key: Option<u64>, make: &mut Option<F>) -> VmmResult<Inserted>
    where
        F: FnOnce() -> VmmResult<Arc<T>>,
    {
        loop {
            let storage = self.storage.read()?;
            let mut structure = storage.structure.lock()?;

            if let Some(key) = key {
                if let Some(existing) = structure.index.find(key) {
                    let mut slot = spin_lock(&storage.slots[existing as usize]);
                    match slot.state {
                        SlotState::PendingRemoval => {
                            slot.state = SlotState::Used;
                            debug!(
                                "Revived slot {} (key={:#x}, ref_count={})",
                                existing, key, slot.ref_count
                            );
                            return Ok(Inserted {
                                index: existing,
                                resurrected: true,
                            });
                        }
                        SlotState::Recycling => {
                            // recycler needs the structure lock to unlink it, wait for that
                            drop(slot);
                            drop(structure);
                            drop(storage);
                            spin_loop();
                            continue;
                        }
                        state => {
                            warn!(
                                "Key {:#x} is already registered in slot {} ({:?})",
                                key, existing, state
                            );
                            return Err(VmmError::InvalidArgument);
                        }
                    }
                }
            }

            if structure.free_head.is_none() {
                trace!("No idle slot left (capacity={})", storage.slots.len());
                return Err(VmmError::OutOfResource);
            }

            let element = (make.take().ok_or(VmmError::Failure)?)()?;
            let index = structure.pop_free().ok_or(VmmError::Failure)?;
            if let Some(key) = key {
                structure.index.link(index, key);
            }

            // all fields are written before the slot becomes visible as used
            let mut slot = spin_lock(&storage.slots[index as usize]);
            *slot = Slot {
                state: SlotState::Used,
                ref_count: 0,
                key: key.unwrap_or(index as u64),
                element: Some(element),
            };
            trace!("Inserted slot {} (key={:?})", index, key);

            return Ok(Inserted {
                index,
                resurrected: false,
            });
        }
    }

    /// Grows the table by one chunk if it is full.
    ///
    /// Returns `false` if there were idle slots left (e.g. a concurrent caller expanded already).
    pub(crate) fn expand(&self) -> VmmResult<bool> {
        let mut guard = self.storage.write()?;
        let storage = &mut *guard;
        let structure = storage.structure.get_mut()?;

        if structure.free_head.is_some() {
            trace!("Skip expansion, idle slots left");
            return Ok(false);
        }

        let old_capacity = storage.slots.len();
        let new_capacity = old_capacity
            .checked_add(self.chunk_size)
            .filter(|capacity| *capacity <= MAX_CAPACITY)
            .ok_or_else(|| {
                warn!("Registry reached its maximum capacity ({})", old_capacity);
                VmmError::OutOfMemory
            })?;

        storage
            .slots
            .try_reserve(self.chunk_size)
            .map_err(|_| VmmError::OutOfMemory)?;
        structure.grow(new_capacity)?;
        storage
            .slots
            .extend((old_capacity..new_capacity).map(|_| TryLock::new(Slot::free())));

        self.expansions.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Expanded registry from {} to {} slots",
            old_capacity, new_capacity
        );

        Ok(true)
    }

    /// Returns the element of `index` and increments its reference count
    pub(crate) fn get(&self, index: u32) -> VmmResult<Arc<T>> {
        let storage = self.storage.read()?;
        let slot_lock = storage.slots.get(index as usize).ok_or_else(|| {
            warn!("Slot index {} out of range", index);
            VmmError::InvalidArgument
        })?;

        let mut slot = spin_lock(slot_lock);
        Self::acquire(&mut slot, index)
    }

    /// Looks up `key` and increments the reference count of its slot
    pub(crate) fn get_by_key(&self, key: u64) -> VmmResult<(u32, Arc<T>)> {
        let storage = self.storage.read()?;
        let index = storage
            .structure
            .lock()?
            .index
            .find(key)
            .ok_or(VmmError::InvalidArgument)?;

        let mut slot = spin_lock(&storage.slots[index as usize]);
        if slot.key != key {
            // recycled and reused in between
            return Err(VmmError::InvalidArgument);
        }

        Ok((index, Self::acquire(&mut slot, index)?))
    }

    fn acquire(slot: &mut Slot<T>, index: u32) -> VmmResult<Arc<T>> {
        if slot.state != SlotState::Used {
            trace!("Slot {} is not in use ({:?})", index, slot.state);
            return Err(VmmError::InvalidArgument);
        }

        let element = slot.element.clone().ok_or(VmmError::Failure)?;
        slot.ref_count = slot.ref_count.checked_add(1).ok_or_else(|| {
            warn!("Reference count of slot {} overflows", index);
            VmmError::OutOfResource
        })?;

        Ok(element)
    }

    /// Drops one reference, recycles the slot if it was the last one and removal is pending
    pub(crate) fn unuse(&self, index: u32) -> VmmResult<()> {
        let recycled = {
            let storage = self.storage.read()?;
            let slot_lock = storage.slots.get(index as usize).ok_or_else(|| {
                warn!("Slot index {} out of range", index);
                VmmError::InvalidArgument
            })?;

            let element = {
                let mut slot = spin_lock(slot_lock);
                match slot.state {
                    SlotState::Used | SlotState::PendingRemoval if slot.ref_count > 0 => {}
                    state => {
                        warn!(
                            "Unbalanced unuse of slot {} ({:?}, ref_count={})",
                            index, state, slot.ref_count
                        );
                        return Err(VmmError::InvalidArgument);
                    }
                }

                slot.ref_count -= 1;
                if slot.ref_count == 0 && slot.state == SlotState::PendingRemoval {
                    slot.state = SlotState::Recycling;
                    slot.element.take()
                } else {
                    None
                }
            };

            match element {
                Some(element) => {
                    Self::finish_recycle(&storage, index)?;
                    Some(element)
                }
                None => None,
            }
        };

        if let Some(element) = recycled {
            self.notify_removed(index, element);
        }

        Ok(())
    }

    /// Requests removal of `index`.
    ///
    /// The slot is recycled immediately if it is not referenced (or `force` is set),
    /// otherwise the last `unuse` recycles it.
    pub(crate) fn remove(&self, index: u32, force: bool) -> VmmResult<()> {
        self.remove_checked(index, None, force)
    }

    pub(crate) fn remove_by_key(&self, key: u64, force: bool) -> VmmResult<()> {
        let index = {
            let storage = self.storage.read()?;
            let index = storage.structure.lock()?.index.find(key);
            index
        };

        match index {
            Some(index) => self.remove_checked(index, Some(key), force),
            None => {
                warn!("Key {:#x} is not registered", key);
                Err(VmmError::InvalidArgument)
            }
        }
    }

    fn remove_checked(&self, index: u32, key: Option<u64>, force: bool) -> VmmResult<()> {
        let recycled = {
            let storage = self.storage.read()?;
            let slot_lock = storage.slots.get(index as usize).ok_or_else(|| {
                warn!("Slot index {} out of range", index);
                VmmError::InvalidArgument
            })?;

            let element = {
                let mut slot = spin_lock(slot_lock);
                let in_use = matches!(slot.state, SlotState::Used | SlotState::PendingRemoval);
                if !in_use || key.map_or(false, |key| key != slot.key) {
                    warn!("Remove of unused slot {} ({:?})", index, slot.state);
                    return Err(VmmError::InvalidArgument);
                }

                slot.state = SlotState::PendingRemoval;
                if slot.ref_count == 0 || force {
                    if slot.ref_count > 0 {
                        warn!(
                            "Forced removal of slot {} with {} references left",
                            index, slot.ref_count
                        );
                    }
                    slot.ref_count = 0;
                    slot.state = SlotState::Recycling;
                    slot.element.take()
                } else {
                    debug!(
                        "Removal of slot {} deferred, ref_count={}",
                        index, slot.ref_count
                    );
                    None
                }
            };

            match element {
                Some(element) => {
                    Self::finish_recycle(&storage, index)?;
                    Some(element)
                }
                None => None,
            }
        };

        if let Some(element) = recycled {
            self.notify_removed(index, element);
        }

        Ok(())
    }

    fn finish_recycle(storage: &Storage<T, X>, index: u32) -> VmmResult<()> {
        let mut structure = storage.structure.lock()?;
        structure.index.unlink(index);
        structure.push_free(index);

        let mut slot = spin_lock(&storage.slots[index as usize]);
        debug_assert_eq!(slot.state, SlotState::Recycling);
        *slot = Slot::free();
        trace!("Recycled slot {}", index);

        Ok(())
    }

    fn notify_removed(&self, index: u32, element: Arc<T>) {
        if let Some(callback) = self.on_remove.as_ref() {
            callback.on_remove(index, element);
        }
    }

    /// Snapshot of all used slots, scanning only below `free_pos`
    pub(crate) fn collect_used(&self) -> VmmResult<Vec<(u32, Arc<T>)>> {
        let storage = self.storage.read()?;
        let free_pos = storage.structure.lock()?.free_pos;

        let mut res = Vec::new();
        for (index, slot_lock) in storage.slots[..free_pos].iter().enumerate() {
            let slot = spin_lock(slot_lock);
            if slot.state == SlotState::Used {
                if let Some(element) = slot.element.as_ref() {
                    res.push((index as u32, element.clone()));
                }
            }
        }

        Ok(res)
    }

    pub(crate) fn capacity(&self) -> VmmResult<usize> {
        Ok(self.storage.read()?.slots.len())
    }

    pub(crate) fn len(&self) -> VmmResult<usize> {
        Ok(self.storage.read()?.structure.lock()?.len)
    }

    pub(crate) fn free_pos(&self) -> VmmResult<usize> {
        Ok(self.storage.read()?.structure.lock()?.free_pos)
    }

    pub(crate) fn expansion_count(&self) -> usize {
        self.expansions.load(Ordering::SeqCst)
    }

    pub(crate) fn slot_state(&self, index: u32) -> VmmResult<(SlotState, u16)> {
        let storage = self.storage.read()?;
        let slot_lock = storage
            .slots
            .get(index as usize)
            .ok_or(VmmError::InvalidArgument)?;
        let slot = spin_lock(slot_lock);

        Ok((slot.state, slot.ref_count))
    }
}

/// Type erased `unuse` so [`Pinned`] does not carry the index type
pub(crate) trait UnuseSlot: Sync {
    fn unuse_slot(&self, index: u32) -> VmmResult<()>;
}

impl<T: Send + Sync, X: SlotIndex> UnuseSlot for SlotTable<T, X> {
    fn unuse_slot(&self, index: u32) -> VmmResult<()> {
        self.unuse(index)
    }
}

/// A referenced registry element, the reference is dropped together with this guard
pub struct Pinned<'a, T> {
    table: &'a dyn UnuseSlot,
    index: u32,
    element: Arc<T>,
}

impl<'a, T> Pinned<'a, T> {
    pub(crate) fn new(table: &'a dyn UnuseSlot, index: u32, element: Arc<T>) -> Self {
        Self {
            table,
            index,
            element,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Shared pointer to the element, stays valid after the guard is dropped
    pub fn arc(&self) -> &Arc<T> {
        &self.element
    }
}

impl<T> Deref for Pinned<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.element
    }
}

impl<T> Drop for Pinned<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.table.unuse_slot(self.index) {
            error!("Could not release reference to slot {}: {}", self.index, err);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{NoIndex, SlotTable};
    use crate::{registry::SlotState, VmmError};

    fn counting_table(capacity: usize, removed: Arc<AtomicUsize>) -> SlotTable<u32, NoIndex> {
        SlotTable::new(
            capacity,
            capacity,
            NoIndex,
            Some(Box::new(move |_: u32, _: Arc<u32>| {
                removed.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_geometry() {
        assert_eq!(
            SlotTable::<u32, NoIndex>::new(0, 1, NoIndex, None).err(),
            Some(VmmError::InvalidArgument)
        );
        assert_eq!(
            SlotTable::<u32, NoIndex>::new(1, 0, NoIndex, None).err(),
            Some(VmmError::InvalidArgument)
        );
    }

    #[test]
    fn test_idle_list_order() {
        let table = counting_table(4, Arc::new(AtomicUsize::new(0)));
        for i in 0..4 {
            let inserted = table.insert_with(None, || Ok(Arc::new(i))).unwrap();
            assert_eq!(inserted.index, i);
        }
        assert_eq!(
            table.insert_with(None, || Ok(Arc::new(5))).err(),
            Some(VmmError::OutOfResource)
        );

        // recycled slots are reused first
        table.remove(2, false).unwrap();
        assert_eq!(table.insert_with(None, || Ok(Arc::new(6))).unwrap().index, 2);
    }

    #[test]
    fn test_failed_make_keeps_slot_idle() {
        let table = counting_table(2, Arc::new(AtomicUsize::new(0)));
        assert_eq!(
            table.insert_with(None, || Err(VmmError::OutOfMemory)).err(),
            Some(VmmError::OutOfMemory)
        );
        assert_eq!(table.len().unwrap(), 0);
        assert_eq!(table.free_pos().unwrap(), 0);
        assert_eq!(table.insert_with(None, || Ok(Arc::new(1))).unwrap().index, 0);
    }

    #[test]
    fn test_unbalanced_unuse() {
        let table = counting_table(2, Arc::new(AtomicUsize::new(0)));
        let index = table.insert_with(None, || Ok(Arc::new(1))).unwrap().index;
        assert_eq!(table.unuse(index).err(), Some(VmmError::InvalidArgument));
        assert_eq!(table.unuse(7).err(), Some(VmmError::InvalidArgument));
        assert_eq!(table.get(7).err(), Some(VmmError::InvalidArgument));
    }

    #[test]
    fn test_force_remove() {
        let removed = Arc::new(AtomicUsize::new(0));
        let table = counting_table(2, removed.clone());
        let index = table.insert_with(None, || Ok(Arc::new(1))).unwrap().index;

        let element = table.get(index).unwrap();
        table.remove(index, true).unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(table.slot_state(index).unwrap(), (SlotState::Free, 0));

        // the element itself outlives the slot
        assert_eq!(*element, 1);
        assert_eq!(table.unuse(index).err(), Some(VmmError::InvalidArgument));
    }

    #[test]
    fn test_get_after_remove_request_fails() {
        let table = counting_table(2, Arc::new(AtomicUsize::new(0)));
        let index = table.insert_with(None, || Ok(Arc::new(1))).unwrap().index;

        table.get(index).unwrap();
        table.remove(index, false).unwrap();
        assert_eq!(
            table.slot_state(index).unwrap(),
            (SlotState::PendingRemoval, 1)
        );
        assert_eq!(table.get(index).err(), Some(VmmError::InvalidArgument));

        table.unuse(index).unwrap();
        assert_eq!(table.slot_state(index).unwrap(), (SlotState::Free, 0));
    }
}
