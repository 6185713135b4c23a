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

use core::{marker::PhantomData, ops::Deref};
use std::{
    sync::{Condvar, Mutex},
    thread::{self, ThreadId},
};

use crate::VmmResult;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    count: usize,
}

/// Mutex that the owning thread may acquire again.
///
/// The lock is released when the last guard of the owning thread is dropped.
/// As multiple guards of one thread can coexist, only shared access is handed out;
/// wrap the data in a `RefCell` to mutate it.
pub(crate) struct ReentrantLock<T> {
    state: Mutex<LockState>,
    released: Condvar,
    data: T,
}

// SAFETY: `data` is only reachable through a `ReentrantGuard`, and all guards that exist
// at the same time belong to one thread (the guard is neither `Send` nor `Sync`).
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            data,
        }
    }

    /// Blocks until the lock is free or already held by the current thread
    pub(crate) fn lock(&self) -> VmmResult<ReentrantGuard<'_, T>> {
        let me = thread::current().id();
        let mut state = self.state.lock()?;

        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.count += 1;
                    break;
                }
                Some(_) => {
                    state = self.released.wait(state)?;
                }
            }
        }

        Ok(ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.state.lock().map(|state| state.count).unwrap_or(0)
    }
}

pub(crate) struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantLock<T>,

    /// guards must stay on the thread that acquired them
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for ReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = match self.lock.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        debug_assert!(state.count > 0);
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.lock.released.notify_one();
        }
    }
}

#[cfg(test)]
mod test {
    use core::cell::RefCell;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Barrier,
    };

    use super::ReentrantLock;

    #[test]
    fn test_reenter_same_thread() {
        let lock = ReentrantLock::new(RefCell::new(0));

        let outer = lock.lock().unwrap();
        *outer.borrow_mut() += 1;
        {
            let inner = lock.lock().unwrap();
            assert_eq!(lock.depth(), 2);
            *inner.borrow_mut() += 1;
        }
        assert_eq!(lock.depth(), 1);
        drop(outer);
        assert_eq!(lock.depth(), 0);

        assert_eq!(*lock.lock().unwrap().borrow(), 2);
    }

    #[test]
    fn test_other_thread_waits_for_full_release() {
        let lock = ReentrantLock::new(RefCell::new(0u32));
        let barrier = Barrier::new(2);
        let released = AtomicBool::new(false);

        std::thread::scope(|s| {
            let outer = lock.lock().unwrap();
            let inner = lock.lock().unwrap();

            s.spawn(|| {
                barrier.wait();
                let guard = lock.lock().unwrap();
                // the first thread must have dropped both guards by now
                assert!(released.load(Ordering::SeqCst));
                *guard.borrow_mut() += 1;
            });

            barrier.wait();
            drop(inner);
            std::thread::sleep(std::time::Duration::from_millis(20));
            released.store(true, Ordering::SeqCst);
            drop(outer);
        });

        assert_eq!(*lock.lock().unwrap().borrow(), 1);
    }
}
