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

use core::fmt;
use std::sync::PoisonError;

/// Status codes returned by every fallible operation of this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmmError {
    /// Bad caller input: zero size, misaligned address, unknown page type, unknown handle
    InvalidArgument,

    /// Physical allocator exhausted, registry full and not expandable
    /// or no contiguous run left in the page table
    OutOfMemory,

    /// Registry insert found no idle slot, the caller should expand and retry
    OutOfResource,

    /// The configuration lacks a required hardware feature
    /// or an address does not fit the current addressing mode
    NotSupported,

    /// Internal invariant violated or a lock primitive failed
    Failure,

    /// A bounded hardware poll did not finish in time
    Timeout,
}

pub type VmmResult<T> = Result<T, VmmError>;

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VmmError::InvalidArgument => "invalid argument",
            VmmError::OutOfMemory => "out of memory",
            VmmError::OutOfResource => "out of resources",
            VmmError::NotSupported => "not supported",
            VmmError::Failure => "internal failure",
            VmmError::Timeout => "timeout",
        };
        f.write_str(text)
    }
}

impl std::error::Error for VmmError {}

impl<T> From<PoisonError<T>> for VmmError {
    fn from(_: PoisonError<T>) -> Self {
        log::error!("lock poisoned");
        VmmError::Failure
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::{VmmError, VmmResult};

    #[test]
    fn test_poisoned_lock_is_failure() {
        let lock = Mutex::new(0u32);
        let _ = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = lock.lock().unwrap();
                panic!("poison the lock");
            })
            .join()
        });

        let res: VmmResult<u32> = (|| Ok(*lock.lock()?))();
        assert_eq!(res, Err(VmmError::Failure));
    }

    #[test]
    fn test_display() {
        assert_eq!(VmmError::OutOfResource.to_string(), "out of resources");
        assert_eq!(VmmError::Timeout.to_string(), "timeout");
    }
}
