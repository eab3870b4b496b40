// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Size-classed, reference-counted packet/datagram buffers shared
//! across tasks by handle (spec C7).
//!
//! A producer allocates a buffer sized to the next size class up,
//! fills it, and hands a [`BufHandle`] to a consumer -- normally by
//! putting its id in an ordinary IPC call payload, the way a phone
//! handle or task id already rides in one. The pool itself knows
//! nothing about IPC; it only tracks which size class a buffer came
//! from and how many outstanding handles refer to it, matching the
//! teacher's `USlice`/`safe_copy` discipline of validating every
//! access against a plain length check rather than trusting the
//! caller (`sys/kern/src/umem.rs`, see `DESIGN.md`).

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Opaque identity of one pooled buffer, stable across `share`/
/// `release`. Carried across an IPC call payload as a little-endian
/// `u64` -- `to_le_bytes`/`from_le_bytes`, no serialization crate
/// needed for eight bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BufHandle(pub u64);

impl BufHandle {
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolError {
    /// The requested length exceeds the pool's largest size class.
    TooLarge,
    /// `handle` does not refer to a live buffer (never allocated,
    /// already fully released, or from a different pool).
    NoSuchBuffer,
    /// The read/write range fell outside the buffer's payload length.
    OutOfRange,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PoolError::TooLarge => "requested size exceeds the largest size class",
            PoolError::NoSuchBuffer => "no live buffer has that handle",
            PoolError::OutOfRange => "access falls outside the buffer's length",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for PoolError {}

struct Slot {
    class: usize,
    data: Vec<u8>,
    len: usize,
    refcount: usize,
}

struct Inner {
    /// Ascending size classes, e.g. `[64, 256, 1024, 4096]`.
    classes: Vec<usize>,
    /// Free (class-capacity, zero-filled) buffers ready for reuse, one
    /// list per class.
    free: Vec<Vec<Vec<u8>>>,
    live: HashMap<u64, Slot>,
    next_id: u64,
}

impl Inner {
    fn class_for(&self, len: usize) -> Option<usize> {
        self.classes.iter().position(|&c| c >= len)
    }
}

/// A shared pool of size-classed buffers. Cloning a `Pool` shares the
/// same backing storage -- every task that wants to allocate or
/// release from it holds a clone, the same way `kern::System`'s
/// clones all point at one dispatcher.
#[derive(Clone)]
pub struct Pool(std::sync::Arc<Mutex<Inner>>);

/// The size classes used by [`Pool::with_default_classes`], matching
/// common small-datagram, page, and jumbo-frame sizes.
pub const DEFAULT_CLASSES: &[usize] = &[64, 256, 1024, 4096];

impl Pool {
    /// Builds a pool with explicit size classes, which must be
    /// strictly ascending and non-empty.
    pub fn new(classes: Vec<usize>) -> Self {
        assert!(!classes.is_empty(), "a pool needs at least one size class");
        assert!(
            classes.windows(2).all(|w| w[0] < w[1]),
            "size classes must be strictly ascending"
        );
        let free = classes.iter().map(|_| Vec::new()).collect();
        Self(std::sync::Arc::new(Mutex::new(Inner {
            classes,
            free,
            live: HashMap::new(),
            next_id: 0,
        })))
    }

    pub fn with_default_classes() -> Self {
        Self::new(DEFAULT_CLASSES.to_vec())
    }

    /// Allocates a buffer able to hold `len` bytes, rounded up to the
    /// next size class, with `refcount` 1. Reuses a freed buffer of
    /// the chosen class when one is available.
    pub fn alloc(&self, len: usize) -> Result<BufHandle, PoolError> {
        let mut inner = self.0.lock().unwrap();
        let class_idx = inner.class_for(len).ok_or(PoolError::TooLarge)?;
        let capacity = inner.classes[class_idx];
        let data = inner.free[class_idx]
            .pop()
            .unwrap_or_else(|| vec![0u8; capacity]);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live.insert(
            id,
            Slot {
                class: class_idx,
                data,
                len,
                refcount: 1,
            },
        );
        Ok(BufHandle(id))
    }

    /// Hands the same buffer to another holder, bumping its refcount.
    /// Returns the same handle -- sharing does not copy the payload.
    pub fn share(&self, handle: BufHandle) -> Result<BufHandle, PoolError> {
        let mut inner = self.0.lock().unwrap();
        let slot = inner
            .live
            .get_mut(&handle.0)
            .ok_or(PoolError::NoSuchBuffer)?;
        slot.refcount += 1;
        Ok(handle)
    }

    /// Drops one holder's reference. The buffer's storage returns to
    /// its class's free list only once every holder has released it
    /// (spec C7's destroy-at-zero-refcount invariant).
    pub fn release(&self, handle: BufHandle) -> Result<(), PoolError> {
        let mut inner = self.0.lock().unwrap();
        let slot = inner
            .live
            .get_mut(&handle.0)
            .ok_or(PoolError::NoSuchBuffer)?;
        slot.refcount -= 1;
        if slot.refcount == 0 {
            let Slot { class, mut data, .. } = inner.live.remove(&handle.0).unwrap();
            data.iter_mut().for_each(|b| *b = 0);
            inner.free[class].push(data);
        }
        Ok(())
    }

    pub fn len(&self, handle: BufHandle) -> Result<usize, PoolError> {
        let inner = self.0.lock().unwrap();
        inner
            .live
            .get(&handle.0)
            .map(|s| s.len)
            .ok_or(PoolError::NoSuchBuffer)
    }

    /// Overwrites the buffer's payload in place. `data.len()` becomes
    /// the buffer's reported length; it must fit within its size
    /// class's capacity.
    pub fn write(&self, handle: BufHandle, data: &[u8]) -> Result<(), PoolError> {
        let mut inner = self.0.lock().unwrap();
        let slot = inner
            .live
            .get_mut(&handle.0)
            .ok_or(PoolError::NoSuchBuffer)?;
        if data.len() > slot.data.len() {
            return Err(PoolError::TooLarge);
        }
        slot.data[..data.len()].copy_from_slice(data);
        slot.len = data.len();
        Ok(())
    }

    /// Reads the buffer's current payload (`0..len`, not the full
    /// class capacity) into `out`, starting at `offset`.
    pub fn read(&self, handle: BufHandle, offset: usize, out: &mut [u8]) -> Result<usize, PoolError> {
        let inner = self.0.lock().unwrap();
        let slot = inner.live.get(&handle.0).ok_or(PoolError::NoSuchBuffer)?;
        let end = offset.checked_add(out.len()).ok_or(PoolError::OutOfRange)?;
        if end > slot.len {
            return Err(PoolError::OutOfRange);
        }
        out.copy_from_slice(&slot.data[offset..end]);
        Ok(out.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_next_class() {
        let pool = Pool::new(vec![64, 256]);
        let h = pool.alloc(10).unwrap();
        assert_eq!(pool.len(h).unwrap(), 10);
    }

    #[test]
    fn alloc_beyond_largest_class_fails() {
        let pool = Pool::new(vec![64]);
        assert_eq!(pool.alloc(65), Err(PoolError::TooLarge));
    }

    #[test]
    fn write_then_read_round_trips() {
        let pool = Pool::with_default_classes();
        let h = pool.alloc(5).unwrap();
        pool.write(h, b"hello").unwrap();
        let mut out = [0u8; 5];
        pool.read(h, 0, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn buffer_survives_until_every_holder_releases() {
        let pool = Pool::new(vec![64]);
        let h = pool.alloc(4).unwrap();
        let h2 = pool.share(h).unwrap();
        pool.release(h).unwrap();
        // still live: h2 holds a reference
        assert!(pool.len(h2).is_ok());
        pool.release(h2).unwrap();
        assert_eq!(pool.len(h), Err(PoolError::NoSuchBuffer));
    }

    #[test]
    fn freed_storage_is_reused_by_the_next_alloc_in_class() {
        let pool = Pool::new(vec![64]);
        let h1 = pool.alloc(64).unwrap();
        pool.write(h1, &[7u8; 64]).unwrap();
        pool.release(h1).unwrap();
        let h2 = pool.alloc(10).unwrap();
        let mut out = [0u8; 10];
        pool.read(h2, 0, &mut out).unwrap();
        // reused storage is zeroed before reuse, not left stale.
        assert_eq!(out, [0u8; 10]);
    }

    #[test]
    fn read_out_of_range_is_rejected() {
        let pool = Pool::new(vec![64]);
        let h = pool.alloc(4).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(pool.read(h, 2, &mut out), Err(PoolError::OutOfRange));
    }

    #[test]
    fn release_of_unknown_handle_is_rejected() {
        let pool = Pool::new(vec![64]);
        assert_eq!(pool.release(BufHandle(999)), Err(PoolError::NoSuchBuffer));
    }
}
