// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A diagnostic ring buffer, adapted for host use.
//!
//! The teacher's version of this crate is `no_std` and backs its
//! static storage with `static_cell::StaticCell`, because on bare
//! metal there is no heap to allocate from and no thread to race with.
//! Here the ring buffer instruments `kern`'s dispatcher and
//! `async-rt`'s fibril manager, both of which run on ordinary OS
//! threads, so the backing store is a `std::sync::Mutex<VecDeque<_>>`
//! instead: the dedup-on-repeat behaviour and the macro surface are
//! kept, the `no_std`-specific storage is not.
//!
//! ## Creating a ring buffer
//!
//! ```ignore
//! ringbuf!(MY_RINGBUF, u32, 16);
//! ringbuf_entry!(MY_RINGBUF, 42);
//! ```
//!
//! Entries with the same payload as the most recently recorded entry
//! increment a count on that entry instead of pushing a new one, so a
//! busy loop doesn't drown out older history.

use std::collections::VecDeque;
use std::sync::Mutex;

/// One recorded entry.
#[derive(Debug, Clone)]
pub struct RingbufEntry<T> {
    pub payload: T,
    pub count: u32,
}

struct Inner<T> {
    cap: usize,
    buffer: VecDeque<RingbufEntry<T>>,
}

/// A ring buffer of parameterized entry type and bounded capacity.
///
/// Instantiating this directly is unusual -- see the [`ringbuf!`]
/// macro.
pub struct Ringbuf<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Ringbuf<T> {
    pub const fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cap,
                buffer: VecDeque::new(),
            }),
        }
    }

    /// Snapshot of the buffer's current contents, oldest first.
    pub fn snapshot(&self) -> Vec<RingbufEntry<T>>
    where
        T: Clone,
    {
        let inner = self.inner.lock().unwrap();
        inner.buffer.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + PartialEq> Ringbuf<T> {
    /// Records `payload`, de-duplicating against the most recent entry.
    pub fn record(&self, payload: T) {
        if cfg!(feature = "disabled") {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(last) = inner.buffer.back_mut() {
            if last.payload == payload {
                last.count = last.count.saturating_add(1);
                return;
            }
        }
        let cap = inner.cap;
        if inner.buffer.len() >= cap {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(RingbufEntry { payload, count: 1 });
    }
}

/// Declares a ring buffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N)` makes a static ring buffer named `NAME`,
/// holding entries of type `Type`, retaining the most recent `N`
/// distinct entries.
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr) => {
        static $name: $crate::Ringbuf<$t> = $crate::Ringbuf::new($n);
    };
    ($t:ty, $n:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n);
    };
}

/// Records `expr` into a ring buffer declared with [`ringbuf!`].
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {
        $crate::Ringbuf::record(&$buf, $payload)
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_bounds_capacity() {
        let r: Ringbuf<u32> = Ringbuf::new(2);
        r.record(1);
        r.record(2);
        r.record(3);
        let snap = r.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].payload, 2);
        assert_eq!(snap[1].payload, 3);
    }

    #[test]
    fn dedups_repeated_entries() {
        let r: Ringbuf<u32> = Ringbuf::new(4);
        r.record(7);
        r.record(7);
        r.record(7);
        let snap = r.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].count, 3);
    }
}
