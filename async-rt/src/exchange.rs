// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Exchange`]: the unit of request/reply atomicity on a phone shared
//! by many fibrils (spec §4.5).
//!
//! The kernel guarantees FIFO delivery per phone, but says nothing
//! about which fibril's request goes first when several want to use
//! the same phone concurrently -- a request followed by a related
//! bulk-data transfer would otherwise race against an unrelated
//! fibril's own request landing on the same phone in between. An
//! exchange is a plain mutual-exclusion reservation, scoped with
//! RAII so "forgot to release" shows up as a held lock rather than a
//! silent protocol violation.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use abi::PhoneHandle;

struct Inner {
    reserved: Mutex<HashSet<PhoneHandle>>,
    cv: Condvar,
}

/// Per-task table of which phones are currently reserved by an
/// in-progress exchange. One instance is shared by every fibril
/// belonging to the same task.
#[derive(Clone)]
pub struct PhoneLocks(Arc<Inner>);

impl PhoneLocks {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            reserved: Mutex::new(HashSet::new()),
            cv: Condvar::new(),
        }))
    }

    /// Blocks until `phone` is free, then reserves it. The returned
    /// [`Exchange`] releases the reservation when dropped.
    pub fn begin(&self, phone: PhoneHandle) -> Exchange {
        let mut reserved = self.0.reserved.lock().unwrap();
        while reserved.contains(&phone) {
            reserved = self.0.cv.wait(reserved).unwrap();
        }
        reserved.insert(phone);
        drop(reserved);
        Exchange {
            locks: self.clone(),
            phone,
            ended: false,
        }
    }

    /// Non-blocking variant of `begin`: reserves `phone` only if it is
    /// free right now.
    pub fn try_begin(&self, phone: PhoneHandle) -> Option<Exchange> {
        let mut reserved = self.0.reserved.lock().unwrap();
        if reserved.contains(&phone) {
            return None;
        }
        reserved.insert(phone);
        drop(reserved);
        Some(Exchange {
            locks: self.clone(),
            phone,
            ended: false,
        })
    }

    fn release(&self, phone: PhoneHandle) {
        let mut reserved = self.0.reserved.lock().unwrap();
        reserved.remove(&phone);
        drop(reserved);
        self.0.cv.notify_all();
    }
}

impl Default for PhoneLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// An exclusive reservation of one phone, for the duration of a
/// request and any bulk transfer that rides along with it.
pub struct Exchange {
    locks: PhoneLocks,
    phone: PhoneHandle,
    ended: bool,
}

impl Exchange {
    pub fn phone(&self) -> PhoneHandle {
        self.phone
    }

    /// Releases the reservation early. Equivalent to dropping the
    /// exchange, spelled out because the teacher's own RAII guards
    /// (e.g. its lease scoping) give the explicit form a name too.
    pub fn end(mut self) {
        self.ended = true;
        self.locks.release(self.phone);
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if !self.ended {
            self.locks.release(self.phone);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn second_begin_blocks_until_first_ends() {
        let locks = PhoneLocks::new();
        let phone = PhoneHandle(7);
        let first = locks.begin(phone);

        let (tx, rx) = mpsc::channel();
        let locks2 = locks.clone();
        let waiter = std::thread::spawn(move || {
            let _second = locks2.begin(phone);
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        first.end();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn try_begin_fails_while_reserved() {
        let locks = PhoneLocks::new();
        let phone = PhoneHandle(3);
        let _held = locks.begin(phone);
        assert!(locks.try_begin(phone).is_none());
    }

    #[test]
    fn drop_releases_without_calling_end() {
        let locks = PhoneLocks::new();
        let phone = PhoneHandle(1);
        {
            let _exchange = locks.begin(phone);
        }
        assert!(locks.try_begin(phone).is_some());
    }
}
