// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bulk data transfer (spec C6).
//!
//! The teacher's `umem.rs` validates a `USlice` against a task's MPU
//! region table before trusting it, because sender and receiver live
//! in genuinely different address spaces. This simulation has one
//! address space, so a [`Lease`] is simply a reference-counted,
//! mutex-guarded byte buffer a task offers for the lifetime of one
//! call; `data_read`/`data_write` perform the bounds and overlap
//! checks `safe_copy` performs, but against `Vec` lengths and `Arc`
//! identity rather than raw address ranges.

use std::sync::{Arc, Mutex};

use crate::err::InteractFault;
use abi::IpcError;

/// The largest number of bytes a single `data_read`/`data_write` call
/// will move, independent of either lease's own length (spec §4.6).
/// Keeps one oversized request from pinning an unbounded `Vec` behind
/// a lock for the duration of the call.
pub const MAX_TRANSFER_LEN: usize = 64 * 1024;

/// A buffer one side of a call exposes to the other for the duration
/// of that call (spec §4.1's `CallFlags::HAS_LEASE`).
#[derive(Clone)]
pub struct Lease {
    data: Arc<Mutex<Vec<u8>>>,
}

impl Lease {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn same_allocation(&self, other: &Lease) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Copies `len` bytes starting at `offset` out of `src`'s lease into a
/// freshly-allocated `Vec` (spec C6 `data_read`: the callee pulls
/// bytes the caller staged).
pub fn data_read(
    src: &Lease,
    offset: usize,
    len: usize,
) -> Result<Vec<u8>, IpcError> {
    if len > MAX_TRANSFER_LEN {
        return Err(IpcError::BadSize);
    }
    let buf = src.data.lock().unwrap();
    let end = offset.checked_add(len).ok_or(IpcError::BadSize)?;
    if end > buf.len() {
        return Err(IpcError::BadSize);
    }
    Ok(buf[offset..end].to_vec())
}

/// Writes `src` into `dst`'s lease at `offset` (spec C6 `data_write`:
/// the callee pushes bytes into a buffer the caller staged).
///
/// Returns an [`InteractFault`] rather than a bare `IpcError` because
/// either side can be the one that got it wrong: the destination lease
/// might be too short, or the write might alias the very buffer being
/// read from.
pub fn data_write(
    dst: &Lease,
    offset: usize,
    src: &[u8],
    src_lease: Option<&Lease>,
) -> Result<usize, InteractFault> {
    if let Some(src_lease) = src_lease {
        if src_lease.same_allocation(dst) {
            return Err(InteractFault::both(
                IpcError::BadSize,
                IpcError::BadSize,
            ));
        }
    }
    if src.len() > MAX_TRANSFER_LEN {
        return Err(InteractFault::in_dst(IpcError::BadSize));
    }
    let mut buf = dst.data.lock().unwrap();
    let end = match offset.checked_add(src.len()) {
        Some(e) => e,
        None => return Err(InteractFault::in_dst(IpcError::BadSize)),
    };
    if end > buf.len() {
        return Err(InteractFault::in_dst(IpcError::BadSize));
    }
    buf[offset..end].copy_from_slice(src);
    Ok(src.len())
}

/// Copies the full contents of `from` into `to`, truncating to the
/// shorter of the two lengths -- the ordering guarantee in spec C6
/// ("the copy completes before the answer is observable") falls out
/// naturally here since this call returns only once the copy is done.
pub fn safe_copy(from: &Lease, to: &Lease) -> Result<usize, InteractFault> {
    if from.same_allocation(to) {
        return Err(InteractFault::both(IpcError::BadSize, IpcError::BadSize));
    }
    let src = from.data.lock().unwrap().clone();
    let mut dst = to.data.lock().unwrap();
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_read_returns_requested_slice() {
        let lease = Lease::new(vec![1, 2, 3, 4, 5]);
        let out = data_read(&lease, 1, 3).unwrap();
        assert_eq!(out, vec![2, 3, 4]);
    }

    #[test]
    fn data_read_past_end_is_bad_size() {
        let lease = Lease::new(vec![1, 2, 3]);
        assert_eq!(data_read(&lease, 1, 10), Err(IpcError::BadSize));
    }

    #[test]
    fn data_write_updates_in_place() {
        let lease = Lease::new(vec![0; 4]);
        data_write(&lease, 1, &[9, 9], None).unwrap();
        assert_eq!(*lease.data.lock().unwrap(), vec![0, 9, 9, 0]);
    }

    #[test]
    fn data_read_past_transfer_limit_is_bad_size() {
        let lease = Lease::new(vec![0; MAX_TRANSFER_LEN + 1]);
        assert_eq!(
            data_read(&lease, 0, MAX_TRANSFER_LEN + 1),
            Err(IpcError::BadSize)
        );
    }

    #[test]
    fn data_write_rejects_self_aliasing() {
        let lease = Lease::new(vec![0; 4]);
        let alias = lease.clone();
        let err = data_write(&lease, 0, &[1, 2], Some(&alias)).unwrap_err();
        assert!(err.dst.is_some());
    }

    #[test]
    fn safe_copy_truncates_to_shorter_length() {
        let from = Lease::new(vec![1, 2, 3, 4]);
        let to = Lease::new(vec![0; 2]);
        let n = safe_copy(&from, &to).unwrap();
        assert_eq!(n, 2);
        assert_eq!(*to.data.lock().unwrap(), vec![1, 2]);
    }
}
