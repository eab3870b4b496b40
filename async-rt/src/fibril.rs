// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Fibril`]: a unit of cooperative concurrency within one task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use unwrap_lite::UnwrapLite;

/// Checked by a fibril's body at its own yield points -- there is no
/// way to force a fibril to stop from outside, since it may be mid-
/// exchange; cancellation here is always cooperative (spec §4.5).
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A fibril running `body` to completion on its own OS thread.
///
/// `T` is the fibril's result, handed back by [`Fibril::join`]. Most
/// server-side fibrils run forever and are never joined; `cancel`
/// followed by a final IPC failure is how those unwind in practice.
pub struct Fibril<T> {
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Fibril<T> {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let token = CancelToken(cancelled.clone());
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || body(token))
            .expect("failed to spawn fibril thread");
        Self {
            cancelled,
            handle: Some(handle),
        }
    }

    /// Requests cooperative cancellation. Has no effect unless `body`
    /// is written to check [`CancelToken::is_cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Blocks until the fibril's body returns.
    pub fn join(mut self) -> T {
        self.handle
            .take()
            .expect("fibril already joined")
            .join()
            .unwrap_lite()
    }
}
