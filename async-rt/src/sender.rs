// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Async send and answer correlation (spec §4.5 "Async send").
//!
//! `kern::Dispatcher` already splits "send and get a handle" from
//! "block for the answer" (`send_async`/`await_answer`/`poll_answer`),
//! unlike the teacher's single in-band receive loop that has to
//! distinguish an answer to one of its own outstanding calls from a
//! fresh incoming call on the same stream. What's missing is the
//! *fan-in*: many fibrils issuing async sends from the same task, each
//! wanting to block on just its own answer without a thread per
//! pending call. [`Manager`] is the single correlator that owns that
//! multiplexing, polling every outstanding call on one thread and
//! waking only the fibril whose answer arrived -- the adaptation of
//! the teacher's "manager fibril" to a dispatcher that already hands
//! out a per-call correlation key (`CallId`) instead of making one up.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use abi::{CallFlags, IpcError, Method, PhoneHandle, TaskId};
use kern::call::CallId;
use kern::Dispatcher;

/// How often the manager's poll loop sweeps outstanding calls. A real
/// manager fibril would instead be woken by the kernel the instant an
/// answer lands; polling is the cost of adapting a single blocking
/// `await_answer` into a multi-waiter correlator on a hosted target.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

enum Slot {
    Pending,
    Ready(Result<Vec<u8>, IpcError>),
    Cancelled,
}

struct Inner {
    dispatcher: Dispatcher,
    caller: TaskId,
    slots: Mutex<HashMap<CallId, Slot>>,
    cv: Condvar,
    running: Mutex<bool>,
}

/// Owns every outstanding async call issued by one task's fibrils, and
/// the background thread that polls their answers in.
#[derive(Clone)]
pub struct Manager(Arc<Inner>);

impl Manager {
    /// Starts the manager's poll loop on a fresh thread. `caller` is
    /// the task whose quota every async send through this manager is
    /// charged against.
    pub fn start(dispatcher: Dispatcher, caller: TaskId) -> Self {
        let inner = Arc::new(Inner {
            dispatcher,
            caller,
            slots: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            running: Mutex::new(true),
        });
        let manager = Self(inner);
        let worker = manager.clone();
        std::thread::Builder::new()
            .name("async-rt-manager".into())
            .spawn(move || worker.poll_loop())
            .expect("failed to spawn manager thread");
        manager
    }

    /// Stops the poll loop. Outstanding [`AsyncSender`]s that haven't
    /// been waited on yet will never resolve after this.
    pub fn shutdown(&self) {
        *self.0.running.lock().unwrap() = false;
    }

    fn poll_loop(&self) {
        loop {
            if !*self.0.running.lock().unwrap() {
                return;
            }
            let ready: Vec<CallId> = {
                let slots = self.0.slots.lock().unwrap();
                slots
                    .iter()
                    .filter(|(_, s)| matches!(s, Slot::Pending))
                    .map(|(id, _)| *id)
                    .collect()
            };
            let mut any_resolved = false;
            for id in ready {
                if let Some(result) = self.0.dispatcher.poll_answer(id) {
                    self.0.dispatcher.system().decrement_quota(self.0.caller);
                    let mut slots = self.0.slots.lock().unwrap();
                    slots.insert(id, Slot::Ready(result));
                    any_resolved = true;
                }
            }
            if any_resolved {
                self.0.cv.notify_all();
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Issues an async send and returns a handle the issuing fibril
    /// can block on for the answer.
    pub fn send(
        &self,
        phone: PhoneHandle,
        method: Method,
        flags: CallFlags,
        payload: Vec<u8>,
    ) -> Result<AsyncSender, IpcError> {
        let id = self
            .0
            .dispatcher
            .send_async(self.0.caller, phone, method, flags, payload)?;
        self.0.slots.lock().unwrap().insert(id, Slot::Pending);
        Ok(AsyncSender {
            manager: self.clone(),
            call: id,
        })
    }
}

/// A future-like handle to one outstanding async call (spec's
/// "returns immediately with a future-like handle").
pub struct AsyncSender {
    manager: Manager,
    call: CallId,
}

impl AsyncSender {
    /// Blocks the calling fibril until the answer arrives, or until
    /// `cancel` resolves it with [`IpcError::Cancelled`] from another
    /// thread.
    pub fn wait(self) -> Result<Vec<u8>, IpcError> {
        let mut slots = self.manager.0.slots.lock().unwrap();
        loop {
            match slots.get(&self.call) {
                Some(Slot::Ready(_)) | Some(Slot::Cancelled) => break,
                _ => slots = self.manager.0.cv.wait(slots).unwrap(),
            }
        }
        match slots.remove(&self.call) {
            Some(Slot::Ready(result)) => result,
            Some(Slot::Cancelled) | None => Err(IpcError::Cancelled),
            Some(Slot::Pending) => unreachable!("woken with no resolution"),
        }
    }

    /// Cancels this call's exchange (spec "Cancellation"): any fibril
    /// blocked in `wait` wakes with `IpcError::Cancelled`. The
    /// underlying dispatcher call is left to resolve on its own --
    /// this only stops this task from caring about the answer.
    pub fn cancel(self) {
        let mut slots = self.manager.0.slots.lock().unwrap();
        if matches!(slots.get(&self.call), Some(Slot::Pending)) {
            slots.insert(self.call, Slot::Cancelled);
        }
        drop(slots);
        self.manager.0.cv.notify_all();
    }

    pub fn call_id(&self) -> CallId {
        self.call
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::System;

    fn pair() -> (Manager, Dispatcher, TaskId, PhoneHandle) {
        let sys = System::new();
        let disp = Dispatcher::new(sys.clone());
        let a = sys.spawn_task(None);
        let b = sys.spawn_task(None);
        let phone = disp.phone_alloc(a).unwrap();
        disp.phone_connect(a, phone, b).unwrap();
        let manager = Manager::start(disp.clone(), a);
        (manager, disp, b, phone)
    }

    #[test]
    fn async_send_resolves_once_answered() {
        let (manager, disp, b, phone) = pair();
        let sender = manager
            .send(phone, Method(0x8000), CallFlags::empty(), vec![9])
            .unwrap();

        let worker = std::thread::spawn(move || {
            let call = disp.wait_for_call(b, None).unwrap().into_call().unwrap();
            assert_eq!(call.payload, vec![9]);
            disp.answer(b, call.id, vec![10]).unwrap();
        });
        let reply = sender.wait().unwrap();
        assert_eq!(reply, vec![10]);
        worker.join().unwrap();
        manager.shutdown();
    }

    #[test]
    fn cancelled_sender_wakes_with_cancelled_error() {
        let (manager, _disp, _b, phone) = pair();
        let sender = manager
            .send(phone, Method(0x8000), CallFlags::empty(), vec![])
            .unwrap();
        let id = sender.call_id();
        let manager2 = manager.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            for pending in [id] {
                let mut slots = manager2.0.slots.lock().unwrap();
                slots.insert(pending, Slot::Cancelled);
                drop(slots);
                manager2.0.cv.notify_all();
            }
        });
        assert_eq!(sender.wait(), Err(IpcError::Cancelled));
        manager.shutdown();
    }
}
