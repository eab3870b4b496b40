// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatcher's task-facing surface (spec C2).
//!
//! `Dispatcher` is a thin, ergonomically-named wrapper over
//! [`crate::system::System`] -- it exists so call sites read
//! `dispatcher.send_sync(...)` rather than reaching into `System`
//! directly, mirroring the way the teacher separates `syscalls.rs`'s
//! per-syscall entry points from `task.rs`'s underlying state.

use std::time::Duration;

use abi::{CallFlags, IpcError, Method, PhoneHandle, TaskId};

use crate::call::{CallId, IncomingCall};
use crate::system::System;

/// What `wait_for_call` handed back: either a freshly arrived call, or
/// a notification posted by `poke` (checked first, per spec §4.2's
/// notification-priority rule, matching the teacher's own `recv`).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Call(IncomingCall),
    Notification(u32),
}

impl Event {
    pub fn into_call(self) -> Option<IncomingCall> {
        match self {
            Event::Call(c) => Some(c),
            Event::Notification(_) => None,
        }
    }
}

/// Cloneable dispatcher handle. See [`System`] for what cloning does
/// and does not copy.
#[derive(Clone)]
pub struct Dispatcher(System);

impl Dispatcher {
    pub fn new(system: System) -> Self {
        Self(system)
    }

    pub fn system(&self) -> &System {
        &self.0
    }

    pub fn send_sync(
        &self,
        caller: TaskId,
        phone: PhoneHandle,
        method: Method,
        flags: CallFlags,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, IpcError> {
        self.0.send_sync(caller, phone, method, flags, payload)
    }

    pub fn send_async(
        &self,
        caller: TaskId,
        phone: PhoneHandle,
        method: Method,
        flags: CallFlags,
        payload: Vec<u8>,
    ) -> Result<CallId, IpcError> {
        self.0.send_async(caller, phone, method, flags, payload)
    }

    pub fn await_answer(&self, caller: TaskId, id: CallId) -> Result<Vec<u8>, IpcError> {
        let result = self.0.await_answer(id);
        self.0.decrement_quota(caller);
        result
    }

    pub fn poll_answer(&self, id: CallId) -> Option<Result<Vec<u8>, IpcError>> {
        self.0.poll_answer(id)
    }

    pub fn wait_for_call(
        &self,
        task: TaskId,
        timeout: Option<Duration>,
    ) -> Result<Event, IpcError> {
        self.0.wait_for_call(task, timeout)
    }

    pub fn answer(
        &self,
        task: TaskId,
        call: CallId,
        payload: Vec<u8>,
    ) -> Result<(), IpcError> {
        self.0.answer(task, call, payload)
    }

    pub fn forward(
        &self,
        task: TaskId,
        call: IncomingCall,
        via: PhoneHandle,
    ) -> Result<(), IpcError> {
        self.0.forward(task, call, via)
    }

    pub fn poke(&self, target: TaskId, bits: u32) -> Result<(), IpcError> {
        self.0.poke(target, bits)
    }

    pub fn phone_alloc(&self, owner: TaskId) -> Result<PhoneHandle, IpcError> {
        self.0.phone_alloc(owner)
    }

    pub fn phone_connect(
        &self,
        owner: TaskId,
        handle: PhoneHandle,
        peer: TaskId,
    ) -> Result<(), IpcError> {
        self.0.phone_connect(owner, handle, peer)
    }

    pub fn phone_hangup(
        &self,
        owner: TaskId,
        handle: PhoneHandle,
    ) -> Result<(), IpcError> {
        self.0.phone_hangup(owner, handle)
    }

    pub fn clone_connection(
        &self,
        task: TaskId,
        handle: PhoneHandle,
        target: TaskId,
    ) -> Result<PhoneHandle, IpcError> {
        self.0.clone_connection(task, handle, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::System;

    #[test]
    fn send_sync_blocks_until_answered() {
        let sys = System::new();
        let disp = Dispatcher::new(sys.clone());
        let a = sys.spawn_task(None);
        let b = sys.spawn_task(None);
        let h = disp.phone_alloc(a).unwrap();
        disp.phone_connect(a, h, b).unwrap();

        let worker = std::thread::spawn({
            let disp = disp.clone();
            move || {
                let call = disp.wait_for_call(b, None).unwrap().into_call().unwrap();
                disp.answer(b, call.id, vec![42]).unwrap();
            }
        });
        let reply = disp
            .send_sync(a, h, Method(0x8000), CallFlags::empty(), vec![1])
            .unwrap();
        assert_eq!(reply, vec![42]);
        worker.join().unwrap();
    }

    #[test]
    fn await_answer_releases_quota_slot() {
        let sys = System::with_limits(abi::CAP_TABLE_LEN, 1);
        let disp = Dispatcher::new(sys.clone());
        let a = sys.spawn_task(None);
        let b = sys.spawn_task(None);
        let h = disp.phone_alloc(a).unwrap();
        disp.phone_connect(a, h, b).unwrap();

        let id = disp
            .send_async(a, h, Method(0x8000), CallFlags::empty(), vec![])
            .unwrap();
        let call = disp.wait_for_call(b, None).unwrap().into_call().unwrap();
        disp.answer(b, call.id, vec![]).unwrap();
        disp.await_answer(a, id).unwrap();

        // quota slot should be free again
        disp.send_async(a, h, Method(0x8000), CallFlags::empty(), vec![])
            .unwrap();
    }

    #[test]
    fn event_into_call_is_none_for_notifications() {
        assert!(Event::Notification(1).into_call().is_none());
    }
}
