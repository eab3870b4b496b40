// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level user interface.
//!
//! This is intended to provide a more ergonomic interface than the raw
//! `TaskHandle::sys_*` primitives, the same way the teacher's `hl`
//! sits above its raw syscalls. The biggest change from the teacher:
//! a received message's payload is an owned `Vec<u8>` here (since
//! `kern` already copied it into the answerbox), so `Message` owns its
//! bytes instead of borrowing a caller-supplied buffer, and a `Caller`
//! carries the [`kern::call::CallId`] needed to answer it, not just a
//! `TaskId`.

use core::cell::Cell;
use core::marker::PhantomData;

use abi::{PhoneHandle, TaskId};
use kern::bulk::Lease;
use kern::call::CallId;
use zerocopy::{AsBytes, FromBytes};

use crate::{ClosedRecvError, FromPrimitive, RecvMessage, RecvResult, TaskHandle};

/// Receives a message, or a notification, and handles it.
///
/// `mask` is a bitmask describing the set of notifications to accept.
/// `state` is a value of your choice passed to whichever closure --
/// `notify` or `msg` -- gets executed, so that both can reach shared
/// state without fighting the borrow checker over it.
pub fn recv<O, E, S>(
    task: &TaskHandle,
    mask: u32,
    state: S,
    notify: impl FnOnce(S, u32),
    msg: impl FnOnce(S, O, Message) -> Result<(), E>,
) where
    O: FromPrimitive,
    E: Into<u32>,
{
    match task.sys_recv_open(mask) {
        RecvResult::Notification(bits) => notify(state, bits),
        RecvResult::Message(rm) => dispatch_message(task, rm, state, msg),
    }
}

/// Variant of `recv` that doesn't allow notifications.
pub fn recv_without_notification<O, E>(
    task: &TaskHandle,
    msg: impl FnOnce(O, Message) -> Result<(), E>,
) where
    O: FromPrimitive,
    E: Into<u32>,
{
    recv(task, 0, (), |_, _| (), |_, op, m| msg(op, m))
}

/// Variant of `recv` that can be configured at runtime to receive from
/// a specific task only (closed receive) by setting `source` to
/// `Some(task_id)`, or to receive from all callers (`source` of
/// `None`).
pub fn recv_from<O, E, S>(
    task: &TaskHandle,
    source: Option<TaskId>,
    mask: u32,
    state: S,
    notify: impl FnOnce(S, u32),
    msg: impl FnOnce(S, O, Message) -> Result<(), E>,
) -> Result<(), ClosedRecvError>
where
    O: FromPrimitive,
    E: Into<u32>,
{
    let result = task.sys_recv(mask)?;
    match result {
        RecvResult::Notification(bits) => {
            notify(state, bits);
            Ok(())
        }
        RecvResult::Message(rm) => {
            if let Some(expected) = source {
                if rm.sender != expected {
                    // Not who we were expecting; answer defensively
                    // rather than silently dropping the call.
                    task.sys_reply_fail(rm.call, 1);
                    return Ok(());
                }
            }
            dispatch_message(task, rm, state, msg);
            Ok(())
        }
    }
}

/// Variant of `recv_from_without_notification` -- see `recv_from`.
pub fn recv_from_without_notification<O, E>(
    task: &TaskHandle,
    source: Option<TaskId>,
    msg: impl FnOnce(O, Message) -> Result<(), E>,
) -> Result<(), ClosedRecvError>
where
    O: FromPrimitive,
    E: Into<u32>,
{
    recv_from(task, source, 0, (), |_, _| (), |_, op, m| msg(op, m))
}

fn dispatch_message<O, E, S>(
    task: &TaskHandle,
    rm: RecvMessage,
    state: S,
    msg: impl FnOnce(S, O, Message) -> Result<(), E>,
) where
    O: FromPrimitive,
    E: Into<u32>,
{
    let sender = rm.sender;
    let call = rm.call;
    if let Some(op) = O::from_u32(rm.operation) {
        let m = Message {
            payload: rm.payload,
            sender,
            call,
        };
        if let Err(e) = msg(state, op, m) {
            task.sys_reply_fail(call, e.into());
        }
    } else {
        task.sys_reply_fail(call, 1);
    }
}

/// Represents a received message (not a notification), owning its
/// payload bytes.
pub struct Message {
    payload: Vec<u8>,
    sender: TaskId,
    call: CallId,
}

impl Message {
    /// Parses this message as a fixed-size value of type `M`, and
    /// prepares to (maybe, eventually) send a response of type `R`.
    ///
    /// Returns `None` if the caller sent a message of the wrong size
    /// for `M`.
    pub fn fixed<M, R>(self) -> Option<(M, Caller<R>)>
    where
        M: FromBytes,
        R: AsBytes,
    {
        if self.payload.len() != core::mem::size_of::<M>() {
            return None;
        }
        let msg = M::read_from(self.payload.as_slice())
            .expect("buffer has wrong size for M");
        let caller = Caller::new(self.sender, self.call);
        Some((msg, caller))
    }

    pub fn sender(&self) -> TaskId {
        self.sender
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A typed handle to a call, used to send a single reply of type `R`.
pub struct Caller<R> {
    task: TaskId,
    call: CallId,
    _phantom: PhantomData<fn(R)>,
}

impl<R> Caller<R> {
    fn new(task: TaskId, call: CallId) -> Self {
        Self {
            task,
            call,
            _phantom: PhantomData,
        }
    }

    /// Sends a successful reply message of type `R`, consuming the
    /// handle. `on` is the answering task (it must be the task that
    /// received this call, since only that task owns it).
    pub fn reply(self, on: &TaskHandle, message: R)
    where
        R: AsBytes,
    {
        on.sys_reply(self.call, 0, message.as_bytes());
    }

    /// Sends a failure message with response code `rc`, consuming the
    /// handle. A response code of `0` conventionally means "success,"
    /// so `rc` should not convert to `0`.
    pub fn reply_fail(self, on: &TaskHandle, rc: impl Into<u32>) {
        on.sys_reply_fail(self.call, rc.into());
    }

    /// Derives a lease handle attached to this call, for bulk data
    /// transfer (spec C6).
    pub fn lease(&self, lease: Lease) -> BoundLease<'_> {
        BoundLease {
            _caller: PhantomData,
            lease,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }
}

/// A lease attached to the call a `Caller` is answering. Borrowing the
/// `Caller` keeps this from outliving the reply -- once you've
/// answered, the lease is gone (the error-robustness rationale the
/// teacher's `Borrow` documents, kept in spirit).
pub struct BoundLease<'caller> {
    _caller: PhantomData<&'caller ()>,
    lease: Lease,
}

impl BoundLease<'_> {
    pub fn read_fully_at(&self, offset: usize, dest: &mut [u8]) -> Option<()> {
        let bytes = kern::bulk::data_read(&self.lease, offset, dest.len()).ok()?;
        dest.copy_from_slice(&bytes);
        Some(())
    }

    pub fn write_fully_at(&self, offset: usize, src: &[u8]) -> Option<()> {
        kern::bulk::data_write(&self.lease, offset, src, None).ok()?;
        Some(())
    }

    pub fn len(&self) -> usize {
        self.lease.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lease.is_empty()
    }
}

/// Trait implemented by types that represent a message sent to another
/// task, mirroring the teacher's `Call` trait so `hl::send` can stay
/// generic over the operation.
pub trait Call: AsBytes {
    type Response: FromBytes;
    type Err: From<u32>;
    const OP: u16;
}

/// Typed version of `TaskHandle::sys_send` that sends a value to
/// another task over `phone` and collects a response.
pub fn send<M>(
    task: &TaskHandle,
    phone: PhoneHandle,
    message: &M,
) -> Result<M::Response, M::Err>
where
    M: Call,
{
    let mut response = vec![0u8; core::mem::size_of::<M::Response>()];
    let (code, len) =
        task.sys_send(phone, M::OP, message.as_bytes(), &mut response);
    if code == 0 {
        if len == response.len() {
            Ok(M::Response::read_from(response.as_slice())
                .expect("response has wrong size for M::Response"))
        } else {
            panic!("server replied with wrong-size response");
        }
    } else {
        Err(M::Err::from(code))
    }
}

/// Typed version of `send` that retries automatically if the peer has
/// restarted since `target` was last refreshed -- for operations that
/// are safe to repeat (the server may have performed the operation
/// and then crashed before replying).
pub fn send_with_retry<M>(
    task: &TaskHandle,
    target: &Cell<TaskId>,
    phone: PhoneHandle,
    message: &M,
) -> Result<M::Response, M::Err>
where
    M: Call,
    M::Err: Into<u32>,
{
    loop {
        match send(task, phone, message) {
            Ok(r) => break Ok(r),
            Err(e) => {
                let code: u32 = e.into();
                if let Some(gen) = abi::extract_new_generation(code) {
                    let last = target.get();
                    target.set(TaskId::for_index_and_gen(last.index(), gen));
                    continue;
                }
                break Err(M::Err::from(code));
            }
        }
    }
}
