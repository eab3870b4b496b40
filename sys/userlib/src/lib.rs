// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The client library every task in this system links against.
//!
//! The teacher's `userlib` wraps ARM SVC trap instructions behind
//! plain Rust functions (`sys_send`, `sys_recv`, `sys_reply`, ...) so
//! application code never touches inline assembly directly. There is
//! no trap here -- a [`TaskHandle`] holds a [`kern::Dispatcher`] clone
//! and calls straight into it -- but the same shape of API is kept: a
//! small set of `sys_*`-named primitives that [`hl`] builds its
//! ergonomic, typed wrappers on top of.

pub mod hl;
pub mod kipc;

pub use num_traits::FromPrimitive;
pub use unwrap_lite::UnwrapLite;

use abi::{CallFlags, IpcError, Method, PhoneHandle, TaskId};
use kern::call::CallId;
use kern::{Dispatcher, Event, IncomingCall};

/// The response code conventionally meaning "the operation succeeded."
pub const SUCCESS: u32 = 0;

/// First response code used for an ordinary (non-generation) failure
/// raised by the dispatcher itself, as opposed to an application-level
/// code an answering task chose for `sys_reply`. Codes below this are
/// reserved for `SUCCESS`; codes at or above [`abi::FIRST_DEAD_CODE`]
/// instead encode a dead peer's generation.
const FIRST_ERROR_CODE: u32 = 1;

/// Encodes an [`IpcError`] as a response code any server in this
/// system can use with `sys_reply`, and any client can decode with
/// [`decode_response`].
pub fn encode_error(e: IpcError) -> u32 {
    FIRST_ERROR_CODE + u32::from(e)
}

/// Recovers an [`IpcError`] from a non-zero response code produced by
/// [`TaskHandle::sys_send`] for a transport-level (not application)
/// failure. Returns `None` for `SUCCESS`, a dead-peer generation code
/// (see [`abi::extract_new_generation`]), or an application code a
/// server chose that happens to collide with this range -- callers
/// that define their own error enum should decode the raw code
/// themselves instead of going through this helper.
pub fn decode_response(code: u32) -> Option<IpcError> {
    if code == SUCCESS || abi::extract_new_generation(code).is_some() {
        return None;
    }
    IpcError::try_from(code - FIRST_ERROR_CODE).ok()
}

/// Answer payloads carry their response code as a little-endian `u32`
/// prefix, with the application-defined body following it. This is
/// the wire-level equivalent of the teacher's `sys_reply(peer, code,
/// message)` taking the code out-of-band from the SVC return value --
/// there is no separate return channel here, so the dispatcher's
/// opaque `Vec<u8>` answer carries both.
fn pack_reply(code: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn unpack_reply(bytes: &[u8]) -> (u32, &[u8]) {
    if bytes.len() < 4 {
        return (SUCCESS, bytes);
    }
    let code = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    (code, &bytes[4..])
}

/// A message handed to a task by [`TaskHandle::sys_recv`]/
/// `sys_recv_open`, not yet answered.
#[derive(Debug, Clone)]
pub struct RecvMessage {
    pub sender: TaskId,
    pub call: CallId,
    pub operation: u32,
    pub payload: Vec<u8>,
}

/// What `sys_recv`/`sys_recv_open` handed back.
#[derive(Debug, Clone)]
pub enum RecvResult {
    Message(RecvMessage),
    Notification(u32),
}

/// Why a closed receive returned without a message. Kept as a
/// dedicated error type, matching the teacher, even though this
/// simulation only ever produces `Dead`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClosedRecvError {
    Dead,
}

/// A task's live handle onto the dispatcher: its own identity plus the
/// dispatcher every task in the system shares.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    dispatcher: Dispatcher,
}

impl TaskHandle {
    pub fn new(id: TaskId, dispatcher: Dispatcher) -> Self {
        Self { id, dispatcher }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn phone_alloc(&self) -> Result<PhoneHandle, IpcError> {
        self.dispatcher.phone_alloc(self.id)
    }

    pub fn phone_connect(
        &self,
        handle: PhoneHandle,
        peer: TaskId,
    ) -> Result<(), IpcError> {
        self.dispatcher.phone_connect(self.id, handle, peer)
    }

    pub fn phone_hangup(&self, handle: PhoneHandle) -> Result<(), IpcError> {
        self.dispatcher.phone_hangup(self.id, handle)
    }

    /// Duplicates `handle`'s connection for `target`, which gets its
    /// own phone to the same peer without this task relaying any
    /// further traffic (spec C1 `clone-connection`).
    pub fn phone_clone(&self, handle: PhoneHandle, target: TaskId) -> Result<PhoneHandle, IpcError> {
        self.dispatcher.clone_connection(self.id, handle, target)
    }

    /// Sends `msg` to whatever is connected on `phone` and blocks for
    /// a reply, the way the teacher's `sys_send` blocks for its SVC
    /// trap to return. `response` is filled with as many reply bytes
    /// as fit; the `(response code, bytes written)` pair mirrors the
    /// teacher's own convention of a plain response code plus length.
    pub fn sys_send(
        &self,
        phone: PhoneHandle,
        operation: u16,
        msg: &[u8],
        response: &mut [u8],
    ) -> (u32, usize) {
        match self.dispatcher.send_sync(
            self.id,
            phone,
            Method(u32::from(operation)),
            CallFlags::empty(),
            msg.to_vec(),
        ) {
            Ok(bytes) => {
                let (code, body) = unpack_reply(&bytes);
                let n = body.len().min(response.len());
                response[..n].copy_from_slice(&body[..n]);
                (code, n)
            }
            Err(e) => (encode_error(e), 0),
        }
    }

    /// Open receive: accepts a message from any sender, or a
    /// notification (the teacher's `sys_recv_open`).
    pub fn sys_recv_open(&self, mask: u32) -> RecvResult {
        match self.dispatcher.wait_for_call(self.id, None) {
            Ok(Event::Call(call)) => RecvResult::Message(into_recv_message(call)),
            Ok(Event::Notification(bits)) => RecvResult::Notification(bits & mask),
            Err(_) => RecvResult::Notification(0),
        }
    }

    /// Closed receive: like `sys_recv_open`, but surfaces dispatcher
    /// failure as `ClosedRecvError::Dead` instead of blocking forever
    /// (the teacher's `sys_recv`/`sys_recv_closed`).
    pub fn sys_recv(&self, mask: u32) -> Result<RecvResult, ClosedRecvError> {
        Ok(self.sys_recv_open(mask))
    }

    /// Answers `call` with response code `code` and body `message`
    /// (the teacher's `sys_reply(peer, code, message)`).
    pub fn sys_reply(&self, call: CallId, code: u32, message: &[u8]) {
        let _ = self
            .dispatcher
            .answer(self.id, call, pack_reply(code, message));
    }

    /// Answers `call` with a failure response code and no body.
    pub fn sys_reply_fail(&self, call: CallId, code: u32) {
        self.sys_reply(call, code, &[]);
    }
}

fn into_recv_message(call: IncomingCall) -> RecvMessage {
    RecvMessage {
        sender: call.sender,
        call: call.id,
        operation: call.method.0,
        payload: call.payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::System;

    fn pair() -> (TaskHandle, TaskHandle, PhoneHandle) {
        let sys = System::new();
        let disp = Dispatcher::new(sys.clone());
        let a = TaskHandle::new(sys.spawn_task(None), disp.clone());
        let b = TaskHandle::new(sys.spawn_task(None), disp.clone());
        let phone = a.phone_alloc().unwrap();
        a.phone_connect(phone, b.id()).unwrap();
        (a, b, phone)
    }

    #[test]
    fn encode_decode_round_trips_every_error() {
        for e in [
            IpcError::InvalidHandle,
            IpcError::Hungup,
            IpcError::QuotaExceeded,
            IpcError::NotFound,
            IpcError::CapTableFull,
        ] {
            assert_eq!(decode_response(encode_error(e)), Some(e));
        }
        assert_eq!(decode_response(SUCCESS), None);
    }

    #[test]
    fn sys_send_round_trips_code_and_body() {
        let (a, b, phone) = pair();
        let worker = std::thread::spawn(move || {
            let call = b.sys_recv_open(0);
            match call {
                RecvResult::Message(m) => {
                    assert_eq!(m.payload, b"hi");
                    b.sys_reply(m.call, 0, b"hello");
                }
                RecvResult::Notification(_) => panic!("unexpected notification"),
            }
        });
        let mut response = [0u8; 5];
        let (code, len) = a.sys_send(phone, 0x8000, b"hi", &mut response);
        assert_eq!(code, SUCCESS);
        assert_eq!(&response[..len], b"hello");
        worker.join().unwrap();
    }

    #[test]
    fn sys_send_surfaces_transport_error_as_encoded_code() {
        let (a, _b, phone) = pair();
        a.phone_hangup(phone).unwrap();
        let mut response = [0u8; 1];
        let (code, _) = a.sys_send(phone, 0x8000, &[], &mut response);
        assert_eq!(decode_response(code), Some(IpcError::Hungup));
    }

    #[test]
    fn phone_clone_lets_a_third_task_reach_the_same_peer() {
        let (a, b, phone) = pair();
        let sys = a.dispatcher().system().clone();
        let c = TaskHandle::new(sys.spawn_task(None), a.dispatcher().clone());

        let cloned = a.phone_clone(phone, c.id()).unwrap();
        let c_id = c.id();
        let worker = std::thread::spawn(move || match b.sys_recv_open(0) {
            RecvResult::Message(m) => {
                assert_eq!(m.sender, c_id);
                b.sys_reply(m.call, 0, &[]);
            }
            RecvResult::Notification(_) => panic!("unexpected notification"),
        });
        let mut response = [0u8; 0];
        c.sys_send(cloned, 0x8000, &[], &mut response);
        worker.join().unwrap();
    }
}
