// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operations implemented by IPC with the naming service.
//!
//! The teacher's `kipc.rs` is a thin client for the handful of
//! operations the supervisor task answers directly (task status,
//! restart, fault injection). This system's well-known peer at
//! capability 0 is the naming service instead (spec §4.4), so this
//! module plays the same role for *its* protocol: small, typed
//! wrappers around `sys_send(PhoneHandle::NAMING_SERVICE, ...)` that
//! every task can call without knowing the wire format.

use abi::{IpcError, Method, PhoneHandle, ServiceId, TaskId};

use crate::{decode_response, encode_error, TaskHandle};

fn naming_send(
    task: &TaskHandle,
    method: Method,
    msg: &[u8],
    response: &mut [u8],
) -> Result<usize, IpcError> {
    let (code, len) = task.sys_send(
        PhoneHandle::NAMING_SERVICE,
        method.0 as u16,
        msg,
        response,
    );
    if code == 0 {
        Ok(len)
    } else {
        Err(decode_response(code).unwrap_or(IpcError::InvalidHandle))
    }
}

/// Registers this task as the provider of `service` (spec C4
/// `register`). A `clonable` registration is good for exactly one
/// future `connect_to_service`: the naming service queues it and pops
/// it the moment a client connects, rather than binding it to `service`
/// forever the way a plain registration does.
pub fn register(
    task: &TaskHandle,
    service: &ServiceId,
    clonable: bool,
) -> Result<(), IpcError> {
    let mut buf = [0u8; 16];
    let n = ssmarshal::serialize(&mut buf, &(*service, clonable))
        .map_err(|_| IpcError::BadSize)?;
    naming_send(task, Method::REGISTER, &buf[..n], &mut []).map(|_| ())
}

/// Looks up `service` and returns a freshly connected phone to its
/// provider (spec C4 `connect_to_service`). The naming service forwards
/// this call to the provider itself, which is the one that actually
/// opens the returned phone -- see [`accept_connect`].
pub fn connect_to_service(
    task: &TaskHandle,
    service: &ServiceId,
) -> Result<PhoneHandle, IpcError> {
    let mut buf = [0u8; 16];
    let n = ssmarshal::serialize(&mut buf, service)
        .map_err(|_| IpcError::BadSize)?;
    let mut response = [0u8; 4];
    let len = naming_send(task, Method::CONNECT_TO_SERVICE, &buf[..n], &mut response)?;
    if len != 4 {
        return Err(IpcError::InvalidHandle);
    }
    Ok(PhoneHandle(u32::from_le_bytes(response)))
}

/// Accepts a `CONNECT_TO_SERVICE` call the naming service forwarded to
/// this task: opens a phone from the original caller to this task and
/// replies with its handle (spec C4 `connect_to_service`, the
/// provider's half of the forward-then-accept exchange the naming
/// service's `CONNECT_TO_ME_CALLBACK` already uses the same way).
pub fn accept_connect(
    task: &TaskHandle,
    call: &kern::IncomingCall,
) -> Result<PhoneHandle, IpcError> {
    let client = call.sender;
    let result = task
        .dispatcher()
        .phone_alloc(client)
        .and_then(|h| task.dispatcher().phone_connect(client, h, task.id()).map(|_| h));
    match result {
        Ok(handle) => {
            task.sys_reply(call.id, 0, &handle.0.to_le_bytes());
            Ok(handle)
        }
        Err(e) => {
            task.sys_reply_fail(call.id, encode_error(e));
            Err(e)
        }
    }
}

/// Registers a callback phone the provider of `service` can use to
/// call back into this task (spec C4
/// `connect_to_me_callback`/CONNECT_TO_ME_CALLBACK).
pub fn connect_to_me_callback(
    task: &TaskHandle,
    service: &ServiceId,
) -> Result<(), IpcError> {
    let mut buf = [0u8; 16];
    let n = ssmarshal::serialize(&mut buf, service)
        .map_err(|_| IpcError::BadSize)?;
    naming_send(task, Method::CONNECT_TO_ME_CALLBACK, &buf[..n], &mut [])
        .map(|_| ())
}

/// Announces this task's identity to the naming service, so it can be
/// looked up by `TASK_WAIT` later.
pub fn task_id_intro(task: &TaskHandle) -> Result<(), IpcError> {
    naming_send(task, Method::TASK_ID_INTRO, &task.id().0.to_le_bytes(), &mut [])
        .map(|_| ())
}

/// Reports this task's exit/retry code to the naming service (spec
/// C4's `TASK_RETVAL`), so a `task_wait`er can be told why.
pub fn task_retval(task: &TaskHandle, code: u32) -> Result<(), IpcError> {
    naming_send(task, Method::TASK_RETVAL, &code.to_le_bytes(), &mut [])
        .map(|_| ())
}

/// Blocks until `target` reports a return value via `task_retval`,
/// returning the code it reported.
pub fn task_wait(task: &TaskHandle, target: TaskId) -> Result<u32, IpcError> {
    let mut response = [0u8; 4];
    let len = naming_send(task, Method::TASK_WAIT, &target.0.to_le_bytes(), &mut response)?;
    if len != 4 {
        return Err(IpcError::InvalidHandle);
    }
    Ok(u32::from_le_bytes(response))
}

/// A liveness check against the naming service.
pub fn ping(task: &TaskHandle) -> Result<(), IpcError> {
    naming_send(task, Method::PING, &[], &mut []).map(|_| ())
}
