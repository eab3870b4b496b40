// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Call records (spec C1).
//!
//! A call has exactly one owner at any moment: it is either queued in
//! a callee's answerbox (waiting to be picked up by
//! [`crate::dispatch::Dispatcher::wait_for_call`]) or recorded as
//! in-flight and awaiting an answer. `CallId` is the handle threaded
//! through both states, and through `forward`, without ever copying
//! the payload.

use abi::{CallFlags, Method, TaskId};

/// Opaque identity of one call, stable across `send` -> `wait_for_call`
/// -> `answer`/`forward`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CallId(pub(crate) u64);

/// A call as handed to the callee by `wait_for_call`.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub id: CallId,
    pub sender: TaskId,
    pub method: Method,
    pub flags: CallFlags,
    pub payload: Vec<u8>,
}
