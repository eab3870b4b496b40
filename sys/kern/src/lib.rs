// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The IPC dispatcher.
//!
//! This is the portion of the system that would, in a real microkernel,
//! run in privileged mode and mediate every cross-task interaction. Here
//! it runs as an ordinary library: tasks are represented by indices into
//! a task table owned by a [`system::System`], and "trapping into the
//! kernel" is simply calling a method on [`dispatch::Dispatcher`].
//!
//! # Design principles
//!
//! 1. The dispatcher owns all cross-task state (phones, capability
//!    tables, queued calls); tasks never share that state directly.
//! 2. A call has exactly one owner at any time: either it is queued in
//!    a callee's answerbox, or it is recorded as in-flight and awaiting
//!    an answer. It is never both.
//! 3. Lock ordering is capability-table-before-answerbox, matching
//!    spec §5, to avoid deadlocking `forward` against a concurrent
//!    `hangup`.

pub mod bulk;
pub mod call;
pub mod cap;
pub mod err;
pub mod phone;
pub mod ringbuf_log;
pub mod system;
pub mod dispatch;

pub use call::{CallId, IncomingCall};
pub use cap::CapTable;
pub use dispatch::{Dispatcher, Event};
pub use err::Result;
pub use phone::{Phone, PhoneState};
pub use system::System;
