// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative async framework layered over the synchronous dispatcher
//! (spec C5).
//!
//! The teacher has nothing like this -- every one of its tasks runs a
//! single blocking `sys_recv` loop. This module builds the pieces the
//! specification asks for on top of `kern`/`userlib`: [`Fibril`] (a
//! cooperatively-managed unit of concurrency), [`Exchange`] (mutual
//! exclusion on a phone across fibrils sharing one task), an async
//! send/correlation layer ([`Manager`]/[`AsyncSender`]), and
//! per-connection dispatch ([`Server`]).
//!
//! Real fibrils are stackful user-mode coroutines multiplexed
//! many-to-one onto kernel threads; that scheduler has nothing to sit
//! on top of in a hosted binary with no notion of "kernel thread" at
//! all below `std::thread`, so every fibril here gets its own OS
//! thread instead (one-to-one, not many-to-one) and yields simply by
//! blocking on IPC the way the thread already does. What is kept is
//! the *shape* of the API: reservation-scoped exchanges, a manager
//! that owns correlation, and a handler spawned per new connection.

pub mod exchange;
pub mod fibril;
pub mod sender;
pub mod server;

pub use exchange::{Exchange, PhoneLocks};
pub use fibril::{CancelToken, Fibril};
pub use sender::{AsyncSender, Manager};
pub use server::Server;
