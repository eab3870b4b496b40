// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatcher event log, backed by [`ringbuf`].

use abi::TaskId;
use ringbuf::Ringbuf;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchEvent {
    Send { from: TaskId, to: TaskId },
    Answer { to: TaskId },
    Forward { from: TaskId, to: TaskId },
    Hangup { task: TaskId },
    Timeout { task: TaskId },
    Poke { task: TaskId },
}

ringbuf::ringbuf!(EVENTS, DispatchEvent, 64);

pub fn log(event: DispatchEvent) {
    ringbuf::ringbuf_entry!(EVENTS, event);
}

pub fn snapshot() -> Vec<ringbuf::RingbufEntry<DispatchEvent>> {
    EVENTS.snapshot()
}

#[allow(dead_code)]
fn _assert_ringbuf_type() -> &'static Ringbuf<DispatchEvent> {
    &EVENTS
}
