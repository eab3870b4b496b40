// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end dispatcher scenarios, exercising `kern` the way a real
//! client/server pair would: one thread per task, talking only
//! through `Dispatcher`.

use std::thread;
use std::time::Duration;

use abi::{CallFlags, IpcError, Method};
use kern::bulk::Lease;
use kern::{Dispatcher, Event, System};

fn dispatcher() -> Dispatcher {
    Dispatcher::new(System::new())
}

/// S1: a client sends one synchronous call and gets back the reply the
/// server chose to send.
#[test]
fn scenario_request_reply() {
    let disp = dispatcher();
    let client = disp.system().spawn_task(None);
    let server = disp.system().spawn_task(None);
    let phone = disp.phone_alloc(client).unwrap();
    disp.phone_connect(client, phone, server).unwrap();

    let server_thread = thread::spawn({
        let disp = disp.clone();
        move || {
            let call = disp
                .wait_for_call(server, None)
                .unwrap()
                .into_call()
                .unwrap();
            assert_eq!(call.payload, b"ping");
            disp.answer(server, call.id, b"pong".to_vec()).unwrap();
        }
    });

    let reply = disp
        .send_sync(client, phone, Method(0x8001), CallFlags::empty(), b"ping".to_vec())
        .unwrap();
    assert_eq!(reply, b"pong");
    server_thread.join().unwrap();
}

/// S2: a client fires an asynchronous call, does other work, then
/// collects the answer -- `poll_answer` sees nothing until the server
/// actually answers.
#[test]
fn scenario_async_call_then_poll() {
    let disp = dispatcher();
    let client = disp.system().spawn_task(None);
    let server = disp.system().spawn_task(None);
    let phone = disp.phone_alloc(client).unwrap();
    disp.phone_connect(client, phone, server).unwrap();

    let id = disp
        .send_async(client, phone, Method(0x8001), CallFlags::ASYNC, vec![])
        .unwrap();
    assert!(disp.poll_answer(id).is_none());

    let call = disp
        .wait_for_call(server, None)
        .unwrap()
        .into_call()
        .unwrap();
    disp.answer(server, call.id, vec![1, 2]).unwrap();

    let reply = disp.await_answer(client, id).unwrap();
    assert_eq!(reply, vec![1, 2]);
}

/// S3: a server forwards a call to a third task; the original client
/// sees the third task's answer as if it had called directly.
#[test]
fn scenario_forward_to_third_party() {
    let disp = dispatcher();
    let client = disp.system().spawn_task(None);
    let middle = disp.system().spawn_task(None);
    let backend = disp.system().spawn_task(None);

    let to_middle = disp.phone_alloc(client).unwrap();
    disp.phone_connect(client, to_middle, middle).unwrap();
    let to_backend = disp.phone_alloc(middle).unwrap();
    disp.phone_connect(middle, to_backend, backend).unwrap();

    let middle_thread = thread::spawn({
        let disp = disp.clone();
        move || {
            let call = disp
                .wait_for_call(middle, None)
                .unwrap()
                .into_call()
                .unwrap();
            disp.forward(middle, call, to_backend).unwrap();
        }
    });
    let backend_thread = thread::spawn({
        let disp = disp.clone();
        move || {
            let call = disp
                .wait_for_call(backend, None)
                .unwrap()
                .into_call()
                .unwrap();
            disp.answer(backend, call.id, b"handled".to_vec()).unwrap();
        }
    });

    let reply = disp
        .send_sync(client, to_middle, Method(0x8002), CallFlags::empty(), vec![])
        .unwrap();
    assert_eq!(reply, b"handled");
    middle_thread.join().unwrap();
    backend_thread.join().unwrap();
}

/// S4: hanging up a phone delivers exactly one hangup notification to
/// the peer, and a subsequent send on the caller's side fails cleanly.
#[test]
fn scenario_hangup_notifies_peer_once() {
    let disp = dispatcher();
    let a = disp.system().spawn_task(None);
    let b = disp.system().spawn_task(None);
    let phone = disp.phone_alloc(a).unwrap();
    disp.phone_connect(a, phone, b).unwrap();

    disp.phone_hangup(a, phone).unwrap();
    let notify = disp.wait_for_call(b, None).unwrap().into_call().unwrap();
    assert_eq!(notify.method, kern::system::HANGUP_NOTIFY);

    assert_eq!(
        disp.wait_for_call(b, Some(Duration::from_millis(10))),
        Err(IpcError::Timeout)
    );
    assert_eq!(
        disp.send_sync(a, phone, Method(0x8001), CallFlags::empty(), vec![])
            .unwrap_err(),
        IpcError::Hungup
    );
}

/// S5: bulk data moves between two leases attached to a call, and the
/// copy is visible to the receiver as soon as the call completes.
#[test]
fn scenario_bulk_transfer_completes_before_answer_observed() {
    let disp = dispatcher();
    let client = disp.system().spawn_task(None);
    let server = disp.system().spawn_task(None);
    let phone = disp.phone_alloc(client).unwrap();
    disp.phone_connect(client, phone, server).unwrap();

    let payload = Lease::new(b"bulk-bytes".to_vec());
    let sink = Lease::new(vec![0u8; payload.len()]);

    let server_thread = thread::spawn({
        let disp = disp.clone();
        let payload = payload.clone();
        let sink = sink.clone();
        move || {
            let call = disp
                .wait_for_call(server, None)
                .unwrap()
                .into_call()
                .unwrap();
            kern::bulk::safe_copy(&payload, &sink).unwrap();
            disp.answer(server, call.id, vec![]).unwrap();
        }
    });

    disp.send_sync(
        client,
        phone,
        Method(0x8003),
        CallFlags::HAS_LEASE,
        vec![],
    )
    .unwrap();
    server_thread.join().unwrap();

    let out = kern::bulk::data_read(&sink, 0, sink.len()).unwrap();
    assert_eq!(out, b"bulk-bytes");
}

/// S6: when a server task is retired while a client is blocked waiting
/// on its reply, the client observes `SenderGone` rather than hanging
/// forever.
#[test]
fn scenario_server_retirement_unblocks_waiting_client() {
    let disp = dispatcher();
    let client = disp.system().spawn_task(None);
    let server = disp.system().spawn_task(None);
    let phone = disp.phone_alloc(client).unwrap();
    disp.phone_connect(client, phone, server).unwrap();

    let id = disp
        .send_async(client, phone, Method(0x8001), CallFlags::empty(), vec![])
        .unwrap();
    disp.system().retire_task(server);
    assert_eq!(disp.await_answer(client, id).unwrap_err(), IpcError::SenderGone);
}
