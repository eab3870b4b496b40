// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A host binary that boots a [`kern::System`], a naming service, and
//! a handful of demo tasks, then drives the canonical end-to-end
//! scenarios by hand for manual inspection -- the host-side companion
//! to the unit and integration tests, in the spirit of the teacher's
//! own `xtask`/`packager` binaries (`clap::Parser` + `anyhow::Result`).

use std::sync::mpsc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use abi::{CallFlags, Method, PhoneHandle, ServiceId, TaskId};
use async_rt::Manager;
use bufpool::{BufHandle, Pool};
use kern::{Dispatcher, Event, System};
use naming_service::BootConfig;
use userlib::TaskHandle;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Scenario {
    All,
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
}

/// Drives one or all of the register/FIFO/hangup/forward/bulk/
/// sender-gone scenarios against a fresh, in-process simulation.
#[derive(Debug, Parser)]
#[clap(about = "runs canonical IPC scenarios against an in-process simulation")]
struct Args {
    /// Which scenario to run; defaults to all of them in order.
    #[clap(value_enum, default_value = "all")]
    scenario: Scenario,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let scenarios: Vec<Scenario> = match args.scenario {
        Scenario::All => vec![
            Scenario::S1,
            Scenario::S2,
            Scenario::S3,
            Scenario::S4,
            Scenario::S5,
            Scenario::S6,
        ],
        other => vec![other],
    };

    for s in scenarios {
        let name = format!("{s:?}");
        run(s).with_context(|| format!("scenario {name} failed"))?;
        println!("{name}: ok");
    }
    Ok(())
}

fn run(scenario: Scenario) -> Result<()> {
    match scenario {
        Scenario::All => unreachable!("expanded before dispatch"),
        Scenario::S1 => s1_register_and_connect(),
        Scenario::S2 => s2_fifo(),
        Scenario::S3 => s3_hangup(),
        Scenario::S4 => s4_forward(),
        Scenario::S5 => s5_bulk_read(),
        Scenario::S6 => s6_sender_gone(),
    }
}

fn harness() -> (System, Dispatcher, TaskHandle) {
    let sys = System::new();
    let disp = Dispatcher::new(sys.clone());
    let ns = TaskHandle::new(sys.spawn_task(None), disp.clone());
    (sys, disp, ns)
}

fn spawn_client(sys: &System, disp: &Dispatcher, ns: TaskId) -> TaskHandle {
    TaskHandle::new(sys.spawn_task(Some(ns)), disp.clone())
}

/// S1: a server registers under a service id; a client looks it up
/// through the naming service and reaches the server over the
/// returned phone.
fn s1_register_and_connect() -> Result<()> {
    let (sys, disp, ns) = harness();
    let ns_thread = thread::spawn({
        let ns = ns.clone();
        move || naming_service::run(ns, BootConfig::empty())
    });

    let server = spawn_client(&sys, &disp, ns.id());
    let client = spawn_client(&sys, &disp, ns.id());
    let service = ServiceId::Custom(17);

    userlib::kipc::register(&server, &service, false).context("server registration")?;

    let client_thread = thread::spawn({
        let client = client.clone();
        move || userlib::kipc::connect_to_service(&client, &service)
    });

    // The naming service forwards the lookup straight to the server; it
    // must accept that call itself before a phone exists to answer on.
    let Event::Call(forwarded) = server.dispatcher().wait_for_call(server.id(), None)? else {
        bail!("expected the forwarded connect-to-service request");
    };
    userlib::kipc::accept_connect(&server, &forwarded).context("server accepting client")?;

    let phone = client_thread
        .join()
        .unwrap()
        .context("client lookup")?;
    if phone == PhoneHandle::NAMING_SERVICE {
        bail!("connect_to_service returned the well-known naming-service handle");
    }

    let server_thread = thread::spawn(move || {
        let Event::Call(call) = server.dispatcher().wait_for_call(server.id(), None).unwrap()
        else {
            panic!("expected a call, not a notification");
        };
        assert_eq!(call.payload, b"ping");
        server.sys_reply(call.id, 0, b"pong");
    });

    let mut response = [0u8; 4];
    let (code, len) = client.sys_send(phone, 0x8000, b"ping", &mut response);
    server_thread.join().unwrap();
    if code != 0 || &response[..len] != b"pong" {
        bail!("unexpected reply from freshly connected server");
    }

    sys.retire_task(ns.id());
    let _ = ns_thread.join();
    Ok(())
}

/// S2: async sends over one connected phone arrive at the server in
/// send order, regardless of how the server interleaves its answers.
fn s2_fifo() -> Result<()> {
    let sys = System::new();
    let disp = Dispatcher::new(sys.clone());
    let server_task = sys.spawn_task(None);
    let server = TaskHandle::new(server_task, disp.clone());
    let client_task = sys.spawn_task(None);
    let client = TaskHandle::new(client_task, disp.clone());

    let phone = client.phone_alloc()?;
    client.phone_connect(phone, server_task)?;

    let (tx, rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        for _ in 0..5 {
            let Event::Call(call) = server.dispatcher().wait_for_call(server.id(), None).unwrap()
            else {
                continue;
            };
            tx.send(call.payload[0]).unwrap();
            server.sys_reply(call.id, 0, &[]);
        }
    });

    let manager = Manager::start(disp.clone(), client_task);
    let senders: Vec<_> = (1u8..=5)
        .map(|n| {
            manager
                .send(phone, Method(0x8000), CallFlags::empty(), vec![n])
                .unwrap()
        })
        .collect();
    for s in senders {
        s.wait().unwrap();
    }
    server_thread.join().unwrap();
    manager.shutdown();

    let received: Vec<u8> = rx.try_iter().collect();
    if received != [1, 2, 3, 4, 5] {
        bail!("FIFO order violated: got {received:?}");
    }
    Ok(())
}

/// S3: hanging up a phone delivers a hangup notification to the
/// peer's next `wait_for_call`, naming the same connection.
fn s3_hangup() -> Result<()> {
    let sys = System::new();
    let disp = Dispatcher::new(sys.clone());
    let server_task = sys.spawn_task(None);
    let client_task = sys.spawn_task(None);
    let client = TaskHandle::new(client_task, disp.clone());

    let phone = client.phone_alloc()?;
    client.phone_connect(phone, server_task)?;
    client.phone_hangup(phone)?;

    let Event::Call(call) = disp.wait_for_call(server_task, None)? else {
        bail!("expected the hangup notification as an ordinary call");
    };
    if call.method != kern::system::HANGUP_NOTIFY || call.sender != client_task {
        bail!("hangup notification did not name the hanging-up peer");
    }
    Ok(())
}

/// S4: the naming service forwards a `CONNECT_TO_ME_CALLBACK` through
/// the administrative phone it holds on a provider, so the provider
/// sees the original caller's identity directly -- never a forwarding
/// intermediary.
fn s4_forward() -> Result<()> {
    let (sys, disp, ns) = harness();
    let ns_thread = thread::spawn({
        let ns = ns.clone();
        move || naming_service::run(ns, BootConfig::empty())
    });

    let provider = spawn_client(&sys, &disp, ns.id());
    let client = spawn_client(&sys, &disp, ns.id());
    let service = ServiceId::Custom(42);
    userlib::kipc::register(&provider, &service, false)?;

    let client_id = client.id();
    let client_thread = thread::spawn(move || {
        userlib::kipc::connect_to_me_callback(&client, &service)
    });

    let Event::Call(forwarded) = provider
        .dispatcher()
        .wait_for_call(provider.id(), None)?
    else {
        bail!("expected the forwarded callback request");
    };
    if forwarded.sender != client_id {
        bail!("forward lost the original caller's identity");
    }
    provider.sys_reply(forwarded.id, 0, &[]);
    client_thread.join().unwrap()?;

    sys.retire_task(ns.id());
    let _ = ns_thread.join();
    Ok(())
}

/// S5: a client allocates a pooled buffer, a server fills part of it
/// and reports the length it actually wrote, and the client observes
/// exactly that many bytes -- bulk data moved by handle, not copied
/// through the call payload.
fn s5_bulk_read() -> Result<()> {
    let sys = System::new();
    let disp = Dispatcher::new(sys.clone());
    let server_task = sys.spawn_task(None);
    let server = TaskHandle::new(server_task, disp.clone());
    let client_task = sys.spawn_task(None);
    let client = TaskHandle::new(client_task, disp.clone());

    let phone = client.phone_alloc()?;
    client.phone_connect(phone, server_task)?;

    let pool = Pool::with_default_classes();
    let handle = pool.alloc(4096)?;

    let server_pool = pool.clone();
    let server_thread = thread::spawn(move || {
        let Event::Call(call) = server.dispatcher().wait_for_call(server.id(), None).unwrap()
        else {
            panic!("expected the data-read request");
        };
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&call.payload[..8]);
        let requested = BufHandle::from_le_bytes(id_bytes);
        let written = vec![0xABu8; 1234];
        server_pool.write(requested, &written).unwrap();
        server.sys_reply(call.id, 0, &1234u32.to_le_bytes());
    });

    let mut response = [0u8; 4];
    let (code, len) = client.sys_send(phone, 0x8001, &handle.to_le_bytes(), &mut response);
    server_thread.join().unwrap();
    if code != 0 || len != 4 {
        bail!("data-read call did not succeed");
    }
    let reported = u32::from_le_bytes(response) as usize;
    if reported != 1234 {
        bail!("server reported {reported} bytes, expected 1234");
    }
    let mut out = vec![0u8; 1234];
    pool.read(handle, 0, &mut out)?;
    if out != vec![0xABu8; 1234] {
        bail!("client did not observe the bytes the server wrote");
    }
    pool.release(handle)?;
    Ok(())
}

/// S6: a client sends an async request and exits before the server
/// answers. The server still receives and answers the call; the
/// discarded answer leaves no trace in the dispatcher's bookkeeping.
fn s6_sender_gone() -> Result<()> {
    let sys = System::new();
    let disp = Dispatcher::new(sys.clone());
    let server_task = sys.spawn_task(None);
    let server = TaskHandle::new(server_task, disp.clone());
    let client_task = sys.spawn_task(None);

    let phone = disp.phone_alloc(client_task)?;
    disp.phone_connect(client_task, phone, server_task)?;

    let call_id = disp.send_async(client_task, phone, Method(0x8000), CallFlags::empty(), vec![7])?;
    sys.retire_task(client_task);

    let Event::Call(call) = server.dispatcher().wait_for_call(server.id(), None)? else {
        bail!("expected the already-enqueued request to still arrive");
    };
    if call.payload != vec![7] {
        bail!("unexpected payload on the orphaned call");
    }
    // Answering a call whose sender is gone must not panic or hang --
    // the kernel discards it silently.
    server.sys_reply(call.id, 0, &[]);
    let _ = call_id;
    Ok(())
}
