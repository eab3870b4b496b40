// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use abi::{Method, PhoneHandle, ServiceId};
use kern::{Dispatcher, System};
use naming_service::{BootConfig, Registry};
use userlib::TaskHandle;

fn spawn_registry_thread(ns: TaskHandle, config: BootConfig) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || naming_service::run(ns, config))
}

#[test]
fn boot_reservation_is_connectable_without_registering() {
    let sys = System::new();
    let disp = Dispatcher::new(sys.clone());
    let ns = TaskHandle::new(sys.spawn_task(None), disp.clone());
    let provider = TaskHandle::new(sys.spawn_task(Some(ns.id())), disp.clone());
    let client = TaskHandle::new(sys.spawn_task(Some(ns.id())), disp.clone());

    let mut config = BootConfig::empty();
    config.reservations.push(naming_service::Reservation {
        service: ServiceId::Clock,
        task: provider.id(),
        clonable: false,
    });

    // The registry loop runs forever; leaving it unjoined mirrors how
    // the service actually runs (there is no clean shutdown), and it
    // exits with the process when the test binary does.
    let _ns_thread = spawn_registry_thread(ns.clone(), config);

    // The naming service forwards CONNECT_TO_SERVICE to the boot
    // reservation's provider, which must accept it itself before the
    // client sees a phone handle come back.
    let provider_worker = std::thread::spawn({
        let provider = provider.clone();
        move || {
            let forwarded = provider.sys_recv_open(0);
            match forwarded {
                userlib::RecvResult::Message(m) => {
                    let call = kern::IncomingCall {
                        id: m.call,
                        sender: m.sender,
                        method: Method(m.operation),
                        flags: abi::CallFlags::empty(),
                        payload: m.payload,
                    };
                    userlib::kipc::accept_connect(&provider, &call).unwrap();
                }
                userlib::RecvResult::Notification(_) => panic!("unexpected notification"),
            }
        }
    });

    let mut buf = [0u8; 16];
    let n = ssmarshal::serialize(&mut buf, &ServiceId::Clock).unwrap();
    let mut response = [0u8; 4];
    let (code, len) = client.sys_send(
        PhoneHandle::NAMING_SERVICE,
        Method::CONNECT_TO_SERVICE.0 as u16,
        &buf[..n],
        &mut response,
    );
    assert_eq!(code, 0);
    assert_eq!(len, 4);
    provider_worker.join().unwrap();

    let phone = PhoneHandle(u32::from_le_bytes(response));
    let mut echo_response = [0u8; 0];
    // Nobody is listening on `phone` yet, but the allocation/connect
    // succeeding at all is the thing under test here.
    let worker = std::thread::spawn({
        let provider = provider.clone();
        move || {
            let call = provider.sys_recv_open(0);
            match call {
                userlib::RecvResult::Message(m) => provider.sys_reply(m.call, 0, &[]),
                userlib::RecvResult::Notification(_) => panic!("unexpected notification"),
            }
        }
    });
    let (code, _) = client.sys_send(phone, 0x8000, &[], &mut echo_response);
    assert_eq!(code, 0);
    worker.join().unwrap();
}

#[test]
fn registry_rejects_wrong_size_payload() {
    let sys = System::new();
    let disp = Dispatcher::new(sys.clone());
    let ns = TaskHandle::new(sys.spawn_task(None), disp.clone());
    let client = TaskHandle::new(sys.spawn_task(Some(ns.id())), disp.clone());
    let mut registry = Registry::new();

    let ns_id = ns.id();
    let worker = std::thread::spawn(move || {
        let mut response = [0u8; 0];
        client.sys_send(
            PhoneHandle::NAMING_SERVICE,
            Method::REGISTER.0 as u16,
            b"\x00\x01",
            &mut response,
        )
    });
    let call = ns.dispatcher().wait_for_call(ns_id, None).unwrap();
    registry.handle(&ns, call.into_call().unwrap());
    let (code, _) = worker.join().unwrap();
    assert_eq!(
        userlib::decode_response(code),
        Some(abi::IpcError::BadSize)
    );
}
