// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The naming service: the well-known peer every task finds at
//! `PhoneHandle::NAMING_SERVICE` (capability 0).
//!
//! The teacher has no equivalent of this -- its capability 0 always
//! points at the supervisor, a peer with a fixed, statically-known
//! identity. Here, capability 0 is a broker: tasks register under a
//! [`ServiceId`], other tasks look services up and get a phone
//! connected to whichever task registered, and a small amount of
//! task-lifecycle bookkeeping (`TASK_ID_INTRO`/`TASK_RETVAL`/
//! `TASK_WAIT`) rides along on the same operation table, the way the
//! teacher's kernel virtual task answers a handful of unrelated
//! bookkeeping operations through one dispatch loop
//! (`sys/kern/src/kipc.rs`'s `handle_kernel_message`). This crate
//! builds the dispatch-by-operation-code loop in that same shape.

use std::collections::{HashMap, HashSet, VecDeque};

use abi::{IpcError, Method, PhoneHandle, ServiceId, TaskId};
use kern::call::CallId;
use kern::{Event, IncomingCall};
use userlib::{encode_error, TaskHandle};

mod config;

pub use config::{BootConfig, ConfigError, Reservation};

/// Registry state: who provides what, who is waiting on whom.
///
/// Kept separate from the dispatch loop in [`run`] so tests can drive
/// [`Registry::handle`] directly against a hand-built call, the way
/// `sys/kern/src/system.rs`'s own tests drive `System` methods without
/// going through a thread.
pub struct Registry {
    providers: HashMap<ServiceId, TaskId>,
    /// A phone the naming service itself holds to each fixed provider,
    /// opened the moment it registers. Every `CONNECT_TO_SERVICE` (and
    /// `CONNECT_TO_ME_CALLBACK`) for that service is forwarded through
    /// it rather than answered directly, so the provider's own
    /// `wait_for_call` is the one that actually sees the connect
    /// request and opens the return phone (spec C4, grounded on
    /// `concttome.c`'s forward-the-original-call idiom).
    admin_phones: HashMap<ServiceId, PhoneHandle>,
    /// Second table (spec C4): service ids for which every connection
    /// spawns a fresh server instance. A service id stays clonable
    /// forever once any registration declares it so, independent of
    /// how many queued registrations currently sit in
    /// `clonable_queue`.
    clonable_ids: HashSet<ServiceId>,
    /// Queued clonable registrations awaiting a client, one admin
    /// phone per registration; the first `connect_to_service` pops one
    /// and forwards to it, so each registration serves exactly one
    /// client.
    clonable_queue: HashMap<ServiceId, VecDeque<PhoneHandle>>,
    /// `connect_to_service` calls left pending because their service
    /// is clonable but nothing has registered against it yet.
    pending_connects: HashMap<ServiceId, VecDeque<IncomingCall>>,
    retvals: HashMap<TaskId, u32>,
    waiters: HashMap<TaskId, Vec<CallId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            admin_phones: HashMap::new(),
            clonable_ids: HashSet::new(),
            clonable_queue: HashMap::new(),
            pending_connects: HashMap::new(),
            retvals: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    /// Seeds the registry with a fixed (or clonable) provider for each
    /// reservation in a boot-time topology, without requiring the
    /// provider task to call `register` itself.
    pub fn apply_boot_config(&mut self, ns: &TaskHandle, config: &BootConfig) {
        for r in &config.reservations {
            if let Ok(handle) = ns.dispatcher().phone_alloc(ns.id()) {
                if ns.dispatcher().phone_connect(ns.id(), handle, r.task).is_ok() {
                    if r.clonable {
                        log::info!("boot reservation (clonable): {:?} -> {:?}", r.service, r.task);
                        self.clonable_ids.insert(r.service);
                        self.clonable_queue.entry(r.service).or_default().push_back(handle);
                    } else {
                        log::info!("boot reservation: {:?} -> {:?}", r.service, r.task);
                        self.providers.insert(r.service, r.task);
                        self.admin_phones.insert(r.service, handle);
                    }
                }
            }
        }
        for service in self.clonable_ids.clone() {
            self.drain_pending_connects(ns, service);
        }
    }

    /// Forwards queued `connect_to_service` calls to queued clonable
    /// registrations for `service`, as many as both queues allow.
    /// Called after anything that could have added to either queue, so
    /// a late-registering clonable server unblocks waiters the moment
    /// it shows up (spec C4).
    fn drain_pending_connects(&mut self, ns: &TaskHandle, service: ServiceId) {
        loop {
            let has_pending = self
                .pending_connects
                .get(&service)
                .is_some_and(|q| !q.is_empty());
            if !has_pending {
                return;
            }
            let Some(via) = self
                .clonable_queue
                .get_mut(&service)
                .and_then(|q| q.pop_front())
            else {
                return;
            };
            let call = self
                .pending_connects
                .get_mut(&service)
                .and_then(|q| q.pop_front())
                .expect("has_pending just confirmed a front element");
            log::info!("draining queued connect for clonable {:?}", service);
            let _ = ns.dispatcher().forward(ns.id(), call, via);
        }
    }

    /// Handles one incoming call, answering or forwarding it before
    /// returning. Every branch consumes the call exactly once, the way
    /// every `kern::System` operation hands a call off to exactly one
    /// owner.
    pub fn handle(&mut self, ns: &TaskHandle, call: kern::IncomingCall) {
        match call.method {
            Method::REGISTER => self.register(ns, call),
            Method::CONNECT_TO_SERVICE => self.connect_to_service(ns, call),
            Method::CONNECT_TO_ME_CALLBACK => self.connect_to_me_callback(ns, call),
            Method::TASK_ID_INTRO => ns.sys_reply(call.id, 0, &[]),
            Method::TASK_RETVAL => self.task_retval(ns, call),
            Method::TASK_WAIT => self.task_wait(ns, call),
            Method::PING => ns.sys_reply(call.id, 0, &[]),
            _ => ns.sys_reply_fail(call.id, encode_error(IpcError::InvalidHandle)),
        }
    }

    /// Registers `call.sender` as the provider of a service (spec C4
    /// `register-service`). Fails with `AlreadyExists` if `service`
    /// already has a fixed non-clonable provider, and likewise if this
    /// registration's clonable-ness conflicts with the table the
    /// service id already belongs to: a service id is either a single
    /// fixed provider or a queue of one-shot clonable providers, never
    /// both (Open Question resolution, see `DESIGN.md`).
    fn register(&mut self, ns: &TaskHandle, call: kern::IncomingCall) {
        let (service, clonable) = match decode_register(&call.payload) {
            Some(v) => v,
            None => {
                ns.sys_reply_fail(call.id, encode_error(IpcError::BadSize));
                return;
            }
        };
        let has_fixed = self.providers.contains_key(&service);
        let is_clonable_type = self.clonable_ids.contains(&service);
        let conflict = if clonable {
            has_fixed
        } else {
            has_fixed || is_clonable_type
        };
        if conflict {
            ns.sys_reply_fail(call.id, encode_error(IpcError::AlreadyExists));
            return;
        }
        let provider = call.sender;
        match ns
            .dispatcher()
            .phone_alloc(ns.id())
            .and_then(|h| ns.dispatcher().phone_connect(ns.id(), h, provider).map(|_| h))
        {
            Ok(handle) => {
                if clonable {
                    log::info!("registered clonable {:?} -> {:?}", service, provider);
                    self.clonable_ids.insert(service);
                    self.clonable_queue.entry(service).or_default().push_back(handle);
                    self.drain_pending_connects(ns, service);
                } else {
                    log::info!("registered {:?} -> {:?}", service, provider);
                    self.providers.insert(service, provider);
                    self.admin_phones.insert(service, handle);
                }
                ns.sys_reply(call.id, 0, &[]);
            }
            Err(e) => ns.sys_reply_fail(call.id, encode_error(e)),
        }
    }

    /// Forwards a `connect_to_service` call to whichever provider
    /// answers for `service`, the same way `connect_to_me_callback`
    /// already forwards rather than fabricating a reply itself: the
    /// provider's own `wait_for_call` sees the connect request and
    /// opens the return phone (spec C4, §2 data-flow step 2).
    fn connect_to_service(&mut self, ns: &TaskHandle, call: kern::IncomingCall) {
        let service = match decode_service(&call.payload) {
            Some(s) => s,
            None => {
                ns.sys_reply_fail(call.id, encode_error(IpcError::BadSize));
                return;
            }
        };
        if let Some(via) = self.admin_phones.get(&service).copied() {
            log::info!("forwarding connect-to-service for {:?}", service);
            let _ = ns.dispatcher().forward(ns.id(), call, via);
            return;
        }
        if self.clonable_ids.contains(&service) {
            match self.clonable_queue.get_mut(&service).and_then(|q| q.pop_front()) {
                Some(via) => {
                    log::info!("forwarding connect-to-service (clonable) for {:?}", service);
                    let _ = ns.dispatcher().forward(ns.id(), call, via);
                }
                None => {
                    log::info!("queuing connect-to-service for clonable {:?}", service);
                    self.pending_connects.entry(service).or_default().push_back(call);
                }
            }
            return;
        }
        ns.sys_reply_fail(call.id, encode_error(IpcError::NotFound));
    }

    fn connect_to_me_callback(&mut self, ns: &TaskHandle, call: kern::IncomingCall) {
        let service = match decode_service(&call.payload) {
            Some(s) => s,
            None => {
                ns.sys_reply_fail(call.id, encode_error(IpcError::BadSize));
                return;
            }
        };
        let via = match self.admin_phones.get(&service) {
            Some(h) => *h,
            None => {
                ns.sys_reply_fail(call.id, encode_error(IpcError::NotFound));
                return;
            }
        };
        // Forward the call as-is; the provider sees `call.sender`
        // untouched and can open its own phone back to it. We don't
        // manufacture a new message or reply here, matching
        // `concttome.c`'s approach of re-routing the very call that
        // asked, rather than answering it directly.
        let _ = ns.dispatcher().forward(ns.id(), call, via);
    }

    fn task_retval(&mut self, ns: &TaskHandle, call: kern::IncomingCall) {
        let code = match call.payload.get(0..4) {
            Some(bytes) => u32::from_le_bytes(bytes.try_into().unwrap()),
            None => {
                ns.sys_reply_fail(call.id, encode_error(IpcError::BadSize));
                return;
            }
        };
        self.retvals.insert(call.sender, code);
        if let Some(waiting) = self.waiters.remove(&call.sender) {
            for waiter in waiting {
                ns.sys_reply(waiter, 0, &code.to_le_bytes());
            }
        }
        ns.sys_reply(call.id, 0, &[]);
    }

    fn task_wait(&mut self, ns: &TaskHandle, call: kern::IncomingCall) {
        let target = match call.payload.get(0..2) {
            Some(bytes) => TaskId(u16::from_le_bytes(bytes.try_into().unwrap())),
            None => {
                ns.sys_reply_fail(call.id, encode_error(IpcError::BadSize));
                return;
            }
        };
        match self.retvals.get(&target) {
            Some(code) => ns.sys_reply(call.id, 0, &code.to_le_bytes()),
            // Left pending: the waiting task owns no thread time while
            // blocked in `sys_send`, and the call stays in `ns`'s
            // owned set until a matching `TASK_RETVAL` answers it.
            None => self.waiters.entry(target).or_default().push(call.id),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_service(payload: &[u8]) -> Option<ServiceId> {
    ssmarshal::deserialize(payload).ok().map(|(s, _)| s)
}

fn decode_register(payload: &[u8]) -> Option<(ServiceId, bool)> {
    ssmarshal::deserialize(payload).ok().map(|(v, _)| v)
}

/// Runs the naming service's dispatch loop forever on the calling
/// thread. Intended to be the body of a dedicated OS thread, the way
/// every other task in this simulation pins one thread to one
/// answerbox.
pub fn run(ns: TaskHandle, config: BootConfig) {
    let mut registry = Registry::new();
    registry.apply_boot_config(&ns, &config);
    loop {
        match ns.dispatcher().wait_for_call(ns.id(), None) {
            Ok(Event::Call(call)) => registry.handle(&ns, call),
            Ok(Event::Notification(_)) => {}
            Err(_) => {
                log::warn!("naming service task retired, stopping dispatch loop");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::{Dispatcher, System};
    use userlib::kipc;

    fn harness() -> (TaskHandle, Registry, Dispatcher) {
        let sys = System::new();
        let disp = Dispatcher::new(sys.clone());
        let ns = TaskHandle::new(sys.spawn_task(None), disp.clone());
        (ns, Registry::new(), disp)
    }

    fn client_of(ns: &TaskHandle, disp: &Dispatcher) -> (TaskHandle, PhoneHandle) {
        let sys = disp.system().clone();
        let client = TaskHandle::new(sys.spawn_task(Some(ns.id())), disp.clone());
        (client, PhoneHandle::NAMING_SERVICE)
    }

    /// Drives one pending call through `reg` on `ns`'s thread of
    /// control, the way `run`'s loop body does for exactly one event.
    fn step(ns: &TaskHandle, reg: &mut Registry) {
        let call = ns.dispatcher().wait_for_call(ns.id(), None).unwrap();
        reg.handle(ns, call.into_call().unwrap());
    }

    #[test]
    fn register_then_connect_forwards_to_provider_and_returns_live_phone() {
        let (ns, mut reg, disp) = harness();
        let (provider, _) = client_of(&ns, &disp);
        let (client, _) = client_of(&ns, &disp);

        let register = std::thread::spawn({
            let provider = provider.clone();
            move || kipc::register(&provider, &ServiceId::Echo, false)
        });
        step(&ns, &mut reg);
        register.join().unwrap().unwrap();

        let connect = std::thread::spawn({
            let client = client.clone();
            move || kipc::connect_to_service(&client, &ServiceId::Echo)
        });
        // Forwarded straight to the provider, not answered by ns itself.
        step(&ns, &mut reg);

        let forwarded = provider
            .dispatcher()
            .wait_for_call(provider.id(), None)
            .unwrap()
            .into_call()
            .unwrap();
        assert_eq!(forwarded.sender, client.id());
        kipc::accept_connect(&provider, &forwarded).unwrap();

        let phone = connect.join().unwrap().unwrap();
        assert_ne!(phone, PhoneHandle::NAMING_SERVICE);
    }

    #[test]
    fn clonable_registration_serves_exactly_one_queued_connect() {
        let (ns, mut reg, disp) = harness();
        let (provider, _) = client_of(&ns, &disp);
        let (client, _) = client_of(&ns, &disp);

        let connect = std::thread::spawn({
            let client = client.clone();
            move || kipc::connect_to_service(&client, &ServiceId::Net)
        });
        // No provider yet: the connect call is queued, not failed.
        step(&ns, &mut reg);
        assert!(!connect.is_finished());

        let register = std::thread::spawn({
            let provider = provider.clone();
            move || kipc::register(&provider, &ServiceId::Net, true)
        });
        step(&ns, &mut reg);
        register.join().unwrap().unwrap();

        let forwarded = provider
            .dispatcher()
            .wait_for_call(provider.id(), None)
            .unwrap()
            .into_call()
            .unwrap();
        assert_eq!(forwarded.sender, client.id());
        kipc::accept_connect(&provider, &forwarded).unwrap();
        connect.join().unwrap().unwrap();

        // That registration is now spent; a second connect has nothing
        // queued to pop and must wait again.
        let second = client_of(&ns, &disp).0;
        let second_connect = std::thread::spawn(move || {
            kipc::connect_to_service(&second, &ServiceId::Net)
        });
        step(&ns, &mut reg);
        assert!(!second_connect.is_finished());
    }

    #[test]
    fn clonable_register_after_fixed_provider_is_rejected() {
        let (ns, mut reg, disp) = harness();
        let (fixed, _) = client_of(&ns, &disp);
        let (other, _) = client_of(&ns, &disp);

        let first = std::thread::spawn({
            let fixed = fixed.clone();
            move || kipc::register(&fixed, &ServiceId::Clock, false)
        });
        step(&ns, &mut reg);
        first.join().unwrap().unwrap();

        let second = std::thread::spawn(move || kipc::register(&other, &ServiceId::Clock, true));
        step(&ns, &mut reg);
        assert_eq!(second.join().unwrap(), Err(IpcError::AlreadyExists));
    }

    #[test]
    fn double_register_is_rejected() {
        let (ns, mut reg, disp) = harness();
        let (a, _) = client_of(&ns, &disp);
        let (b, _) = client_of(&ns, &disp);

        let first = std::thread::spawn(move || kipc::register(&a, &ServiceId::Clock, false));
        step(&ns, &mut reg);
        first.join().unwrap().unwrap();

        let second = std::thread::spawn(move || kipc::register(&b, &ServiceId::Clock, false));
        step(&ns, &mut reg);
        assert_eq!(second.join().unwrap(), Err(IpcError::AlreadyExists));
    }

    #[test]
    fn connect_to_unregistered_service_is_not_found() {
        let (ns, mut reg, disp) = harness();
        let (client, _) = client_of(&ns, &disp);

        let worker = std::thread::spawn(move || kipc::connect_to_service(&client, &ServiceId::Net));
        step(&ns, &mut reg);
        assert_eq!(worker.join().unwrap(), Err(IpcError::NotFound));
    }

    #[test]
    fn task_wait_blocks_until_matching_retval() {
        let (ns, mut reg, disp) = harness();
        let (watcher, ns_phone) = client_of(&ns, &disp);
        let (worker_task, _) = client_of(&ns, &disp);
        let target = worker_task.id();

        let ns2 = ns.clone();
        let waiter = std::thread::spawn(move || {
            let mut response = [0u8; 4];
            let (code, _) = watcher.sys_send(
                ns_phone,
                Method::TASK_WAIT.0 as u16,
                &target.0.to_le_bytes(),
                &mut response,
            );
            (code, u32::from_le_bytes(response))
        });
        // TASK_WAIT arrives first and is left pending.
        let call = ns.dispatcher().wait_for_call(ns2.id(), None).unwrap();
        reg.handle(&ns2, call.into_call().unwrap());

        let ns3 = ns.clone();
        let reporter = std::thread::spawn(move || {
            let mut response = [0u8; 0];
            worker_task.sys_send(
                PhoneHandle::NAMING_SERVICE,
                Method::TASK_RETVAL.0 as u16,
                &99u32.to_le_bytes(),
                &mut response,
            )
        });
        let call = ns.dispatcher().wait_for_call(ns3.id(), None).unwrap();
        reg.handle(&ns3, call.into_call().unwrap());
        reporter.join().unwrap();

        let (code, value) = waiter.join().unwrap();
        assert_eq!(code, 0);
        assert_eq!(value, 99);
    }
}
