// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-process "kernel": task table, phone pool, and per-call
//! bookkeeping shared by every [`crate::dispatch::Dispatcher`]
//! operation.
//!
//! In the teacher, this state lives in a `&mut [Task]` slice passed
//! through every syscall handler, because the kernel runs with
//! interrupts disabled and is implicitly single-threaded. Here,
//! multiple simulated tasks are ordinary OS threads that can call into
//! the dispatcher concurrently, so the task table is owned by a
//! `Mutex` and blocking operations (`wait_for_call`, synchronous
//! `send`) park on a `Condvar` instead of yielding to a scheduler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use abi::{CallFlags, Generation, IpcError, Method, PhoneHandle, TaskId};

use crate::call::{CallId, IncomingCall};
use crate::cap::CapTable;
use crate::phone::{Phone, PhoneId, PhoneState};

/// Maximum number of unanswered calls a single task may have
/// outstanding at once (spec §9 Open Question, resolved in
/// `DESIGN.md`).
pub const DEFAULT_CALL_QUOTA: usize = 256;

/// The sentinel method used for the notification a phone's peer
/// receives when the other end hangs up (spec §4.1).
pub const HANGUP_NOTIFY: Method = Method(0);

#[derive(Debug)]
enum CallOutcome {
    /// Not yet answered; `TaskId` is the caller, so a retiring caller's
    /// own still-outstanding calls can be swept out of `in_flight`
    /// without anyone ever having to await them.
    Pending(TaskId),
    Answered(Result<Vec<u8>, IpcError>),
}

struct TaskSlot {
    generation: Generation,
    alive: bool,
    cap_table: CapTable,
    inbox: VecDeque<IncomingCall>,
    owned_calls: HashSet<CallId>,
    notifications: u32,
    quota_in_use: usize,
    quota: usize,
}

impl TaskSlot {
    fn new(generation: Generation, cap_capacity: usize, quota: usize) -> Self {
        Self {
            generation,
            alive: true,
            cap_table: CapTable::with_capacity(cap_capacity),
            inbox: VecDeque::new(),
            owned_calls: HashSet::new(),
            notifications: 0,
            quota_in_use: 0,
            quota,
        }
    }
}

struct State {
    tasks: Vec<TaskSlot>,
    phones: Vec<Phone>,
    in_flight: HashMap<CallId, CallOutcome>,
}

impl State {
    fn task_index(&self, id: TaskId) -> Result<usize, IpcError> {
        let idx = id.index();
        let slot = self.tasks.get(idx).ok_or(IpcError::InvalidHandle)?;
        if !slot.alive || slot.generation != id.generation() {
            return Err(IpcError::InvalidHandle);
        }
        Ok(idx)
    }

    fn task_id(&self, idx: usize) -> TaskId {
        TaskId::for_index_and_gen(idx, self.tasks[idx].generation)
    }

    fn phone_id_valid(&self, id: PhoneId) -> Result<&Phone, IpcError> {
        let phone = self.phones.get(id.index()).ok_or(IpcError::InvalidHandle)?;
        if phone.generation != id.generation() {
            return Err(IpcError::InvalidHandle);
        }
        Ok(phone)
    }

    fn alloc_phone_slot(&mut self) -> usize {
        if let Some(idx) = self.phones.iter().position(Phone::is_free) {
            idx
        } else {
            self.phones.push(Phone::free());
            self.phones.len() - 1
        }
    }
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    next_call: AtomicU64,
    cap_capacity: usize,
    call_quota: usize,
}

/// A cloneable handle to the shared dispatcher state. Cloning a
/// `System` does not copy the task table; every clone refers to the
/// same kernel, the same way every task in a real system shares one
/// kernel image.
#[derive(Clone)]
pub struct System(Arc<Inner>);

impl System {
    pub fn new() -> Self {
        Self::with_limits(abi::CAP_TABLE_LEN, DEFAULT_CALL_QUOTA)
    }

    /// Builds a system with non-default capability-table and call-quota
    /// sizes, so tests can drive either limit to exhaustion cheaply.
    pub fn with_limits(cap_capacity: usize, call_quota: usize) -> Self {
        Self(Arc::new(Inner {
            state: Mutex::new(State {
                tasks: Vec::new(),
                phones: Vec::new(),
                in_flight: HashMap::new(),
            }),
            cv: Condvar::new(),
            next_call: AtomicU64::new(1),
            cap_capacity,
            call_quota,
        }))
    }

    fn next_call_id(&self) -> CallId {
        CallId(self.0.next_call.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a new task and returns its `TaskId`. If `naming_service`
    /// is given, a phone connected to it is pre-installed at capability
    /// 0, matching spec §4.4.
    pub fn spawn_task(&self, naming_service: Option<TaskId>) -> TaskId {
        let mut state = self.0.state.lock().unwrap();
        let idx = state.tasks.len();
        state
            .tasks
            .push(TaskSlot::new(Generation::ZERO, self.0.cap_capacity, self.0.call_quota));
        let id = state.task_id(idx);

        if let Some(ns) = naming_service {
            let phone_idx = state.alloc_phone_slot();
            let generation = state.phones[phone_idx].generation;
            state.phones[phone_idx].state = PhoneState::Connected {
                owner: id,
                peer: ns,
            };
            let pid = PhoneId::new(phone_idx, generation);
            state.tasks[idx]
                .cap_table
                .install(PhoneHandle::NAMING_SERVICE, pid);
        }
        id
    }

    /// Tears down a task: hangs up every phone it owns (notifying
    /// peers) and wakes any task blocked waiting on a reply from it.
    pub fn retire_task(&self, task: TaskId) {
        let mut state = self.0.state.lock().unwrap();
        let Ok(idx) = state.task_index(task) else {
            return;
        };
        state.tasks[idx].alive = false;

        let owned_phones: Vec<usize> = state
            .phones
            .iter()
            .enumerate()
            .filter(|(_, p)| p.owner() == Some(task))
            .map(|(i, _)| i)
            .collect();
        for pidx in owned_phones {
            self.hangup_phone_index(&mut state, pidx);
        }

        // Fail out anyone still blocked sending to this task, matching
        // the auto-answer-on-dead-peer rule (spec §3/§7).
        let new_gen = task.next_generation().generation();
        let stuck: Vec<CallId> = state.tasks[idx]
            .inbox
            .iter()
            .map(|c| c.id)
            .chain(state.tasks[idx].owned_calls.iter().copied())
            .collect();
        for id in stuck {
            state.in_flight.insert(
                id,
                CallOutcome::Answered(Err(IpcError::SenderGone)),
            );
        }
        state.tasks[idx].inbox.clear();
        state.tasks[idx].generation = new_gen;

        // Calls this task sent and never came back to await are
        // nobody's business anymore; drop their bookkeeping instead of
        // leaving them `Pending` in `in_flight` forever.
        let orphaned: Vec<CallId> = state
            .in_flight
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                CallOutcome::Pending(caller) if *caller == task => Some(*id),
                _ => None,
            })
            .collect();
        for id in orphaned {
            state.in_flight.remove(&id);
        }

        drop(state);
        self.0.cv.notify_all();
    }

    pub fn phone_alloc(&self, owner: TaskId) -> Result<PhoneHandle, IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let owner_idx = state.task_index(owner)?;
        let phone_idx = state.alloc_phone_slot();
        state.phones[phone_idx].state = PhoneState::Connecting;
        let generation = state.phones[phone_idx].generation;
        let pid = PhoneId::new(phone_idx, generation);
        state.tasks[owner_idx].cap_table.alloc(pid)
    }

    pub fn phone_connect(
        &self,
        owner: TaskId,
        handle: PhoneHandle,
        peer: TaskId,
    ) -> Result<(), IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let owner_idx = state.task_index(owner)?;
        state.task_index(peer)?;
        let pid = state.tasks[owner_idx].cap_table.get(handle)?;
        let phone = state
            .phones
            .get_mut(pid.index())
            .ok_or(IpcError::InvalidHandle)?;
        if phone.generation != pid.generation() {
            return Err(IpcError::InvalidHandle);
        }
        if !matches!(phone.state, PhoneState::Connecting) {
            return Err(IpcError::InvalidHandle);
        }
        phone.state = PhoneState::Connected { owner, peer };
        Ok(())
    }

    pub fn phone_hangup(
        &self,
        owner: TaskId,
        handle: PhoneHandle,
    ) -> Result<(), IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let owner_idx = state.task_index(owner)?;
        let pid = state.tasks[owner_idx].cap_table.get(handle)?;
        state.phone_id_valid(pid)?;
        self.hangup_phone_index(&mut state, pid.index());
        drop(state);
        self.0.cv.notify_all();
        Ok(())
    }

    /// Duplicates an established connection so `target` gets its own
    /// phone to the same peer `handle` already reaches, without
    /// involving that peer (spec §6 `clone-connection`, a kernel-
    /// interpreted primitive alongside `connect`/`hangup`).
    pub fn clone_connection(
        &self,
        task: TaskId,
        handle: PhoneHandle,
        target: TaskId,
    ) -> Result<PhoneHandle, IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let idx = state.task_index(task)?;
        let target_idx = state.task_index(target)?;
        let pid = state.tasks[idx].cap_table.get(handle)?;
        let peer = match &state.phone_id_valid(pid)?.state {
            PhoneState::Connected { peer, .. } => *peer,
            _ => return Err(IpcError::InvalidHandle),
        };
        let phone_idx = state.alloc_phone_slot();
        state.phones[phone_idx].state = PhoneState::Connected {
            owner: target,
            peer,
        };
        let generation = state.phones[phone_idx].generation;
        let new_pid = PhoneId::new(phone_idx, generation);
        state.tasks[target_idx].cap_table.alloc(new_pid)
    }

    fn hangup_phone_index(&self, state: &mut State, phone_idx: usize) {
        let Some(peer) = state.phones[phone_idx].peer() else {
            return;
        };
        let owner = state.phones[phone_idx].owner();
        let first = state.phones[phone_idx].hangup();
        // bump the generation so a stale PhoneId from before this
        // hangup is rejected if the slot is reused later.
        state.phones[phone_idx].generation =
            state.phones[phone_idx].generation.next();

        if first {
            crate::ringbuf_log::log(crate::ringbuf_log::DispatchEvent::Hangup {
                task: owner.unwrap_or(TaskId::UNBOUND),
            });
            if let Ok(peer_idx) = state.task_index(peer) {
                let id = self.next_call_id();
                state.tasks[peer_idx].inbox.push_back(IncomingCall {
                    id,
                    sender: owner.unwrap_or(TaskId::UNBOUND),
                    method: HANGUP_NOTIFY,
                    flags: CallFlags::empty(),
                    payload: Vec::new(),
                });
            }
        }
    }

    pub fn cap_alloc(
        &self,
        owner: TaskId,
        phone: PhoneHandle,
    ) -> Result<PhoneHandle, IpcError> {
        // Re-homes a capability the caller already owns into the
        // lowest free slot of its own table; used after a transfer
        // lands a phone somewhere other than the lowest index.
        let mut state = self.0.state.lock().unwrap();
        let owner_idx = state.task_index(owner)?;
        let pid = state.tasks[owner_idx].cap_table.free(phone)?;
        state.tasks[owner_idx].cap_table.alloc(pid)
    }

    pub fn cap_free(
        &self,
        owner: TaskId,
        phone: PhoneHandle,
    ) -> Result<(), IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let owner_idx = state.task_index(owner)?;
        state.tasks[owner_idx].cap_table.free(phone)?;
        Ok(())
    }

    pub fn cap_get(&self, owner: TaskId, phone: PhoneHandle) -> Result<(), IpcError> {
        let state = self.0.state.lock().unwrap();
        let owner_idx = state.task_index(owner)?;
        state.tasks[owner_idx].cap_table.get(phone).map(|_| ())
    }

    /// Moves a phone from `from`'s capability table into `to`'s,
    /// used by the naming service to hand a freshly connected phone
    /// to the client that asked for it (spec §4.4, C3 `cap_transfer`).
    pub fn cap_transfer(
        &self,
        from: TaskId,
        handle: PhoneHandle,
        to: TaskId,
    ) -> Result<PhoneHandle, IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let from_idx = state.task_index(from)?;
        let to_idx = state.task_index(to)?;
        let pid = state.tasks[from_idx].cap_table.free(handle)?;
        match state.tasks[to_idx].cap_table.alloc(pid) {
            Ok(new_handle) => Ok(new_handle),
            Err(e) => {
                state.tasks[from_idx].cap_table.install(handle, pid);
                Err(e)
            }
        }
    }

    fn enqueue_call(
        &self,
        state: &mut State,
        peer_idx: usize,
        call: IncomingCall,
    ) {
        state.tasks[peer_idx].inbox.push_back(call);
    }

    /// Sends a call and blocks until it is answered (spec C2
    /// `send_sync`).
    pub fn send_sync(
        &self,
        caller: TaskId,
        phone: PhoneHandle,
        method: Method,
        flags: CallFlags,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, IpcError> {
        let id = self.send_async(caller, phone, method, flags, payload)?;
        let result = self.await_answer(id);
        self.decrement_quota(caller);
        result
    }

    /// Sends a call without blocking, returning a handle that can be
    /// awaited later (spec C2 `send_async`).
    pub fn send_async(
        &self,
        caller: TaskId,
        phone: PhoneHandle,
        method: Method,
        flags: CallFlags,
        payload: Vec<u8>,
    ) -> Result<CallId, IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let caller_idx = state.task_index(caller)?;
        if state.tasks[caller_idx].quota_in_use >= state.tasks[caller_idx].quota {
            return Err(IpcError::QuotaExceeded);
        }
        let pid = state.tasks[caller_idx].cap_table.get(phone)?;
        let phone_rec = state.phone_id_valid(pid)?;
        let peer = match &phone_rec.state {
            PhoneState::Connected { peer, .. } => *peer,
            PhoneState::Hungup { .. } => return Err(IpcError::Hungup),
            _ => return Err(IpcError::InvalidHandle),
        };
        let peer_idx = state.task_index(peer)?;

        let id = self.next_call_id();
        state.in_flight.insert(id, CallOutcome::Pending(caller));
        state.tasks[caller_idx].quota_in_use += 1;
        self.enqueue_call(
            &mut state,
            peer_idx,
            IncomingCall {
                id,
                sender: caller,
                method,
                flags,
                payload,
            },
        );
        drop(state);
        crate::ringbuf_log::log(crate::ringbuf_log::DispatchEvent::Send {
            from: caller,
            to: peer,
        });
        self.0.cv.notify_all();
        Ok(id)
    }

    /// Blocks until `id` has been answered, returning the response
    /// payload or the error it was answered/auto-answered with.
    pub fn await_answer(&self, id: CallId) -> Result<Vec<u8>, IpcError> {
        let mut state = self.0.state.lock().unwrap();
        loop {
            match state.in_flight.get(&id) {
                Some(CallOutcome::Answered(_)) => break,
                Some(CallOutcome::Pending(_)) => {
                    state = self.0.cv.wait(state).unwrap();
                }
                None => return Err(IpcError::InvalidHandle),
            }
        }
        let outcome = state.in_flight.remove(&id).unwrap();
        // `send_sync` calls `decrement_quota` itself once this returns,
        // using the caller it already has in hand.
        match outcome {
            CallOutcome::Answered(res) => res,
            CallOutcome::Pending(_) => unreachable!(),
        }
    }

    /// Non-blocking poll of an async call's answer.
    pub fn poll_answer(&self, id: CallId) -> Option<Result<Vec<u8>, IpcError>> {
        let mut state = self.0.state.lock().unwrap();
        match state.in_flight.get(&id) {
            Some(CallOutcome::Answered(_)) => {
                let CallOutcome::Answered(res) = state.in_flight.remove(&id).unwrap()
                else {
                    unreachable!()
                };
                Some(res)
            }
            _ => None,
        }
    }

    pub fn decrement_quota(&self, task: TaskId) {
        let mut state = self.0.state.lock().unwrap();
        if let Ok(idx) = state.task_index(task) {
            state.tasks[idx].quota_in_use =
                state.tasks[idx].quota_in_use.saturating_sub(1);
        }
    }

    /// Blocks a task until a call or notification arrives in its
    /// answerbox (spec C2 `wait_for_call`), checking notifications
    /// first, matching the teacher's own `recv` ordering.
    pub fn wait_for_call(
        &self,
        task: TaskId,
        timeout: Option<Duration>,
    ) -> Result<super::dispatch::Event, IpcError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.0.state.lock().unwrap();
        loop {
            let idx = state.task_index(task)?;
            if state.tasks[idx].notifications != 0 {
                let bits = std::mem::take(&mut state.tasks[idx].notifications);
                return Ok(super::dispatch::Event::Notification(bits));
            }
            if let Some(call) = state.tasks[idx].inbox.pop_front() {
                state.tasks[idx].owned_calls.insert(call.id);
                return Ok(super::dispatch::Event::Call(call));
            }
            match deadline {
                None => {
                    state = self.0.cv.wait(state).unwrap();
                }
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        crate::ringbuf_log::log(
                            crate::ringbuf_log::DispatchEvent::Timeout { task },
                        );
                        return Err(IpcError::Timeout);
                    }
                    let (guard, result) =
                        self.0.cv.wait_timeout(state, dl - now).unwrap();
                    state = guard;
                    if result.timed_out() {
                        // Loop once more to check for a
                        // last-instant arrival before giving up.
                        if state.tasks[idx].notifications == 0
                            && state.tasks[idx].inbox.is_empty()
                        {
                            crate::ringbuf_log::log(
                                crate::ringbuf_log::DispatchEvent::Timeout { task },
                            );
                            return Err(IpcError::Timeout);
                        }
                    }
                }
            }
        }
    }

    /// Answers a call this task previously received from
    /// `wait_for_call` (spec C2 `answer`).
    pub fn answer(
        &self,
        task: TaskId,
        call: CallId,
        payload: Vec<u8>,
    ) -> Result<(), IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let idx = state.task_index(task)?;
        if !state.tasks[idx].owned_calls.remove(&call) {
            return Err(IpcError::InvalidHandle);
        }
        state
            .in_flight
            .insert(call, CallOutcome::Answered(Ok(payload)));
        drop(state);
        crate::ringbuf_log::log(crate::ringbuf_log::DispatchEvent::Answer { to: task });
        self.0.cv.notify_all();
        Ok(())
    }

    /// Re-targets a call this task owns onto a different phone (spec
    /// C2 `forward`), preserving the call's identity and original
    /// sender so the eventual answer reaches the original caller
    /// untouched (forward-transparency, spec §8).
    pub fn forward(
        &self,
        task: TaskId,
        call: IncomingCall,
        via: PhoneHandle,
    ) -> Result<(), IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let idx = state.task_index(task)?;
        if !state.tasks[idx].owned_calls.remove(&call.id) {
            return Err(IpcError::InvalidHandle);
        }
        let pid = state.tasks[idx].cap_table.get(via)?;
        let phone = state.phone_id_valid(pid)?;
        let target = match &phone.state {
            PhoneState::Connected { peer, .. } => *peer,
            PhoneState::Hungup { .. } => {
                // Forwarding through a hungup phone is transparent:
                // the original caller gets the same outcome it would
                // have received from a dead direct peer (DESIGN.md).
                state
                    .in_flight
                    .insert(call.id, CallOutcome::Answered(Err(IpcError::SenderGone)));
                drop(state);
                self.0.cv.notify_all();
                return Ok(());
            }
            _ => return Err(IpcError::InvalidHandle),
        };
        let target_idx = state.task_index(target)?;
        crate::ringbuf_log::log(crate::ringbuf_log::DispatchEvent::Forward {
            from: task,
            to: target,
        });
        self.enqueue_call(&mut state, target_idx, call);
        drop(state);
        self.0.cv.notify_all();
        Ok(())
    }

    /// Posts a lightweight notification to `target`'s answerbox
    /// without going through the call protocol (spec C2 `poke`).
    pub fn poke(&self, target: TaskId, bits: u32) -> Result<(), IpcError> {
        let mut state = self.0.state.lock().unwrap();
        let idx = state.task_index(target)?;
        state.tasks[idx].notifications |= bits;
        drop(state);
        crate::ringbuf_log::log(crate::ringbuf_log::DispatchEvent::Poke { task: target });
        self.0.cv.notify_all();
        Ok(())
    }

    pub fn current_generation(&self, task: TaskId) -> Option<Generation> {
        let state = self.0.state.lock().unwrap();
        state.tasks.get(task.index()).map(|t| t.generation)
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}
