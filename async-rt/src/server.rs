// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! New-connection dispatch (spec §4.5): one handler fibril per
//! distinct caller, fed from a single manager loop that owns
//! `wait_for_call` for the task.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};

use abi::TaskId;
use kern::{Event, IncomingCall};
use userlib::TaskHandle;

use crate::fibril::{CancelToken, Fibril};

/// Runs one task's receive loop, spawning a fresh handler fibril the
/// first time a given sender is seen and routing every later call
/// from that sender to the same fibril -- "that fibril drives all
/// subsequent calls on that connection until hangup."
pub struct Server {
    task: TaskHandle,
    handlers: HashMap<TaskId, Sender<IncomingCall>>,
}

impl Server {
    pub fn new(task: TaskHandle) -> Self {
        Self {
            task,
            handlers: HashMap::new(),
        }
    }

    /// Runs until the dispatcher reports this task is gone (normally:
    /// forever). `spawn_handler` builds a per-connection fibril body
    /// from a channel of that connection's calls; it's invoked once
    /// per distinct sender, the first time that sender's call arrives.
    pub fn run<F>(mut self, spawn_handler: F)
    where
        F: Fn(TaskHandle, TaskId, mpsc::Receiver<IncomingCall>) + Clone + Send + 'static,
    {
        let mut fibrils: Vec<Fibril<()>> = Vec::new();
        loop {
            match self.task.dispatcher().wait_for_call(self.task.id(), None) {
                Ok(Event::Call(call)) => {
                    let sender = call.sender;
                    let call = match self.handlers.get(&sender) {
                        Some(tx) => match tx.send(call) {
                            Ok(()) => continue,
                            // Handler fibril exited (e.g. on hangup); fall
                            // through to spin up a fresh one below, using
                            // the call the dead channel handed back.
                            Err(mpsc::SendError(call)) => {
                                self.handlers.remove(&sender);
                                call
                            }
                        },
                        None => call,
                    };
                    let (tx, rx) = mpsc::channel();
                    let _ = tx.send(call);
                    self.handlers.insert(sender, tx);
                    let task = self.task.clone();
                    let handler = spawn_handler.clone();
                    fibrils.push(Fibril::spawn(
                        format!("conn-{}", sender.0),
                        move |_: CancelToken| handler(task, sender, rx),
                    ));
                }
                Ok(Event::Notification(_)) => {}
                Err(_) => {
                    log::info!("server task retired, stopping dispatch loop");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::{Dispatcher, System};

    #[test]
    fn each_sender_gets_its_own_handler() {
        let sys = System::new();
        let disp = Dispatcher::new(sys.clone());
        let server_task = TaskHandle::new(sys.spawn_task(None), disp.clone());
        let a = TaskHandle::new(sys.spawn_task(None), disp.clone());
        let b = TaskHandle::new(sys.spawn_task(None), disp.clone());

        let phone_a = a.phone_alloc().unwrap();
        a.phone_connect(phone_a, server_task.id()).unwrap();
        let phone_b = b.phone_alloc().unwrap();
        b.phone_connect(phone_b, server_task.id()).unwrap();

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_for_handler = seen.clone();
        let server = Server::new(server_task.clone());
        let server_thread = std::thread::spawn(move || {
            server.run(move |task, sender, rx| {
                seen_for_handler.lock().unwrap().push(sender);
                for call in rx {
                    task.sys_reply(call.id, 0, &[]);
                    break;
                }
            });
        });

        let mut response = [0u8; 0];
        a.sys_send(phone_a, 0x8000, &[], &mut response);
        b.sys_send(phone_b, 0x8000, &[], &mut response);

        std::thread::sleep(std::time::Duration::from_millis(50));
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&a.id()));
        assert!(seen.contains(&b.id()));
        drop(seen);
        drop(server_thread);
    }
}
