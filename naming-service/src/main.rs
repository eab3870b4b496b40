// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Standalone naming-service binary: spins up a bare dispatcher with
//! no other tasks and runs the registry loop on it. Real use is as a
//! thread inside `ipc-cli`'s host process (see that crate's `main`);
//! this binary exists for smoke-testing the service in isolation,
//! against whatever boot topology is handed to it on the command
//! line.

use std::env;

use kern::{Dispatcher, System};
use naming_service::BootConfig;
use userlib::TaskHandle;

fn main() {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => BootConfig::load(&path).unwrap_or_else(|e| {
            log::error!("failed to load boot config {path}: {e}");
            std::process::exit(1);
        }),
        None => BootConfig::empty(),
    };

    let sys = System::new();
    let dispatcher = Dispatcher::new(sys.clone());
    let ns_id = sys.spawn_task(None);
    let ns = TaskHandle::new(ns_id, dispatcher);

    log::info!("naming service running as {:?}", ns_id);
    naming_service::run(ns, config);
}
