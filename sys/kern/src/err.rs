// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error plumbing for the dispatcher.
//!
//! The teacher's `err.rs` splits syscall failure into `UserError`
//! (`Recoverable`, returned to the caller as a response code, vs.
//! `Unrecoverable`, a kernel-detected invariant violation that faults a
//! task) and an `InteractFault` type carrying independent fault
//! attribution for the two tasks on either end of a cross-task copy.
//! The host simulation keeps that split in spirit: every error a task
//! can observe is [`abi::IpcError`] (the "recoverable" half); a kernel
//! invariant violation is instead a Rust `panic!`, since there is no
//! task to fault into and no way to keep running with corrupted
//! dispatcher state.

pub use abi::IpcError;

pub type Result<T> = core::result::Result<T, IpcError>;

/// Carries independent fault attribution for the two tasks on either
/// side of a bulk-data copy (spec C6; teacher's `InteractFault`).
/// Either side, or both, may be at fault: the source buffer might be
/// too short, or the destination buffer might overlap the source.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct InteractFault {
    pub src: Option<IpcError>,
    pub dst: Option<IpcError>,
}

impl InteractFault {
    pub fn in_src(e: IpcError) -> Self {
        Self {
            src: Some(e),
            dst: None,
        }
    }

    pub fn in_dst(e: IpcError) -> Self {
        Self {
            src: None,
            dst: Some(e),
        }
    }

    pub fn both(src: IpcError, dst: IpcError) -> Self {
        Self {
            src: Some(src),
            dst: Some(dst),
        }
    }

    /// Resolves this fault to the error the *sending* task should see,
    /// preferring a fault attributed to the source side.
    pub fn for_sender(&self) -> IpcError {
        self.src.or(self.dst).unwrap_or(IpcError::BadSize)
    }

    /// Resolves this fault to the error the *receiving* task should
    /// see, preferring a fault attributed to the destination side.
    pub fn for_receiver(&self) -> IpcError {
        self.dst.or(self.src).unwrap_or(IpcError::BadSize)
    }
}
