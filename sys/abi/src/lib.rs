// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types shared between the dispatcher (`kern`), client library
//! (`userlib`) and every task built on top of them.
//!
//! This mirrors the split in a real microkernel between a portable ABI
//! crate and the kernel/userland code built on it, but there is no
//! architecture here to be portable across: every type in this crate
//! describes the IPC protocol itself (tasks, phones, calls, services,
//! errors), not a particular CPU's calling convention.

use core::convert::TryFrom;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Number of bits of a [`TaskId`] devoted to the task table index; the
/// remainder are the generation count.
pub const TASK_ID_INDEX_BITS: u32 = 10;

/// A generation-stamped reference to a task's slot in the task table.
///
/// Splitting the handle into an index and a generation count lets a
/// stale reference to a restarted task be detected instead of silently
/// aliasing whatever now occupies that slot (the "ABA problem"). This
/// is the same scheme the teacher uses for its own `TaskId`; here it
/// backs every `PhoneHandle`'s peer reference as well.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    AsBytes,
    FromBytes,
    FromZeroes,
)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// The index bits, and thus the maximum number of live tasks.
    pub const INDEX_BITS: u32 = TASK_ID_INDEX_BITS;
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// A sentinel referring to the naming service's well-known slot.
    pub const NAMING_SERVICE: Self = Self(0);

    /// A sentinel that can never compare equal to a real `TaskId`,
    /// used by servers to mean "no peer yet."
    pub const UNBOUND: Self = Self(0xFFFF);

    pub fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        let index = index as u16;
        assert!(index <= Self::INDEX_MASK);
        Self(index | (u16::from(gen.0) << Self::INDEX_BITS))
    }

    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }

    pub fn next_generation(self) -> Self {
        Self::for_index_and_gen(self.index(), self.generation().next())
    }
}

/// A task restart counter. Two `TaskId`s with the same index but
/// different generations refer to different incarnations of the task
/// in that slot.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    AsBytes,
    FromBytes,
    FromZeroes,
)]
#[repr(transparent)]
pub struct Generation(pub u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// The first response code reserved to mean "the peer you called has
/// since been restarted." Response codes below this are protocol- or
/// application-defined; values at or above it encode a generation.
pub const FIRST_DEAD_CODE: u32 = 0xFFFF_0000;

/// Builds the response code delivered to a caller whose peer died (was
/// restarted) while the call was outstanding. The dead peer's new
/// generation is folded into the code so a caller using
/// [`extract_new_generation`] can retry against the fresh incarnation
/// without an extra round trip to look it up.
pub fn dead_response_code(new_generation: Generation) -> u32 {
    FIRST_DEAD_CODE | u32::from(new_generation.0)
}

/// Recovers the generation folded into a response code produced by
/// [`dead_response_code`], if `code` is in fact such a code.
pub fn extract_new_generation(code: u32) -> Option<Generation> {
    if code & 0xFFFF_FF00 == FIRST_DEAD_CODE {
        Some(Generation(code as u8))
    } else {
        None
    }
}

/// A task's capability-table index for a phone it owns a connection
/// through. Capability zero is reserved for the naming service and is
/// installed in every task's table at creation time (spec §4.4).
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    AsBytes,
    FromBytes,
    FromZeroes,
)]
#[repr(transparent)]
pub struct PhoneHandle(pub u32);

impl PhoneHandle {
    pub const NAMING_SERVICE: Self = Self(0);

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// The number of phone-capability slots in a task's capability table
/// (spec §4.3). Capability zero is reserved for the naming service.
pub const CAP_TABLE_LEN: usize = 64;

/// A request method. Methods below 0x8000 are protocol-defined
/// (dispatched specially by the kernel's virtual tasks, or by the
/// naming service's own operation table); methods at or above it are
/// entirely application-defined, matching spec §9's note on dynamic
/// method dispatch.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    AsBytes,
    FromBytes,
    FromZeroes,
)]
#[repr(transparent)]
pub struct Method(pub u32);

impl Method {
    pub const REGISTER: Self = Self(1);
    pub const CONNECT_TO_SERVICE: Self = Self(2);
    pub const CONNECT_TO_ME_CALLBACK: Self = Self(3);
    pub const TASK_ID_INTRO: Self = Self(4);
    pub const TASK_RETVAL: Self = Self(5);
    pub const TASK_WAIT: Self = Self(6);
    pub const PING: Self = Self(7);
    /// Reserved number for the `clone-connection` kernel primitive
    /// (spec §6); not dispatched through a task's call handler, the
    /// same way `connect`/`hangup` never appear in a `match
    /// call.method` either -- listed here only so the full reserved
    /// range is accounted for in one place.
    pub const CLONE_CONNECTION: Self = Self(8);

    pub const FIRST_USER_METHOD: u32 = 0x8000;

    pub fn is_reserved(&self) -> bool {
        self.0 < Self::FIRST_USER_METHOD
    }
}

/// A well-known, registry-assigned name for a service reachable through
/// the naming service (spec §4.4). Kept as an opaque closed enumeration
/// rather than a free-form string so registration typos are caught at
/// compile time by callers within this workspace; the naming service
/// itself stores the string form for unregistered/ad-hoc lookups.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ServiceId {
    Echo,
    Clock,
    Net,
    Custom(u32),
}

bitflags! {
    /// Per-call flags set by the sender (spec §4.1/§4.2).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct CallFlags: u32 {
        /// This call carries a bulk-data lease to be consumed with
        /// `data_read`/`data_write` (C6) before it is answered.
        const HAS_LEASE = 1 << 0;
        /// The sender used `send_async`; answering this call delivers
        /// the response to a correlation handle rather than unblocking
        /// a synchronously-waiting caller.
        const ASYNC = 1 << 1;
    }
}

// `bitflags!` stores the bits in a private wrapper type that the
// `zerocopy` derive macros can't see through, so these are implemented
// by hand instead of derived. `CallFlags` is `repr(transparent)` over a
// `u32` and (like every `bitflags` type) tolerates any bit pattern,
// including unknown bits, so these are sound.
unsafe impl AsBytes for CallFlags {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
unsafe impl FromZeroes for CallFlags {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
unsafe impl FromBytes for CallFlags {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}

/// A fixed-size message header copied between a call's sender and
/// receiver; the payload that follows it is an application-defined
/// byte buffer, exactly as in the teacher's own send/recv convention.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MessageHeader {
    pub method: Method,
    pub flags: CallFlags,
    pub len: u32,
    pub sender: TaskId,
    /// Explicit trailing padding so every byte of the struct is named;
    /// `zerocopy`'s derives refuse to run over implicit compiler-inserted
    /// padding.
    _reserved: u16,
}

/// The recoverable error taxonomy for this IPC protocol (spec §7).
/// Every variant here is returned as an ordinary `Result::Err` by the
/// dispatcher; nothing in this crate models a kernel-invariant
/// violation (a faulted dispatcher call), since that is a `panic!` in
/// `kern`'s own code, never a value a task observes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IpcError {
    InvalidHandle,
    Hungup,
    QuotaExceeded,
    NotFound,
    AlreadyExists,
    Timeout,
    Cancelled,
    SenderGone,
    NoMemory,
    BadSize,
    CapTableFull,
}

impl core::fmt::Display for IpcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            IpcError::InvalidHandle => "phone handle is invalid or stale",
            IpcError::Hungup => "the peer has hung up",
            IpcError::QuotaExceeded => "per-task call quota exceeded",
            IpcError::NotFound => "no such service is registered",
            IpcError::AlreadyExists => {
                "a service with that name is already registered"
            }
            IpcError::Timeout => "the operation timed out",
            IpcError::Cancelled => "the operation was cancelled",
            IpcError::SenderGone => "the sender of this call is gone",
            IpcError::NoMemory => "no memory available for this request",
            IpcError::BadSize => "the supplied buffer size is invalid",
            IpcError::CapTableFull => {
                "the target task's capability table is full"
            }
        };
        f.write_str(msg)
    }
}

impl std::error::Error for IpcError {}

impl TryFrom<u32> for IpcError {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => IpcError::InvalidHandle,
            1 => IpcError::Hungup,
            2 => IpcError::QuotaExceeded,
            3 => IpcError::NotFound,
            4 => IpcError::AlreadyExists,
            5 => IpcError::Timeout,
            6 => IpcError::Cancelled,
            7 => IpcError::SenderGone,
            8 => IpcError::NoMemory,
            9 => IpcError::BadSize,
            10 => IpcError::CapTableFull,
            _ => return Err(()),
        })
    }
}

impl From<IpcError> for u32 {
    fn from(e: IpcError) -> u32 {
        match e {
            IpcError::InvalidHandle => 0,
            IpcError::Hungup => 1,
            IpcError::QuotaExceeded => 2,
            IpcError::NotFound => 3,
            IpcError::AlreadyExists => 4,
            IpcError::Timeout => 5,
            IpcError::Cancelled => 6,
            IpcError::SenderGone => 7,
            IpcError::NoMemory => 8,
            IpcError::BadSize => 9,
            IpcError::CapTableFull => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips_index_and_generation() {
        let id = TaskId::for_index_and_gen(7, Generation(3));
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), Generation(3));
    }

    #[test]
    fn dead_response_code_round_trips_generation() {
        let code = dead_response_code(Generation(42));
        assert_eq!(extract_new_generation(code), Some(Generation(42)));
    }

    #[test]
    fn non_dead_codes_do_not_decode_as_generations() {
        assert_eq!(extract_new_generation(0), None);
        assert_eq!(extract_new_generation(123), None);
    }

    #[test]
    fn ipc_error_round_trips_through_u32() {
        for e in [
            IpcError::InvalidHandle,
            IpcError::Hungup,
            IpcError::QuotaExceeded,
            IpcError::NotFound,
            IpcError::AlreadyExists,
            IpcError::Timeout,
            IpcError::Cancelled,
            IpcError::SenderGone,
            IpcError::NoMemory,
            IpcError::BadSize,
            IpcError::CapTableFull,
        ] {
            let code: u32 = e.into();
            assert_eq!(IpcError::try_from(code), Ok(e));
        }
    }
}
