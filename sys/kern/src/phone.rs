// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Phone state machine (spec C1).
//!
//! A phone is a directed connection from an owning task to a peer
//! task's answerbox. Phones live in a single global pool owned by the
//! [`crate::system::System`]; a task's [`crate::cap::CapTable`] maps
//! small local handles onto entries in that pool.
//!
//! Every phone carries a generation stamp, the same way the teacher
//! stamps `TaskId`s, so that a reference to a freed-and-reused phone
//! slot is detected as stale instead of silently aliasing an unrelated
//! connection (`original_source`'s "phone hash" back-link, see
//! `DESIGN.md`).

use abi::{Generation, TaskId};

/// A generation-stamped reference to a slot in the phone pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PhoneId {
    index: usize,
    generation: Generation,
}

impl PhoneId {
    pub fn new(index: usize, generation: Generation) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

/// The lifecycle state of one phone (spec C1).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PhoneState {
    /// Slot is unused; present only so freed slots can be reused
    /// without shifting every other index.
    Free,
    /// Allocated but not yet connected to a peer.
    Connecting,
    /// Live: calls sent through this phone land in `peer`'s answerbox.
    Connected { owner: TaskId, peer: TaskId },
    /// Either side has hung up. A hungup phone never transitions back
    /// to `Connected`; the owning task must allocate a fresh phone
    /// (and thus a fresh generation) to reconnect.
    Hungup { owner: TaskId, peer: TaskId },
}

/// One entry in the global phone pool.
#[derive(Debug, Clone)]
pub struct Phone {
    pub generation: Generation,
    pub state: PhoneState,
}

impl Phone {
    pub fn free() -> Self {
        Self {
            generation: Generation::ZERO,
            state: PhoneState::Free,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self.state, PhoneState::Free)
    }

    pub fn peer(&self) -> Option<TaskId> {
        match &self.state {
            PhoneState::Connected { peer, .. } | PhoneState::Hungup { peer, .. } => {
                Some(*peer)
            }
            _ => None,
        }
    }

    pub fn owner(&self) -> Option<TaskId> {
        match &self.state {
            PhoneState::Connected { owner, .. } | PhoneState::Hungup { owner, .. } => {
                Some(*owner)
            }
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, PhoneState::Connected { .. })
    }

    /// Hangs up this phone. Returns `true` if this call is the one that
    /// performed the transition (i.e. the first hangup), `false` if the
    /// phone was already hung up -- the idempotence spec §4.1 requires,
    /// so that simultaneous hangups from both directions only enqueue a
    /// single hangup notification.
    pub fn hangup(&mut self) -> bool {
        match std::mem::replace(&mut self.state, PhoneState::Free) {
            PhoneState::Connected { owner, peer } => {
                self.state = PhoneState::Hungup { owner, peer };
                true
            }
            other @ PhoneState::Hungup { .. } => {
                self.state = other;
                false
            }
            PhoneState::Free => {
                self.state = PhoneState::Free;
                false
            }
            PhoneState::Connecting => {
                self.state = PhoneState::Free;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(owner: TaskId, peer: TaskId) -> Phone {
        Phone {
            generation: Generation::ZERO,
            state: PhoneState::Connected { owner, peer },
        }
    }

    #[test]
    fn first_hangup_returns_true_and_transitions() {
        let mut p = connected(TaskId(0), TaskId(1));
        assert!(p.hangup());
        assert!(matches!(p.state, PhoneState::Hungup { .. }));
    }

    #[test]
    fn second_hangup_returns_false() {
        let mut p = connected(TaskId(0), TaskId(1));
        assert!(p.hangup());
        assert!(!p.hangup());
    }

    #[test]
    fn hangup_of_connecting_phone_frees_it_without_notifying() {
        let mut p = Phone {
            generation: Generation::ZERO,
            state: PhoneState::Connecting,
        };
        assert!(!p.hangup());
        assert!(p.is_free());
    }

    #[test]
    fn peer_and_owner_are_none_for_free_or_connecting() {
        let p = Phone::free();
        assert_eq!(p.peer(), None);
        assert_eq!(p.owner(), None);
    }
}
