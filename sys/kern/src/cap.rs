// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task capability table (spec C3).
//!
//! Generalizes the teacher's index-validated-against-a-table pattern
//! (`task.rs`'s `check_task_id_against_table`) from task indices to
//! phone-capability indices: a task never references a phone directly,
//! only a small integer handle that this table resolves (and
//! generation-checks) into a [`crate::phone::PhoneId`].

use abi::{IpcError, PhoneHandle, CAP_TABLE_LEN};

use crate::phone::PhoneId;

#[derive(Debug, Clone)]
pub struct CapTable {
    slots: Vec<Option<PhoneId>>,
}

impl CapTable {
    /// Builds an empty table with the protocol's standard 64-phone
    /// capacity (spec §4.3).
    pub fn new() -> Self {
        Self::with_capacity(CAP_TABLE_LEN)
    }

    /// Builds an empty table with a caller-chosen capacity, so tests
    /// can drive a table to exhaustion without allocating 64 phones.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            slots: vec![None; cap],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installs `phone` at a specific slot, used for capability zero
    /// (the naming service, spec §4.4) which every task gets
    /// pre-installed at creation rather than allocated dynamically.
    pub fn install(&mut self, handle: PhoneHandle, phone: PhoneId) {
        self.slots[handle.index()] = Some(phone);
    }

    /// Allocates the lowest-numbered free slot and stores `phone`
    /// there (spec §4.3's "lowest-free-index allocation").
    pub fn alloc(&mut self, phone: PhoneId) -> Result<PhoneHandle, IpcError> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(IpcError::CapTableFull)?;
        self.slots[idx] = Some(phone);
        Ok(PhoneHandle(idx as u32))
    }

    pub fn get(&self, handle: PhoneHandle) -> Result<PhoneId, IpcError> {
        self.slots
            .get(handle.index())
            .copied()
            .flatten()
            .ok_or(IpcError::InvalidHandle)
    }

    pub fn free(&mut self, handle: PhoneHandle) -> Result<PhoneId, IpcError> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(IpcError::InvalidHandle)?;
        slot.take().ok_or(IpcError::InvalidHandle)
    }

    /// Moves the phone at `handle` into the lowest free slot of
    /// `other`, used for `cap_transfer` (e.g. NS's
    /// CONNECT_TO_ME_CALLBACK handing a connected phone to the client
    /// that originally asked for it).
    pub fn transfer(
        &mut self,
        handle: PhoneHandle,
        other: &mut CapTable,
    ) -> Result<PhoneHandle, IpcError> {
        let phone = self.free(handle)?;
        match other.alloc(phone) {
            Ok(new_handle) => Ok(new_handle),
            Err(e) => {
                // Put it back; a failed transfer must not lose the
                // capability.
                self.slots[handle.index()] = Some(phone);
                Err(e)
            }
        }
    }
}

impl Default for CapTable {
    fn default() -> Self {
        Self::new()
    }
}
