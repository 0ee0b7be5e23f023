//! Dual-keyed session index.
//!
//! One authoritative mapping (address → slot) paired with a stable slot
//! number exposed as the session's receive handle. Slots are reused through
//! a free list but never renumbered, so a handle stays valid for the
//! session's whole life. Handles are offset by a per-instance random base:
//! guessing another session's handle means guessing that base.

use std::collections::HashMap;

use crate::identity::Ip6;

use super::entry::Session;

/// Handles 0–3 are reserved: they collide with handshake stage words.
pub const MIN_FIRST_HANDLE: u32 = 4;

/// Exclusive upper bound for the random handle base.
pub const MAX_FIRST_HANDLE: u32 = 100_000;

pub(crate) struct SessionTable {
    slots: Vec<Option<Session>>,
    by_ip: HashMap<Ip6, usize>,
    free: Vec<usize>,
    first_handle: u32,
}

impl SessionTable {
    pub(crate) fn new(first_handle: u32) -> Self {
        debug_assert!((MIN_FIRST_HANDLE..MAX_FIRST_HANDLE).contains(&first_handle));
        Self {
            slots: Vec::new(),
            by_ip: HashMap::new(),
            free: Vec::new(),
            first_handle,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_ip.len()
    }

    /// Number of slots ever allocated; iteration bound for sweeps.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn first_handle(&self) -> u32 {
        self.first_handle
    }

    pub(crate) fn slot_by_ip(&self, ip: &Ip6) -> Option<usize> {
        self.by_ip.get(ip).copied()
    }

    pub(crate) fn slot_by_handle(&self, handle: u32) -> Option<usize> {
        let slot = handle.checked_sub(self.first_handle)? as usize;
        match self.slots.get(slot) {
            Some(Some(_)) => Some(slot),
            _ => None,
        }
    }

    /// Look up by address, running the lazy key-consistency check.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn get_by_ip6(&mut self, ip: &Ip6) -> Option<&mut Session> {
        let slot = self.slot_by_ip(ip)?;
        self.get_slot_checked(slot)
    }

    /// Slot lookup by address that also runs the lazy key check.
    pub(crate) fn checked_slot_by_ip(&mut self, ip: &Ip6) -> Option<usize> {
        let slot = self.slot_by_ip(ip)?;
        self.get_slot_checked(slot)?;
        Some(slot)
    }

    /// Slot lookup by handle that also runs the lazy key check.
    pub(crate) fn checked_slot_by_handle(&mut self, handle: u32) -> Option<usize> {
        let slot = self.slot_by_handle(handle)?;
        self.get_slot_checked(slot)?;
        Some(slot)
    }

    /// Look up by receive handle, running the lazy key-consistency check.
    pub(crate) fn get_by_handle(&mut self, handle: u32) -> Option<&mut Session> {
        let slot = self.slot_by_handle(handle)?;
        self.get_slot_checked(slot)
    }

    pub(crate) fn get_slot(&self, slot: usize) -> Option<&Session> {
        self.slots.get(slot)?.as_ref()
    }

    pub(crate) fn get_slot_mut(&mut self, slot: usize) -> Option<&mut Session> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Slot access that also runs the lazy key check.
    pub(crate) fn get_slot_checked(&mut self, slot: usize) -> Option<&mut Session> {
        let sess = self.slots.get_mut(slot)?.as_mut()?;
        check_key(sess);
        Some(sess)
    }

    /// Insert a session, assigning its slot and receive handle.
    ///
    /// Returns `(slot, receive_handle)`.
    pub(crate) fn insert(&mut self, mut sess: Session) -> (usize, u32) {
        debug_assert!(
            !self.by_ip.contains_key(&sess.addr),
            "one session per address"
        );
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let handle = self.first_handle + slot as u32;
        sess.receive_handle = handle;
        self.by_ip.insert(sess.addr, slot);
        self.slots[slot] = Some(sess);
        (slot, handle)
    }

    /// Remove the session in `slot`, releasing the slot for reuse.
    pub(crate) fn remove_slot(&mut self, slot: usize) -> Option<Session> {
        let sess = self.slots.get_mut(slot)?.take()?;
        self.by_ip.remove(&sess.addr);
        self.free.push(slot);
        Some(sess)
    }

    /// Snapshot of live handles, in slot order.
    pub(crate) fn list_handles(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(slot, _)| self.first_handle + slot as u32)
            .collect()
    }
}

/// Deferred key-consistency check.
///
/// The peer key only becomes known once the cipher session progresses, so
/// the check runs at lookup time: a non-zero key must derive exactly the
/// address the session is indexed under. A mismatch means memory corruption
/// or a protocol breach and is fatal.
fn check_key(sess: &mut Session) {
    if sess.found_key {
        return;
    }
    let key = *sess.cipher.her_public_key();
    if key.is_zero() {
        return;
    }
    let derived = Ip6::for_public_key(&key);
    assert_eq!(
        derived,
        Some(sess.addr),
        "session key does not derive the indexed address"
    );
    sess.found_key = true;
}
