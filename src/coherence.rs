//! Keyed tables backing the coherence protocol: pending invalidations with
//! ACK counting, and in-flight supplies that can be cancelled before their
//! deferred send fires.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::block::Status;
use crate::event::{EventId, MemEvent, Source};
use crate::Address;

/// Egress selection for an invalidate broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Both,
}

impl Direction {
    #[must_use]
    pub fn up(self) -> bool {
        matches!(self, Direction::Up | Direction::Both)
    }

    #[must_use]
    pub fn down(self) -> bool {
        matches!(self, Direction::Down | Direction::Both)
    }
}

/// A pending invalidate broadcast for one base address.
#[derive(Debug)]
pub struct Invalidation {
    pub issuing_id: EventId,
    /// Block locked for the duration, if the invalidate targets a resident
    /// block. `None` for opportunistic invalidates forwarded on a miss.
    pub target: Option<(usize, usize)>,
    /// Status applied to the target when every ACK is in. `None` leaves the
    /// block as-is (the upstream phase of a directory fetch).
    pub new_status: Option<Status>,
    pub waiting_acks: u32,
    /// A cancelable invalidation yields to an incoming invalidate for the
    /// same block; a non-cancelable one forces the newcomer to retry.
    pub can_cancel: bool,
    pub bus_event: Option<EventId>,
    /// Events replayed in arrival order once the invalidate completes. The
    /// first replay is told the invalidate chain has finished.
    pub queue: VecDeque<(MemEvent, Source)>,
}

#[derive(Debug, Default)]
pub struct InvalidationTable {
    entries: IndexMap<Address, Invalidation>,
}

impl InvalidationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, base_addr: Address) -> bool {
        self.entries.contains_key(&base_addr)
    }

    #[must_use]
    pub fn get(&self, base_addr: Address) -> Option<&Invalidation> {
        self.entries.get(&base_addr)
    }

    pub fn get_mut(&mut self, base_addr: Address) -> Option<&mut Invalidation> {
        self.entries.get_mut(&base_addr)
    }

    pub fn insert(&mut self, base_addr: Address, inv: Invalidation) {
        debug_assert!(!self.entries.contains_key(&base_addr));
        self.entries.insert(base_addr, inv);
    }

    pub fn remove(&mut self, base_addr: Address) -> Option<Invalidation> {
        self.entries.shift_remove(&base_addr)
    }
}

/// An in-flight supply for one `(base address, peer)` pair.
#[derive(Debug)]
pub struct Supply {
    pub bus_event: Option<EventId>,
    /// A canceled supply short-circuits when its deferred send fires.
    pub canceled: bool,
}

#[derive(Debug, Default)]
pub struct SupplyTable {
    entries: IndexMap<(Address, String), Supply>,
}

impl SupplyTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, base_addr: Address, peer: &str) -> bool {
        self.entries.contains_key(&(base_addr, peer.to_owned()))
    }

    #[must_use]
    pub fn get(&self, base_addr: Address, peer: &str) -> Option<&Supply> {
        self.entries.get(&(base_addr, peer.to_owned()))
    }

    pub fn get_mut(&mut self, base_addr: Address, peer: &str) -> Option<&mut Supply> {
        self.entries.get_mut(&(base_addr, peer.to_owned()))
    }

    pub fn insert(&mut self, base_addr: Address, peer: String, supply: Supply) {
        self.entries.insert((base_addr, peer), supply);
    }

    pub fn remove(&mut self, base_addr: Address, peer: &str) -> Option<Supply> {
        self.entries.shift_remove(&(base_addr, peer.to_owned()))
    }

    /// Any supply for this block still live?
    #[must_use]
    pub fn any_in_flight(&self, base_addr: Address) -> bool {
        self.entries
            .iter()
            .any(|((base, _), supply)| *base == base_addr && !supply.canceled)
    }

    /// Peers with a live supply for this block.
    #[must_use]
    pub fn peers_for(&self, base_addr: Address) -> Vec<String> {
        self.entries
            .iter()
            .filter(|((base, _), supply)| *base == base_addr && !supply.canceled)
            .map(|((_, peer), _)| peer.clone())
            .collect()
    }
}
