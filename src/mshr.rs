//! Outstanding-load table.
//!
//! Misses on the same block coalesce into one entry, so N concurrent misses
//! produce exactly one outbound request. Entries are keyed by base address;
//! blocks point back at them only via that key.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::event::{EventId, MemEvent, Source};
use crate::Address;

/// Which way a load travels: a miss fill from below, or a fetch of fresher
/// data from the caches above (directory fetch of a dirty line).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDirection {
    Down,
    Up,
}

#[derive(Debug)]
pub struct LoadInfo {
    pub base_addr: Address,
    /// Id of the event that created this entry. Only that event may drive
    /// victim selection; everything else coalesces into `queue`.
    pub initiating_id: EventId,
    /// `(row, col)` of the block reserved for the fill, once chosen.
    pub target: Option<(usize, usize)>,
    pub direction: LoadDirection,
    /// Events awaiting the fill, with the time they were queued.
    pub queue: VecDeque<(MemEvent, Source, u64)>,
    /// In-flight snoop-bus request, cancellable while still queued at the
    /// arbiter.
    pub bus_event: Option<EventId>,
}

impl LoadInfo {
    #[must_use]
    pub fn new(base_addr: Address, initiating_id: EventId, direction: LoadDirection) -> Self {
        Self {
            base_addr,
            initiating_id,
            target: None,
            direction,
            queue: VecDeque::new(),
            bus_event: None,
        }
    }
}

/// Keyed table of outstanding loads. Iteration order is insertion order so
/// simulation stays reproducible.
#[derive(Debug, Default)]
pub struct MshrTable {
    entries: IndexMap<Address, LoadInfo>,
}

impl MshrTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, base_addr: Address) -> bool {
        self.entries.contains_key(&base_addr)
    }

    #[must_use]
    pub fn get(&self, base_addr: Address) -> Option<&LoadInfo> {
        self.entries.get(&base_addr)
    }

    pub fn get_mut(&mut self, base_addr: Address) -> Option<&mut LoadInfo> {
        self.entries.get_mut(&base_addr)
    }

    pub fn insert(&mut self, info: LoadInfo) {
        debug_assert!(!self.entries.contains_key(&info.base_addr));
        self.entries.insert(info.base_addr, info);
    }

    pub fn remove(&mut self, base_addr: Address) -> Option<LoadInfo> {
        self.entries.shift_remove(&base_addr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
