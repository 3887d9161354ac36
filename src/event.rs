//! Event payload schema shared by every link surface.
//!
//! One structure carries all commands; handlers switch on [`Command`] and the
//! logical [`Source`] link the event arrived on.

use serde::{Deserialize, Serialize};

use crate::Address;

/// Globally unique event identifier: `(sequence, rank)`.
///
/// The rank half keeps ids from different components disjoint without any
/// central coordination.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventId(pub u64, pub u32);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// Issues fresh [`EventId`]s for a single component.
#[derive(Debug, Clone)]
pub struct IdGen {
    rank: u32,
    next: u64,
}

impl IdGen {
    #[must_use]
    pub fn new(rank: u32) -> Self {
        Self { rank, next: 1 }
    }

    pub fn next(&mut self) -> EventId {
        let id = EventId(self.next, self.rank);
        self.next += 1;
        id
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Command {
    ReadReq,
    WriteReq,
    RequestData,
    SupplyData,
    Invalidate,
    Ack,
    Nack,
    Fetch,
    FetchInvalidate,
    BusClearToSend,
}

/// Per-event flag bits.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flags(u8);

impl Flags {
    /// Payload propagates toward the next level; no response is expected.
    pub const WRITEBACK: Flags = Flags(1 << 0);
    /// CPU atomic-lock request (load-locked / store-unlock pair).
    pub const LOCKED: Flags = Flags(1 << 1);
    /// Supplier will produce real data later; response carries no payload.
    pub const DELAYED: Flags = Flags(1 << 2);

    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Flags::WRITEBACK) {
            set.entry(&"WRITEBACK");
        }
        if self.contains(Flags::LOCKED) {
            set.entry(&"LOCKED");
        }
        if self.contains(Flags::DELAYED) {
            set.entry(&"DELAYED");
        }
        set.finish()
    }
}

/// Logical link an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Upstream(usize),
    Downstream,
    Snoop,
    Directory,
    Prefetch,
    SelfLink,
}

impl Source {
    #[must_use]
    pub fn is_snoop(self) -> bool {
        matches!(self, Source::Snoop)
    }

    #[must_use]
    pub fn is_upstream(self) -> bool {
        matches!(self, Source::Upstream(_))
    }
}

/// The one event structure carried on every link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemEvent {
    pub id: EventId,
    pub response_to: Option<EventId>,
    pub cmd: Command,
    /// Symbolic name of the sending component.
    pub src: String,
    /// Symbolic name of the addressed component; empty for broadcasts.
    pub dst: String,
    pub addr: Address,
    /// `addr` aligned down to the sender's block size.
    pub base_addr: Address,
    pub size: usize,
    pub flags: Flags,
    pub payload: Vec<u8>,
    /// Index of the link the event was sent on, where relevant.
    pub link_id: usize,
}

impl MemEvent {
    #[must_use]
    pub fn new(
        id: EventId,
        cmd: Command,
        src: impl Into<String>,
        dst: impl Into<String>,
        addr: Address,
        base_addr: Address,
        size: usize,
    ) -> Self {
        Self {
            id,
            response_to: None,
            cmd,
            src: src.into(),
            dst: dst.into(),
            addr,
            base_addr,
            size,
            flags: Flags::empty(),
            payload: Vec::new(),
            link_id: 0,
        }
    }

    /// Build a response: src/dst swapped, addressing copied, `response_to`
    /// linked back to this event.
    #[must_use]
    pub fn make_response(&self, id: EventId, cmd: Command) -> Self {
        Self {
            id,
            response_to: Some(self.id),
            cmd,
            src: self.dst.clone(),
            dst: self.src.clone(),
            addr: self.addr,
            base_addr: self.base_addr,
            size: self.size,
            flags: Flags::empty(),
            payload: Vec::new(),
            link_id: self.link_id,
        }
    }
}

impl std::fmt::Display for MemEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}[{}] {:#x}+{} {} -> {}",
            self.cmd, self.id, self.addr, self.size, self.src, self.dst
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_links_back_to_request() {
        let mut ids = IdGen::new(3);
        let req = MemEvent::new(
            ids.next(),
            Command::ReadReq,
            "cpu0",
            "l1",
            0x104,
            0x100,
            8,
        );
        let resp = req.make_response(ids.next(), Command::SupplyData);
        assert_eq!(resp.response_to, Some(req.id));
        assert_eq!(resp.src, "l1");
        assert_eq!(resp.dst, "cpu0");
        assert_eq!(resp.addr, 0x104);
        assert_eq!(resp.base_addr, 0x100);
    }

    #[test]
    fn flag_bits_are_independent() {
        let mut flags = Flags::empty();
        flags.insert(Flags::WRITEBACK);
        assert!(flags.contains(Flags::WRITEBACK));
        assert!(!flags.contains(Flags::DELAYED));
        let both = flags | Flags::DELAYED;
        assert!(both.contains(Flags::WRITEBACK | Flags::DELAYED));
        assert!(!both.contains(Flags::LOCKED));
    }

    #[test]
    fn id_gen_is_monotonic_per_rank() {
        let mut ids = IdGen::new(7);
        let a = ids.next();
        let b = ids.next();
        assert!(a < b);
        assert_eq!(a.1, 7);
    }
}
