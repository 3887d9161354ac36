//! Link surfaces and the outgoing-action sink.
//!
//! The cache never owns a transport. Handlers push [`Outgoing`] actions into
//! a caller-provided sink; the simulator kernel routes link sends, delivers
//! self-events after the requested delay, and forwards bus requests to the
//! snoop arbiter. Deferred work is a tagged [`SelfEvent`] variant, never a
//! bound callable.

use serde::Serialize;

use crate::block::Status;
use crate::event::{EventId, MemEvent, Source};
use crate::Address;

/// Logical egress for a direct send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Upstream(usize),
    Downstream,
    Directory,
    Snoop,
}

/// Deferred work the cache schedules against itself.
#[derive(Debug, Clone)]
pub enum SelfEvent {
    /// Re-enter the dispatcher with an event, optionally after a retry
    /// delay. Replays carry `first_time = false` so statistics and phase
    /// detection stay single-shot.
    Dispatch {
        ev: MemEvent,
        src: Source,
        first_time: bool,
        first_phase_done: bool,
    },
    /// Deliver a response to a CPU request once the access latency elapsed.
    Respond { req: MemEvent, src: Source },
    /// Issue the outbound fill request for an outstanding load.
    IssueLoad { base_addr: Address },
    /// Run the deferred half of a supply: check cancellation and the user
    /// lock, then send the payload toward the requester.
    SupplySend { req: MemEvent, src: Source },
}

/// The init/finish halves of a queued snoop-bus send, run when the arbiter
/// grants the bus.
#[derive(Debug, Clone)]
pub enum BusAction {
    /// Copy the block's current payload into the event just before it goes
    /// on the wire.
    AttachPayload { rc: (usize, usize) },
    /// Writeback left the queue: unlock, apply the final status, mirror on
    /// the point-to-point links.
    FinishWriteback {
        rc: (usize, usize),
        new_status: Status,
    },
    /// Supply left the queue: demote Exclusive to Shared, unlock, drop the
    /// supply record.
    FinishSupply { base_addr: Address, peer: String },
    /// Fill request left the queue: it is no longer cancellable.
    LoadRequestSent { base_addr: Address },
    /// Invalidate left the queue: it is no longer cancellable as queued.
    InvalidateSent { base_addr: Address },
}

/// A snoop-bus send waiting for arbitration.
#[derive(Debug, Clone)]
pub struct BusSend {
    pub ev: MemEvent,
    pub init: Option<BusAction>,
    pub finish: Option<BusAction>,
}

/// One action emitted by a handler.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Direct send on a point-to-point link or the snoop wire.
    Send { target: Target, ev: MemEvent },
    /// Self-delivery after `delay` simulation ticks.
    SelfEvent { delay: u64, ev: SelfEvent },
    /// Hand the send to the snoop arbiter's queue; the arbiter answers with
    /// `BusClearToSend` carrying the event id when it reaches the head.
    BusRequest { ev: MemEvent },
    /// Retract a still-queued bus request.
    BusCancel { id: EventId },
}

/// Which link surfaces exist on a cache instance. A meaningful configuration
/// has at least one downstream path.
#[derive(Debug, Clone)]
pub struct Links {
    pub num_upstream: usize,
    pub downstream: bool,
    pub snoop: bool,
    pub directory: bool,
}

/// Peer directory controller descriptor snapshotted from the network link at
/// startup.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryPeer {
    pub range_start: Address,
    pub range_end: Address,
    pub interleave_size: u64,
    pub interleave_step: u64,
    pub name: String,
}

impl DirectoryPeer {
    /// Does this peer own `addr`? The range is `[start, end)`; with
    /// interleaving, the offset into the range modulo the step must fall
    /// inside the interleave window.
    #[must_use]
    pub fn matches(&self, addr: Address) -> bool {
        if addr < self.range_start || addr >= self.range_end {
            return false;
        }
        if self.interleave_size > 0 {
            let offset = (addr - self.range_start) % self.interleave_step;
            return offset < self.interleave_size;
        }
        true
    }
}

/// First peer whose interval covers the address, or `None` (which the cache
/// treats as fatal: the directory map must cover the address space).
#[must_use]
pub fn find_directory_target(peers: &[DirectoryPeer], addr: Address) -> Option<&str> {
    peers
        .iter()
        .find(|peer| peer.matches(addr))
        .map(|peer| peer.name.as_str())
}
