//! The cache controller: event dispatcher, per-block coherence state
//! machine, and the handlers tying the storage and the outstanding-work
//! tables together.
//!
//! A handler runs to completion; deferred work re-enters the dispatcher
//! through a self-event. Replays out of the invalidation, load and row
//! queues happen synchronously, in arrival order, with `first_time = false`
//! so statistics and phase detection stay single-shot.

use std::collections::VecDeque;

use console::style;
use serde::Serialize;

use crate::block::Status;
use crate::coherence::{Direction, Invalidation, InvalidationTable, Supply, SupplyTable};
use crate::config::{Config, ConfigError, Mode};
use crate::event::{Command, EventId, Flags, IdGen, MemEvent, Source};
use crate::interconn::{
    find_directory_target, BusAction, BusSend, DirectoryPeer, Links, Outgoing, SelfEvent, Target,
};
use crate::listener::{from_name, AccessRecord, CacheListener};
use crate::mshr::{LoadDirection, LoadInfo, MshrTable};
use crate::stats::Stats;
use crate::tag_array::TagArray;
use crate::Address;

/// Abort the simulation on a protocol violation. These indicate a bug in the
/// surrounding coherence design, not a runtime condition.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}

/// Snapshot of one resident block, for harness comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockState {
    pub base_addr: Address,
    pub status: Status,
    pub last_touched: u64,
}

/// Snapshot of every resident block, in storage order.
#[derive(Debug, Clone, Serialize)]
pub struct CacheState {
    pub name: String,
    pub blocks: Vec<BlockState>,
}

pub struct Cache {
    name: String,
    config: Config,
    links: Links,
    tag: TagArray,
    mshr: MshrTable,
    invals: InvalidationTable,
    supplies: SupplyTable,
    /// Sends waiting for the snoop arbiter, front first. The arbiter grants
    /// in the same order requests were issued, so the front always matches
    /// the next `BusClearToSend`.
    bus_pending: VecDeque<BusSend>,
    peers: Vec<DirectoryPeer>,
    listener: Box<dyn CacheListener>,
    stats: Stats,
    ids: IdGen,
    is_l1: bool,
    /// When set, the role came from configuration and the first-request
    /// heuristic is disabled.
    is_l1_fixed: bool,
}

impl Cache {
    pub fn new(
        name: impl Into<String>,
        rank: u32,
        config: Config,
        links: Links,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if !(links.downstream || links.directory || links.snoop) {
            return Err(ConfigError::NoDownstreamPath);
        }
        let listener = from_name(&config.prefetcher)?;
        let tag = TagArray::new(config.num_rows, config.num_ways, config.blocksize);
        Ok(Self {
            name: name.into(),
            tag,
            mshr: MshrTable::new(),
            invals: InvalidationTable::new(),
            supplies: SupplyTable::new(),
            bus_pending: VecDeque::new(),
            peers: Vec::new(),
            listener,
            stats: Stats::default(),
            ids: IdGen::new(rank),
            is_l1: config.is_l1.unwrap_or(false),
            is_l1_fixed: config.is_l1.is_some(),
            links,
            config,
        })
    }

    /// Snapshot the peer directory controllers learned from the network link
    /// at startup.
    pub fn set_directory_peers(&mut self, peers: Vec<DirectoryPeer>) {
        self.peers = peers;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[must_use]
    pub fn is_l1(&self) -> bool {
        self.is_l1
    }

    #[must_use]
    pub fn block_status(&self, addr: Address) -> Option<Status> {
        self.tag.find_block(addr).map(|rc| self.tag.block(rc).status)
    }

    #[must_use]
    pub fn block_data(&self, addr: Address) -> Option<&[u8]> {
        self.tag
            .find_block(addr)
            .map(|rc| self.tag.block(rc).data.as_slice())
    }

    #[must_use]
    pub fn state(&self) -> CacheState {
        CacheState {
            name: self.name.clone(),
            blocks: self
                .tag
                .blocks()
                .filter(|block| block.status.is_valid())
                .map(|block| BlockState {
                    base_addr: block.base_addr,
                    status: block.status,
                    last_touched: block.last_touched,
                })
                .collect(),
        }
    }

    /// Entry point for events arriving on a link.
    pub fn handle_event(
        &mut self,
        ev: MemEvent,
        src: Source,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        self.dispatch(ev, src, true, false, now, out);
    }

    /// Entry point for self-events coming back off the self link.
    pub fn handle_self_event(&mut self, ev: SelfEvent, now: u64, out: &mut Vec<Outgoing>) {
        match ev {
            SelfEvent::Dispatch {
                ev,
                src,
                first_time,
                first_phase_done,
            } => self.dispatch(ev, src, first_time, first_phase_done, now, out),
            SelfEvent::Respond { req, src } => self.fire_respond(&req, src, now, out),
            SelfEvent::IssueLoad { base_addr } => self.fire_issue_load(base_addr, now, out),
            SelfEvent::SupplySend { req, src } => self.fire_supply_send(&req, src, now, out),
        }
    }

    // ------------------------------------------------------------------
    // dispatcher

    fn dispatch(
        &mut self,
        ev: MemEvent,
        src: Source,
        first_time: bool,
        first_phase_done: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        log::trace!(
            "{}::dispatch({ev}, src={src:?}, first_time={first_time}, first_phase_done={first_phase_done})",
            self.name
        );

        // Everything we sent on the bus comes back to us through the snoop
        // loopback: our own invalidate doubles as its self-ACK, the rest is
        // noise.
        if src.is_snoop() && ev.src == self.name {
            if ev.cmd == Command::Invalidate {
                let base = ev.base_addr;
                let acked = match self.invals.get_mut(base) {
                    Some(inv) if inv.issuing_id == ev.id => {
                        debug_assert!(inv.waiting_acks > 0);
                        inv.waiting_acks -= 1;
                        true
                    }
                    _ => false,
                };
                if acked {
                    log::trace!("{}::self-ack for {:#x}", self.name, base);
                    self.try_complete_invalidation(base, now, out);
                } else {
                    log::warn!(
                        "{}::snooped own invalidate {ev} with no matching record",
                        self.name
                    );
                }
            } else {
                log::trace!("{}::discarding own bus event {ev}", self.name);
            }
            return;
        }

        match ev.cmd {
            Command::ReadReq | Command::WriteReq => {
                self.handle_cpu_request(ev, src, first_time, first_phase_done, now, out);
            }
            Command::RequestData => {
                self.handle_request_data(ev, src, first_time, now, out);
            }
            Command::SupplyData => {
                self.handle_supply_data(ev, src, first_phase_done, now, out);
            }
            Command::Invalidate => {
                self.handle_invalidate(ev, src, first_phase_done, now, out);
            }
            Command::Fetch | Command::FetchInvalidate => {
                self.handle_fetch(ev, src, first_phase_done, now, out);
            }
            Command::Ack => self.handle_ack(&ev, src, now, out),
            Command::Nack => self.handle_nack(&ev, now, out),
            Command::BusClearToSend => self.handle_bus_granted(&ev, now, out),
        }
    }

    // ------------------------------------------------------------------
    // CPU requests

    fn handle_cpu_request(
        &mut self,
        ev: MemEvent,
        src: Source,
        first_time: bool,
        first_phase_done: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        // CPU requests only ever arrive at the first level; seeing one makes
        // us an L1 unless the role was pinned by configuration.
        if src.is_upstream() && !self.is_l1_fixed {
            self.is_l1 = true;
        }

        let base = self.tag.base_addr(ev.addr);
        let block_size = self.tag.block_size() as Address;
        if ev.addr + ev.size as Address > base + block_size {
            fatal!(
                "{}::request {ev} spans a block boundary; split requests are unsupported",
                self.name
            );
        }

        let is_write = ev.cmd == Command::WriteReq;
        let rc = self.tag.find_block(ev.addr);
        let resident = rc.map(|rc| self.tag.block(rc).status);

        if first_time {
            let hit = matches!(resident, Some(status) if status != Status::Assigned);
            match (is_write, hit) {
                (false, true) => self.stats.read_hit += 1,
                (false, false) => self.stats.read_miss += 1,
                (true, true) => self.stats.write_hit += 1,
                (true, false) => self.stats.write_miss += 1,
            }
            self.listener.on_access(&AccessRecord {
                addr: ev.addr,
                base_addr: base,
                write: is_write,
                hit,
            });
        }

        let Some(rc) = rc else {
            self.begin_load(ev, src, now, out);
            return;
        };

        if self.tag.block(rc).status == Status::Assigned {
            // Not a hit for any observer: ride the existing load.
            match self.mshr.get_mut(base) {
                Some(info) => info.queue.push_back((ev, src, now)),
                None => fatal!(
                    "{}::assigned block {:#x} has no outstanding load",
                    self.name,
                    base
                ),
            }
            return;
        }

        if self.invals.contains(base) {
            if let Some(inv) = self.invals.get_mut(base) {
                inv.queue.push_back((ev, src));
            }
            return;
        }

        if is_write {
            self.cpu_write_hit(rc, ev, src, first_time, now, out);
        } else {
            self.cpu_read_hit(rc, ev, src, first_time, first_phase_done, now, out);
        }
    }

    fn cpu_read_hit(
        &mut self,
        rc: (usize, usize),
        ev: MemEvent,
        src: Source,
        first_time: bool,
        first_phase_done: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        let base = self.tag.base_addr(ev.addr);
        let status = self.tag.block(rc).status;
        let busy = self.tag.block(rc).wb_in_progress || self.supplies.any_in_flight(base);

        if !ev.flags.contains(Flags::LOCKED) {
            if busy {
                // A writeback or supply holds the line; retry next tick.
                self.reschedule(ev, src, first_phase_done, out);
                return;
            }
            self.schedule_response(rc, ev, src, now, out);
            return;
        }

        // Atomic-lock read: the line must be held Exclusive first.
        if !matches!(status, Status::Exclusive | Status::Dirty) {
            if first_time {
                self.stats.upgrade_miss += 1;
            }
            self.issue_invalidate(
                Some(rc),
                base,
                Some(Status::Exclusive),
                Direction::Both,
                true,
                Some(src),
                out,
            );
            if let Some(inv) = self.invals.get_mut(base) {
                inv.queue.push_back((ev, src));
            }
            self.try_complete_invalidation(base, now, out);
            return;
        }
        if busy {
            // Something in flight would demote the line under the lock.
            self.reschedule(ev, src, first_phase_done, out);
            return;
        }
        {
            let block = self.tag.block_mut(rc);
            block.user_locked += 1;
            block.user_lock_needs_wb = false;
        }
        self.schedule_response(rc, ev, src, now, out);
    }

    fn cpu_write_hit(
        &mut self,
        rc: (usize, usize),
        ev: MemEvent,
        src: Source,
        first_time: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        let base = self.tag.base_addr(ev.addr);
        let status = self.tag.block(rc).status;
        match status {
            Status::Exclusive | Status::Dirty => {
                let mut needs_wb = false;
                {
                    let block = self.tag.block_mut(rc);
                    block.write(ev.addr, &ev.payload);
                    if ev.flags.contains(Flags::LOCKED) && block.user_locked > 0 {
                        block.user_locked -= 1;
                        if block.user_locked == 0 && block.user_lock_needs_wb {
                            block.user_lock_needs_wb = false;
                            needs_wb = true;
                        }
                    }
                }
                if needs_wb {
                    self.writeback(rc, Status::Shared, out);
                }
                self.schedule_response(rc, ev, src, now, out);
            }
            Status::Shared => {
                // Upgrade miss: take exclusivity via the invalidate fabric.
                if first_time {
                    self.stats.upgrade_miss += 1;
                }
                self.issue_invalidate(
                    Some(rc),
                    base,
                    Some(Status::Exclusive),
                    Direction::Both,
                    true,
                    Some(src),
                    out,
                );
                if let Some(inv) = self.invals.get_mut(base) {
                    inv.queue.push_back((ev, src));
                }
                self.try_complete_invalidation(base, now, out);
            }
            Status::Invalid | Status::Assigned => {
                fatal!("{}::write hit on unusable block {:#x}", self.name, base)
            }
        }
    }

    /// Lock the line for the access-latency window and schedule the CPU
    /// response.
    fn schedule_response(
        &mut self,
        rc: (usize, usize),
        ev: MemEvent,
        src: Source,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        {
            let block = self.tag.block_mut(rc);
            block.touch(now);
            block.lock();
        }
        out.push(Outgoing::SelfEvent {
            delay: self.config.access_time,
            ev: SelfEvent::Respond { req: ev, src },
        });
    }

    fn fire_respond(&mut self, req: &MemEvent, src: Source, _now: u64, out: &mut Vec<Outgoing>) {
        let Some(rc) = self.tag.find_block(req.addr) else {
            // The lock taken at scheduling time should make this impossible.
            log::error!("{}::response target {:#x} vanished", self.name, req.addr);
            debug_assert!(false);
            return;
        };
        let mut resp = req.make_response(self.ids.next(), Command::SupplyData);
        resp.src = self.name.clone();
        if req.cmd == Command::ReadReq {
            resp.payload = self.tag.block(rc).read(req.addr, req.size).to_vec();
        }
        if req.flags.contains(Flags::LOCKED) {
            resp.flags.insert(Flags::LOCKED);
        }
        self.unlock_and_wake(rc, out);
        match src {
            Source::Upstream(link) => out.push(Outgoing::Send {
                target: Target::Upstream(link),
                ev: resp,
            }),
            Source::Prefetch => {
                // Listener traffic wants the access effect, not a reply.
            }
            other => {
                debug_assert!(false, "cpu response routed to {other:?}");
            }
        }
    }

    // ------------------------------------------------------------------
    // loads and fills

    /// Begin (or join) a downstream load for a missing block.
    fn begin_load(&mut self, ev: MemEvent, src: Source, now: u64, out: &mut Vec<Outgoing>) {
        let base = self.tag.base_addr(ev.addr);

        if let Some(info) = self.mshr.get_mut(base) {
            if info.target.is_some() || info.initiating_id != ev.id {
                // Coalesce: one outbound request serves every queued miss.
                info.queue.push_back((ev, src, now));
                return;
            }
            // The initiating event is back to retry victim selection.
        } else {
            self.mshr
                .insert(LoadInfo::new(base, ev.id, LoadDirection::Down));
        }

        let row = self.tag.row_of(base);
        let rc = match self.tag.find_empty(row) {
            Some(rc) => rc,
            None => {
                let Some(victim) = self.tag.lru_unlocked(row) else {
                    // Every way is locked; retry when one of them unlocks.
                    self.tag.push_waiting(row, base, ev, src);
                    return;
                };
                let victim_status = self.tag.block(victim).status;
                let victim_base = self.tag.block(victim).base_addr;
                debug_assert_ne!(victim_status, Status::Assigned);

                if self.config.mode == Mode::Inclusive && victim_status.is_valid() {
                    // Peers above must give the block up (and write back)
                    // before the slot can be re-used.
                    if self.invals.contains(victim_base) {
                        self.tag.push_waiting(row, base, ev, src);
                        return;
                    }
                    self.listener.on_evict(victim_base);
                    self.issue_invalidate(
                        Some(victim),
                        victim_base,
                        Some(Status::Invalid),
                        Direction::Up,
                        true,
                        // Block-eviction invalidate for a different address:
                        // the triggering link is not exempt.
                        None,
                        out,
                    );
                    if let Some(inv) = self.invals.get_mut(victim_base) {
                        inv.queue.push_back((ev, src));
                    }
                    self.try_complete_invalidation(victim_base, now, out);
                    return;
                }

                match victim_status {
                    Status::Exclusive | Status::Dirty => {
                        // Writeback completion re-drives the row.
                        self.listener.on_evict(victim_base);
                        self.tag.push_waiting(row, base, ev, src);
                        self.writeback(victim, Status::Invalid, out);
                        return;
                    }
                    Status::Shared => {
                        self.listener.on_evict(victim_base);
                        victim
                    }
                    Status::Invalid => victim,
                    Status::Assigned => unreachable!("assigned blocks are locked"),
                }
            }
        };

        let tag = self.tag.tag_of(base);
        {
            let block = self.tag.block_mut(rc);
            block.assign(base, tag, now);
            block.lock();
            block.load_pending = true;
        }
        let Some(info) = self.mshr.get_mut(base) else {
            fatal!("{}::load record for {:#x} vanished", self.name, base)
        };
        info.target = Some(rc);
        info.queue.push_back((ev, src, now));
        out.push(Outgoing::SelfEvent {
            delay: self.config.access_time,
            ev: SelfEvent::IssueLoad { base_addr: base },
        });
    }

    /// Begin an upstream fetch of fresher data for a dirty resident block.
    fn fetch_block(
        &mut self,
        rc: (usize, usize),
        ev: MemEvent,
        src: Source,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        let base = self.tag.block(rc).base_addr;
        if let Some(info) = self.mshr.get_mut(base) {
            info.queue.push_back((ev, src, now));
            return;
        }
        let mut info = LoadInfo::new(base, ev.id, LoadDirection::Up);
        info.target = Some(rc);
        info.queue.push_back((ev, src, now));
        self.mshr.insert(info);
        self.tag.block_mut(rc).lock();
        out.push(Outgoing::SelfEvent {
            delay: self.config.access_time,
            ev: SelfEvent::IssueLoad { base_addr: base },
        });
    }

    fn fire_issue_load(&mut self, base: Address, _now: u64, out: &mut Vec<Outgoing>) {
        let Some(info) = self.mshr.get(base) else {
            // Every waiter was discarded in the meantime.
            return;
        };
        let direction = info.direction;
        let id = self.ids.next();
        let mut req = MemEvent::new(
            id,
            Command::RequestData,
            self.name.clone(),
            String::new(),
            base,
            base,
            self.tag.block_size(),
        );
        match direction {
            LoadDirection::Down => {
                if self.links.downstream {
                    out.push(Outgoing::Send {
                        target: Target::Downstream,
                        ev: req,
                    });
                } else if self.links.directory {
                    req.dst = self.directory_target(base).to_owned();
                    out.push(Outgoing::Send {
                        target: Target::Directory,
                        ev: req,
                    });
                } else if self.links.snoop {
                    if let Some(next) = self.config.next_level_name() {
                        req.dst = next.to_owned();
                    }
                    if let Some(info) = self.mshr.get_mut(base) {
                        info.bus_event = Some(id);
                    }
                    self.bus_push(
                        BusSend {
                            ev: req,
                            init: None,
                            finish: Some(BusAction::LoadRequestSent { base_addr: base }),
                        },
                        out,
                    );
                } else {
                    fatal!("{}::no downstream path to load {:#x}", self.name, base);
                }
            }
            LoadDirection::Up => {
                for link in 0..self.links.num_upstream {
                    let mut up = req.clone();
                    up.link_id = link;
                    out.push(Outgoing::Send {
                        target: Target::Upstream(link),
                        ev: up,
                    });
                }
            }
        }
    }

    fn handle_supply_data(
        &mut self,
        ev: MemEvent,
        src: Source,
        first_phase_done: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        let base = self.tag.base_addr(ev.base_addr);
        if self.mshr.contains(base) {
            self.finish_load(ev, src, first_phase_done, now, out);
            return;
        }
        if ev.flags.contains(Flags::WRITEBACK) {
            self.receive_writeback(&ev, src, now, out);
            return;
        }
        // A race with a recent fill or cancellation; the peer will reissue
        // if it still cares.
        if src.is_snoop() {
            log::trace!("{}::unmatched bus supply {ev}", self.name);
        } else {
            log::warn!("{}::unmatched supply {ev}, discarding", self.name);
        }
    }

    fn finish_load(
        &mut self,
        ev: MemEvent,
        src: Source,
        first_phase_done: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        let base = self.tag.base_addr(ev.base_addr);
        let (target, direction) = {
            let info = self.mshr.get(base).expect("load record exists");
            (info.target, info.direction)
        };
        let Some(rc) = target else {
            // No request has been issued yet; a bus observation cannot be
            // meant for us.
            log::warn!("{}::supply {ev} before load issue, discarding", self.name);
            return;
        };

        let status = self.tag.block(rc).status;
        // Proceed only for a block reserved by this load, or a dirty block
        // we are refreshing from above.
        let gate = status == Status::Assigned
            || (status == Status::Dirty && direction == LoadDirection::Up);
        if !gate {
            fatal!(
                "{}::fill for {:#x} found block in {:?} (direction {:?})",
                self.name,
                base,
                status,
                direction
            );
        }

        if let Some(bus_id) = self.mshr.get_mut(base).and_then(|info| info.bus_event.take()) {
            // Someone else's transaction satisfied the load first.
            self.bus_cancel(bus_id, out);
        }

        if ev.flags.contains(Flags::DELAYED) {
            // The supplier will produce real data later. Bus observers are
            // served by that later transaction; keep only the rest.
            let name = self.name.clone();
            let info = self.mshr.get_mut(base).expect("load record exists");
            info.queue
                .retain(|(qev, qsrc, _)| !qsrc.is_snoop() || qev.dst == name);
            if info.queue.is_empty() {
                self.mshr.remove(base);
                let block = self.tag.block_mut(rc);
                block.status = Status::Invalid;
                block.load_pending = false;
                block.unlock();
                self.run_row_waiters(rc.0, now, out);
            }
            return;
        }

        if ev.payload.len() != self.tag.block_size() {
            fatal!(
                "{}::fill for {:#x} carries {} bytes, block size is {}",
                self.name,
                base,
                ev.payload.len(),
                self.tag.block_size()
            );
        }

        {
            let block = self.tag.block_mut(rc);
            block.fill(&ev.payload);
            block.status = Status::Shared;
            block.load_pending = false;
            block.touch(now);
            block.unlock();
        }
        let info = self.mshr.remove(base).expect("load record exists");
        log::debug!(
            "{}::{} {:#x} filled, replaying {} waiters",
            self.name,
            style("load").green(),
            base,
            info.queue.len()
        );

        if ev.flags.contains(Flags::WRITEBACK) && src.is_upstream() {
            self.forward_writeback(&ev, out);
        }

        for (qev, qsrc, _issued) in info.queue {
            if qsrc.is_snoop() && qev.dst != self.name {
                // Served by the same bus transaction we just observed.
                continue;
            }
            self.dispatch(qev, qsrc, false, first_phase_done, now, out);
        }
        self.run_row_waiters(rc.0, now, out);
    }

    /// A writeback from above: take the payload, settle a transiently dirty
    /// block, and keep the propagation moving toward the next level.
    fn receive_writeback(
        &mut self,
        ev: &MemEvent,
        src: Source,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        let base = self.tag.base_addr(ev.base_addr);
        match self.tag.find_block(base) {
            Some(rc) if self.tag.block(rc).status != Status::Assigned => {
                let block = self.tag.block_mut(rc);
                block.fill(&ev.payload);
                block.touch(now);
                if block.status == Status::Dirty {
                    block.status = Status::Shared;
                }
            }
            _ => {
                log::debug!(
                    "{}::writeback {ev} for a block we no longer hold",
                    self.name
                );
            }
        }
        if src.is_upstream() {
            self.forward_writeback(ev, out);
        }
    }

    fn forward_writeback(&mut self, ev: &MemEvent, out: &mut Vec<Outgoing>) {
        let mut fwd = ev.clone();
        fwd.src = self.name.clone();
        if self.links.downstream {
            out.push(Outgoing::Send {
                target: Target::Downstream,
                ev: fwd,
            });
        } else if self.links.directory {
            fwd.dst = self.directory_target(ev.base_addr).to_owned();
            out.push(Outgoing::Send {
                target: Target::Directory,
                ev: fwd,
            });
        } else if self.links.snoop {
            self.bus_push(
                BusSend {
                    ev: fwd,
                    init: None,
                    finish: None,
                },
                out,
            );
        }
    }

    // ------------------------------------------------------------------
    // supplies (RequestData)

    fn handle_request_data(
        &mut self,
        ev: MemEvent,
        src: Source,
        first_time: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        if ev.size != self.tag.block_size() {
            fatal!(
                "{}::request {ev} for {} bytes, block size is {}; split sizes are unsupported",
                self.name,
                ev.size,
                self.tag.block_size()
            );
        }
        let base = self.tag.base_addr(ev.base_addr);

        let resident = self
            .tag
            .find_block(base)
            .filter(|&rc| self.tag.block(rc).status != Status::Assigned);

        if let Some(rc) = resident {
            if self.invals.contains(base) {
                if let Some(inv) = self.invals.get_mut(base) {
                    inv.queue.push_back((ev, src));
                }
                return;
            }
            let status = self.tag.block(rc).status;
            if status == Status::Dirty {
                if !src.is_snoop() {
                    fatal!(
                        "{}::dirty block {:#x} cannot answer RequestData from {:?}",
                        self.name,
                        base,
                        src
                    );
                }
                // Pretend we do not have it; the owner above holds the
                // fresh copy and answers the same bus transaction.
                log::debug!(
                    "{}::dirty block {:#x} leaves the bus request to its owner",
                    self.name,
                    base
                );
                return;
            } else {
                if first_time {
                    self.stats.supply_hit += 1;
                }
                let peer = ev.src.clone();
                if self.supplies.contains(base, &peer) {
                    log::debug!(
                        "{}::supply for ({:#x}, {peer}) already in progress",
                        self.name,
                        base
                    );
                    return;
                }
                self.supplies.insert(
                    base,
                    peer,
                    Supply {
                        bus_event: None,
                        canceled: false,
                    },
                );
                {
                    let block = self.tag.block_mut(rc);
                    block.touch(now);
                    block.lock();
                }
                out.push(Outgoing::SelfEvent {
                    delay: self.config.access_time,
                    ev: SelfEvent::SupplySend { req: ev, src },
                });
                return;
            }
        }

        if first_time {
            self.stats.supply_miss += 1;
        }
        match src {
            Source::Downstream => {
                // A race with a recent writeback of ours.
                log::debug!("{}::downstream request {ev} missed, discarding", self.name);
            }
            Source::Snoop if ev.dst != self.name => {
                log::trace!("{}::bus request {ev} not for us, discarding", self.name);
            }
            _ => self.begin_load(ev, src, now, out),
        }
    }

    fn fire_supply_send(&mut self, req: &MemEvent, src: Source, _now: u64, out: &mut Vec<Outgoing>) {
        let base = self.tag.base_addr(req.base_addr);
        let peer = req.src.clone();
        let Some(supply) = self.supplies.get(base, &peer) else {
            log::trace!("{}::supply ({:#x}, {peer}) already resolved", self.name, base);
            return;
        };
        if supply.canceled {
            self.supplies.remove(base, &peer);
            return;
        }
        let Some(rc) = self.tag.find_block(base) else {
            log::warn!("{}::supply target {:#x} vanished", self.name, base);
            self.supplies.remove(base, &peer);
            return;
        };

        if self.tag.block(rc).user_locked > 0 {
            // The line is under a CPU atomic; promise the data for later.
            // The unlock store triggers the real writeback.
            let mut resp = req.make_response(self.ids.next(), Command::SupplyData);
            resp.src = self.name.clone();
            resp.dst = peer.clone();
            resp.size = self.tag.block_size();
            resp.flags.insert(Flags::DELAYED);
            self.tag.block_mut(rc).user_lock_needs_wb = true;
            self.unlock_and_wake(rc, out);
            self.supplies.remove(base, &peer);
            if src.is_snoop() {
                self.bus_push(
                    BusSend {
                        ev: resp,
                        init: None,
                        finish: None,
                    },
                    out,
                );
            } else if let Some(target) = direct_route(src) {
                out.push(Outgoing::Send { target, ev: resp });
            }
            return;
        }

        let mut resp = req.make_response(self.ids.next(), Command::SupplyData);
        resp.src = self.name.clone();
        resp.dst = peer.clone();
        resp.size = self.tag.block_size();

        if src.is_snoop() {
            let id = resp.id;
            if let Some(supply) = self.supplies.get_mut(base, &peer) {
                supply.bus_event = Some(id);
            }
            self.bus_push(
                BusSend {
                    ev: resp,
                    init: Some(BusAction::AttachPayload { rc }),
                    finish: Some(BusAction::FinishSupply {
                        base_addr: base,
                        peer,
                    }),
                },
                out,
            );
            return;
        }

        resp.payload = self.tag.block(rc).data.clone();
        // Supplying toward the level below surrenders sole ownership; only
        // a supply up to a requester we serve leaves the block Exclusive.
        let demote = matches!(src, Source::Directory | Source::Downstream);
        {
            let block = self.tag.block_mut(rc);
            if demote && block.status == Status::Exclusive {
                block.status = Status::Shared;
            }
        }
        self.unlock_and_wake(rc, out);
        self.supplies.remove(base, &peer);
        if let Some(target) = direct_route(src) {
            out.push(Outgoing::Send { target, ev: resp });
        } else {
            debug_assert!(false, "supply routed to {src:?}");
        }
    }

    /// Cancel every live supply for the block, retracting queued bus sends
    /// and undoing the per-supply block lock. Returns how many were live.
    fn cancel_supplies(&mut self, base: Address, out: &mut Vec<Outgoing>) -> usize {
        let peers = self.supplies.peers_for(base);
        let mut canceled = 0;
        for peer in peers {
            let Some(supply) = self.supplies.get_mut(base, &peer) else {
                continue;
            };
            if supply.canceled {
                continue;
            }
            supply.canceled = true;
            canceled += 1;
            if let Some(id) = supply.bus_event.take() {
                // Already committed to the arbiter queue; no deferred send
                // remains to clean the record up.
                self.bus_cancel(id, out);
                self.supplies.remove(base, &peer);
            }
            if let Some(rc) = self.tag.find_block(base) {
                self.unlock_and_wake(rc, out);
            }
        }
        canceled
    }

    // ------------------------------------------------------------------
    // invalidation protocol

    /// Create an invalidation record, lock the target, broadcast on every
    /// enabled egress, and count the expected ACKs. The caller queues any
    /// events to replay and then calls [`Self::try_complete_invalidation`]
    /// (the broadcast may have had no recipients at all).
    #[allow(clippy::too_many_arguments)]
    fn issue_invalidate(
        &mut self,
        target: Option<(usize, usize)>,
        base: Address,
        new_status: Option<Status>,
        direction: Direction,
        can_cancel: bool,
        exclude: Option<Source>,
        out: &mut Vec<Outgoing>,
    ) {
        debug_assert!(!self.invals.contains(base));
        let id = self.ids.next();
        let ev = MemEvent::new(
            id,
            Command::Invalidate,
            self.name.clone(),
            String::new(),
            base,
            base,
            self.tag.block_size(),
        );

        let mut waiting = 0u32;
        let mut bus_event = None;

        // The bus participates unless it delivered the trigger: every
        // member saw that transaction already, and an echo would count a
        // second self-ACK that nothing answers. When it does participate,
        // the expected ACK is our own, observed by snooping our own send.
        if self.links.snoop && !matches!(exclude, Some(Source::Snoop)) {
            bus_event = Some(id);
            self.bus_push(
                BusSend {
                    ev: ev.clone(),
                    init: None,
                    finish: Some(BusAction::InvalidateSent { base_addr: base }),
                },
                out,
            );
            waiting += 1;
        }

        if direction.up() && !self.is_l1 {
            for link in 0..self.links.num_upstream {
                if matches!(exclude, Some(Source::Upstream(trigger)) if trigger == link) {
                    continue;
                }
                let mut up = ev.clone();
                up.link_id = link;
                out.push(Outgoing::Send {
                    target: Target::Upstream(link),
                    ev: up,
                });
                waiting += 1;
            }
        }

        if direction.down() {
            if self.links.downstream && !matches!(exclude, Some(Source::Downstream)) {
                out.push(Outgoing::Send {
                    target: Target::Downstream,
                    ev: ev.clone(),
                });
                waiting += 1;
            } else if self.links.directory && !matches!(exclude, Some(Source::Directory)) {
                let mut down = ev.clone();
                down.dst = self.directory_target(base).to_owned();
                out.push(Outgoing::Send {
                    target: Target::Directory,
                    ev: down,
                });
                waiting += 1;
            }
        }

        if let Some(rc) = target {
            self.tag.block_mut(rc).lock();
        }
        log::debug!(
            "{}::invalidate {:#x} issued (id {id}, waiting for {waiting} acks)",
            self.name,
            base
        );
        self.invals.insert(
            base,
            Invalidation {
                issuing_id: id,
                target,
                new_status,
                waiting_acks: waiting,
                can_cancel,
                bus_event,
                queue: VecDeque::new(),
            },
        );
    }

    fn try_complete_invalidation(&mut self, base: Address, now: u64, out: &mut Vec<Outgoing>) {
        let done = matches!(self.invals.get(base), Some(inv) if inv.waiting_acks == 0);
        if !done {
            return;
        }
        let inv = self.invals.remove(base).expect("checked above");
        let mut freed_row = None;
        if let Some(rc) = inv.target {
            if let Some(status) = inv.new_status {
                self.tag.block_mut(rc).status = status;
                if status == Status::Invalid {
                    freed_row = Some(rc.0);
                }
            }
            self.unlock_and_wake(rc, out);
        }
        log::debug!(
            "{}::invalidate {:#x} {} ({} replays)",
            self.name,
            base,
            style("complete").green(),
            inv.queue.len()
        );
        let mut first = true;
        for (qev, qsrc) in inv.queue {
            // The first replay is told the invalidate chain has finished.
            self.dispatch(qev, qsrc, false, first, now, out);
            first = false;
        }
        if let Some(row) = freed_row {
            self.run_row_waiters(row, now, out);
        }
    }

    fn handle_invalidate(
        &mut self,
        ev: MemEvent,
        src: Source,
        first_phase_done: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        let base = self.tag.base_addr(ev.base_addr);

        if self.invals.contains(base) {
            let can_cancel = self.invals.get(base).map(|inv| inv.can_cancel) == Some(true);
            if !can_cancel {
                // The running invalidate wins; come back next tick.
                self.reschedule(ev, src, first_phase_done, out);
                return;
            }
            // Preempted: retract the in-flight broadcast and send its
            // waiters around again.
            let inv = self.invals.remove(base).expect("checked above");
            log::debug!(
                "{}::invalidate {:#x} preempted by {ev}",
                self.name,
                base
            );
            if let Some(id) = inv.bus_event {
                self.bus_cancel(id, out);
            }
            if let Some(rc) = inv.target {
                self.unlock_and_wake(rc, out);
            }
            for (qev, qsrc) in inv.queue {
                self.reschedule(qev, qsrc, false, out);
            }
        }

        let resident = self.tag.find_block(base);

        if let Some(rc) = resident {
            if self.tag.block(rc).status == Status::Assigned {
                // Let the fill land first; the invalidate replays after it.
                if let Some(info) = self.mshr.get_mut(base) {
                    info.queue.push_back((ev, src, now));
                    return;
                }
                fatal!(
                    "{}::assigned block {:#x} has no outstanding load",
                    self.name,
                    base
                );
            }

            // The block is leaving (or being demoted); nothing we promised
            // to supply from it can still be honored.
            let canceled = self.cancel_supplies(base, out);
            if canceled > 0 {
                log::debug!(
                    "{}::canceled {canceled} supplies for {:#x}",
                    self.name,
                    base
                );
            }

            if self.tag.block(rc).wb_in_progress {
                // Replays once the writeback settles the row.
                self.tag.push_waiting(rc.0, base, ev, src);
                return;
            }
            if self.tag.block(rc).user_locked > 0 {
                self.reschedule(ev, src, first_phase_done, out);
                return;
            }

            let final_status = if self.config.mode == Mode::Inclusive && src.is_upstream() {
                // The upstream now owns newer data; we hold the line dirty
                // until its writeback arrives.
                Status::Dirty
            } else {
                Status::Invalid
            };

            if !first_phase_done {
                let direction = if src.is_upstream() {
                    Direction::Both
                } else {
                    Direction::Up
                };
                if self.has_invalidate_egress(direction, src) {
                    self.issue_invalidate(
                        Some(rc),
                        base,
                        Some(final_status),
                        direction,
                        false,
                        Some(src),
                        out,
                    );
                    if let Some(inv) = self.invals.get_mut(base) {
                        inv.queue.push_back((ev, src));
                    }
                    self.try_complete_invalidation(base, now, out);
                    return;
                }
            }

            let status = self.tag.block(rc).status;
            if !src.is_upstream() && matches!(status, Status::Exclusive | Status::Dirty) {
                // Our data is the freshest copy; write it back, then let the
                // replayed invalidate find the slot empty and ACK.
                self.tag.push_waiting(rc.0, base, ev, src);
                self.writeback(rc, Status::Invalid, out);
                return;
            }

            if self.tag.block(rc).is_locked() {
                self.reschedule(ev, src, first_phase_done, out);
                return;
            }
            {
                let block = self.tag.block_mut(rc);
                block.status = final_status;
                block.touch(now);
            }
            if final_status == Status::Invalid {
                self.run_row_waiters(rc.0, now, out);
            }
            self.send_ack(&ev, src, out);
            return;
        }

        // Nothing resident. Forward opportunistically so sharers above us
        // still see it, then ACK; repeated invalidates for an absent block
        // are idempotent.
        if !first_phase_done {
            let direction = if src.is_upstream() {
                Direction::Both
            } else {
                Direction::Up
            };
            if self.has_invalidate_egress(direction, src) {
                self.issue_invalidate(None, base, None, direction, false, Some(src), out);
                if let Some(inv) = self.invals.get_mut(base) {
                    inv.queue.push_back((ev, src));
                }
                self.try_complete_invalidation(base, now, out);
                return;
            }
        }
        self.send_ack(&ev, src, out);
    }

    /// Would an invalidate broadcast reach anyone at all?
    fn has_invalidate_egress(&self, direction: Direction, trigger: Source) -> bool {
        if self.links.snoop && !trigger.is_snoop() {
            return true;
        }
        if direction.up() && !self.is_l1 {
            let excluded = match trigger {
                Source::Upstream(_) => 1,
                _ => 0,
            };
            if self.links.num_upstream > excluded {
                return true;
            }
        }
        if direction.down() {
            if self.links.downstream && !matches!(trigger, Source::Downstream) {
                return true;
            }
            if self.links.directory && !matches!(trigger, Source::Directory) {
                return true;
            }
        }
        false
    }

    fn send_ack(&mut self, to: &MemEvent, src: Source, out: &mut Vec<Outgoing>) {
        if src.is_snoop() {
            // Bus invalidates are acked only by the issuer's own loopback.
            return;
        }
        let mut ack = to.make_response(self.ids.next(), Command::Ack);
        ack.src = self.name.clone();
        ack.dst = to.src.clone();
        if let Some(target) = direct_route(src) {
            out.push(Outgoing::Send { target, ev: ack });
        }
    }

    fn handle_ack(&mut self, ev: &MemEvent, _src: Source, now: u64, out: &mut Vec<Outgoing>) {
        if ev.src == self.name {
            fatal!(
                "{}::ack from ourselves outside the snoop loopback: {ev}",
                self.name
            );
        }
        let base = self.tag.base_addr(ev.base_addr);
        let matched = match self.invals.get_mut(base) {
            Some(inv) if ev.response_to == Some(inv.issuing_id) => {
                debug_assert!(inv.waiting_acks > 0);
                inv.waiting_acks -= 1;
                true
            }
            _ => false,
        };
        if matched {
            self.try_complete_invalidation(base, now, out);
        } else {
            log::debug!("{}::ack {ev} matches nothing, discarding", self.name);
        }
    }

    fn handle_nack(&mut self, ev: &MemEvent, _now: u64, out: &mut Vec<Outgoing>) {
        let base = self.tag.base_addr(ev.base_addr);

        let matches_inval = matches!(
            self.invals.get(base),
            Some(inv) if ev.response_to == Some(inv.issuing_id)
        );
        if matches_inval {
            let inv = self.invals.remove(base).expect("checked above");
            log::debug!("{}::invalidate {:#x} nacked, unwinding", self.name, base);
            if let Some(id) = inv.bus_event {
                self.bus_cancel(id, out);
            }
            if let Some(rc) = inv.target {
                self.unlock_and_wake(rc, out);
            }
            for (qev, qsrc) in inv.queue {
                if self.is_l1 {
                    // The request came from our own CPU; just try again.
                    self.reschedule(qev, qsrc, false, out);
                } else {
                    let mut nack = qev.make_response(self.ids.next(), Command::Nack);
                    nack.src = self.name.clone();
                    if qsrc.is_snoop() {
                        self.bus_push(
                            BusSend {
                                ev: nack,
                                init: None,
                                finish: None,
                            },
                            out,
                        );
                    } else if let Some(target) = direct_route(qsrc) {
                        out.push(Outgoing::Send { target, ev: nack });
                    }
                }
            }
            return;
        }

        if self.mshr.contains(base) {
            // The load request itself was refused; reissue it.
            if let Some(id) = self.mshr.get_mut(base).and_then(|info| info.bus_event.take()) {
                self.bus_cancel(id, out);
            }
            out.push(Outgoing::SelfEvent {
                delay: 1,
                ev: SelfEvent::IssueLoad { base_addr: base },
            });
            return;
        }

        log::debug!("{}::nack {ev} matches nothing, discarding", self.name);
    }

    // ------------------------------------------------------------------
    // directory fetches

    fn handle_fetch(
        &mut self,
        ev: MemEvent,
        src: Source,
        first_phase_done: bool,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) {
        let invalidate = ev.cmd == Command::FetchInvalidate;
        let base = self.tag.base_addr(ev.base_addr);
        let resident = self.tag.find_block(base);

        if invalidate
            && !first_phase_done
            && !self.is_l1
            && self.links.num_upstream > 0
        {
            // Pull the line back from above before answering; the handler
            // re-enters once every ACK is in.
            if self.invals.contains(base) {
                if let Some(inv) = self.invals.get_mut(base) {
                    inv.queue.push_back((ev, src));
                }
                return;
            }
            self.issue_invalidate(resident, base, None, Direction::Up, false, None, out);
            if let Some(inv) = self.invals.get_mut(base) {
                inv.queue.push_back((ev, src));
            }
            self.try_complete_invalidation(base, now, out);
            return;
        }

        let Some(rc) = resident else {
            fatal!("{}::fetch {ev} for a block we do not hold", self.name);
        };
        if self.tag.block(rc).user_locked > 0 {
            self.reschedule(ev, src, first_phase_done, out);
            return;
        }

        match self.tag.block(rc).status {
            Status::Shared | Status::Exclusive => {
                if invalidate && self.tag.block(rc).is_locked() {
                    self.reschedule(ev, src, first_phase_done, out);
                    return;
                }
                let mut resp = ev.make_response(self.ids.next(), Command::SupplyData);
                resp.src = self.name.clone();
                resp.size = self.tag.block_size();
                resp.payload = self.tag.block(rc).data.clone();
                if let Some(target) = direct_route(src) {
                    out.push(Outgoing::Send { target, ev: resp });
                }
                if invalidate {
                    self.cancel_supplies(base, out);
                    self.tag.block_mut(rc).status = Status::Invalid;
                    self.run_row_waiters(rc.0, now, out);
                }
            }
            Status::Dirty => {
                if self.is_l1 || self.links.num_upstream == 0 {
                    // Nobody above holds anything fresher.
                    let mut resp = ev.make_response(self.ids.next(), Command::SupplyData);
                    resp.src = self.name.clone();
                    resp.size = self.tag.block_size();
                    resp.payload = self.tag.block(rc).data.clone();
                    if let Some(target) = direct_route(src) {
                        out.push(Outgoing::Send { target, ev: resp });
                    }
                    if invalidate {
                        self.cancel_supplies(base, out);
                        self.tag.block_mut(rc).status = Status::Invalid;
                        self.run_row_waiters(rc.0, now, out);
                    }
                } else {
                    // Refresh from above first; the fetch replays after the
                    // fill.
                    self.fetch_block(rc, ev, src, now, out);
                }
            }
            status @ (Status::Invalid | Status::Assigned) => {
                fatal!(
                    "{}::fetch {ev} found block in illegal state {:?}",
                    self.name,
                    status
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // writeback

    /// Propagate the block's payload toward the next level. Idempotent per
    /// the `wb_in_progress` flag. With a snoop link the send goes through
    /// bus arbitration and the block stays locked until the grant.
    fn writeback(&mut self, rc: (usize, usize), new_status: Status, out: &mut Vec<Outgoing>) {
        if self.tag.block(rc).wb_in_progress {
            return;
        }
        let base = self.tag.block(rc).base_addr;
        self.tag.block_mut(rc).wb_in_progress = true;

        let mut ev = MemEvent::new(
            self.ids.next(),
            Command::SupplyData,
            self.name.clone(),
            self.config
                .next_level_name()
                .unwrap_or_default()
                .to_owned(),
            base,
            base,
            self.tag.block_size(),
        );
        ev.flags.insert(Flags::WRITEBACK);

        if self.links.snoop {
            self.tag.block_mut(rc).lock();
            self.bus_push(
                BusSend {
                    ev,
                    init: Some(BusAction::AttachPayload { rc }),
                    finish: Some(BusAction::FinishWriteback { rc, new_status }),
                },
                out,
            );
            return;
        }

        ev.payload = self.tag.block(rc).data.clone();
        if self.links.downstream {
            out.push(Outgoing::Send {
                target: Target::Downstream,
                ev: ev.clone(),
            });
        }
        if self.links.directory {
            let mut dir = ev.clone();
            dir.dst = self.directory_target(base).to_owned();
            out.push(Outgoing::Send {
                target: Target::Directory,
                ev: dir,
            });
        }
        self.complete_writeback(rc, new_status, out);
    }

    fn complete_writeback(
        &mut self,
        rc: (usize, usize),
        new_status: Status,
        out: &mut Vec<Outgoing>,
    ) {
        {
            let block = self.tag.block_mut(rc);
            block.wb_in_progress = false;
            block.status = new_status;
            debug_assert!(
                new_status != Status::Invalid || !block.is_locked(),
                "invalidated block left locked at writeback completion"
            );
        }
        if new_status == Status::Invalid {
            // The slot is reusable; give the row another spin. Time moves
            // only between kernel deliveries, so reuse the last seen tick.
            self.run_row_waiters_deferred(rc.0, out);
        }
    }

    // ------------------------------------------------------------------
    // snoop-bus queue adapter

    fn bus_push(&mut self, send: BusSend, out: &mut Vec<Outgoing>) {
        let ev = send.ev.clone();
        self.bus_pending.push_back(send);
        out.push(Outgoing::BusRequest { ev });
    }

    fn bus_cancel(&mut self, id: EventId, out: &mut Vec<Outgoing>) {
        self.bus_pending.retain(|send| send.ev.id != id);
        out.push(Outgoing::BusCancel { id });
    }

    fn handle_bus_granted(&mut self, ev: &MemEvent, _now: u64, out: &mut Vec<Outgoing>) {
        // The arbiter may reorder around data-phase priorities and grants
        // can race a cancellation, so locate the pending send by id rather
        // than assuming the front.
        let index = match ev.response_to {
            Some(granted) => self.bus_pending.iter().position(|send| send.ev.id == granted),
            None => (!self.bus_pending.is_empty()).then_some(0),
        };
        let Some(index) = index else {
            log::debug!("{}::bus grant {ev} matches nothing pending, ignoring", self.name);
            return;
        };
        let send = self.bus_pending.remove(index).expect("index just found");
        let BusSend {
            mut ev,
            init,
            finish,
        } = send;

        if let Some(BusAction::AttachPayload { rc }) = init {
            ev.payload = self.tag.block(rc).data.clone();
        }
        out.push(Outgoing::Send {
            target: Target::Snoop,
            ev: ev.clone(),
        });

        match finish {
            None => {}
            Some(BusAction::LoadRequestSent { base_addr }) => {
                if let Some(info) = self.mshr.get_mut(base_addr) {
                    info.bus_event = None;
                }
            }
            Some(BusAction::InvalidateSent { base_addr }) => {
                if let Some(inv) = self.invals.get_mut(base_addr) {
                    inv.bus_event = None;
                }
            }
            Some(BusAction::FinishSupply { base_addr, peer }) => {
                self.supplies.remove(base_addr, &peer);
                if let Some(rc) = self.tag.find_block(base_addr) {
                    {
                        let block = self.tag.block_mut(rc);
                        if block.status == Status::Exclusive {
                            block.status = Status::Shared;
                        }
                    }
                    self.unlock_and_wake(rc, out);
                }
            }
            Some(BusAction::FinishWriteback { rc, new_status }) => {
                // Mirror on the point-to-point links.
                if self.links.downstream {
                    out.push(Outgoing::Send {
                        target: Target::Downstream,
                        ev: ev.clone(),
                    });
                }
                if self.links.directory {
                    let mut dir = ev.clone();
                    dir.dst = self.directory_target(ev.base_addr).to_owned();
                    out.push(Outgoing::Send {
                        target: Target::Directory,
                        ev: dir,
                    });
                }
                self.unlock_and_wake(rc, out);
                self.complete_writeback(rc, new_status, out);
            }
            Some(BusAction::AttachPayload { .. }) => {
                debug_assert!(false, "attach-payload is an init action");
            }
        }
    }

    // ------------------------------------------------------------------
    // shared plumbing

    fn directory_target(&self, addr: Address) -> &str {
        match find_directory_target(&self.peers, addr) {
            Some(name) => name,
            None => fatal!(
                "{}::no directory peer covers {:#x}",
                self.name,
                addr
            ),
        }
    }

    fn reschedule(
        &self,
        ev: MemEvent,
        src: Source,
        first_phase_done: bool,
        out: &mut Vec<Outgoing>,
    ) {
        out.push(Outgoing::SelfEvent {
            delay: 1,
            ev: SelfEvent::Dispatch {
                ev,
                src,
                first_time: false,
                first_phase_done,
            },
        });
    }

    /// Unlock a block and, if that freed the last lock on it, give any
    /// events parked on the row another try.
    fn unlock_and_wake(&mut self, rc: (usize, usize), out: &mut Vec<Outgoing>) {
        self.tag.block_mut(rc).unlock();
        if !self.tag.block(rc).is_locked() && self.tag.has_waiting(rc.0) {
            self.run_row_waiters_deferred(rc.0, out);
        }
    }

    fn run_row_waiters(&mut self, row: usize, now: u64, out: &mut Vec<Outgoing>) {
        for (_base, ev, src) in self.tag.drain_waiting(row) {
            self.dispatch(ev, src, false, false, now, out);
        }
    }

    /// Replay row waiters through the self link instead of synchronously,
    /// for completion paths that do not carry the current time.
    fn run_row_waiters_deferred(&mut self, row: usize, out: &mut Vec<Outgoing>) {
        for (_base, ev, src) in self.tag.drain_waiting(row) {
            self.reschedule(ev, src, false, out);
        }
    }
}

/// Point-to-point egress matching a source link, where one exists.
fn direct_route(src: Source) -> Option<Target> {
    match src {
        Source::Upstream(link) => Some(Target::Upstream(link)),
        Source::Downstream => Some(Target::Downstream),
        Source::Directory => Some(Target::Directory),
        Source::Snoop | Source::Prefetch | Source::SelfLink => None,
    }
}
