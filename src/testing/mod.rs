//! Toy simulation kernel for tests: an event calendar, a flat memory model,
//! and a FIFO snoop-bus arbiter, wired around real [`Cache`] instances.
//!
//! The kernel is deliberately small. It routes [`Outgoing`] actions between
//! components, delivers self-events after their requested delay, and keeps
//! the bus totally ordered: one grant is outstanding at a time, and the
//! granted send is broadcast to every member (including the sender, which
//! observes its own traffic through the snoop loopback).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Once;

use indexmap::IndexMap;

use crate::cache::Cache;
use crate::config::Config;
use crate::event::{Command, EventId, Flags, IdGen, MemEvent, Source};
use crate::interconn::{DirectoryPeer, Links, Outgoing, SelfEvent, Target};
use crate::Address;

static INIT: Once = Once::new();

pub fn init_test() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        let _ = color_eyre::install();
    });
}

pub const MEMORY_NAME: &str = "memory";
const LINK_DELAY: u64 = 1;
const MEMORY_DELAY: u64 = 3;
/// Bus replies are slower than cache-to-cache supply, so a snooping owner
/// always wins the data phase.
const MEMORY_BUS_DELAY: u64 = 5;

/// How one cache is connected into the system.
#[derive(Debug, Clone)]
pub struct Wiring {
    /// Component name per upstream link: a CPU or the cache above.
    pub upstream: Vec<String>,
    /// Cache below, or [`MEMORY_NAME`].
    pub downstream: Option<String>,
    pub on_bus: bool,
    /// Cache answers directory fetches and mirrors writebacks there.
    pub directory: bool,
}

impl Wiring {
    fn links(&self) -> Links {
        Links {
            num_upstream: self.upstream.len(),
            downstream: self.downstream.is_some(),
            snoop: self.on_bus,
            directory: self.directory,
        }
    }
}

#[derive(Debug)]
enum Delivery {
    Link {
        to: String,
        ev: MemEvent,
        src: Source,
    },
    SelfEv {
        to: String,
        ev: SelfEvent,
    },
    MemoryEv {
        ev: MemEvent,
        via_bus: bool,
    },
    /// Memory's bus reply, deferred so a snooping owner can beat it to the
    /// data phase.
    MemoryReply {
        base: Address,
        ev: MemEvent,
    },
    BusGrant {
        to: String,
        id: EventId,
    },
    BusBroadcast {
        ev: MemEvent,
    },
}

#[derive(Debug, Default)]
struct Bus {
    queue: VecDeque<(String, MemEvent)>,
    busy: bool,
    /// Base address of a request broadcast still waiting for its data
    /// phase; only the matching supply may be granted meanwhile.
    awaiting_reply: Option<Address>,
}

struct Memory {
    blocks: HashMap<Address, Vec<u8>>,
    block_size: usize,
    on_bus: bool,
    /// Bus replies not yet sent; dropped when a cache supplies first.
    pending: HashSet<Address>,
    requests_seen: usize,
}

impl Memory {
    fn block(&mut self, base: Address) -> &mut Vec<u8> {
        let size = self.block_size;
        self.blocks.entry(base).or_insert_with(|| vec![0; size])
    }
}

pub struct Sim {
    time: u64,
    seq: u64,
    calendar: BTreeMap<(u64, u64), Delivery>,
    caches: IndexMap<String, (Cache, Wiring)>,
    memory: Memory,
    bus: Bus,
    ids: IdGen,
    cpu_inbox: IndexMap<String, Vec<MemEvent>>,
    directory_inbox: Vec<MemEvent>,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Sim {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            time: 0,
            seq: 0,
            calendar: BTreeMap::new(),
            caches: IndexMap::new(),
            memory: Memory {
                blocks: HashMap::new(),
                block_size,
                on_bus: false,
                pending: HashSet::new(),
                requests_seen: 0,
            },
            bus: Bus::default(),
            ids: IdGen::new(u32::MAX),
            cpu_inbox: IndexMap::new(),
            directory_inbox: Vec::new(),
        }
    }

    pub fn add_cache(&mut self, name: &str, config: Config, wiring: Wiring) {
        let rank = self.caches.len() as u32;
        let mut cache =
            Cache::new(name, rank, config, wiring.links()).expect("valid cache config");
        if wiring.directory {
            // One directory controller owning the whole address space.
            cache.set_directory_peers(vec![DirectoryPeer {
                range_start: 0,
                range_end: Address::MAX,
                interleave_size: 0,
                interleave_step: 0,
                name: "directory".into(),
            }]);
        }
        for cpu in &wiring.upstream {
            self.cpu_inbox.entry(cpu.clone()).or_default();
        }
        self.caches.insert(name.to_owned(), (cache, wiring));
    }

    pub fn put_memory_on_bus(&mut self) {
        self.memory.on_bus = true;
    }

    pub fn cache(&self, name: &str) -> &Cache {
        &self.caches.get(name).expect("known cache").0
    }

    pub fn write_memory(&mut self, base: Address, bytes: &[u8]) {
        let block = self.memory.block(base);
        block[..bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_memory(&self, base: Address) -> Option<&[u8]> {
        self.memory.blocks.get(&base).map(Vec::as_slice)
    }

    #[must_use]
    pub fn responses(&self, cpu: &str) -> &[MemEvent] {
        self.cpu_inbox.get(cpu).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn directory_responses(&self) -> &[MemEvent] {
        &self.directory_inbox
    }

    /// Number of data requests memory has answered.
    #[must_use]
    pub fn memory_requests(&self) -> usize {
        self.memory.requests_seen
    }

    /// Answer a directory-bound request recorded in the inbox.
    pub fn directory_reply(&mut self, to: &str, req: &MemEvent, payload: Vec<u8>) {
        let mut resp = req.make_response(self.ids.next(), Command::SupplyData);
        resp.src = "directory".into();
        resp.dst = req.src.clone();
        resp.payload = payload;
        resp.size = self.memory.block_size;
        self.schedule(
            LINK_DELAY,
            Delivery::Link {
                to: to.to_owned(),
                ev: resp,
                src: Source::Directory,
            },
        );
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.time
    }

    fn schedule(&mut self, delay: u64, delivery: Delivery) {
        let key = (self.time + delay, self.seq);
        self.seq += 1;
        self.calendar.insert(key, delivery);
    }

    fn base_addr(&self, addr: Address) -> Address {
        addr & !((self.memory.block_size as Address) - 1)
    }

    #[allow(clippy::too_many_arguments)]
    fn inject_cpu(
        &mut self,
        cache: &str,
        link: usize,
        cmd: Command,
        addr: Address,
        size: usize,
        payload: Vec<u8>,
        locked: bool,
    ) -> EventId {
        let cpu = self.caches.get(cache).expect("known cache").1.upstream[link].clone();
        let id = self.ids.next();
        let mut ev = MemEvent::new(
            id,
            cmd,
            cpu,
            cache.to_owned(),
            addr,
            self.base_addr(addr),
            size,
        );
        ev.payload = payload;
        ev.link_id = link;
        if locked {
            ev.flags.insert(Flags::LOCKED);
        }
        self.schedule(
            LINK_DELAY,
            Delivery::Link {
                to: cache.to_owned(),
                ev,
                src: Source::Upstream(link),
            },
        );
        id
    }

    pub fn cpu_read(&mut self, cache: &str, link: usize, addr: Address, size: usize) -> EventId {
        self.inject_cpu(cache, link, Command::ReadReq, addr, size, Vec::new(), false)
    }

    pub fn cpu_read_locked(
        &mut self,
        cache: &str,
        link: usize,
        addr: Address,
        size: usize,
    ) -> EventId {
        self.inject_cpu(cache, link, Command::ReadReq, addr, size, Vec::new(), true)
    }

    pub fn cpu_write(
        &mut self,
        cache: &str,
        link: usize,
        addr: Address,
        payload: &[u8],
    ) -> EventId {
        self.inject_cpu(
            cache,
            link,
            Command::WriteReq,
            addr,
            payload.len(),
            payload.to_vec(),
            false,
        )
    }

    pub fn cpu_write_locked(
        &mut self,
        cache: &str,
        link: usize,
        addr: Address,
        payload: &[u8],
    ) -> EventId {
        self.inject_cpu(
            cache,
            link,
            Command::WriteReq,
            addr,
            payload.len(),
            payload.to_vec(),
            true,
        )
    }

    /// Inject a directory fetch toward one cache.
    pub fn directory_fetch(&mut self, cache: &str, addr: Address, invalidate: bool) -> EventId {
        let id = self.ids.next();
        let cmd = if invalidate {
            Command::FetchInvalidate
        } else {
            Command::Fetch
        };
        let ev = MemEvent::new(
            id,
            cmd,
            "directory",
            cache.to_owned(),
            addr,
            self.base_addr(addr),
            self.memory.block_size,
        );
        self.schedule(
            LINK_DELAY,
            Delivery::Link {
                to: cache.to_owned(),
                ev,
                src: Source::Directory,
            },
        );
        id
    }

    /// Drain the calendar. Panics if the system fails to settle within
    /// `max_steps` deliveries.
    pub fn run(&mut self, max_steps: usize) {
        for _ in 0..max_steps {
            let Some((&key, _)) = self.calendar.iter().next() else {
                return;
            };
            let delivery = self.calendar.remove(&key).expect("key just seen");
            self.time = key.0;
            self.deliver(delivery);
            self.maybe_grant_bus();
        }
        assert!(
            self.calendar.is_empty(),
            "simulation did not settle within {max_steps} deliveries"
        );
    }

    fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Link { to, ev, src } => {
                let mut out = Vec::new();
                let now = self.time;
                let (cache, _) = self.caches.get_mut(&to).expect("known cache");
                cache.handle_event(ev, src, now, &mut out);
                self.route_outgoing(&to, out);
            }
            Delivery::SelfEv { to, ev } => {
                let mut out = Vec::new();
                let now = self.time;
                let (cache, _) = self.caches.get_mut(&to).expect("known cache");
                cache.handle_self_event(ev, now, &mut out);
                self.route_outgoing(&to, out);
            }
            Delivery::MemoryEv { ev, via_bus } => self.memory_handle(ev, via_bus),
            Delivery::MemoryReply { base, ev } => {
                if self.memory.pending.remove(&base) {
                    self.memory.requests_seen += 1;
                    self.bus.busy = true;
                    self.schedule(LINK_DELAY, Delivery::BusBroadcast { ev });
                }
            }
            Delivery::BusGrant { to, id } => {
                // The grant's send (if any) re-marks the bus busy; a grant
                // for a request cancelled in flight must not wedge it.
                self.bus.busy = false;
                let mut grant = MemEvent::new(
                    self.ids.next(),
                    Command::BusClearToSend,
                    "bus",
                    to.clone(),
                    0,
                    0,
                    0,
                );
                grant.response_to = Some(id);
                let mut out = Vec::new();
                let now = self.time;
                let (cache, _) = self.caches.get_mut(&to).expect("known cache");
                cache.handle_event(grant, Source::Snoop, now, &mut out);
                self.route_outgoing(&to, out);
            }
            Delivery::BusBroadcast { ev } => {
                let members: Vec<String> = self
                    .caches
                    .iter()
                    .filter(|(_, (_, wiring))| wiring.on_bus)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in members {
                    let mut out = Vec::new();
                    let now = self.time;
                    let (cache, _) = self.caches.get_mut(&name).expect("known cache");
                    cache.handle_event(ev.clone(), Source::Snoop, now, &mut out);
                    self.route_outgoing(&name, out);
                }
                if self.memory.on_bus {
                    self.memory_handle(ev.clone(), true);
                }
                self.bus.busy = false;
                match ev.cmd {
                    Command::RequestData => {
                        // Hold the bus for the data phase.
                        self.bus.awaiting_reply = Some(self.base_addr(ev.base_addr));
                    }
                    Command::SupplyData => {
                        let base = self.base_addr(ev.base_addr);
                        if self.bus.awaiting_reply == Some(base) {
                            self.bus.awaiting_reply = None;
                        }
                        // A cache answered; memory stands down.
                        self.memory.pending.remove(&base);
                    }
                    _ => {}
                }
            }
        }
    }

    fn route_outgoing(&mut self, from: &str, out: Vec<Outgoing>) {
        let wiring = self.caches.get(from).expect("known cache").1.clone();
        for action in out {
            match action {
                Outgoing::Send { target, ev } => self.route_send(from, &wiring, target, ev),
                Outgoing::SelfEvent { delay, ev } => self.schedule(
                    delay,
                    Delivery::SelfEv {
                        to: from.to_owned(),
                        ev,
                    },
                ),
                Outgoing::BusRequest { ev } => {
                    self.bus.queue.push_back((from.to_owned(), ev));
                }
                Outgoing::BusCancel { id } => {
                    self.bus.queue.retain(|(_, queued)| queued.id != id);
                }
            }
        }
    }

    fn route_send(&mut self, from: &str, wiring: &Wiring, target: Target, ev: MemEvent) {
        match target {
            Target::Upstream(link) => {
                let peer = wiring.upstream[link].clone();
                if self.caches.contains_key(&peer) {
                    // The cache above sees us on its downstream link.
                    self.schedule(
                        LINK_DELAY,
                        Delivery::Link {
                            to: peer,
                            ev,
                            src: Source::Downstream,
                        },
                    );
                } else {
                    self.cpu_inbox.entry(peer).or_default().push(ev);
                }
            }
            Target::Downstream => {
                let peer = wiring.downstream.clone().expect("downstream wired");
                if peer == MEMORY_NAME {
                    self.schedule(MEMORY_DELAY, Delivery::MemoryEv { ev, via_bus: false });
                } else {
                    let link = self
                        .caches
                        .get(&peer)
                        .expect("known cache")
                        .1
                        .upstream
                        .iter()
                        .position(|name| name == from)
                        .expect("upstream wiring is symmetric");
                    self.schedule(
                        LINK_DELAY,
                        Delivery::Link {
                            to: peer,
                            ev,
                            src: Source::Upstream(link),
                        },
                    );
                }
            }
            Target::Directory => {
                if ev.cmd == Command::Invalidate {
                    // The directory controller is a test double; it always
                    // acknowledges invalidates.
                    let mut ack = ev.make_response(self.ids.next(), Command::Ack);
                    ack.src = "directory".into();
                    ack.dst = ev.src.clone();
                    self.schedule(
                        MEMORY_DELAY,
                        Delivery::Link {
                            to: from.to_owned(),
                            ev: ack,
                            src: Source::Directory,
                        },
                    );
                }
                self.directory_inbox.push(ev);
            }
            Target::Snoop => {
                self.bus.busy = true;
                self.schedule(LINK_DELAY, Delivery::BusBroadcast { ev });
            }
        }
    }

    fn maybe_grant_bus(&mut self) {
        if self.bus.busy {
            return;
        }
        let index = match self.bus.awaiting_reply {
            // Only the data phase of the open transaction may go out.
            Some(base) => self.bus.queue.iter().position(|(_, queued)| {
                queued.cmd == Command::SupplyData && self.base_addr(queued.base_addr) == base
            }),
            None => (!self.bus.queue.is_empty()).then_some(0),
        };
        let Some(index) = index else {
            return;
        };
        let (to, queued) = self.bus.queue.remove(index).expect("index just found");
        self.bus.busy = true;
        self.schedule(
            LINK_DELAY,
            Delivery::BusGrant {
                to,
                id: queued.id,
            },
        );
    }

    fn memory_handle(&mut self, ev: MemEvent, via_bus: bool) {
        match ev.cmd {
            Command::RequestData => {
                if via_bus && ev.dst != MEMORY_NAME {
                    return;
                }
                let base = self.base_addr(ev.base_addr);
                let payload = self.memory.block(base).clone();
                let mut resp = ev.make_response(self.ids.next(), Command::SupplyData);
                resp.src = MEMORY_NAME.to_owned();
                resp.dst = ev.src.clone();
                resp.payload = payload;
                resp.size = self.memory.block_size;
                if via_bus {
                    // Deferred: a snooping owner supplying first stands
                    // memory down.
                    self.memory.pending.insert(base);
                    self.schedule(MEMORY_BUS_DELAY, Delivery::MemoryReply { base, ev: resp });
                } else {
                    self.memory.requests_seen += 1;
                    self.schedule(
                        MEMORY_DELAY,
                        Delivery::Link {
                            to: ev.src.clone(),
                            ev: resp,
                            src: Source::Downstream,
                        },
                    );
                }
            }
            Command::SupplyData => {
                if ev.flags.contains(Flags::WRITEBACK) {
                    let base = self.base_addr(ev.base_addr);
                    let payload = ev.payload.clone();
                    self.memory.block(base).copy_from_slice(&payload);
                }
            }
            Command::Invalidate => {
                // Memory holds no state to invalidate; p2p invalidates are
                // acked so upgrade chains complete.
                if !via_bus {
                    let mut ack = ev.make_response(self.ids.next(), Command::Ack);
                    ack.src = MEMORY_NAME.to_owned();
                    ack.dst = ev.src.clone();
                    self.schedule(
                        MEMORY_DELAY,
                        Delivery::Link {
                            to: ev.src.clone(),
                            ev: ack,
                            src: Source::Downstream,
                        },
                    );
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Status;

    #[test]
    fn single_cache_read_through_memory() {
        init_test();
        let mut sim = Sim::new(64);
        sim.add_cache(
            "l1",
            Config::default(),
            Wiring {
                upstream: vec!["cpu0".into()],
                downstream: Some(MEMORY_NAME.into()),
                on_bus: false,
                directory: false,
            },
        );
        sim.write_memory(0x100, &[0xaa; 64]);
        sim.cpu_read("l1", 0, 0x104, 8);
        sim.run(1000);

        let responses = sim.responses("cpu0");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].cmd, Command::SupplyData);
        assert_eq!(responses[0].payload, vec![0xaa; 8]);
        assert_eq!(sim.cache("l1").block_status(0x100), Some(Status::Shared));
    }
}
