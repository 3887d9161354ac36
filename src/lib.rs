//! Coherent, multi-level cache component for a discrete-event simulator of
//! memory hierarchies.
//!
//! A [`cache::Cache`] sits between one or more upstream requesters (CPU or
//! higher-level caches) and a downstream memory (lower-level cache, directory
//! controller, or a snoopy bus). It serves hits from its own set-associative
//! storage, resolves misses by issuing requests downstream, keeps a coherence
//! protocol across peers, evicts blocks under capacity pressure, and answers
//! invalidation and fetch commands from the coherence fabric.
//!
//! The cache never talks to the simulator kernel directly: every handler
//! pushes [`interconn::Outgoing`] actions (link sends, deferred self-events,
//! snoop-bus requests and cancellations) into a sink owned by the caller.
//! The [`testing`] module provides a toy kernel, memory model and bus
//! arbiter that drive full multi-cache systems in tests.

pub mod block;
pub mod cache;
pub mod coherence;
pub mod config;
pub mod event;
pub mod interconn;
pub mod listener;
pub mod mshr;
pub mod stats;
pub mod tag_array;
pub mod testing;

/// Physical address in the simulated memory space.
pub type Address = u64;

pub use cache::Cache;
pub use config::{Config, ConfigError, Mode};
pub use event::{Command, EventId, Flags, MemEvent, Source};
pub use interconn::{Outgoing, SelfEvent, Target};
pub use stats::Stats;
