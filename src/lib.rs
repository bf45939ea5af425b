//! Discrete-event simulator for rack-scale replicated key-value caches.
//!
//! The crate models a rack (or a pair of racks) of cache nodes plus a logical
//! client, all advanced in lock-step over a virtual microsecond clock:
//! - A network model (`param`, `node`) charges every message a sampled
//!   propagation delay, a transmission delay derived from its wire length,
//!   and a per-packet processing latency at the receiver.
//! - Applications (`application`, `kv`, `memcachekv`, `pegasuskv`) are state
//!   machines bound to nodes. The memcache-style client/server pair supports
//!   replicated writes under several write modes; the Pegasus pair adds an
//!   in-network-style coherence directory that tracks sharers and serializes
//!   write fan-out.
//! - Configuration policies (`memcachekv`) decide, per request, which nodes a
//!   key maps to and when a hot key should migrate: static hashing, periodic
//!   load rebalancing, consistent-hashing-with-bounded-load, and the
//!   instantaneous/projected/average load variants.
//! - Statistics (`stats`, `kv`) aggregate per-request latencies into integer
//!   microsecond histograms with optional per-epoch rollups.
//!
//! Everything is in-process and deterministic under a fixed seed: all
//! stochastic draws (latency jitter, destination choice, workload) come from
//! a single `StdRng` owned by the simulator root. There is no real network
//! I/O and no wall-clock dependence.

use thiserror::Error;

pub mod application;
pub mod ctrl;
pub mod kv;
pub mod memcachekv;
pub mod message;
pub mod node;
pub mod param;
pub mod pegasuskv;
pub mod simulator;
pub mod stats;
pub mod workload;

/// Virtual time, in microseconds since the start of the run.
pub type Time = u64;

/// Node identifier. The simulator routes outbound messages by id, so ids
/// must be unique across a run.
pub type NodeId = usize;

/// Rack identifier.
pub type RackId = usize;

/// Fatal simulation errors.
///
/// `Protocol` means a state machine received a message it cannot account for
/// (unknown pending request id, a request arriving at a client, an
/// unexpected reply kind). These abort the run: the simulation state is no
/// longer trustworthy. `Config` covers rejected policy parameters and wiring
/// mistakes caught before or during setup.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}
