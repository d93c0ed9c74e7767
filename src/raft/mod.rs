//! The consensus core: the Raft-style role state machine and the structures
//! it coordinates. The core is strictly single-threaded; it is driven by the
//! server's main worker and communicates with the client gateway, peer
//! gateway, and log store exclusively through fire-and-forget effects whose
//! completions come back as new commands.

mod inflight;
mod message;
mod node;
mod progress;
mod projection;

pub use inflight::{InFlight, InFlightEntry};
pub use message::{Envelope, Message};
pub use node::{Effect, Node, Restore};
pub use progress::{Peer, SyncProgress};
pub use projection::{Program, RawRuntime, Runtime, Topics};

/// A logical clock interval as a number of ticks.
pub type Ticks = u8;

/// The randomized election timeout range, in ticks. Randomized per node to
/// avoid ties.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The interval between leader heartbeats, in ticks.
pub const HEARTBEAT_INTERVAL: Ticks = 3;

/// Ticks a leader will tolerate without a connected majority in every active
/// config before stepping down.
pub const STEP_DOWN_TIMEOUT: Ticks = 40;
