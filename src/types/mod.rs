//! The core data types: topic names, cluster configs, mutations, events, and
//! the client protocol. Each type owns its canonical big-endian encoding,
//! which is used both on the wire and in the log files.

mod client;
mod config;
mod event;
mod mutation;
mod topic;

pub use client::{Request, Response};
pub use config::{ClusterConfig, ConfigEntry, MAX_CLUSTER_MEMBERS};
pub use event::{Change, Event};
pub use mutation::{Mutation, Operation};
pub use topic::{TopicName, MAX_TOPIC_LEN};

use uuid::Uuid;

/// A leader term number, assigned by the current leader and bumped on every
/// new election.
pub type Term = u64;

/// A 128-bit node identifier, generated when a node first starts.
pub type NodeId = Uuid;

/// A 128-bit client identifier, generated by the client.
pub type ClientId = Uuid;
