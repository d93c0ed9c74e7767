use crate::types::{ClusterConfig, NodeId};

use std::collections::{HashMap, HashSet};

/// Replication state for a single downstream peer. The local node appears in
/// the peer map as a degenerate always-writable peer whose last-received
/// offset advances on local append.
#[derive(Clone, Debug, Default)]
pub struct Peer {
    /// Whether the connection to the peer is up.
    pub up: bool,
    /// Whether a record append may be sent. Cleared while one is unacked.
    pub writable: bool,
    /// The highest offset the peer has acknowledged receiving.
    pub last_received: u64,
    /// The offset of the last record sent.
    pub last_sent: u64,
    /// The next offset to send.
    pub next_send: u64,
}

impl Peer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the local node's own peer state.
    pub fn local() -> Self {
        Self { up: true, writable: true, ..Self::default() }
    }

    /// Whether the next record may be sent to this peer.
    pub fn ready(&self) -> bool {
        self.up && self.writable && self.next_send != self.last_sent
    }
}

/// The sync progress of a single cluster config: the highest mutation offset
/// acknowledged by a strict majority of its members. During joint consensus
/// there is one progress per active config, and the commitable offset is the
/// minimum across all of them.
#[derive(Clone, Debug)]
pub struct SyncProgress {
    pub config: ClusterConfig,
}

impl SyncProgress {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// The size of a strict majority of this config.
    pub fn quorum(&self) -> usize {
        quorum_size(self.config.entries.len())
    }

    /// The highest offset acknowledged by a majority of the config's
    /// members. Members without tracked state count as offset 0.
    pub fn offset(&self, peers: &HashMap<NodeId, Peer>) -> u64 {
        let acked =
            self.config.entries.iter().map(|e| peers.get(&e.id).map_or(0, |p| p.last_received));
        quorum_value(acked.collect())
    }

    /// Whether the given nodes form a majority of this config.
    pub fn has_quorum(&self, ids: &HashSet<NodeId>) -> bool {
        self.config.member_ids().filter(|id| ids.contains(id)).count() >= self.quorum()
    }
}

/// Returns the size of a quorum (strict majority), given a total size.
fn quorum_size(size: usize) -> usize {
    size / 2 + 1
}

/// Returns the quorum (median) value of the given unsorted values, in
/// descending order. The slice cannot be empty.
fn quorum_value(mut values: Vec<u64>) -> u64 {
    assert!(!values.is_empty(), "no values provided");
    let index = quorum_size(values.len()) - 1;
    *values.select_nth_unstable_by(index, |a, b| a.cmp(b).reverse()).1
}
