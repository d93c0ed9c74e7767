mod candidate;
mod follower;
mod leader;

use super::message::{Envelope, Message};
use super::progress::{Peer, SyncProgress};
use super::projection::{Runtime, Topics};
use super::{InFlight, InFlightEntry, Ticks};
use crate::encoding::wire;
use crate::error::{Error, Result};
use crate::types::{
    ClientId, ClusterConfig, ConfigEntry, Event, Mutation, NodeId, Operation, Term, TopicName,
};
use candidate::Candidate;
use follower::Follower;
use leader::Leader;

use itertools::Itertools as _;
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A command the core issues to a collaborator. Effects are fire-and-forget:
/// the core never blocks on them, and their completions come back as new
/// commands on the queue.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Send a protocol message to a peer.
    Send(NodeId, Envelope),
    /// Open a downstream connection to a cluster member.
    Connect(ConfigEntry),
    /// Tear down connections to a node no longer in any active config.
    Disconnect(NodeId),
    /// Persist a mutation and its event batch. The batch must land
    /// atomically, before the mutation, and completions must be reported in
    /// submission order.
    CommitLog { mutation: Mutation, events: Vec<Event> },
    /// Fetch a committed mutation from the log store.
    FetchLog { offset: u64 },
    /// Persist the node metadata.
    SaveMeta { term: Term, voted_in: Term },
    /// A mutation committed; ack the owning client if connected.
    Committed { mutation: Mutation, error: bool },
    /// Events committed; stream them to listeners.
    EventsCommitted { events: Vec<Event> },
    /// A config change committed; broadcast it to clients and listeners.
    ConfigCommitted { config: ClusterConfig },
    /// The node is following the given leader; redirect clients to it.
    Redirect { leader: ConfigEntry },
}

/// State recovered from the log store at startup.
#[derive(Debug, Default)]
pub struct Restore {
    /// The last committed term.
    pub term: Term,
    /// The last term this node granted a vote in.
    pub voted_in: Term,
    /// The offset of the last committed mutation.
    pub last_offset: u64,
    /// The term of that mutation.
    pub last_term: Term,
    /// The committed per-topic projection state.
    pub topics: Topics,
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A cluster node with a dynamic role. The node is driven synchronously by
/// the main worker: messages are processed via step(), time advances via
/// tick(), and collaborator completions arrive through the remaining
/// methods. step() and tick() consume the node and return one with a
/// possibly different role.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new node. A node whose config contains only itself becomes
    /// the leader of its single-node cluster immediately; otherwise it
    /// starts as a leaderless follower and waits out an election timeout.
    pub fn new(
        entry: ConfigEntry,
        config: ClusterConfig,
        restore: Restore,
        runtime: Box<dyn Runtime>,
        tx: crossbeam::channel::Sender<Effect>,
    ) -> Result<Self> {
        let id = entry.id;
        let mut peers = HashMap::new();
        peers.insert(id, Peer::local());
        let mut node = RawNode {
            id,
            entry,
            term: restore.term,
            voted_in: restore.voted_in,
            log: InFlight::new(restore.last_offset + 1),
            last_received: restore.last_offset,
            last_received_term: restore.last_term,
            commit_offset: restore.last_offset,
            committed_term: restore.last_term,
            submitted: restore.last_offset,
            committed: restore.topics.clone(),
            projected: restore.topics,
            config: SyncProgress::new(config.clone()),
            pending: BTreeMap::new(),
            peers,
            identities: HashMap::new(),
            fetching: HashSet::new(),
            runtime,
            tx,
            role: Follower::new(None),
        };
        node.peers.get_mut(&id).expect("local peer").last_received = restore.last_offset;
        for peer in config.entries.iter().filter(|e| e.id != id) {
            node.peers.insert(peer.id, Peer::new());
            node.effect(Effect::Connect(peer.clone()))?;
        }
        if node.peers.len() == 1 {
            // If we are the only member, win the election immediately.
            let candidate = node.into_candidate()?;
            assert!(candidate.won(), "single-node election must succeed");
            return Ok(candidate.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeId {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Node::Leader(_))
    }

    /// The known leader's config entry, for client redirects.
    pub fn leader(&self) -> Option<&ConfigEntry> {
        match self {
            Node::Follower(n) => {
                n.role.leader.as_ref().and_then(|leader| n.identities.get(leader))
            }
            Node::Candidate(_) | Node::Leader(_) => None,
        }
    }

    /// The offset of the last committed mutation.
    pub fn commit_offset(&self) -> u64 {
        match self {
            Node::Candidate(n) => n.commit_offset,
            Node::Follower(n) => n.commit_offset,
            Node::Leader(n) => n.commit_offset,
        }
    }

    /// The offset of the last appended mutation.
    pub fn last_received(&self) -> u64 {
        match self {
            Node::Candidate(n) => n.last_received,
            Node::Follower(n) => n.last_received,
            Node::Leader(n) => n.last_received,
        }
    }

    /// The current active config.
    pub fn config(&self) -> &ClusterConfig {
        match self {
            Node::Candidate(n) => &n.config.config,
            Node::Follower(n) => &n.config.config,
            Node::Leader(n) => &n.config.config,
        }
    }

    /// The last committed local offset of a topic.
    pub fn last_local(&self, topic: &TopicName) -> u64 {
        match self {
            Node::Candidate(n) => n.committed.last_local(topic),
            Node::Follower(n) => n.committed.last_local(topic),
            Node::Leader(n) => n.committed.last_local(topic),
        }
    }

    /// Returns an uncommitted buffered mutation by offset, used by client
    /// reconnect replay. Committed mutations must be fetched from the log
    /// store instead.
    pub fn get_buffered(&self, offset: u64) -> Option<&Mutation> {
        let log = match self {
            Node::Candidate(n) => &n.log,
            Node::Follower(n) => &n.log,
            Node::Leader(n) => &n.log,
        };
        log.get(offset).map(|e| &e.mutation)
    }

    /// Requests an asynchronous fetch of a committed mutation. The first
    /// requester issues the fetch; later requesters for the same offset
    /// attach to the pending one.
    pub fn request_fetch(&mut self, offset: u64) -> Result<()> {
        match self {
            Node::Candidate(n) => n.request_fetch(offset),
            Node::Follower(n) => n.request_fetch(offset),
            Node::Leader(n) => n.request_fetch(offset),
        }
    }

    /// Accepts a client mutation, assigning it the next global offset.
    /// Returns Error::Abort if this node is not the leader.
    pub fn propose(
        &mut self,
        client: ClientId,
        nonce: u64,
        topic: TopicName,
        op: Operation,
    ) -> Result<u64> {
        match self {
            Node::Leader(n) => n.propose(client, nonce, topic, op),
            Node::Candidate(_) | Node::Follower(_) => Err(Error::Abort),
        }
    }

    /// Processes a message from a peer.
    pub fn step(self, from: NodeId, envelope: Envelope) -> Result<Self> {
        debug!("Stepping {envelope:?} from {from}");
        match self {
            Node::Candidate(n) => n.step(from, envelope),
            Node::Follower(n) => n.step(from, envelope),
            Node::Leader(n) => n.step(from, envelope),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }

    /// Records the loss of a downstream connection. The peer's sync progress
    /// is retained; reconnection resumes from the identity exchange.
    pub fn disconnected(&mut self, id: NodeId) {
        let peers = match self {
            Node::Candidate(n) => &mut n.peers,
            Node::Follower(n) => &mut n.peers,
            Node::Leader(n) => &mut n.peers,
        };
        if let Some(peer) = peers.get_mut(&id) {
            peer.up = false;
            peer.writable = false;
        }
    }

    /// Processes a commit completion from the log store. Completions arrive
    /// strictly in submission order.
    pub fn committed(&mut self, mutation: Mutation) -> Result<()> {
        match self {
            Node::Candidate(n) => n.commit_applied(mutation),
            Node::Follower(n) => n.commit_applied(mutation),
            Node::Leader(n) => {
                n.commit_applied(mutation)?;
                // A committed config change shrinks the active progress set,
                // which may unblock further commits.
                n.maybe_commit()
            }
        }
    }

    /// Processes a fetch completion from the log store.
    pub fn fetched(&mut self, mutation: &Mutation, prev_term: Term) -> Result<()> {
        match self {
            Node::Candidate(n) => {
                n.fetching.remove(&mutation.offset);
                Ok(())
            }
            Node::Follower(n) => {
                n.fetching.remove(&mutation.offset);
                Ok(())
            }
            Node::Leader(n) => {
                n.fetching.remove(&mutation.offset);
                n.send_fetched(mutation, prev_term)
            }
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A cluster node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>. See:
/// http://cliffle.com/blog/rust-typestate/
pub struct RawNode<R: Role = Follower> {
    id: NodeId,
    entry: ConfigEntry,
    term: Term,
    /// The last term this node granted a vote in (one vote per term).
    voted_in: Term,
    /// The uncommitted tail of the global log.
    log: InFlight,
    /// The offset and term of the last appended mutation.
    last_received: u64,
    last_received_term: Term,
    /// The offset and term of the last committed mutation.
    commit_offset: u64,
    committed_term: Term,
    /// The highest offset submitted to the log store.
    submitted: u64,
    /// Per-topic projection state as of the last commit.
    committed: Topics,
    /// Speculative projection state as of the last appended mutation.
    projected: Topics,
    /// Sync progress of the current active config.
    config: SyncProgress,
    /// Sync progress of each uncommitted config change, by offset. While
    /// non-empty the node is in joint consensus: the commitable offset is
    /// the minimum across all active configs.
    pending: BTreeMap<u64, SyncProgress>,
    /// The union of downstream peers across all active configs, including
    /// the local node as a degenerate always-connected peer.
    peers: HashMap<NodeId, Peer>,
    /// Config entries learned from Identity exchanges.
    identities: HashMap<NodeId, ConfigEntry>,
    /// Offsets with a log-store fetch outstanding.
    fetching: HashSet<u64>,
    runtime: Box<dyn Runtime>,
    tx: crossbeam::channel::Sender<Effect>,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            entry: self.entry,
            term: self.term,
            voted_in: self.voted_in,
            log: self.log,
            last_received: self.last_received,
            last_received_term: self.last_received_term,
            commit_offset: self.commit_offset,
            committed_term: self.committed_term,
            submitted: self.submitted,
            committed: self.committed,
            projected: self.projected,
            config: self.config,
            pending: self.pending,
            peers: self.peers,
            identities: self.identities,
            fetching: self.fetching,
            runtime: self.runtime,
            tx: self.tx,
            role,
        }
    }

    /// Issues an effect to a collaborator.
    fn effect(&self, effect: Effect) -> Result<()> {
        Ok(self.tx.send(effect)?)
    }

    /// Sends a message to a peer, stamped with the current term.
    fn send(&self, to: NodeId, message: Message) -> Result<()> {
        debug!("Sending {message:?} to {to}");
        self.effect(Effect::Send(to, Envelope { term: self.term, message }))
    }

    /// Broadcasts a message to all downstream peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for id in self.peers.keys().copied().filter(|id| *id != self.id).sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Persists the term and vote metadata.
    fn save_meta(&self) -> Result<()> {
        self.effect(Effect::SaveMeta { term: self.term, voted_in: self.voted_in })
    }

    /// The sync progresses of all active configs.
    fn active(&self) -> impl Iterator<Item = &SyncProgress> {
        std::iter::once(&self.config).chain(self.pending.values())
    }

    /// The highest offset replicated to a majority of every active config.
    fn consensus_offset(&self) -> u64 {
        let offset = self.active().map(|p| p.offset(&self.peers)).min().unwrap_or(0);
        offset.min(self.last_received)
    }

    /// The term of the mutation at the given offset, if known. Offsets below
    /// the last committed one are no longer in memory.
    fn term_at(&self, offset: u64) -> Option<Term> {
        if offset == 0 {
            return Some(0);
        }
        if offset == self.commit_offset {
            return Some(self.committed_term);
        }
        self.log.term_at(offset)
    }

    /// Appends a mutation to the in-flight log, projecting its event batch.
    /// Config changes project no events; they enter joint consensus and
    /// kick off connections to any new members instead.
    fn append(&mut self, mutation: Mutation) -> Result<()> {
        let (events, error) = match &mutation.op {
            Operation::UpdateConfig(config) => {
                let new_entries: Vec<_> = config
                    .entries
                    .iter()
                    .filter(|e| !self.peers.contains_key(&e.id))
                    .cloned()
                    .collect();
                for entry in new_entries {
                    self.peers.insert(entry.id, Peer::new());
                    self.effect(Effect::Connect(entry.clone()))?;
                }
                self.pending.insert(mutation.offset, SyncProgress::new(config.clone()));
                (Vec::new(), false)
            }
            _ => self.projected.project(&mutation, self.runtime.as_ref()),
        };
        self.last_received = mutation.offset;
        self.last_received_term = mutation.term;
        let id = self.id;
        self.peers.get_mut(&id).expect("local peer").last_received = mutation.offset;
        self.log.append(InFlightEntry { mutation, events, error });
        Ok(())
    }

    /// Submits all unsubmitted entries up to the target offset to the log
    /// store, in ascending order.
    fn submit_commits(&mut self, target: u64) -> Result<()> {
        let target = target.min(self.last_received);
        while self.submitted < target {
            let offset = self.submitted + 1;
            let entry = self.log.get(offset).expect("unsubmitted entry in flight").clone();
            debug!("Committing {:?}", entry.mutation);
            self.effect(Effect::CommitLog { mutation: entry.mutation, events: entry.events })?;
            self.submitted = offset;
        }
        Ok(())
    }

    /// Handles a commit completion: pops the entry, applies its events to
    /// the committed projection state, installs committed config changes,
    /// and notifies the client gateway.
    fn commit_applied(&mut self, mutation: Mutation) -> Result<()> {
        assert_eq!(mutation.offset, self.commit_offset + 1, "commits reordered");
        let entry = self.log.pop_committed().expect("committed entry in flight");
        assert_eq!(entry.mutation, mutation, "committed entry mismatch");
        self.commit_offset = mutation.offset;
        self.committed_term = mutation.term;
        self.committed.apply(&entry.events);

        let InFlightEntry { mutation, events, error } = entry;
        let config = match &mutation.op {
            Operation::UpdateConfig(config) => Some(config.clone()),
            _ => None,
        };
        self.effect(Effect::Committed { mutation, error })?;
        if !events.is_empty() {
            self.effect(Effect::EventsCommitted { events })?;
        }
        if let Some(config) = config {
            // The change leaves joint consensus and becomes the active
            // config; peers no longer in any active config are dropped.
            self.pending.remove(&self.commit_offset);
            self.config = SyncProgress::new(config.clone());
            self.rebuild_union()?;
            self.effect(Effect::ConfigCommitted { config })?;
        }
        Ok(())
    }

    /// Rebuilds the downstream peer union from the active configs,
    /// connecting new members and dropping unreferenced ones. Existing
    /// peers keep their sync progress.
    fn rebuild_union(&mut self) -> Result<()> {
        let mut wanted: HashMap<NodeId, ConfigEntry> = HashMap::new();
        wanted.insert(self.id, self.entry.clone());
        for progress in std::iter::once(&self.config).chain(self.pending.values()) {
            for entry in &progress.config.entries {
                wanted.entry(entry.id).or_insert_with(|| entry.clone());
            }
        }
        let stale: Vec<NodeId> =
            self.peers.keys().copied().filter(|id| !wanted.contains_key(id)).sorted().collect();
        for id in stale {
            self.peers.remove(&id);
            self.effect(Effect::Disconnect(id))?;
        }
        for (id, entry) in wanted {
            if !self.peers.contains_key(&id) {
                self.peers.insert(id, Peer::new());
                self.effect(Effect::Connect(entry))?;
            }
        }
        Ok(())
    }

    /// Drops the uncommitted tail from the given offset on, unwinding any
    /// pending config changes it contained and rebuilding the speculative
    /// projection state from the committed one. Committed entries are never
    /// dropped.
    fn drop_tail(&mut self, offset: u64) -> Result<()> {
        assert!(offset > self.submitted, "cannot drop entries handed to the log store");
        let dropped = self.log.drop_tail_from(offset);
        if dropped.is_empty() {
            return Ok(());
        }
        for entry in &dropped {
            if matches!(entry.mutation.op, Operation::UpdateConfig(_)) {
                self.pending.remove(&entry.mutation.offset);
            }
        }
        self.last_received = offset - 1;
        self.last_received_term = self.term_at(offset - 1).expect("tail dropped below commit");
        let id = self.id;
        self.peers.get_mut(&id).expect("local peer").last_received = self.last_received;
        self.rebuild_union()?;

        let mut projected = self.committed.clone();
        for entry in self.log.iter() {
            projected.apply(&entry.events);
        }
        self.projected = projected;
        Ok(())
    }

    /// See Node::request_fetch().
    fn request_fetch(&mut self, offset: u64) -> Result<()> {
        assert!(offset <= self.commit_offset, "fetching an uncommitted offset");
        if self.fetching.insert(offset) {
            self.effect(Effect::FetchLog { offset })?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::super::projection::RawRuntime;
    use super::super::ELECTION_TIMEOUT_RANGE;
    use super::*;
    use crate::types::Change;
    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    /// Asserts that the given effects (and no others) were emitted.
    #[track_caller]
    pub fn assert_effects(rx: &Receiver<Effect>, effects: Vec<Effect>) {
        let mut actual = Vec::new();
        while let Ok(effect) = rx.try_recv() {
            actual.push(effect)
        }
        assert_eq!(effects, actual);
    }

    /// Drains and discards any emitted effects.
    pub fn drain_effects(rx: &Receiver<Effect>) {
        while rx.try_recv().is_ok() {}
    }

    pub fn node_id(n: u128) -> NodeId {
        Uuid::from_u128(n)
    }

    pub fn entry(n: u128) -> ConfigEntry {
        ConfigEntry {
            id: node_id(n),
            cluster_addr: format!("127.0.0.1:{}", 9700 + n).parse().unwrap(),
            client_addr: format!("127.0.0.1:{}", 9600 + n).parse().unwrap(),
        }
    }

    pub fn config(ids: &[u128]) -> ClusterConfig {
        ClusterConfig::new(ids.iter().map(|n| entry(*n)).collect()).unwrap()
    }

    pub fn put(term: Term, offset: u64, value: u8) -> Mutation {
        Mutation {
            term,
            offset,
            topic: TopicName::new("t").unwrap(),
            client: Uuid::from_u128(0xc1),
            nonce: offset,
            op: Operation::Put { key: b"k".to_vec(), value: vec![value] },
        }
    }

    /// A follower of node 1's three-node cluster, with peers 2 (the leader)
    /// and 3.
    pub fn setup_follower() -> (RawNode<Follower>, Receiver<Effect>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let cluster = config(&[1, 2, 3]);
        let mut peers = HashMap::new();
        peers.insert(node_id(1), Peer::local());
        peers.insert(node_id(2), Peer::new());
        peers.insert(node_id(3), Peer::new());
        let mut identities = HashMap::new();
        identities.insert(node_id(2), entry(2));
        identities.insert(node_id(3), entry(3));
        let node = RawNode {
            id: node_id(1),
            entry: entry(1),
            term: 1,
            voted_in: 0,
            log: InFlight::new(1),
            last_received: 0,
            last_received_term: 0,
            commit_offset: 0,
            committed_term: 0,
            submitted: 0,
            committed: Topics::new(),
            projected: Topics::new(),
            config: SyncProgress::new(cluster),
            pending: BTreeMap::new(),
            peers,
            identities,
            fetching: HashSet::new(),
            runtime: Box::new(RawRuntime),
            tx,
            role: Follower::new(Some(node_id(2))),
        };
        (node, rx)
    }

    /// A leader of a three-node cluster with connected followers 2 and 3.
    pub fn setup_leader() -> (RawNode<Leader>, Receiver<Effect>) {
        let (node, rx) = setup_follower();
        let mut node = node.into_role(Leader::new());
        node.term = 2;
        for id in [node_id(2), node_id(3)] {
            let peer = node.peers.get_mut(&id).unwrap();
            peer.up = true;
            peer.writable = true;
            peer.next_send = 1;
            peer.last_sent = 0;
        }
        (node, rx)
    }

    #[test]
    fn new_single_node_becomes_leader() -> Result<()> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let node = Node::new(
            entry(1),
            config(&[1]),
            Restore::default(),
            Box::new(RawRuntime),
            tx,
        )?;
        assert!(node.is_leader());
        assert_eq!(node.term(), 1);
        // The vote is persisted; the bootstrap heartbeat has no recipients.
        assert_effects(&rx, vec![Effect::SaveMeta { term: 1, voted_in: 1 }]);
        Ok(())
    }

    #[test]
    fn new_multi_node_starts_follower() -> Result<()> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let node = Node::new(
            entry(1),
            config(&[1, 2, 3]),
            Restore::default(),
            Box::new(RawRuntime),
            tx,
        )?;
        assert!(!node.is_leader());
        assert_eq!(node.term(), 0);
        assert_effects(&rx, vec![Effect::Connect(entry(2)), Effect::Connect(entry(3))]);
        Ok(())
    }

    #[test]
    fn single_node_put_commits_immediately() -> Result<()> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut node = Node::new(
            entry(1),
            config(&[1]),
            Restore::default(),
            Box::new(RawRuntime),
            tx,
        )?;
        drain_effects(&rx);

        let client = Uuid::from_u128(0xc1);
        let topic = TopicName::new("t")?;
        let offset = node.propose(
            client,
            1,
            topic.clone(),
            Operation::Put { key: Vec::new(), value: vec![1] },
        )?;
        assert_eq!(offset, 1);

        // A single-node cluster reaches consensus on its own append.
        let mutation = Mutation {
            term: 1,
            offset: 1,
            topic: topic.clone(),
            client,
            nonce: 1,
            op: Operation::Put { key: Vec::new(), value: vec![1] },
        };
        let event = Event {
            term: 1,
            offset: 1,
            local_offset: 1,
            topic: topic.clone(),
            client,
            nonce: 1,
            change: Change::KeyPut { key: Vec::new(), value: vec![1] },
        };
        assert_effects(
            &rx,
            vec![Effect::CommitLog { mutation: mutation.clone(), events: vec![event.clone()] }],
        );

        // The commit completion acks the client and streams the event.
        node.committed(mutation.clone())?;
        assert_eq!(node.commit_offset(), 1);
        assert_eq!(node.last_local(&topic), 1);
        assert_effects(
            &rx,
            vec![
                Effect::Committed { mutation, error: false },
                Effect::EventsCommitted { events: vec![event] },
            ],
        );
        Ok(())
    }

    #[test]
    fn config_growth_commits_after_new_member_ack() -> Result<()> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut node =
            Node::new(entry(1), config(&[1]), Restore::default(), Box::new(RawRuntime), tx)?;
        drain_effects(&rx);

        // Growing the cluster to {1, 2} opens a connection to 2 and enters
        // joint consensus: our own append alone can no longer commit.
        let client = Uuid::from_u128(0xc1);
        node.propose(
            client,
            1,
            TopicName::synthetic(),
            Operation::UpdateConfig(config(&[1, 2])),
        )?;
        let effects: Vec<Effect> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(effects.contains(&Effect::Connect(entry(2))));
        assert!(!effects.iter().any(|e| matches!(e, Effect::CommitLog { .. })));

        // Node 2 reports in after the identity exchange and is sent the
        // pending record.
        node = node.step(
            node_id(2),
            Envelope { term: 1, message: Message::State { last_received: 0 } },
        )?;
        let effects: Vec<Effect> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send(to, Envelope { message: Message::Append { mutations, .. }, .. })
                if *to == node_id(2) && mutations.len() == 1
        )));

        // Its ack completes the new config's majority and the change
        // commits and becomes active.
        node = node.step(
            node_id(2),
            Envelope { term: 1, message: Message::Ack { last_received: 1 } },
        )?;
        let committed = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                Effect::CommitLog { mutation, .. } => Some(mutation),
                _ => None,
            })
            .expect("commit submitted");
        node.committed(committed)?;
        assert_eq!(node.config(), &config(&[1, 2]));
        let effects: Vec<Effect> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(effects.contains(&Effect::ConfigCommitted { config: config(&[1, 2]) }));
        Ok(())
    }

    #[test]
    fn config_shrink_disconnects_old_peer() -> Result<()> {
        let (mut leader, rx) = setup_leader();
        let client = Uuid::from_u128(0xc1);
        leader.propose(
            client,
            1,
            TopicName::synthetic(),
            Operation::UpdateConfig(config(&[1, 2])),
        )?;
        drain_effects(&rx);

        let mut node: Node = leader.into();
        node = node.step(
            node_id(2),
            Envelope { term: 2, message: Message::Ack { last_received: 1 } },
        )?;
        let committed = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                Effect::CommitLog { mutation, .. } => Some(mutation),
                _ => None,
            })
            .expect("commit submitted");

        // Once the shrunk config commits, the dropped member's connection
        // is torn down.
        node.committed(committed)?;
        assert_eq!(node.config(), &config(&[1, 2]));
        let effects: Vec<Effect> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(effects.contains(&Effect::Disconnect(node_id(3))));
        Ok(())
    }

    #[test]
    fn election_timeout_is_randomized() {
        for _ in 0..100 {
            let timeout = super::follower::tests::random_timeout();
            assert!(ELECTION_TIMEOUT_RANGE.contains(&timeout));
        }
    }
}
