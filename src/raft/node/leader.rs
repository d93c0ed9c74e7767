use super::*;
use crate::errinput;
use crate::raft::{HEARTBEAT_INTERVAL, STEP_DOWN_TIMEOUT};

use itertools::Itertools as _;
use log::{info, warn};

/// A leader accepts client mutations and replicates them to followers.
/// Appends are sent lock-step: at most one unacked record per peer, so the
/// rewind protocol stays unambiguous.
pub struct Leader {
    /// Ticks since the last heartbeat broadcast.
    heartbeat_ticks: Ticks,
    /// Consecutive ticks without a connected majority in every active
    /// config.
    quorum_lost_ticks: Ticks,
}

impl Leader {
    pub fn new() -> Self {
        Self { heartbeat_ticks: 0, quorum_lost_ticks: 0 }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Accepts a client mutation: stamps it with the current term and the
    /// next global offset, projects its events, appends it, replicates it to
    /// ready peers, and commits it if consensus already covers it (the
    /// single-node case).
    pub fn propose(
        &mut self,
        client: ClientId,
        nonce: u64,
        topic: TopicName,
        op: Operation,
    ) -> Result<u64> {
        let offset = self.log.next_offset();
        let mutation = Mutation { term: self.term, offset, topic, client, nonce, op };
        if mutation.encode().len() > wire::MAX_FRAME {
            return errinput!("mutation does not fit a {} byte frame", wire::MAX_FRAME);
        }
        self.append(mutation)?;
        for id in self.peers.keys().copied().filter(|id| *id != self.id).sorted() {
            self.replicate(id)?;
        }
        self.maybe_commit()?;
        Ok(offset)
    }

    /// Sends the next record to a peer if it is ready for one. Records no
    /// longer in memory are fetched from the log store first.
    fn replicate(&mut self, id: NodeId) -> Result<()> {
        let Some(peer) = self.peers.get(&id) else { return Ok(()) };
        if !peer.ready() || peer.next_send >= self.log.next_offset() {
            return Ok(());
        }
        let next = peer.next_send;
        let Some(entry) = self.log.get(next) else {
            // Evicted by commit; the send resumes when the fetch completes.
            return self.request_fetch(next);
        };
        let prev_term = self.term_at(next - 1).expect("prev term in memory");
        let message = Message::Append {
            prev_offset: next - 1,
            prev_term,
            mutations: vec![entry.mutation.clone()],
            commit_offset: self.commit_offset,
        };
        self.send(id, message)?;
        let peer = self.peers.get_mut(&id).expect("peer exists");
        peer.last_sent = next;
        peer.writable = false;
        Ok(())
    }

    /// Sends a fetched record to every peer waiting on it.
    pub(super) fn send_fetched(&mut self, mutation: &Mutation, prev_term: Term) -> Result<()> {
        let waiting: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(id, p)| **id != self.id && p.ready() && p.next_send == mutation.offset)
            .map(|(id, _)| *id)
            .sorted()
            .collect();
        for id in waiting {
            let message = Message::Append {
                prev_offset: mutation.offset - 1,
                prev_term,
                mutations: vec![mutation.clone()],
                commit_offset: self.commit_offset,
            };
            self.send(id, message)?;
            let peer = self.peers.get_mut(&id).expect("peer exists");
            peer.last_sent = mutation.offset;
            peer.writable = false;
        }
        Ok(())
    }

    /// Commits all entries covered by cluster consensus, with the leader
    /// completeness guard: we can only safely commit up to an entry from our
    /// own term, see figure 8 in the Raft paper for background. Once such an
    /// entry is covered, the entire prefix commits with it.
    pub(super) fn maybe_commit(&mut self) -> Result<()> {
        let consensus = self.consensus_offset();
        if consensus <= self.submitted {
            return Ok(());
        }
        match self.term_at(consensus) {
            Some(term) if term == self.term => self.submit_commits(consensus),
            _ => Ok(()),
        }
    }

    /// Broadcasts a heartbeat: an empty append carrying our log tip and
    /// commit offset.
    pub(super) fn heartbeat(&self) -> Result<()> {
        self.broadcast(Message::Append {
            prev_offset: self.last_received,
            prev_term: self.last_received_term,
            mutations: Vec::new(),
            commit_offset: self.commit_offset,
        })
    }

    /// Steps down to follower in the given term.
    fn into_follower(mut self, term: Term, leader: Option<NodeId>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression");
        if term > self.term {
            info!("Discovered new term {term}, stepping down");
            self.term = term;
        }
        let node = self.into_role(Follower::new(leader));
        node.save_meta()?;
        Ok(node)
    }

    /// Processes a message.
    pub fn step(mut self, from: NodeId, envelope: Envelope) -> Result<Node> {
        if envelope.term > self.term {
            return self.into_follower(envelope.term, None)?.step(from, envelope);
        }
        match envelope.message {
            Message::Identity { entry } => {
                self.identities.insert(from, entry);
                self.send(from, Message::State { last_received: self.last_received })?;
            }
            Message::State { last_received } => self.state_reported(from, last_received)?,
            Message::Ack { last_received } => self.acked(from, last_received)?,
            Message::Append { .. } if envelope.term == self.term => {
                // A rival leader in our own term, e.g. a standalone node
                // being absorbed into a cluster. Yield to it.
                warn!("Yielding to a leader append in term {}", self.term);
                let term = self.term;
                return self.into_follower(term, None)?.step(from, envelope);
            }
            Message::Append { .. } => {
                // A deposed leader; our reply carries the current term.
                self.send(from, Message::State { last_received: self.last_received })?;
            }
            // Stale elections are of no concern to an established leader.
            Message::RequestVote { .. } => {}
            Message::Vote => {}
        }
        Ok(self.into())
    }

    /// Handles a peer's replication state report: the reply to our identity
    /// on a fresh connection, or a nack after a conflicting append. On a
    /// fresh connection replication resumes after the peer's log; on a nack
    /// it rewinds to the reported offset so the conflict check walks back
    /// one record at a time. Sync progress only ever advances on acks.
    fn state_reported(&mut self, from: NodeId, reported: u64) -> Result<()> {
        let Some(peer) = self.peers.get_mut(&from) else { return Ok(()) };
        let was_up = peer.up;
        peer.up = true;
        peer.writable = true;
        peer.next_send = if was_up { reported.max(1) } else { reported + 1 };
        peer.last_sent = peer.next_send - 1;
        self.replicate(from)
    }

    /// Handles a record acknowledgement, advancing the peer's sync progress
    /// and committing anything that now has consensus.
    fn acked(&mut self, from: NodeId, acked: u64) -> Result<()> {
        let Some(peer) = self.peers.get_mut(&from) else { return Ok(()) };
        peer.up = true;
        if acked >= peer.last_sent {
            peer.last_received = acked;
            peer.last_sent = acked;
            peer.next_send = acked + 1;
            peer.writable = true;
        }
        self.replicate(from)?;
        self.maybe_commit()
    }

    /// Processes a logical clock tick: periodic heartbeats, and stepping
    /// down if a majority of some active config has been unreachable for
    /// too long.
    pub fn tick(mut self) -> Result<Node> {
        self.role.heartbeat_ticks += 1;
        if self.role.heartbeat_ticks >= HEARTBEAT_INTERVAL {
            self.role.heartbeat_ticks = 0;
            self.heartbeat()?;
        }

        let up: HashSet<NodeId> =
            self.peers.iter().filter(|(_, p)| p.up).map(|(id, _)| *id).collect();
        if self.active().all(|progress| progress.has_quorum(&up)) {
            self.role.quorum_lost_ticks = 0;
        } else {
            self.role.quorum_lost_ticks += 1;
            if self.role.quorum_lost_ticks >= STEP_DOWN_TIMEOUT {
                info!("Lost contact with a cluster majority, stepping down");
                let term = self.term;
                return Ok(self.into_follower(term, None)?.into());
            }
        }
        Ok(self.into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::*;
    use crate::types::Change;
    use pretty_assertions::assert_eq;

    fn append_effect(to: u128, prev_offset: u64, prev_term: Term, m: &Mutation, commit: u64) -> Effect {
        Effect::Send(
            node_id(to),
            Envelope {
                term: 2,
                message: Message::Append {
                    prev_offset,
                    prev_term,
                    mutations: vec![m.clone()],
                    commit_offset: commit,
                },
            },
        )
    }

    #[test]
    fn propose_replicates_to_ready_peers() -> Result<()> {
        let (mut leader, rx) = setup_leader();
        let m = put(2, 1, 7);
        let offset =
            leader.propose(m.client, m.nonce, m.topic.clone(), m.op.clone())?;
        assert_eq!(offset, 1);
        assert_eq!(leader.last_received, 1);
        assert_effects(&rx, vec![append_effect(2, 0, 0, &m, 0), append_effect(3, 0, 0, &m, 0)]);

        // The lock-step discipline blocks a second send until the first is
        // acked.
        let m2 = put(2, 2, 8);
        leader.propose(m2.client, m2.nonce, m2.topic.clone(), m2.op.clone())?;
        assert_effects(&rx, vec![]);
        Ok(())
    }

    #[test]
    fn quorum_ack_commits() -> Result<()> {
        let (mut leader, rx) = setup_leader();
        let m = put(2, 1, 7);
        leader.propose(m.client, m.nonce, m.topic.clone(), m.op.clone())?;
        drain_effects(&rx);

        // The first follower ack forms a majority with our own append: the
        // entry is submitted for commit, and the follower is sent nothing
        // further since there is no next record.
        let mut node: Node = leader.into();
        node = node.step(node_id(2), Envelope { term: 2, message: Message::Ack { last_received: 1 } })?;
        let event = Event {
            term: 2,
            offset: 1,
            local_offset: 1,
            topic: m.topic.clone(),
            client: m.client,
            nonce: m.nonce,
            change: Change::KeyPut { key: b"k".to_vec(), value: vec![7] },
        };
        assert_effects(
            &rx,
            vec![Effect::CommitLog { mutation: m.clone(), events: vec![event] }],
        );

        // A duplicate ack does not resubmit.
        node = node.step(node_id(2), Envelope { term: 2, message: Message::Ack { last_received: 1 } })?;
        assert_effects(&rx, vec![]);

        assert!(node.is_leader());
        assert_eq!(node.commit_offset(), 0); // not yet confirmed by the log store
        Ok(())
    }

    #[test]
    fn leader_completeness_guard() -> Result<()> {
        // A new leader must not commit entries from a prior term until an
        // entry from its own term is covered by consensus; then the entire
        // prefix commits together.
        let (mut leader, rx) = setup_leader();
        leader.append(put(1, 1, 1))?; // from a prior term
        leader.peers.get_mut(&node_id(2)).unwrap().next_send = 2;
        leader.peers.get_mut(&node_id(3)).unwrap().next_send = 2;
        drain_effects(&rx);

        let mut node: Node = leader.into();
        node = node.step(node_id(2), Envelope { term: 2, message: Message::Ack { last_received: 1 } })?;
        // Consensus covers offset 1, but its term is stale: nothing commits.
        assert_effects(&rx, vec![]);

        // A mutation in the current term unblocks the entire prefix once
        // acked.
        let m2 = put(2, 2, 2);
        node.propose(m2.client, m2.nonce, m2.topic.clone(), m2.op.clone())?;
        drain_effects(&rx);
        node = node.step(node_id(2), Envelope { term: 2, message: Message::Ack { last_received: 2 } })?;

        let commits: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                Effect::CommitLog { mutation, .. } => Some(mutation.offset),
                _ => None,
            })
            .collect();
        assert_eq!(commits, vec![1, 2]);
        assert!(node.is_leader());
        Ok(())
    }

    #[test]
    fn state_report_resumes_and_rewinds() -> Result<()> {
        let (mut leader, rx) = setup_leader();
        for offset in 1..=3 {
            leader.append(put(2, offset, offset as u8))?;
        }
        // A fresh peer reports its position after the identity exchange:
        // replication resumes after its log.
        let peer = leader.peers.get_mut(&node_id(2)).unwrap();
        peer.up = false;
        peer.writable = false;
        let mut node: Node = leader.into();
        node = node.step(node_id(2), Envelope { term: 1, message: Message::State { last_received: 1 } })?;
        assert_effects(&rx, vec![append_effect(2, 1, 2, &put(2, 2, 2), 0)]);

        // A nack from a connected peer rewinds to the reported offset
        // itself, re-verifying the record there.
        node = node.step(node_id(2), Envelope { term: 2, message: Message::State { last_received: 1 } })?;
        assert_effects(&rx, vec![append_effect(2, 0, 0, &put(2, 1, 1), 0)]);
        Ok(())
    }

    #[test]
    fn higher_term_steps_down() -> Result<()> {
        let (leader, rx) = setup_leader();
        let node = Node::from(leader).step(
            node_id(2),
            Envelope { term: 3, message: Message::Ack { last_received: 0 } },
        )?;
        assert!(!node.is_leader());
        assert_eq!(node.term(), 3);
        assert_effects(&rx, vec![Effect::SaveMeta { term: 3, voted_in: 0 }]);
        Ok(())
    }

    #[test]
    fn tick_heartbeats() -> Result<()> {
        let (leader, rx) = setup_leader();
        let mut node: Node = leader.into();
        for _ in 0..HEARTBEAT_INTERVAL {
            assert_effects(&rx, vec![]);
            node = node.tick()?;
        }
        let heartbeat = Message::Append {
            prev_offset: 0,
            prev_term: 0,
            mutations: Vec::new(),
            commit_offset: 0,
        };
        assert_effects(
            &rx,
            vec![
                Effect::Send(node_id(2), Envelope { term: 2, message: heartbeat.clone() }),
                Effect::Send(node_id(3), Envelope { term: 2, message: heartbeat }),
            ],
        );
        Ok(())
    }

    #[test]
    fn steps_down_without_quorum() -> Result<()> {
        let (mut leader, rx) = setup_leader();
        leader.peers.get_mut(&node_id(2)).unwrap().up = false;
        leader.peers.get_mut(&node_id(3)).unwrap().up = false;
        let mut node: Node = leader.into();
        for _ in 0..STEP_DOWN_TIMEOUT {
            assert!(node.is_leader());
            node = node.tick()?;
        }
        assert!(!node.is_leader());
        drain_effects(&rx);
        Ok(())
    }
}
