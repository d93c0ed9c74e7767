use super::*;
use crate::raft::ELECTION_TIMEOUT_RANGE;

use log::{error, info};
use rand::Rng as _;

/// A follower replicates the log from a leader and votes in elections.
pub struct Follower {
    /// The leader this follower is replicating from, if known.
    pub(super) leader: Option<NodeId>,
    /// Ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The randomized election timeout.
    election_timeout: Ticks,
}

impl Follower {
    pub fn new(leader: Option<NodeId>) -> Self {
        Self {
            leader,
            leader_seen: 0,
            election_timeout: rand::thread_rng().gen_range(ELECTION_TIMEOUT_RANGE),
        }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Transforms the follower into a candidate and campaigns for
    /// leadership.
    pub(super) fn into_candidate(self) -> Result<RawNode<Candidate>> {
        let mut node = self.into_role(Candidate::new());
        node.campaign()?;
        Ok(node)
    }

    /// Processes a message.
    pub fn step(mut self, from: NodeId, envelope: Envelope) -> Result<Node> {
        match envelope.message {
            Message::Identity { entry } => {
                self.identities.insert(from, entry);
                self.send(from, Message::State { last_received: self.last_received })?;
            }
            Message::Append { prev_offset, prev_term, mutations, commit_offset } => {
                return self.appended(
                    from,
                    envelope.term,
                    prev_offset,
                    prev_term,
                    mutations,
                    commit_offset,
                );
            }
            Message::RequestVote { last_offset, last_term } => {
                self.vote_solicited(from, envelope.term, last_offset, last_term)?;
            }
            Message::State { .. } => {
                // The identity reply on one of our own downstream links.
                // Progress bookkeeping only matters if we get elected, and
                // elections reset it, so just track liveness.
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.up = true;
                }
            }
            // Not of interest to a follower.
            Message::Ack { .. } => {}
            Message::Vote => {}
        }
        Ok(self.into())
    }

    /// Processes an append from a leader. A valid append from any peer with
    /// a current or newer term establishes that peer as the leader for the
    /// term. The previous-record check drives the rewind protocol: on a
    /// conflict the in-flight tail is dropped and our position reported, and
    /// the leader retries from there.
    fn appended(
        mut self,
        from: NodeId,
        term: Term,
        prev_offset: u64,
        prev_term: Term,
        mutations: Vec<Mutation>,
        commit_offset: u64,
    ) -> Result<Node> {
        if term < self.term {
            // A deposed leader; our reply carries the current term.
            self.send(from, Message::State { last_received: self.last_received })?;
            return Ok(self.into());
        }
        if term > self.term {
            self.term = term;
            self.role = Follower::new(None);
            self.save_meta()?;
        }
        if self.role.leader != Some(from) {
            info!("Following leader {from} in term {}", self.term);
            self.role = Follower::new(Some(from));
            // Redirect connected clients to the new leader.
            if let Some(entry) = self.identities.get(&from) {
                self.effect(Effect::Redirect { leader: entry.clone() })?;
            }
        }
        self.role.leader_seen = 0;

        // The previous record must match before anything is appended.
        // Everything at or below the submitted horizon matches by
        // construction: those entries are majority-agreed (the leader said
        // so when we committed them) and are never rewound.
        if prev_offset > self.last_received {
            self.send(from, Message::State { last_received: self.last_received })?;
            return Ok(self.into());
        }
        if prev_offset > self.submitted {
            match self.term_at(prev_offset) {
                Some(t) if t == prev_term => {}
                _ => {
                    // The entry at prev_offset conflicts with the leader's
                    // log: drop it and the tail after it, and report our new
                    // position. The retry re-verifies one record further
                    // back.
                    self.drop_tail(prev_offset)?;
                    self.send(from, Message::State { last_received: self.last_received })?;
                    return Ok(self.into());
                }
            }
        } else if let Some(t) = self.term_at(prev_offset) {
            if t != prev_term {
                error!("Leader {from} disagrees with committed entry {prev_offset}");
                self.send(from, Message::State { last_received: self.last_received })?;
                return Ok(self.into());
            }
        }

        let ack = mutations.last().map(|m| m.offset);
        for mutation in mutations {
            let offset = mutation.offset;
            if offset <= self.submitted {
                continue; // a committed duplicate
            }
            if let Some(t) = self.log.term_at(offset) {
                if t == mutation.term {
                    continue; // an in-flight duplicate
                }
                self.drop_tail(offset)?;
            }
            if offset != self.last_received + 1 {
                self.send(from, Message::State { last_received: self.last_received })?;
                return Ok(self.into());
            }
            self.append(mutation)?;
        }
        Ok(self.commit_and_ack(from, ack, commit_offset)?.into())
    }

    /// Acks a record-bearing append and applies the leader's commit offset.
    /// The ack covers exactly the records the append carried, whether they
    /// were appended or absorbed as duplicates; heartbeats are never acked.
    fn commit_and_ack(mut self, from: NodeId, ack: Option<u64>, commit_offset: u64) -> Result<Self> {
        if let Some(ack) = ack {
            self.send(from, Message::Ack { last_received: ack.min(self.last_received) })?;
        }
        let target = commit_offset.min(self.last_received);
        if target > self.submitted {
            self.submit_commits(target)?;
        }
        Ok(self)
    }

    /// Processes a vote solicitation, granting at most one vote per term and
    /// refusing candidates whose log is behind ours.
    fn vote_solicited(
        &mut self,
        from: NodeId,
        term: Term,
        last_offset: u64,
        last_term: Term,
    ) -> Result<()> {
        if term < self.term {
            return Ok(());
        }
        if term > self.term {
            self.term = term;
            self.role = Follower::new(None);
            self.save_meta()?;
        }
        if self.voted_in >= self.term {
            return Ok(());
        }
        if (last_term, last_offset) < (self.last_received_term, self.last_received) {
            return Ok(());
        }
        info!("Voting for {from} in term {} election", self.term);
        self.voted_in = self.term;
        self.save_meta()?;
        self.send(from, Message::Vote)?;
        self.role.leader_seen = 0;
        Ok(())
    }

    /// Processes a logical clock tick, campaigning for leadership if the
    /// leader has been silent past the election timeout.
    pub fn tick(mut self) -> Result<Node> {
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            let candidate = self.into_candidate()?;
            if candidate.won() {
                return Ok(candidate.into_leader()?.into());
            }
            return Ok(candidate.into());
        }
        Ok(self.into())
    }
}
