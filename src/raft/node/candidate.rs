use super::*;
use crate::raft::ELECTION_TIMEOUT_RANGE;

use log::info;
use rand::Rng as _;

/// A candidate campaigns for leadership. It wins once it holds a strict
/// majority of vote grants in every active config, which during joint
/// consensus means separate majorities in the old and new configs.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<NodeId>,
    /// Ticks elapsed in this election.
    election_ticks: Ticks,
    /// The randomized timeout before starting a new election.
    election_timeout: Ticks,
}

impl Candidate {
    pub fn new() -> Self {
        Self {
            votes: HashSet::new(),
            election_ticks: 0,
            election_timeout: rand::thread_rng().gen_range(ELECTION_TIMEOUT_RANGE),
        }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Starts a new election: bumps the term, votes for ourselves, and
    /// solicits votes from all peers.
    pub(super) fn campaign(&mut self) -> Result<()> {
        self.term += 1;
        self.voted_in = self.term;
        self.role.votes = HashSet::from([self.id]);
        self.role.election_ticks = 0;
        self.save_meta()?;
        info!("Starting election for term {}", self.term);
        self.broadcast(Message::RequestVote {
            last_offset: self.last_received,
            last_term: self.last_received_term,
        })
    }

    /// Whether the votes received form a majority of every active config.
    pub(super) fn won(&self) -> bool {
        self.active().all(|progress| progress.has_quorum(&self.role.votes))
    }

    /// Transforms the candidate into the leader of its term. Replication
    /// restarts after our own log tip: followers report their actual
    /// positions, and their sync progress is re-established by fresh acks
    /// rather than trusted from a previous reign.
    pub(super) fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let mut node = self.into_role(Leader::new());
        let (id, last) = (node.id, node.last_received);
        for (peer_id, peer) in node.peers.iter_mut() {
            if *peer_id == id {
                continue;
            }
            peer.next_send = last + 1;
            peer.last_sent = last;
            peer.last_received = 0;
            peer.writable = true;
        }
        node.heartbeat()?;
        Ok(node)
    }

    /// Abandons the candidacy, reverting to follower in the given term.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression");
        if term > self.term {
            self.term = term;
        }
        let node = self.into_role(Follower::new(None));
        node.save_meta()?;
        Ok(node)
    }

    /// Processes a message.
    pub fn step(mut self, from: NodeId, envelope: Envelope) -> Result<Node> {
        if envelope.term > self.term {
            return self.into_follower(envelope.term)?.step(from, envelope);
        }
        match envelope.message {
            Message::Identity { entry } => {
                self.identities.insert(from, entry);
                self.send(from, Message::State { last_received: self.last_received })?;
            }
            Message::Append { .. } if envelope.term == self.term => {
                // A leader emerged for this term; follow it.
                let term = self.term;
                return self.into_follower(term)?.step(from, envelope);
            }
            Message::Append { .. } => {
                // A deposed leader; our reply carries the current term.
                self.send(from, Message::State { last_received: self.last_received })?;
            }
            Message::Vote if envelope.term == self.term => {
                self.role.votes.insert(from);
                if self.won() {
                    return Ok(self.into_leader()?.into());
                }
            }
            Message::Vote => {}
            // We voted for ourselves; rivals in this term get nothing.
            Message::RequestVote { .. } => {}
            Message::State { .. } => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.up = true;
                }
            }
            Message::Ack { .. } => {}
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick, restarting the election if it has
    /// gone unresolved past the timeout.
    pub fn tick(mut self) -> Result<Node> {
        self.role.election_ticks += 1;
        if self.role.election_ticks >= self.role.election_timeout {
            self.role = Candidate::new();
            self.campaign()?;
            if self.won() {
                return Ok(self.into_leader()?.into());
            }
        }
        Ok(self.into())
    }
}
