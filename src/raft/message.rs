use crate::encoding::wire::{self, Reader};
use crate::errdata;
use crate::error::Result;
use crate::types::{ConfigEntry, Mutation, Term};

/// A message passed between cluster peers, stamped with the sender's current
/// term. The sender's identity is not on the wire; it is established by the
/// Identity exchange when a connection opens, and carried alongside the
/// envelope when it is handed to the core.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// The sender's current term. 0 in gateway-originated identity frames,
    /// which are never term-bearing.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A peer protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Introduces the sender on a freshly opened connection. The receiver
    /// replies with State so replication can resume where it left off.
    Identity { entry: ConfigEntry },

    /// Replicates mutations to a downstream peer. Appends are sent lock-step:
    /// at most one unacked record-bearing append per peer. An append with no
    /// records is a heartbeat; it serves liveness and carries the commit
    /// offset, but never advances the receiver's log.
    Append {
        /// The offset of the record immediately preceding the payload.
        prev_offset: u64,
        /// The term of that record.
        prev_term: Term,
        /// The records to append, if any.
        mutations: Vec<Mutation>,
        /// The sender's last committed offset.
        commit_offset: u64,
    },

    /// Solicits a vote for the envelope term, carrying the candidate's log
    /// position so receivers can refuse out-of-date candidates.
    RequestVote { last_offset: u64, last_term: Term },

    /// Reports the sender's replication position: the initial reply to
    /// Identity, and the nack sent when an append conflicts so the sender
    /// can rewind.
    State { last_received: u64 },

    /// Acknowledges appended records through the given offset.
    Ack { last_received: u64 },

    /// Grants a vote for the envelope term.
    Vote,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let tag = match &self.message {
            Message::Identity { .. } => 1,
            Message::Append { .. } => 2,
            Message::RequestVote { .. } => 3,
            Message::State { .. } => 4,
            Message::Ack { .. } => 5,
            Message::Vote => 6,
        };
        wire::put_u8(&mut buf, tag);
        wire::put_u64(&mut buf, self.term);
        match &self.message {
            Message::Identity { entry } => entry.encode_into(&mut buf),
            Message::Append { prev_offset, prev_term, mutations, commit_offset } => {
                wire::put_u64(&mut buf, *prev_offset);
                wire::put_u64(&mut buf, *prev_term);
                wire::put_u64(&mut buf, *commit_offset);
                wire::put_u8(&mut buf, mutations.len() as u8);
                for mutation in mutations {
                    mutation.encode_into(&mut buf);
                }
            }
            Message::RequestVote { last_offset, last_term } => {
                wire::put_u64(&mut buf, *last_offset);
                wire::put_u64(&mut buf, *last_term);
            }
            Message::State { last_received } | Message::Ack { last_received } => {
                wire::put_u64(&mut buf, *last_received);
            }
            Message::Vote => {}
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let tag = reader.u8()?;
        let term = reader.u64()?;
        let message = match tag {
            1 => Message::Identity { entry: ConfigEntry::decode_from(&mut reader)? },
            2 => {
                let prev_offset = reader.u64()?;
                let prev_term = reader.u64()?;
                let commit_offset = reader.u64()?;
                let count = reader.u8()? as usize;
                let mut mutations = Vec::with_capacity(count);
                for _ in 0..count {
                    mutations.push(Mutation::decode_from(&mut reader)?);
                }
                Message::Append { prev_offset, prev_term, mutations, commit_offset }
            }
            3 => Message::RequestVote { last_offset: reader.u64()?, last_term: reader.u64()? },
            4 => Message::State { last_received: reader.u64()? },
            5 => Message::Ack { last_received: reader.u64()? },
            6 => Message::Vote,
            tag => return errdata!("invalid peer message tag {tag}"),
        };
        reader.done()?;
        Ok(Self { term, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Operation, TopicName};
    use uuid::Uuid;

    fn entry() -> ConfigEntry {
        ConfigEntry {
            id: Uuid::from_u128(1),
            cluster_addr: "127.0.0.1:9701".parse().unwrap(),
            client_addr: "127.0.0.1:9601".parse().unwrap(),
        }
    }

    #[test]
    fn codec() -> Result<()> {
        let mutation = Mutation {
            term: 2,
            offset: 5,
            topic: TopicName::new("orders")?,
            client: Uuid::from_u128(9),
            nonce: 3,
            op: Operation::Put { key: b"k".to_vec(), value: b"v".to_vec() },
        };
        let messages = [
            Message::Identity { entry: entry() },
            Message::Append { prev_offset: 4, prev_term: 2, mutations: vec![mutation], commit_offset: 3 },
            Message::Append { prev_offset: 5, prev_term: 2, mutations: Vec::new(), commit_offset: 5 },
            Message::RequestVote { last_offset: 5, last_term: 2 },
            Message::State { last_received: 5 },
            Message::Ack { last_received: 5 },
            Message::Vote,
        ];
        for message in messages {
            let envelope = Envelope { term: 3, message };
            assert_eq!(Envelope::decode(&envelope.encode())?, envelope);
        }
        Ok(())
    }
}
