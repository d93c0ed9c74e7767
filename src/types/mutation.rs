use super::{ClientId, ClusterConfig, Term, TopicName};
use crate::encoding::wire::{self, Reader};
use crate::errdata;
use crate::error::Result;

/// A mutation is an authoritative entry in the cluster-wide log. Mutations
/// are created on the leader from valid client messages, replicated to
/// followers, written to the global log on commit, and replayed to
/// reconnecting clients. Committing a mutation deterministically produces
/// zero or more per-topic events, so every replica derives the same streams.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    /// The term of the leader that accepted the mutation.
    pub term: Term,
    /// The position in the global log: 1-indexed, dense, gap-free.
    pub offset: u64,
    /// The topic the mutation addresses, or the synthetic topic for
    /// config changes.
    pub topic: TopicName,
    /// The client that submitted the mutation.
    pub client: ClientId,
    /// The client's sequence number for the mutation.
    pub nonce: u64,
    /// The operation payload.
    pub op: Operation,
}

/// The operation carried by a mutation. Ordinals are fixed by the wire
/// format: 1=CREATE_TOPIC, 2=DESTROY_TOPIC, 3=PUT, 4=DELETE, 5=UPDATE_CONFIG
/// (0 is reserved as invalid).
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    CreateTopic { code: Vec<u8>, args: Vec<u8> },
    DestroyTopic,
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    UpdateConfig(ClusterConfig),
}

impl Mutation {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let ordinal = match &self.op {
            Operation::CreateTopic { .. } => 1,
            Operation::DestroyTopic => 2,
            Operation::Put { .. } => 3,
            Operation::Delete { .. } => 4,
            Operation::UpdateConfig(_) => 5,
        };
        wire::put_u8(buf, ordinal);
        wire::put_u64(buf, self.term);
        wire::put_u64(buf, self.offset);
        self.topic.encode_into(buf);
        wire::put_uuid(buf, self.client);
        wire::put_u64(buf, self.nonce);
        match &self.op {
            Operation::CreateTopic { code, args } => {
                wire::put_bytes16(buf, code);
                wire::put_bytes16(buf, args);
            }
            Operation::DestroyTopic => {}
            Operation::Put { key, value } => {
                wire::put_bytes16(buf, key);
                wire::put_bytes16(buf, value);
            }
            Operation::Delete { key } => wire::put_bytes16(buf, key),
            Operation::UpdateConfig(config) => config.encode_into(buf),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let mutation = Self::decode_from(&mut reader)?;
        reader.done()?;
        Ok(mutation)
    }

    pub fn decode_from(reader: &mut Reader) -> Result<Self> {
        let ordinal = reader.u8()?;
        let term = reader.u64()?;
        let offset = reader.u64()?;
        let topic = TopicName::decode_from(reader)?;
        let client = reader.uuid()?;
        let nonce = reader.u64()?;
        let op = match ordinal {
            1 => Operation::CreateTopic {
                code: reader.bytes16()?.to_vec(),
                args: reader.bytes16()?.to_vec(),
            },
            2 => Operation::DestroyTopic,
            3 => Operation::Put {
                key: reader.bytes16()?.to_vec(),
                value: reader.bytes16()?.to_vec(),
            },
            4 => Operation::Delete { key: reader.bytes16()?.to_vec() },
            5 => Operation::UpdateConfig(ClusterConfig::decode_from(reader)?),
            ordinal => return errdata!("invalid mutation kind {ordinal}"),
        };
        if topic.is_synthetic() != matches!(op, Operation::UpdateConfig(_)) {
            return errdata!("synthetic topic is reserved for config changes");
        }
        Ok(Self { term, offset, topic, client, nonce, op })
    }
}

#[cfg(test)]
mod tests {
    use super::super::ConfigEntry;
    use super::*;
    use uuid::Uuid;

    fn mutation(op: Operation) -> Mutation {
        let topic = match op {
            Operation::UpdateConfig(_) => TopicName::synthetic(),
            _ => TopicName::new("orders").unwrap(),
        };
        Mutation { term: 3, offset: 17, topic, client: Uuid::from_u128(0xabcd), nonce: 42, op }
    }

    #[test]
    fn codec() -> Result<()> {
        let config = ClusterConfig::new(vec![ConfigEntry {
            id: Uuid::from_u128(1),
            cluster_addr: "10.0.0.1:9701".parse().unwrap(),
            client_addr: "10.0.0.1:9601".parse().unwrap(),
        }])?;
        let ops = [
            Operation::CreateTopic { code: b"code".to_vec(), args: b"args".to_vec() },
            Operation::CreateTopic { code: Vec::new(), args: Vec::new() },
            Operation::DestroyTopic,
            Operation::Put { key: b"k".to_vec(), value: b"v".to_vec() },
            Operation::Put { key: Vec::new(), value: vec![1] },
            Operation::Delete { key: b"k".to_vec() },
            Operation::UpdateConfig(config),
        ];
        for op in ops {
            let mutation = mutation(op);
            assert_eq!(Mutation::decode(&mutation.encode())?, mutation);
        }
        Ok(())
    }

    #[test]
    fn decode_invalid_kind() {
        let mut buf = mutation(Operation::DestroyTopic).encode();
        buf[0] = 0;
        assert!(Mutation::decode(&buf).is_err());
        buf[0] = 6;
        assert!(Mutation::decode(&buf).is_err());
    }

    #[test]
    fn decode_synthetic_topic_mismatch() {
        // A keyed mutation on the synthetic topic is invalid.
        let mut m = mutation(Operation::DestroyTopic);
        m.topic = TopicName::synthetic();
        assert!(Mutation::decode(&m.encode()).is_err());
    }
}
