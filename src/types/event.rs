use super::{ClientId, ClusterConfig, Term, TopicName};
use crate::encoding::wire::{self, Reader};
use crate::errdata;
use crate::error::Result;

use uuid::Uuid;

/// The sentinel offset carried by synthesized events (-1 as a u64).
const SENTINEL: u64 = u64::MAX;

/// An event is a committed, per-topic projection of a mutation, delivered to
/// listeners in local-offset order. Every replica derives identical events
/// from a committed mutation. A single mutation may produce several events on
/// a programmable topic; all of them share its global offset and commit
/// atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// The term of the producing mutation.
    pub term: Term,
    /// The global offset of the producing mutation.
    pub offset: u64,
    /// The position within the topic: 1-indexed, dense.
    pub local_offset: u64,
    /// The topic the event belongs to.
    pub topic: TopicName,
    /// The client that submitted the producing mutation.
    pub client: ClientId,
    /// That client's nonce for the producing mutation.
    pub nonce: u64,
    /// The change payload.
    pub change: Change,
}

/// The change carried by an event. Ordinals are fixed by the wire format:
/// 1=TOPIC_CREATE, 2=TOPIC_DESTROY, 3=KEY_PUT, 4=KEY_DELETE, 5=CONFIG_CHANGE
/// (0 is reserved as invalid).
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    TopicCreate { code: Vec<u8>, args: Vec<u8> },
    TopicDestroy,
    KeyPut { key: Vec<u8>, value: Vec<u8> },
    KeyDelete { key: Vec<u8> },
    ConfigChange(ClusterConfig),
}

impl Event {
    /// Synthesizes a config-change pseudo-event. These are never persisted;
    /// they exist purely to broadcast the new config to listeners, and use
    /// sentinel offsets and a zero client id.
    pub fn config_change(config: ClusterConfig) -> Self {
        Self {
            term: 0,
            offset: SENTINEL,
            local_offset: SENTINEL,
            topic: TopicName::synthetic(),
            client: Uuid::nil(),
            nonce: 0,
            change: Change::ConfigChange(config),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let ordinal = match &self.change {
            Change::TopicCreate { .. } => 1,
            Change::TopicDestroy => 2,
            Change::KeyPut { .. } => 3,
            Change::KeyDelete { .. } => 4,
            Change::ConfigChange(_) => 5,
        };
        wire::put_u8(buf, ordinal);
        wire::put_u64(buf, self.term);
        wire::put_u64(buf, self.offset);
        wire::put_u64(buf, self.local_offset);
        self.topic.encode_into(buf);
        wire::put_uuid(buf, self.client);
        wire::put_u64(buf, self.nonce);
        match &self.change {
            Change::TopicCreate { code, args } => {
                wire::put_bytes16(buf, code);
                wire::put_bytes16(buf, args);
            }
            Change::TopicDestroy => {}
            Change::KeyPut { key, value } => {
                wire::put_bytes16(buf, key);
                wire::put_bytes16(buf, value);
            }
            Change::KeyDelete { key } => wire::put_bytes16(buf, key),
            Change::ConfigChange(config) => config.encode_into(buf),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let event = Self::decode_from(&mut reader)?;
        reader.done()?;
        Ok(event)
    }

    pub fn decode_from(reader: &mut Reader) -> Result<Self> {
        let ordinal = reader.u8()?;
        let term = reader.u64()?;
        let offset = reader.u64()?;
        let local_offset = reader.u64()?;
        let topic = TopicName::decode_from(reader)?;
        let client = reader.uuid()?;
        let nonce = reader.u64()?;
        let change = match ordinal {
            1 => Change::TopicCreate {
                code: reader.bytes16()?.to_vec(),
                args: reader.bytes16()?.to_vec(),
            },
            2 => Change::TopicDestroy,
            3 => Change::KeyPut {
                key: reader.bytes16()?.to_vec(),
                value: reader.bytes16()?.to_vec(),
            },
            4 => Change::KeyDelete { key: reader.bytes16()?.to_vec() },
            5 => Change::ConfigChange(ClusterConfig::decode_from(reader)?),
            ordinal => return errdata!("invalid event kind {ordinal}"),
        };
        Ok(Self { term, offset, local_offset, topic, client, nonce, change })
    }
}

#[cfg(test)]
mod tests {
    use super::super::ConfigEntry;
    use super::*;

    #[test]
    fn codec() -> Result<()> {
        let changes = [
            Change::TopicCreate { code: b"code".to_vec(), args: Vec::new() },
            Change::TopicDestroy,
            Change::KeyPut { key: b"k".to_vec(), value: b"v".to_vec() },
            Change::KeyDelete { key: b"k".to_vec() },
        ];
        for change in changes {
            let event = Event {
                term: 2,
                offset: 9,
                local_offset: 4,
                topic: TopicName::new("orders")?,
                client: Uuid::from_u128(7),
                nonce: 3,
                change,
            };
            assert_eq!(Event::decode(&event.encode())?, event);
        }
        Ok(())
    }

    #[test]
    fn config_change_sentinels() -> Result<()> {
        let config = ClusterConfig::new(vec![ConfigEntry {
            id: Uuid::from_u128(1),
            cluster_addr: "127.0.0.1:9701".parse().unwrap(),
            client_addr: "127.0.0.1:9601".parse().unwrap(),
        }])?;
        let event = Event::config_change(config);
        assert_eq!(event.offset, u64::MAX);
        assert_eq!(event.local_offset, u64::MAX);
        assert_eq!(event.client, Uuid::nil());
        assert_eq!(Event::decode(&event.encode())?, event);
        Ok(())
    }
}
