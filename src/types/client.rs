use super::{ClientId, ClusterConfig, ConfigEntry, Operation, TopicName};
use crate::encoding::wire::{self, Reader};
use crate::errdata;
use crate::error::Result;

/// A client-to-server request. A fresh connection must open with Handshake,
/// Reconnect, or Listen; mutation requests are only valid afterwards, and
/// only on client (non-listener) connections.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Introduces a new client. Answered with Ready.
    Handshake { client: ClientId },
    /// Reintroduces a client after a disconnect, triggering ack replay from
    /// the given commit offset. `nonce` is the first nonce the client will
    /// resend. Answered with replayed acks followed by Ready.
    Reconnect { client: ClientId, last_commit: u64, nonce: u64 },
    /// Turns the connection into a listener streaming the topic's events
    /// after the given local offset.
    Listen { topic: TopicName, last_local: u64 },
    CreateTopic { nonce: u64, topic: TopicName, code: Vec<u8>, args: Vec<u8> },
    DestroyTopic { nonce: u64, topic: TopicName },
    Put { nonce: u64, topic: TopicName, key: Vec<u8>, value: Vec<u8> },
    Delete { nonce: u64, topic: TopicName, key: Vec<u8> },
    UpdateConfig { nonce: u64, config: ClusterConfig },
}

impl Request {
    /// Splits a mutation request into its nonce and log operation. Returns
    /// None for session requests (handshake, reconnect, listen).
    pub fn into_operation(self) -> Option<(u64, TopicName, Operation)> {
        match self {
            Request::CreateTopic { nonce, topic, code, args } => {
                Some((nonce, topic, Operation::CreateTopic { code, args }))
            }
            Request::DestroyTopic { nonce, topic } => Some((nonce, topic, Operation::DestroyTopic)),
            Request::Put { nonce, topic, key, value } => {
                Some((nonce, topic, Operation::Put { key, value }))
            }
            Request::Delete { nonce, topic, key } => Some((nonce, topic, Operation::Delete { key })),
            Request::UpdateConfig { nonce, config } => {
                Some((nonce, TopicName::synthetic(), Operation::UpdateConfig(config)))
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Handshake { client } => {
                wire::put_u8(&mut buf, 1);
                wire::put_uuid(&mut buf, *client);
            }
            Request::Reconnect { client, last_commit, nonce } => {
                wire::put_u8(&mut buf, 2);
                wire::put_uuid(&mut buf, *client);
                wire::put_u64(&mut buf, *last_commit);
                wire::put_u64(&mut buf, *nonce);
            }
            Request::Listen { topic, last_local } => {
                wire::put_u8(&mut buf, 3);
                topic.encode_into(&mut buf);
                wire::put_u64(&mut buf, *last_local);
            }
            Request::CreateTopic { nonce, topic, code, args } => {
                wire::put_u8(&mut buf, 4);
                wire::put_u64(&mut buf, *nonce);
                topic.encode_into(&mut buf);
                wire::put_bytes16(&mut buf, code);
                wire::put_bytes16(&mut buf, args);
            }
            Request::DestroyTopic { nonce, topic } => {
                wire::put_u8(&mut buf, 5);
                wire::put_u64(&mut buf, *nonce);
                topic.encode_into(&mut buf);
            }
            Request::Put { nonce, topic, key, value } => {
                wire::put_u8(&mut buf, 6);
                wire::put_u64(&mut buf, *nonce);
                topic.encode_into(&mut buf);
                wire::put_bytes16(&mut buf, key);
                wire::put_bytes16(&mut buf, value);
            }
            Request::Delete { nonce, topic, key } => {
                wire::put_u8(&mut buf, 7);
                wire::put_u64(&mut buf, *nonce);
                topic.encode_into(&mut buf);
                wire::put_bytes16(&mut buf, key);
            }
            Request::UpdateConfig { nonce, config } => {
                wire::put_u8(&mut buf, 8);
                wire::put_u64(&mut buf, *nonce);
                config.encode_into(&mut buf);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let request = match reader.u8()? {
            1 => Request::Handshake { client: reader.uuid()? },
            2 => Request::Reconnect {
                client: reader.uuid()?,
                last_commit: reader.u64()?,
                nonce: reader.u64()?,
            },
            3 => Request::Listen {
                topic: TopicName::decode_from(&mut reader)?,
                last_local: reader.u64()?,
            },
            4 => Request::CreateTopic {
                nonce: reader.u64()?,
                topic: TopicName::decode_from(&mut reader)?,
                code: reader.bytes16()?.to_vec(),
                args: reader.bytes16()?.to_vec(),
            },
            5 => Request::DestroyTopic {
                nonce: reader.u64()?,
                topic: TopicName::decode_from(&mut reader)?,
            },
            6 => Request::Put {
                nonce: reader.u64()?,
                topic: TopicName::decode_from(&mut reader)?,
                key: reader.bytes16()?.to_vec(),
                value: reader.bytes16()?.to_vec(),
            },
            7 => Request::Delete {
                nonce: reader.u64()?,
                topic: TopicName::decode_from(&mut reader)?,
                key: reader.bytes16()?.to_vec(),
            },
            8 => Request::UpdateConfig {
                nonce: reader.u64()?,
                config: ClusterConfig::decode_from(&mut reader)?,
            },
            tag => return errdata!("invalid request tag {tag}"),
        };
        reader.done()?;
        Ok(request)
    }
}

/// A server-to-client response. Requests are acked twice: Received when the
/// leader accepts a mutation into its log, Committed when the cluster has
/// durably agreed on it. Both carry the server's commit offset so the client
/// can track its replay horizon across reconnects.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The request's nonce was invalid or the operation was rejected. No
    /// state changed.
    Error { nonce: u64 },
    /// The mutation was accepted into the leader's log.
    Received { nonce: u64, commit_offset: u64 },
    /// The mutation committed. `error` flags a zero-event outcome, e.g. a
    /// failed topic program.
    Committed { nonce: u64, commit_offset: u64, error: bool },
    /// This node is not the leader; reconnect to the given node.
    Redirect { leader: ConfigEntry, commit_offset: u64 },
    /// Handshake or reconnect replay finished; resume from `nonce`.
    Ready { nonce: u64, commit_offset: u64, config: ClusterConfig },
    /// A new cluster config committed.
    ConfigUpdate { config: ClusterConfig },
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Error { nonce } => {
                wire::put_u8(&mut buf, 1);
                wire::put_u64(&mut buf, *nonce);
            }
            Response::Received { nonce, commit_offset } => {
                wire::put_u8(&mut buf, 2);
                wire::put_u64(&mut buf, *nonce);
                wire::put_u64(&mut buf, *commit_offset);
            }
            Response::Committed { nonce, commit_offset, error } => {
                wire::put_u8(&mut buf, 3);
                wire::put_u64(&mut buf, *nonce);
                wire::put_u64(&mut buf, *commit_offset);
                wire::put_u8(&mut buf, *error as u8);
            }
            Response::Redirect { leader, commit_offset } => {
                wire::put_u8(&mut buf, 4);
                leader.encode_into(&mut buf);
                wire::put_u64(&mut buf, *commit_offset);
            }
            Response::Ready { nonce, commit_offset, config } => {
                wire::put_u8(&mut buf, 5);
                wire::put_u64(&mut buf, *nonce);
                wire::put_u64(&mut buf, *commit_offset);
                config.encode_into(&mut buf);
            }
            Response::ConfigUpdate { config } => {
                wire::put_u8(&mut buf, 6);
                config.encode_into(&mut buf);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let response = match reader.u8()? {
            1 => Response::Error { nonce: reader.u64()? },
            2 => Response::Received { nonce: reader.u64()?, commit_offset: reader.u64()? },
            3 => Response::Committed {
                nonce: reader.u64()?,
                commit_offset: reader.u64()?,
                error: reader.u8()? != 0,
            },
            4 => Response::Redirect {
                leader: ConfigEntry::decode_from(&mut reader)?,
                commit_offset: reader.u64()?,
            },
            5 => Response::Ready {
                nonce: reader.u64()?,
                commit_offset: reader.u64()?,
                config: ClusterConfig::decode_from(&mut reader)?,
            },
            6 => Response::ConfigUpdate { config: ClusterConfig::decode_from(&mut reader)? },
            tag => return errdata!("invalid response tag {tag}"),
        };
        reader.done()?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn config() -> ClusterConfig {
        ClusterConfig::new(vec![ConfigEntry {
            id: Uuid::from_u128(1),
            cluster_addr: "127.0.0.1:9701".parse().unwrap(),
            client_addr: "127.0.0.1:9601".parse().unwrap(),
        }])
        .unwrap()
    }

    #[test]
    fn request_codec() -> Result<()> {
        let topic = TopicName::new("orders")?;
        let requests = [
            Request::Handshake { client: Uuid::from_u128(9) },
            Request::Reconnect { client: Uuid::from_u128(9), last_commit: 4, nonce: 2 },
            Request::Listen { topic: topic.clone(), last_local: 0 },
            Request::CreateTopic {
                nonce: 1,
                topic: topic.clone(),
                code: b"c".to_vec(),
                args: Vec::new(),
            },
            Request::DestroyTopic { nonce: 2, topic: topic.clone() },
            Request::Put { nonce: 3, topic: topic.clone(), key: b"k".to_vec(), value: vec![1] },
            Request::Delete { nonce: 4, topic, key: b"k".to_vec() },
            Request::UpdateConfig { nonce: 5, config: config() },
        ];
        for request in requests {
            assert_eq!(Request::decode(&request.encode())?, request);
        }
        Ok(())
    }

    #[test]
    fn response_codec() -> Result<()> {
        let responses = [
            Response::Error { nonce: 7 },
            Response::Received { nonce: 1, commit_offset: 0 },
            Response::Committed { nonce: 1, commit_offset: 1, error: false },
            Response::Committed { nonce: 2, commit_offset: 2, error: true },
            Response::Redirect { leader: config().entries[0].clone(), commit_offset: 3 },
            Response::Ready { nonce: 4, commit_offset: 3, config: config() },
            Response::ConfigUpdate { config: config() },
        ];
        for response in responses {
            assert_eq!(Response::decode(&response.encode())?, response);
        }
        Ok(())
    }
}
