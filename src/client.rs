//! A synchronous client library for a laminar cluster, used by the
//! integration tests and external tools. Each mutation call blocks until
//! the cluster acknowledges the commit.

use crate::encoding::wire;
use crate::errdata;
use crate::error::{Error, Result};
use crate::types::{
    ClientId, ClusterConfig, ConfigEntry, Event, Request, Response, TopicName,
};

use std::io::{BufReader, Write as _};
use std::net::{TcpStream, ToSocketAddrs};
use uuid::Uuid;

/// The outcome of a committed mutation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Commit {
    /// The global offset the mutation committed at.
    pub offset: u64,
    /// Whether the mutation committed with an error effect (e.g. a failed
    /// topic program); such commits produced no events.
    pub error: bool,
}

/// A laminar client. Tracks the nonce sequence and commit horizon needed to
/// survive reconnects.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    id: ClientId,
    /// The nonce of the next mutation.
    nonce: u64,
    /// The server's commit offset as of the last response.
    commit_offset: u64,
    /// The cluster config as of the last update.
    config: ClusterConfig,
}

impl Client {
    /// Connects and handshakes as a new client.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let id = Uuid::new_v4();
        let (client, _) = Self::open(addr, id, Request::Handshake { client: id })?;
        Ok(client)
    }

    /// Reconnects as an existing client, returning the acks the server
    /// replays for mutations sent after the given commit offset.
    pub fn reconnect(
        addr: impl ToSocketAddrs,
        id: ClientId,
        last_commit: u64,
        nonce: u64,
    ) -> Result<(Self, Vec<Response>)> {
        Self::open(addr, id, Request::Reconnect { client: id, last_commit, nonce })
    }

    fn open(
        addr: impl ToSocketAddrs,
        id: ClientId,
        request: Request,
    ) -> Result<(Self, Vec<Response>)> {
        let writer = TcpStream::connect(addr)?;
        let reader = BufReader::new(writer.try_clone()?);
        let mut client =
            Self { reader, writer, id, nonce: 0, commit_offset: 0, config: ClusterConfig { entries: Vec::new() } };
        client.send(&request)?;
        let mut replayed = Vec::new();
        loop {
            match client.recv()? {
                Response::Ready { nonce, commit_offset, config } => {
                    client.nonce = nonce;
                    client.commit_offset = commit_offset;
                    client.config = config;
                    return Ok((client, replayed));
                }
                response @ (Response::Received { .. } | Response::Committed { .. }) => {
                    replayed.push(response)
                }
                response => return errdata!("unexpected response {response:?}"),
            }
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The nonce the next mutation will use.
    pub fn next_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn commit_offset(&self) -> u64 {
        self.commit_offset
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn create_topic(&mut self, topic: &str, code: &[u8], args: &[u8]) -> Result<Commit> {
        let request = Request::CreateTopic {
            nonce: self.nonce,
            topic: TopicName::new(topic)?,
            code: code.to_vec(),
            args: args.to_vec(),
        };
        self.call(request)
    }

    pub fn destroy_topic(&mut self, topic: &str) -> Result<Commit> {
        self.call(Request::DestroyTopic { nonce: self.nonce, topic: TopicName::new(topic)? })
    }

    pub fn put(&mut self, topic: &str, key: &[u8], value: &[u8]) -> Result<Commit> {
        let request = Request::Put {
            nonce: self.nonce,
            topic: TopicName::new(topic)?,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.call(request)
    }

    pub fn delete(&mut self, topic: &str, key: &[u8]) -> Result<Commit> {
        let request = Request::Delete {
            nonce: self.nonce,
            topic: TopicName::new(topic)?,
            key: key.to_vec(),
        };
        self.call(request)
    }

    pub fn update_config(&mut self, entries: Vec<ConfigEntry>) -> Result<Commit> {
        let config = ClusterConfig::new(entries)?;
        self.call(Request::UpdateConfig { nonce: self.nonce, config })
    }

    /// Submits a mutation and blocks until it commits.
    fn call(&mut self, request: Request) -> Result<Commit> {
        let nonce = self.nonce;
        self.send(&request)?;
        loop {
            match self.recv()? {
                Response::Received { nonce: n, commit_offset } if n == nonce => {
                    self.commit_offset = commit_offset;
                }
                Response::Committed { nonce: n, commit_offset, error } if n == nonce => {
                    self.commit_offset = commit_offset;
                    self.nonce += 1;
                    return Ok(Commit { offset: commit_offset, error });
                }
                Response::ConfigUpdate { config } => self.config = config,
                Response::Error { nonce: n } if n == nonce => {
                    return Err(Error::InvalidInput("server rejected the request".into()))
                }
                Response::Redirect { leader, .. } => {
                    return Err(Error::InvalidInput(format!(
                        "not the leader, try {}",
                        leader.client_addr
                    )))
                }
                response => return errdata!("unexpected response {response:?}"),
            }
        }
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        wire::write_frame(&mut self.writer, &request.encode())?;
        Ok(self.writer.flush()?)
    }

    fn recv(&mut self) -> Result<Response> {
        match wire::read_frame(&mut self.reader)? {
            Some(frame) => Response::decode(&frame),
            None => errdata!("server closed the connection"),
        }
    }
}

/// A listener streaming a topic's committed events in local-offset order,
/// with config-change pseudo-events interleaved.
pub struct Listener {
    reader: BufReader<TcpStream>,
}

impl Listener {
    /// Subscribes to a topic's events after the given local offset.
    pub fn connect(addr: impl ToSocketAddrs, topic: &str, last_local: u64) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        let request = Request::Listen { topic: TopicName::new(topic)?, last_local };
        wire::write_frame(&mut stream, &request.encode())?;
        stream.flush()?;
        Ok(Self { reader: BufReader::new(stream) })
    }

    /// Blocks until the next event arrives.
    pub fn recv(&mut self) -> Result<Event> {
        match wire::read_frame(&mut self.reader)? {
            Some(frame) => Event::decode(&frame),
            None => errdata!("server closed the connection"),
        }
    }
}
