//! The client gateway. Socket I/O runs on per-connection reader and writer
//! threads; all session state lives in Sessions and is only ever touched by
//! the main worker, so nonce checks, ack ordering, reconnect replay, and
//! listener streaming are all serialized with the core.

use super::disk::DiskRequest;
use super::Command;
use crate::encoding::wire;
use crate::error::Result;
use crate::raft::Node;
use crate::types::{ClientId, ClusterConfig, ConfigEntry, Event, Mutation, Request, Response, TopicName};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, info};
use std::collections::HashMap;
use std::io::{BufReader, Write as _};
use std::net::{Shutdown, TcpListener, TcpStream};

/// Identifies a client connection.
pub type Token = u64;

/// What a connection has negotiated itself into.
enum Mode {
    /// Freshly connected; must open with Handshake, Reconnect, or Listen.
    New,
    /// A client session accepting mutations.
    Normal { client: ClientId },
    /// A client session replaying acks after a reconnect. Requests are
    /// invalid until the replay concludes with Ready.
    Reconnecting { client: ClientId },
    /// A listener streaming a topic's events.
    Listener {
        topic: TopicName,
        /// The next local offset to deliver.
        next_local: u64,
        /// Whether the listener is waiting at the tip of the topic.
        parked: bool,
        /// A config-change pseudo-event to deliver before the next event.
        /// A single high-priority slot: only the latest config matters.
        pending_config: Option<Event>,
    },
}

struct Conn {
    tx: Sender<Vec<u8>>,
    mode: Mode,
}

struct ClientState {
    token: Token,
    /// The nonce the client must use next.
    next_nonce: u64,
}

/// A reconnect replay scanning the global log for the client's mutations.
struct ReconnectScan {
    token: Token,
    client: ClientId,
    /// The next offset to examine.
    next_offset: u64,
    /// The last offset to examine (the log tip at reconnect time).
    final_offset: u64,
    /// The commit horizon at reconnect time; mutations beyond it get only a
    /// synthetic RECEIVED, their COMMITTED arrives live later.
    final_commit: u64,
    /// The highest nonce seen plus one.
    next_nonce: u64,
    /// The commit offset most recently reported to the client.
    sent_commit: u64,
}

pub struct Sessions {
    disk_tx: Sender<DiskRequest>,
    conns: HashMap<Token, Conn>,
    clients: HashMap<ClientId, ClientState>,
    /// Reconnect scans parked on a mutation fetch, by offset.
    scans: HashMap<u64, Vec<ReconnectScan>>,
    /// Commit acks that arrived while their client was mid-replay, flushed
    /// when the replay concludes.
    held_commits: HashMap<ClientId, Vec<Response>>,
    /// Listeners waiting for an event, by topic and local offset.
    waiting: HashMap<(TopicName, u64), Vec<Token>>,
}

impl Sessions {
    pub fn new(disk_tx: Sender<DiskRequest>) -> Self {
        Self {
            disk_tx,
            conns: HashMap::new(),
            clients: HashMap::new(),
            scans: HashMap::new(),
            held_commits: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    pub fn connected(&mut self, token: Token, tx: Sender<Vec<u8>>) {
        self.conns.insert(token, Conn { tx, mode: Mode::New });
    }

    /// Drops all state for a connection. The client's identity state goes
    /// with it: a future reconnect reconstructs everything from the log.
    pub fn disconnected(&mut self, token: Token) {
        let Some(conn) = self.conns.remove(&token) else { return };
        if let Mode::Normal { client } | Mode::Reconnecting { client } = conn.mode {
            if self.clients.get(&client).is_some_and(|state| state.token == token) {
                self.clients.remove(&client);
                self.held_commits.remove(&client);
            }
        }
        // Parked scan and listener entries are reaped lazily when their
        // offset comes up.
    }

    /// Processes a client request.
    pub fn request(&mut self, node: &mut Node, token: Token, request: Request) -> Result<()> {
        match self.conns.get(&token).map(|c| &c.mode) {
            None => Ok(()), // disconnected while queued
            Some(Mode::New) => self.open(node, token, request),
            Some(Mode::Normal { client }) => {
                let client = *client;
                self.mutate(node, token, client, request)
            }
            // Anything else mid-replay or on a listener is a protocol
            // violation.
            Some(Mode::Reconnecting { .. }) | Some(Mode::Listener { .. }) => {
                self.drop_conn(token);
                Ok(())
            }
        }
    }

    /// Handles the opening request of a fresh connection.
    fn open(&mut self, node: &mut Node, token: Token, request: Request) -> Result<()> {
        match request {
            Request::Handshake { client } => {
                debug!("Client {client} connected");
                self.clients.insert(client, ClientState { token, next_nonce: 1 });
                self.set_mode(token, Mode::Normal { client });
                self.send_to(
                    token,
                    &Response::Ready {
                        nonce: 1,
                        commit_offset: node.commit_offset(),
                        config: node.config().clone(),
                    },
                );
                Ok(())
            }
            Request::Reconnect { client, last_commit, nonce } => {
                debug!("Client {client} reconnecting from offset {last_commit}");
                self.clients.insert(client, ClientState { token, next_nonce: nonce });
                self.set_mode(token, Mode::Reconnecting { client });
                let scan = ReconnectScan {
                    token,
                    client,
                    next_offset: last_commit + 1,
                    final_offset: node.last_received(),
                    final_commit: node.commit_offset(),
                    next_nonce: nonce,
                    sent_commit: last_commit,
                };
                self.advance_scan(scan, node)
            }
            Request::Listen { topic, last_local } => {
                debug!("Listener subscribed to {topic} from offset {last_local}");
                self.set_mode(
                    token,
                    Mode::Listener {
                        topic,
                        next_local: last_local + 1,
                        parked: false,
                        pending_config: None,
                    },
                );
                self.advance_listener(token, node)
            }
            _ => {
                self.drop_conn(token);
                Ok(())
            }
        }
    }

    /// Handles a mutation request from an established client session.
    fn mutate(
        &mut self,
        node: &mut Node,
        token: Token,
        client: ClientId,
        request: Request,
    ) -> Result<()> {
        let Some((nonce, topic, op)) = request.into_operation() else {
            self.drop_conn(token);
            return Ok(());
        };
        let expected = self.clients.get(&client).map(|s| s.next_nonce);
        if expected != Some(nonce) {
            self.send_to(token, &Response::Error { nonce });
            return Ok(());
        }
        if !node.is_leader() {
            match node.leader() {
                Some(leader) => {
                    let leader = leader.clone();
                    self.send_to(
                        token,
                        &Response::Redirect { leader, commit_offset: node.commit_offset() },
                    );
                }
                None => self.send_to(token, &Response::Error { nonce }),
            }
            return Ok(());
        }
        match node.propose(client, nonce, topic, op) {
            Ok(_) => {
                self.clients.get_mut(&client).expect("client state").next_nonce += 1;
                self.send_to(
                    token,
                    &Response::Received { nonce, commit_offset: node.commit_offset() },
                );
            }
            Err(err) => {
                debug!("Rejected mutation from {client}: {err}");
                self.send_to(token, &Response::Error { nonce });
            }
        }
        Ok(())
    }

    /// Walks a reconnect scan forward. Offsets at or below the commit
    /// horizon are fetched from the log store asynchronously; the rest are
    /// replayed synchronously from the in-flight buffer.
    fn advance_scan(&mut self, mut scan: ReconnectScan, node: &mut Node) -> Result<()> {
        loop {
            if scan.next_offset > scan.final_offset {
                return self.conclude_scan(scan, node);
            }
            if scan.next_offset <= node.commit_offset() {
                let offset = scan.next_offset;
                self.scans.entry(offset).or_default().push(scan);
                return node.request_fetch(offset);
            }
            // The buffered tail can shrink mid-replay if leadership flips
            // and entries are dropped; the scan has nothing left to say
            // about offsets that no longer exist.
            let Some(mutation) = node.get_buffered(scan.next_offset) else {
                return self.conclude_scan(scan, node);
            };
            let mutation = mutation.clone();
            self.replay_one(&mut scan, &mutation, false);
            scan.next_offset += 1;
        }
    }

    /// Replays a single historical mutation to a reconnecting client,
    /// synthesizing the acks it would have seen had it stayed connected.
    fn replay_one(&mut self, scan: &mut ReconnectScan, mutation: &Mutation, committed: bool) {
        if mutation.client != scan.client {
            return;
        }
        let will_commit = committed && mutation.offset <= scan.final_commit;
        let commit_offset = if will_commit { mutation.offset } else { scan.sent_commit };
        self.send_to(scan.token, &Response::Received { nonce: mutation.nonce, commit_offset });
        if will_commit {
            self.send_to(
                scan.token,
                &Response::Committed { nonce: mutation.nonce, commit_offset, error: false },
            );
            scan.sent_commit = commit_offset;
        }
        if mutation.nonce >= scan.next_nonce {
            scan.next_nonce = mutation.nonce + 1;
        }
    }

    /// Finishes a reconnect replay: flushes commits that landed mid-replay
    /// and hands the session back to the client with Ready.
    fn conclude_scan(&mut self, scan: ReconnectScan, node: &Node) -> Result<()> {
        if let Some(held) = self.held_commits.remove(&scan.client) {
            for response in held {
                self.send_to(scan.token, &response);
            }
        }
        if let Some(state) = self.clients.get_mut(&scan.client) {
            state.next_nonce = scan.next_nonce;
        }
        self.set_mode(scan.token, Mode::Normal { client: scan.client });
        info!("Client {} replay complete, resuming at nonce {}", scan.client, scan.next_nonce);
        self.send_to(
            scan.token,
            &Response::Ready {
                nonce: scan.next_nonce,
                commit_offset: node.commit_offset(),
                config: node.config().clone(),
            },
        );
        Ok(())
    }

    /// Feeds a fetched mutation to the reconnect scans waiting on it.
    pub fn mutation_fetched(&mut self, mutation: &Mutation, node: &mut Node) -> Result<()> {
        let Some(scans) = self.scans.remove(&mutation.offset) else { return Ok(()) };
        for mut scan in scans {
            // The client may have dropped or reconnected again mid-replay.
            if !self.clients.get(&scan.client).is_some_and(|s| s.token == scan.token) {
                continue;
            }
            self.replay_one(&mut scan, mutation, true);
            scan.next_offset = mutation.offset + 1;
            self.advance_scan(scan, node)?;
        }
        Ok(())
    }

    /// Acks a committed mutation to its owning client, if connected. Acks
    /// for a client that is mid-replay are held back until the replay
    /// concludes, so the synthetic stream stays ordered.
    pub fn committed(&mut self, mutation: &Mutation, error: bool) {
        let Some(state) = self.clients.get(&mutation.client) else { return };
        let token = state.token;
        let response = Response::Committed {
            nonce: mutation.nonce,
            commit_offset: mutation.offset,
            error,
        };
        match self.conns.get(&token).map(|c| &c.mode) {
            Some(Mode::Normal { .. }) => self.send_to(token, &response),
            Some(Mode::Reconnecting { .. }) => {
                self.held_commits.entry(mutation.client).or_default().push(response)
            }
            _ => {}
        }
    }

    /// Streams freshly committed events to the listeners waiting at the tip
    /// of their topic.
    pub fn events_committed(&mut self, events: &[Event]) {
        for event in events {
            let key = (event.topic.clone(), event.local_offset);
            let Some(tokens) = self.waiting.remove(&key) else { continue };
            for token in tokens {
                self.deliver(token, event);
                // The next event is beyond the tip until it commits.
                self.park(token);
            }
        }
    }

    /// Feeds a fetched event to the catching-up listeners waiting on it.
    pub fn event_fetched(&mut self, event: &Event, node: &Node) -> Result<()> {
        let key = (event.topic.clone(), event.local_offset);
        let Some(tokens) = self.waiting.remove(&key) else { return Ok(()) };
        for token in tokens {
            self.deliver(token, event);
            self.advance_listener(token, node)?;
        }
        Ok(())
    }

    /// Delivers an event to a listener, preceded by any pending
    /// config-change pseudo-event, and advances its position.
    fn deliver(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.conns.get_mut(&token) else { return };
        let Mode::Listener { next_local, parked, pending_config, .. } = &mut conn.mode else {
            return;
        };
        if let Some(config_event) = pending_config.take() {
            conn.tx.send(config_event.encode()).ok();
        }
        *next_local += 1;
        *parked = false;
        conn.tx.send(event.encode()).ok();
    }

    /// Moves a listener towards the tip of its topic: fetches the next
    /// committed event from the log store, or parks at the tip to wait for
    /// new commits.
    fn advance_listener(&mut self, token: Token, node: &Node) -> Result<()> {
        let Some(conn) = self.conns.get(&token) else { return Ok(()) };
        let Mode::Listener { topic, next_local, .. } = &conn.mode else { return Ok(()) };
        let (topic, next_local) = (topic.clone(), *next_local);

        if next_local <= node.last_local(&topic) {
            let list = self.waiting.entry((topic.clone(), next_local)).or_default();
            let first = list.is_empty();
            list.push(token);
            if first {
                // Only the first waiter issues the fetch.
                self.disk_tx.send(DiskRequest::FetchEvent { topic, local: next_local })?;
            }
        } else {
            self.park(token);
        }
        Ok(())
    }

    /// Marks a listener as waiting at the tip of its topic and flushes any
    /// pending config-change pseudo-event, since there is no next event to
    /// precede.
    fn park(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else { return };
        let Mode::Listener { topic, next_local, parked, pending_config } = &mut conn.mode else {
            return;
        };
        *parked = true;
        if let Some(config_event) = pending_config.take() {
            conn.tx.send(config_event.encode()).ok();
        }
        let key = (topic.clone(), *next_local);
        let list = self.waiting.entry(key).or_default();
        if !list.contains(&token) {
            list.push(token);
        }
    }

    /// Broadcasts a committed config change: clients get a config update
    /// response, listeners get the pseudo-event. A listener waiting at the
    /// tip sees it immediately; one mid-stream sees it before its next
    /// event, through the single high-priority slot.
    pub fn config_committed(&mut self, config: &ClusterConfig) {
        let pseudo = Event::config_change(config.clone());
        let update = Response::ConfigUpdate { config: config.clone() }.encode();
        for conn in self.conns.values_mut() {
            match &mut conn.mode {
                Mode::Normal { .. } => {
                    conn.tx.send(update.clone()).ok();
                }
                Mode::Listener { parked, pending_config, .. } => {
                    if *parked {
                        conn.tx.send(pseudo.encode()).ok();
                        *pending_config = None;
                    } else {
                        *pending_config = Some(pseudo.clone());
                    }
                }
                _ => {}
            }
        }
    }

    /// Redirects every client session to the given leader. Listeners stay:
    /// they can stream from either role.
    pub fn redirect_all(&mut self, leader: &ConfigEntry, commit_offset: u64) {
        let response = Response::Redirect { leader: leader.clone(), commit_offset }.encode();
        for conn in self.conns.values() {
            if let Mode::Normal { .. } = conn.mode {
                conn.tx.send(response.clone()).ok();
            }
        }
    }

    fn set_mode(&mut self, token: Token, mode: Mode) {
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.mode = mode;
        }
    }

    fn send_to(&self, token: Token, response: &Response) {
        if let Some(conn) = self.conns.get(&token) {
            // A send failure means the writer is gone; the reader thread
            // will deliver the disconnect.
            conn.tx.send(response.encode()).ok();
        }
    }

    /// Drops a misbehaving connection.
    fn drop_conn(&mut self, token: Token) {
        debug!("Dropping client connection {token} after protocol violation");
        self.disconnected(token);
    }
}

/// Accepts client connections, spawning a reader and writer thread per
/// connection.
pub fn accept(listener: TcpListener, cmd_tx: Sender<Command>) {
    std::thread::spawn(move || {
        let mut next_token: Token = 0;
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            next_token += 1;
            let token = next_token;
            let (tx, rx) = crossbeam::channel::unbounded();
            if cmd_tx.send(Command::ClientConnected { token, tx }).is_err() {
                return;
            }
            let Ok(read_stream) = stream.try_clone() else { continue };
            let read_cmd_tx = cmd_tx.clone();
            std::thread::spawn(move || read_loop(token, read_stream, read_cmd_tx));
            std::thread::spawn(move || write_loop(stream, rx));
        }
    });
}

fn read_loop(token: Token, stream: TcpStream, cmd_tx: Sender<Command>) {
    let mut reader = BufReader::new(stream);
    loop {
        let request = match wire::read_frame(&mut reader) {
            Ok(Some(frame)) => Request::decode(&frame),
            Ok(None) | Err(_) => break,
        };
        let Ok(request) = request else { break };
        if cmd_tx.send(Command::ClientRequest { token, request }).is_err() {
            return;
        }
    }
    cmd_tx.send(Command::ClientDisconnected { token }).ok();
}

fn write_loop(mut stream: TcpStream, rx: Receiver<Vec<u8>>) {
    for frame in rx {
        if wire::write_frame(&mut stream, &frame).is_err() || stream.flush().is_err() {
            break;
        }
    }
    stream.shutdown(Shutdown::Both).ok();
}
