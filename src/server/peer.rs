//! The peer gateway. Each cluster member keeps one outbound (downstream)
//! link to every other member of its active configs, opened with an
//! Identity frame and redialed on failure, plus inbound (upstream) links
//! accepted from peers dialing it. Leader appends and vote solicitations
//! travel downstream; state reports, acks, and votes travel back upstream
//! over whichever link the triggering message arrived on.

use super::Command;
use crate::encoding::wire;
use crate::raft::{Envelope, Message};
use crate::types::{ConfigEntry, NodeId};

use crossbeam::channel::{Receiver, Sender};
use log::debug;
use std::collections::HashMap;
use std::io::BufReader;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::time::Duration;

/// The delay between dial attempts to an unreachable peer.
const REDIAL_INTERVAL: Duration = Duration::from_millis(1000);

pub struct PeerLinks {
    cmd_tx: Sender<Command>,
    /// Our pre-encoded identity frame, sent when a dial succeeds.
    identity: Vec<u8>,
    /// Frame channels of the links this node dialed, by peer.
    outbound: HashMap<NodeId, Sender<Vec<u8>>>,
    /// Frame channels of accepted links, by identified peer.
    inbound: HashMap<NodeId, Sender<Vec<u8>>>,
}

impl PeerLinks {
    pub fn new(cmd_tx: Sender<Command>, entry: ConfigEntry) -> Self {
        let identity = Envelope { term: 0, message: Message::Identity { entry } }.encode();
        Self { cmd_tx, identity, outbound: HashMap::new(), inbound: HashMap::new() }
    }

    /// Opens a downstream link to a peer, keeping it dialed until
    /// disconnect() drops it.
    pub fn connect(&mut self, entry: ConfigEntry) {
        if self.outbound.contains_key(&entry.id) {
            return;
        }
        let (tx, rx) = crossbeam::channel::unbounded();
        self.outbound.insert(entry.id, tx);
        let identity = self.identity.clone();
        let cmd_tx = self.cmd_tx.clone();
        std::thread::spawn(move || dial(entry, identity, rx, cmd_tx));
    }

    /// Drops all links to a peer. The dialer exits when it notices its
    /// channel is gone.
    pub fn disconnect(&mut self, id: NodeId) {
        self.outbound.remove(&id);
        self.inbound.remove(&id);
    }

    pub fn register_inbound(&mut self, id: NodeId, tx: Sender<Vec<u8>>) {
        self.inbound.insert(id, tx);
    }

    /// Routes a message to a peer over the appropriate link. Messages for
    /// unknown or down peers are dropped; the protocol recovers through the
    /// identity exchange on reconnect.
    pub fn send(&self, to: NodeId, envelope: &Envelope) {
        let links = match envelope.message {
            Message::Identity { .. } | Message::Append { .. } | Message::RequestVote { .. } => {
                &self.outbound
            }
            Message::State { .. } | Message::Ack { .. } | Message::Vote => &self.inbound,
        };
        if let Some(tx) = links.get(&to) {
            tx.send(envelope.encode()).ok();
        }
    }
}

/// Accepts inbound peer connections.
pub fn accept(listener: TcpListener, cmd_tx: Sender<Command>) {
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let cmd_tx = cmd_tx.clone();
            std::thread::spawn(move || inbound(stream, cmd_tx));
        }
    });
}

/// Serves an accepted connection: the first frame must identify the peer,
/// the rest are its protocol messages.
fn inbound(stream: TcpStream, cmd_tx: Sender<Command>) {
    let Ok(read_stream) = stream.try_clone() else { return };
    let mut reader = BufReader::new(read_stream);

    let Ok(Some(frame)) = wire::read_frame(&mut reader) else { return };
    let Ok(envelope) = Envelope::decode(&frame) else { return };
    let Message::Identity { entry } = &envelope.message else { return };
    let id = entry.id;
    debug!("Peer {entry} connected");

    let (tx, rx) = crossbeam::channel::unbounded();
    std::thread::spawn(move || write_loop(stream, rx));
    if cmd_tx.send(Command::PeerConnected { entry: entry.clone(), tx }).is_err() {
        return;
    }
    if cmd_tx.send(Command::PeerMessage { from: id, envelope }).is_err() {
        return;
    }

    loop {
        let envelope = match wire::read_frame(&mut reader) {
            Ok(Some(frame)) => Envelope::decode(&frame),
            Ok(None) | Err(_) => break,
        };
        let Ok(envelope) = envelope else { break };
        if cmd_tx.send(Command::PeerMessage { from: id, envelope }).is_err() {
            return;
        }
    }
    debug!("Peer {id} disconnected");
    cmd_tx.send(Command::PeerDisconnected { id, downstream: false }).ok();
}

/// Writes queued frames to an upstream reply socket.
fn write_loop(mut stream: TcpStream, rx: Receiver<Vec<u8>>) {
    for frame in rx {
        if wire::write_frame(&mut stream, &frame).is_err() {
            break;
        }
    }
    stream.shutdown(Shutdown::Both).ok();
}

/// Dials a downstream peer until the link is dropped, introducing ourselves
/// and forwarding frames on each established session.
fn dial(entry: ConfigEntry, identity: Vec<u8>, rx: Receiver<Vec<u8>>, cmd_tx: Sender<Command>) {
    loop {
        match TcpStream::connect(entry.cluster_addr) {
            Ok(stream) => {
                debug!("Connected to peer {entry}");
                if !session(&entry, stream, &identity, &rx, &cmd_tx) {
                    return;
                }
            }
            Err(err) => debug!("Failed connecting to peer {entry}: {err}"),
        }
        // Pace the redials, and notice when the link has been dropped.
        match rx.recv_timeout(REDIAL_INTERVAL) {
            Ok(_) => {} // stale frame from while we were down, discard
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Runs one established downstream session. Returns false when the link has
/// been dropped and dialing should stop.
fn session(
    entry: &ConfigEntry,
    mut stream: TcpStream,
    identity: &[u8],
    rx: &Receiver<Vec<u8>>,
    cmd_tx: &Sender<Command>,
) -> bool {
    // Frames queued while the link was down are stale; the identity
    // exchange restarts the conversation.
    while rx.try_recv().is_ok() {}
    if wire::write_frame(&mut stream, identity).is_err() {
        cmd_tx.send(Command::PeerDisconnected { id: entry.id, downstream: true }).ok();
        return true;
    }

    // Responses (state reports, acks, votes) come back over this socket.
    let (dead_tx, dead_rx) = crossbeam::channel::bounded(1);
    let Ok(read_stream) = stream.try_clone() else { return true };
    let read_cmd_tx = cmd_tx.clone();
    let id = entry.id;
    std::thread::spawn(move || {
        let mut reader = BufReader::new(read_stream);
        loop {
            let envelope = match wire::read_frame(&mut reader) {
                Ok(Some(frame)) => Envelope::decode(&frame),
                Ok(None) | Err(_) => break,
            };
            let Ok(envelope) = envelope else { break };
            if read_cmd_tx.send(Command::PeerMessage { from: id, envelope }).is_err() {
                return;
            }
        }
        dead_tx.send(()).ok();
    });

    let keep_dialing = loop {
        crossbeam::channel::select! {
            recv(rx) -> frame => match frame {
                Ok(frame) => {
                    if wire::write_frame(&mut stream, &frame).is_err() {
                        break true;
                    }
                }
                Err(_) => break false, // link dropped by the core
            },
            recv(dead_rx) -> _ => break true,
        }
    };
    stream.shutdown(Shutdown::Both).ok();
    if keep_dialing {
        debug!("Lost connection to peer {entry}");
        cmd_tx.send(Command::PeerDisconnected { id: entry.id, downstream: true }).ok();
    }
    keep_dialing
}
