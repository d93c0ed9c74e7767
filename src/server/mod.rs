//! The node runtime. Collaborators (client gateway, peer gateway, log store,
//! console) perform I/O on their own threads and communicate with the core
//! exclusively by enqueueing commands onto a single serialized queue; the
//! main worker drains the queue, drives the consensus core, and routes its
//! effects back out. Every state-mutating operation runs to completion
//! before the next command is dequeued, which gives a total order on all
//! state transitions without locks.

pub mod client;
pub mod console;
pub mod disk;
pub mod peer;

use crate::error::Result;
use crate::raft::{Effect, Envelope, Node, RawRuntime, Restore};
use crate::storage::{LogStore, NodeMeta};
use crate::types::{ClusterConfig, ConfigEntry, Event, Mutation, NodeId, Request, Term};
use client::{Sessions, Token};
use disk::DiskRequest;
use peer::PeerLinks;

use crossbeam::channel::{Receiver, Sender};
use log::info;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// The duration of a tick, the unit of time for heartbeats and elections.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A command enqueued for the main worker by a collaborator thread.
pub enum Command {
    /// A client connection opened; frames to it go through the sender.
    ClientConnected { token: Token, tx: Sender<Vec<u8>> },
    /// A client request arrived.
    ClientRequest { token: Token, request: Request },
    /// A client connection closed or misbehaved.
    ClientDisconnected { token: Token },
    /// An inbound peer connection identified itself; replies to it go
    /// through the sender.
    PeerConnected { entry: ConfigEntry, tx: Sender<Vec<u8>> },
    /// A peer message arrived.
    PeerMessage { from: NodeId, envelope: Envelope },
    /// A peer link dropped. `downstream` is set for links this node dialed.
    PeerDisconnected { id: NodeId, downstream: bool },
    /// The log store committed a mutation and its events.
    Committed { mutation: Mutation },
    /// The log store fetched a mutation; `prev_term` is the term of the
    /// preceding record, for replication probes.
    MutationFetched { mutation: Mutation, prev_term: Term },
    /// The log store fetched an event for a catching-up listener.
    EventFetched { event: Event },
}

/// A laminar node server.
pub struct Server {
    entry: ConfigEntry,
    config: ClusterConfig,
    store: LogStore,
    restore: Restore,
}

impl Server {
    /// Opens the data directory and prepares a node advertising the given
    /// addresses. The node id is generated on first start and persisted; the
    /// active config is recovered from the log, falling back to a bootstrap
    /// config containing only this node.
    pub fn new(dir: &Path, cluster_addr: SocketAddr, client_addr: SocketAddr) -> Result<Self> {
        let (mut store, recovery) = LogStore::open(dir, true)?;
        let mut meta = recovery.meta;
        if meta.id.is_nil() {
            meta.id = Uuid::new_v4();
            store.save_meta(meta)?;
        }
        let entry = ConfigEntry { id: meta.id, cluster_addr, client_addr };
        let config = recovery
            .config
            .unwrap_or_else(|| ClusterConfig { entries: vec![entry.clone()] });
        let restore = Restore {
            term: meta.term.max(recovery.last_term),
            voted_in: meta.voted_in,
            last_offset: recovery.last_offset,
            last_term: recovery.last_term,
            topics: recovery.topics,
        };
        info!("Node {} starting with a config of {} members", entry.id, config.entries.len());
        Ok(Self { entry, config, store, restore })
    }

    /// The entry this node advertises to peers and clients.
    pub fn entry(&self) -> &ConfigEntry {
        &self.entry
    }

    /// Serves until a stop arrives on the given channel. The listeners are
    /// bound by the caller so that startup failures surface before any
    /// threads exist.
    pub fn serve(
        self,
        client_listener: TcpListener,
        peer_listener: TcpListener,
        stop_rx: Receiver<()>,
    ) -> Result<()> {
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded::<Command>();
        let (effect_tx, effect_rx) = crossbeam::channel::unbounded::<Effect>();
        let (disk_tx, disk_rx) = crossbeam::channel::unbounded::<DiskRequest>();

        let id = self.entry.id;
        let disk_cmd_tx = cmd_tx.clone();
        let store = self.store;
        std::thread::spawn(move || disk::run(store, disk_rx, disk_cmd_tx));
        client::accept(client_listener, cmd_tx.clone());
        peer::accept(peer_listener, cmd_tx.clone());

        let mut node = Node::new(
            self.entry.clone(),
            self.config,
            self.restore,
            Box::new(RawRuntime),
            effect_tx,
        )?;
        let mut sessions = Sessions::new(disk_tx.clone());
        let mut peers = PeerLinks::new(cmd_tx.clone(), self.entry);
        let ticker = crossbeam::channel::tick(TICK_INTERVAL);

        // Route the initial effects (downstream connects, metadata).
        Self::effects(&effect_rx, id, &mut node, &mut sessions, &mut peers, &disk_tx)?;

        loop {
            crossbeam::channel::select! {
                recv(ticker) -> _ => node = node.tick()?,
                recv(cmd_rx) -> command => match command {
                    Ok(command) => node = Self::command(command, node, &mut sessions, &mut peers)?,
                    Err(_) => break,
                },
                recv(stop_rx) -> _ => {
                    info!("Shutting down");
                    // Drain what is already queued, then tear down.
                    while let Ok(command) = cmd_rx.try_recv() {
                        node = Self::command(command, node, &mut sessions, &mut peers)?;
                    }
                    Self::effects(&effect_rx, id, &mut node, &mut sessions, &mut peers, &disk_tx)?;
                    break;
                }
            }
            Self::effects(&effect_rx, id, &mut node, &mut sessions, &mut peers, &disk_tx)?;
        }
        Ok(())
    }

    /// Processes a single command against the core.
    fn command(
        command: Command,
        mut node: Node,
        sessions: &mut Sessions,
        peers: &mut PeerLinks,
    ) -> Result<Node> {
        match command {
            Command::ClientConnected { token, tx } => sessions.connected(token, tx),
            Command::ClientRequest { token, request } => {
                sessions.request(&mut node, token, request)?
            }
            Command::ClientDisconnected { token } => sessions.disconnected(token),
            Command::PeerConnected { entry, tx } => peers.register_inbound(entry.id, tx),
            Command::PeerMessage { from, envelope } => return node.step(from, envelope),
            Command::PeerDisconnected { id, downstream } => {
                if downstream {
                    node.disconnected(id);
                }
            }
            Command::Committed { mutation } => node.committed(mutation)?,
            Command::MutationFetched { mutation, prev_term } => {
                node.fetched(&mutation, prev_term)?;
                sessions.mutation_fetched(&mutation, &mut node)?;
            }
            Command::EventFetched { event } => sessions.event_fetched(&event, &node)?,
        }
        Ok(node)
    }

    /// Routes the core's pending effects to the collaborators. Session
    /// handling may itself produce new effects (e.g. fetch requests from
    /// reconnect scans), so this drains until the channel is empty.
    fn effects(
        effects: &Receiver<Effect>,
        id: NodeId,
        node: &mut Node,
        sessions: &mut Sessions,
        peers: &mut PeerLinks,
        disk_tx: &Sender<DiskRequest>,
    ) -> Result<()> {
        while let Ok(effect) = effects.try_recv() {
            match effect {
                Effect::Send(to, envelope) => peers.send(to, &envelope),
                Effect::Connect(entry) => peers.connect(entry),
                Effect::Disconnect(peer) => peers.disconnect(peer),
                Effect::CommitLog { mutation, events } => {
                    disk_tx.send(DiskRequest::Commit { mutation, events })?
                }
                Effect::FetchLog { offset } => {
                    disk_tx.send(DiskRequest::FetchMutation { offset })?
                }
                Effect::SaveMeta { term, voted_in } => {
                    disk_tx.send(DiskRequest::SaveMeta { meta: NodeMeta { id, term, voted_in } })?
                }
                Effect::Committed { mutation, error } => sessions.committed(&mutation, error),
                Effect::EventsCommitted { events } => sessions.events_committed(&events),
                Effect::ConfigCommitted { config } => sessions.config_committed(&config),
                Effect::Redirect { leader } => sessions.redirect_all(&leader, node.commit_offset()),
            }
        }
        Ok(())
    }
}
