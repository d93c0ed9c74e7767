//! The disk worker. Owns the log store and processes requests strictly in
//! order, so commit completions are reported in submission order as the
//! core's commit engine requires. A log store failure is fatal: the node
//! terminates rather than acknowledge unpersisted commits.

use super::Command;
use crate::error::Result;
use crate::storage::{LogStore, NodeMeta};
use crate::types::{Event, Mutation, TopicName};

use crossbeam::channel::{Receiver, Sender};
use log::error;

/// A request to the disk worker.
pub enum DiskRequest {
    /// Persist a mutation and its event batch.
    Commit { mutation: Mutation, events: Vec<Event> },
    /// Fetch a committed mutation.
    FetchMutation { offset: u64 },
    /// Fetch a committed event.
    FetchEvent { topic: TopicName, local: u64 },
    /// Persist the node metadata.
    SaveMeta { meta: NodeMeta },
}

pub fn run(mut store: LogStore, rx: Receiver<DiskRequest>, cmd_tx: Sender<Command>) {
    for request in rx {
        if let Err(err) = process(&mut store, request, &cmd_tx) {
            error!("Log store failure: {err}");
            std::process::exit(1);
        }
    }
}

fn process(store: &mut LogStore, request: DiskRequest, cmd_tx: &Sender<Command>) -> Result<()> {
    match request {
        DiskRequest::Commit { mutation, events } => {
            store.commit(&mutation, &events)?;
            cmd_tx.send(Command::Committed { mutation }).ok();
        }
        DiskRequest::FetchMutation { offset } => {
            let prev_term = store.term_at(offset - 1)?;
            let mutation = store.fetch(offset)?;
            cmd_tx.send(Command::MutationFetched { mutation, prev_term }).ok();
        }
        DiskRequest::FetchEvent { topic, local } => {
            let event = store.fetch_event(&topic, local)?;
            cmd_tx.send(Command::EventFetched { event }).ok();
        }
        DiskRequest::SaveMeta { meta } => store.save_meta(meta)?,
    }
    Ok(())
}
