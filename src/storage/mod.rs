//! The durable log store: an append-only global mutation log plus one event
//! log per topic, with random fetch by offset.

mod log;

pub use log::{LogStore, NodeMeta, Recovery};
