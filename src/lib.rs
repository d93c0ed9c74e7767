#![warn(clippy::all)]
#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod raft;
pub mod server;
pub mod storage;
pub mod types;

pub use client::{Client, Listener};
pub use server::Server;
