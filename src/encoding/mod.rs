//! Binary data encodings.
//!
//! - wire: the canonical big-endian record formats and the length-prefixed
//!   frame transport. Used on the wire and in the log files.
//! - bincode: used for the node metadata file.
pub mod bincode;
pub mod wire;
