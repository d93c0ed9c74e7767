use super::NodeId;
use crate::encoding::wire::{self, Reader};
use crate::errdata;
use crate::error::Result;

use std::net::{IpAddr, SocketAddr};

/// The maximum number of members in a cluster config.
pub const MAX_CLUSTER_MEMBERS: usize = 31;

/// A single entry in a cluster config, describing one node: its identifier
/// and its cluster-facing and client-facing addresses. Addresses are bare
/// IP:port pairs, so equality is well-defined without hostname resolution.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConfigEntry {
    pub id: NodeId,
    pub cluster_addr: SocketAddr,
    pub client_addr: SocketAddr,
}

impl ConfigEntry {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        wire::put_uuid(buf, self.id);
        put_addr(buf, self.cluster_addr);
        put_addr(buf, self.client_addr);
    }

    pub fn decode_from(reader: &mut Reader) -> Result<Self> {
        let id = reader.uuid()?;
        let cluster_addr = read_addr(reader)?;
        let client_addr = read_addr(reader)?;
        Ok(Self { id, cluster_addr, client_addr })
    }
}

impl std::fmt::Display for ConfigEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} (cluster {}, client {})", self.id, self.cluster_addr, self.client_addr)
    }
}

/// Encodes an address as a 1-byte IP length (4 or 16), the IP bytes, and a
/// 2-byte port.
fn put_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => wire::put_bytes8(buf, &ip.octets()),
        IpAddr::V6(ip) => wire::put_bytes8(buf, &ip.octets()),
    }
    wire::put_u16(buf, addr.port());
}

fn read_addr(reader: &mut Reader) -> Result<SocketAddr> {
    let ip = match reader.bytes8()? {
        bytes if bytes.len() == 4 => {
            IpAddr::from(<[u8; 4]>::try_from(bytes).expect("checked len"))
        }
        bytes if bytes.len() == 16 => {
            IpAddr::from(<[u8; 16]>::try_from(bytes).expect("checked len"))
        }
        bytes => return errdata!("invalid IP address length {}", bytes.len()),
    };
    let port = reader.u16()?;
    Ok(SocketAddr::new(ip, port))
}

/// The description of a coherent cluster of nodes. The config is just data
/// describing the cluster; it doesn't change based on who is leader or which
/// nodes are online. While a config change is in flight the node tracks two
/// or more configs at once (joint consensus), so equality is element-wise
/// over the entries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterConfig {
    pub entries: Vec<ConfigEntry>,
}

impl ClusterConfig {
    /// Creates a config from a list of entries, enforcing the size bounds.
    pub fn new(entries: Vec<ConfigEntry>) -> Result<Self> {
        if entries.is_empty() || entries.len() > MAX_CLUSTER_MEMBERS {
            return errdata!("cluster config must have 1 to {MAX_CLUSTER_MEMBERS} entries");
        }
        Ok(Self { entries })
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        wire::put_u8(buf, self.entries.len() as u8);
        for entry in &self.entries {
            entry.encode_into(buf);
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let config = Self::decode_from(&mut reader)?;
        reader.done()?;
        Ok(config)
    }

    pub fn decode_from(reader: &mut Reader) -> Result<Self> {
        let count = reader.u8()? as usize;
        if count == 0 || count > MAX_CLUSTER_MEMBERS {
            return errdata!("cluster config must have 1 to {MAX_CLUSTER_MEMBERS} entries");
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(ConfigEntry::decode_from(reader)?);
        }
        Ok(Self { entries })
    }
}
