//! Raft log entries and cluster configurations.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::{LogIndex, ServerId, Term};

/// What an entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// An opaque state-machine command.
    Command,
    /// A full cluster configuration (voter set change).
    Configuration,
    /// A leader-establishment entry with no payload; lets a fresh leader
    /// commit entries from earlier terms.
    Noop,
}

/// One entry in the raft log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Term in which the entry was created.
    pub term: Term,
    /// Position in the log (1-based).
    pub index: LogIndex,
    /// What the payload is.
    pub kind: EntryKind,
    /// The payload; empty for noop entries.
    pub data: Bytes,
}

impl Entry {
    /// Creates a new entry.
    #[must_use]
    pub const fn new(term: Term, index: LogIndex, kind: EntryKind, data: Bytes) -> Self {
        Self {
            term,
            index,
            kind,
            data,
        }
    }
}

/// One server in a cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// The server's id (its node name).
    pub id: ServerId,
    /// The server's raft address, host:port of the multiplexed listener.
    pub addr: String,
}

/// The voter set of the cluster.
///
/// Configurations are replicated as log entries and take effect as soon
/// as they are appended; the latest configuration in the log wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    /// All voting servers, local node included.
    pub servers: Vec<Server>,
}

impl Configuration {
    /// A configuration with a single voter.
    #[must_use]
    pub fn single(id: ServerId, addr: String) -> Self {
        Self {
            servers: vec![Server { id, addr }],
        }
    }

    /// Returns true when `id` is a voter.
    #[must_use]
    pub fn contains(&self, id: &ServerId) -> bool {
        self.servers.iter().any(|s| &s.id == id)
    }

    /// Looks up a voter's address.
    #[must_use]
    pub fn addr_of(&self, id: &ServerId) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| &s.id == id)
            .map(|s| s.addr.as_str())
    }

    /// The quorum size (strict majority) of this configuration.
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.servers.len() / 2 + 1
    }

    /// Every voter except `id`.
    #[must_use]
    pub fn peers_of(&self, id: &ServerId) -> Vec<Server> {
        self.servers.iter().filter(|s| &s.id != id).cloned().collect()
    }

    /// Encodes the configuration for storage in an entry payload.
    ///
    /// Layout, big-endian: `u32` server count, then per server a
    /// length-prefixed id and a length-prefixed address.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // lengths bounded by cluster limits
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.servers.len() as u32);
        for server in &self.servers {
            let id = server.id.as_str().as_bytes();
            buf.put_u32(id.len() as u32);
            buf.put_slice(id);
            buf.put_u32(server.addr.len() as u32);
            buf.put_slice(server.addr.as_bytes());
        }
        buf.freeze()
    }

    /// Decodes a configuration from an entry payload.
    ///
    /// Returns `None` if the payload is malformed.
    #[must_use]
    pub fn decode(mut data: &[u8]) -> Option<Self> {
        if data.remaining() < 4 {
            return None;
        }
        let count = data.get_u32();
        let mut servers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = take_string(&mut data)?;
            let addr = take_string(&mut data)?;
            servers.push(Server {
                id: ServerId::new(id),
                addr,
            });
        }
        Some(Self { servers })
    }
}

fn take_string(data: &mut &[u8]) -> Option<String> {
    if data.remaining() < 4 {
        return None;
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return None;
    }
    let bytes = data[..len].to_vec();
    data.advance(len);
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_roundtrip() {
        let config = Configuration {
            servers: vec![
                Server {
                    id: ServerId::new("node-0"),
                    addr: "127.0.0.1:9001".to_string(),
                },
                Server {
                    id: ServerId::new("node-1"),
                    addr: "127.0.0.1:9002".to_string(),
                },
            ],
        };

        let decoded = Configuration::decode(&config.encode()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let config = Configuration::single(ServerId::new("a"), "addr".to_string());
        let encoded = config.encode();
        assert!(Configuration::decode(&encoded[..encoded.len() - 1]).is_none());
    }

    #[test]
    fn test_quorum() {
        let one = Configuration::single(ServerId::new("a"), String::new());
        assert_eq!(one.quorum(), 1);

        let mut three = one.clone();
        three.servers.push(Server {
            id: ServerId::new("b"),
            addr: String::new(),
        });
        three.servers.push(Server {
            id: ServerId::new("c"),
            addr: String::new(),
        });
        assert_eq!(three.quorum(), 2);
    }
}
