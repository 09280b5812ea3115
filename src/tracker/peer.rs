use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Size of one entry in a compact peer list
pub const COMPACT_PEER_LEN: usize = 6;

/// Represents a peer in the swarm
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: SocketAddr,
    pub peer_id: Option<Vec<u8>>,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            peer_id: None,
        }
    }

    pub fn with_peer_id(ip: IpAddr, port: u16, peer_id: Vec<u8>) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            peer_id: Some(peer_id),
        }
    }

    /// Parse a peer from compact format (6 bytes: 4 IP + 2 port)
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_PEER_LEN {
            return None;
        }

        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let port = u16::from_be_bytes([data[4], data[5]]);

        Some(Self::new(IpAddr::V4(ip), port))
    }

    /// Parse a compact peer list; `None` unless the length is a multiple of 6.
    pub fn from_compact_list(data: &[u8]) -> Option<Vec<Self>> {
        if data.len() % COMPACT_PEER_LEN != 0 {
            return None;
        }
        data.chunks_exact(COMPACT_PEER_LEN)
            .map(Self::from_compact)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_list() {
        let data = [127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = Peer::from_compact_list(&data).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].addr, "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1].addr, "10.0.0.2:80".parse().unwrap());
    }

    #[test]
    fn test_compact_list_rejects_partial_entry() {
        assert!(Peer::from_compact_list(&[127, 0, 0, 1, 0x1a]).is_none());
        assert!(Peer::from_compact_list(&[]).unwrap().is_empty());
    }
}
