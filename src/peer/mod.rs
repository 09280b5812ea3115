mod connection;
mod message;
mod protocol;
mod queue;

pub use connection::{Direction, PeerCommand, PeerConnection, PeerContext, PeerEvent};
pub use message::{read_message, write_message, WireMessage, MAX_FRAME_LEN};
pub use protocol::{initiate, respond, Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use queue::SendQueue;

use std::time::Duration;

/// 20-byte peer identifier exchanged in the handshake
pub type PeerId = [u8; 20];

/// Choke and interest flags for one connection.
///
/// The four flags move independently: each is flipped by its own message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Per-connection timeouts and limits.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Longest silence tolerated from the remote
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Idle time after which a keep-alive is sent
    pub keepalive_interval: Duration,
    /// Maximum block requests in flight
    pub pipeline_depth: usize,
    /// Maximum `Piece` responses queued for the remote
    pub max_queued_uploads: usize,
    /// Pick pieces in order instead of randomly
    pub sequential: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(120),
            pipeline_depth: 5,
            max_queued_uploads: 500,
            sequential: false,
        }
    }
}
