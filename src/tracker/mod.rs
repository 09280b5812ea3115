mod client;
mod peer;
mod request;
mod response;

pub use client::TrackerClient;
pub use peer::{Peer, COMPACT_PEER_LEN};
pub use request::{TrackerEvent, TrackerRequest};
pub use response::TrackerResponse;

use crate::peer::PeerId;
use rand::Rng;

/// Generate a random peer ID
/// Format: -BW0001-<12 random chars>
pub fn generate_peer_id() -> PeerId {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-BW0001-");

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.gen_range(b'0'..=b'z');
    }

    peer_id
}
