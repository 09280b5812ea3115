//! A BitTorrent client: bencode codec, torrent descriptors, a verified piece
//! store over multi-file storage, the peer wire protocol engine, and the
//! session that ties them to trackers.

pub mod bencode;
pub mod cli;
pub mod client;
pub mod error;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::{BittorrentError, Result};
