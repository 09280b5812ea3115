mod descriptor;
#[cfg(test)]
pub(crate) mod fixtures;
mod piece;

pub use descriptor::{InfoHash, TorrentDescriptor, TorrentFile};
pub(crate) use descriptor::sha1_digest;
pub use piece::{PieceHash, Pieces, HASH_LEN};

use crate::error::Result;
use std::path::Path;
use tokio::fs;

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<TorrentDescriptor> {
    let data = fs::read(path).await?;
    TorrentDescriptor::from_bytes(&data)
}
