use crate::error::TorrentError;

pub const HASH_LEN: usize = 20;

/// SHA-1 digest of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceHash([u8; HASH_LEN]);

impl PieceHash {
    pub fn new(hash: [u8; HASH_LEN]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for PieceHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The piece-hash table, one digest per piece in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pieces {
    hashes: Vec<PieceHash>,
}

impl Pieces {
    /// Split the concatenated `pieces` string into 20-byte digests.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TorrentError> {
        if data.len() % HASH_LEN != 0 {
            return Err(TorrentError::InconsistentPieceTable(format!(
                "'pieces' is {} bytes, not a multiple of {}",
                data.len(),
                HASH_LEN
            )));
        }

        let hashes = data
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(chunk);
                PieceHash(hash)
            })
            .collect();

        Ok(Self { hashes })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PieceHash> {
        self.hashes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceHash> {
        self.hashes.iter()
    }
}
