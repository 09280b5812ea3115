mod files;

pub use files::FileStorage;

use crate::error::StorageError;
use crate::piece::Bitfield;
use crate::torrent::{sha1_digest, TorrentDescriptor};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type StorageResult<T> = std::result::Result<T, StorageError>;

/// Default deadline for a single disk operation
pub const DEFAULT_DISK_TIMEOUT: Duration = Duration::from_secs(30);

/// Verified-piece bookkeeping plus byte-range access to the backing files.
///
/// One store is shared by the session and every peer connection. The
/// completion bitmap sits behind a reader-writer lock and is persisted to a
/// sidecar file after every successful verification.
pub struct PieceStore {
    descriptor: Arc<TorrentDescriptor>,
    files: FileStorage,
    bitfield: RwLock<Bitfield>,
    sidecar: PathBuf,
    disk_timeout: Duration,
}

impl PieceStore {
    /// Open (creating if needed) the backing files under `root` and restore
    /// progress from the sidecar bitmap.
    pub async fn open(descriptor: Arc<TorrentDescriptor>, root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root).await?;
        let files = FileStorage::open(&descriptor, root).await?;
        let sidecar = root.join(format!("{}.bitfield", descriptor.name));
        let bitfield = load_sidecar(&sidecar, descriptor.piece_count()).await?;

        info!(
            "Storage ready: {} files, {} bytes, {}/{} pieces complete",
            descriptor.files.len(),
            descriptor.total_length,
            bitfield.count(),
            descriptor.piece_count()
        );

        Ok(Self {
            descriptor,
            files,
            bitfield: RwLock::new(bitfield),
            sidecar,
            disk_timeout: DEFAULT_DISK_TIMEOUT,
        })
    }

    pub fn with_disk_timeout(mut self, disk_timeout: Duration) -> Self {
        self.disk_timeout = disk_timeout;
        self
    }

    pub fn descriptor(&self) -> &Arc<TorrentDescriptor> {
        &self.descriptor
    }

    pub fn piece_count(&self) -> usize {
        self.descriptor.piece_count()
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar
    }

    async fn bounded<T, F>(&self, what: &'static str, op: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        tokio::time::timeout(self.disk_timeout, op)
            .await
            .map_err(|_| StorageError::Timeout(what))?
    }

    /// Read `length` bytes of the logical stream starting at `offset`.
    pub async fn read_range(&self, offset: u64, length: usize) -> StorageResult<Vec<u8>> {
        self.bounded("disk read", self.files.read(offset, length)).await
    }

    /// Write `data` into the logical stream starting at `offset`.
    pub async fn write_range(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.bounded("disk write", self.files.write(offset, data)).await
    }

    /// Read a whole piece back from disk.
    pub async fn read_piece(&self, index: usize) -> StorageResult<Vec<u8>> {
        let length = self.piece_length_of(index)?;
        self.read_range(self.descriptor.piece_offset(index), length as usize)
            .await
    }

    fn piece_length_of(&self, index: usize) -> StorageResult<u64> {
        self.descriptor
            .piece_len(index)
            .ok_or(StorageError::PieceIndexOutOfRange {
                index,
                piece_count: self.piece_count(),
            })
    }

    /// Hash `data` against piece `index` and, on a match, mark the piece
    /// complete and persist the bitmap.
    ///
    /// Returns `Ok(false)` on a hash or length mismatch; the bitmap is left
    /// untouched. An already-complete piece returns `Ok(true)` without
    /// hashing.
    pub async fn verify_and_commit(&self, index: usize, data: &[u8]) -> StorageResult<bool> {
        let expected_len = self.piece_length_of(index)?;
        if self.has_piece(index).await {
            debug!("Piece {} already complete", index);
            return Ok(true);
        }

        if data.len() as u64 != expected_len {
            warn!(
                "Piece {} has {} bytes, expected {}",
                index,
                data.len(),
                expected_len
            );
            return Ok(false);
        }

        let matches = self
            .descriptor
            .pieces
            .get(index)
            .map(|hash| sha1_digest(data) == *hash.as_bytes())
            .unwrap_or(false);
        if !matches {
            warn!("Piece {} failed hash verification", index);
            return Ok(false);
        }

        let mut bitfield = self.bitfield.write().await;
        if bitfield.has(index) {
            return Ok(true);
        }
        bitfield.set(index);
        if let Err(e) = self
            .bounded("bitfield persist", persist_sidecar(&self.sidecar, &bitfield))
            .await
        {
            bitfield.clear(index);
            return Err(e);
        }

        info!(
            "Piece {} verified ({}/{})",
            index,
            bitfield.count(),
            bitfield.piece_count()
        );
        Ok(true)
    }

    /// Re-hash every piece from disk and rebuild the bitmap from scratch.
    /// Returns the number of pieces found complete.
    pub async fn recheck(&self) -> StorageResult<usize> {
        let mut rebuilt = Bitfield::new(self.piece_count());

        for (index, hash) in self.descriptor.pieces.iter().enumerate() {
            let data = self.read_piece(index).await?;
            if sha1_digest(&data) == *hash.as_bytes() {
                rebuilt.set(index);
            }
        }

        let mut bitfield = self.bitfield.write().await;
        self.bounded("bitfield persist", persist_sidecar(&self.sidecar, &rebuilt))
            .await?;
        *bitfield = rebuilt;

        info!(
            "Recheck found {}/{} pieces complete",
            bitfield.count(),
            bitfield.piece_count()
        );
        Ok(bitfield.count())
    }

    /// Sum of the lengths of every piece not yet verified.
    pub async fn bytes_remaining(&self) -> u64 {
        let bitfield = self.bitfield.read().await;
        bitfield
            .missing()
            .filter_map(|index| self.descriptor.piece_len(index))
            .sum()
    }

    pub async fn has_piece(&self, index: usize) -> bool {
        self.bitfield.read().await.has(index)
    }

    /// Snapshot of the completion bitmap.
    pub async fn bitfield(&self) -> Bitfield {
        self.bitfield.read().await.clone()
    }

    pub async fn completed_count(&self) -> usize {
        self.bitfield.read().await.count()
    }

    pub async fn is_complete(&self) -> bool {
        self.bitfield.read().await.is_complete()
    }
}

async fn load_sidecar(path: &Path, piece_count: usize) -> StorageResult<Bitfield> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let bitfield = Bitfield::new(piece_count);
            persist_sidecar(path, &bitfield).await?;
            return Ok(bitfield);
        }
        Err(e) => {
            warn!("Discarding unreadable progress file {:?}: {}", path, e);
            Vec::new()
        }
    };

    match Bitfield::from_bytes(&bytes, piece_count) {
        Some(bitfield) => Ok(bitfield),
        None => {
            warn!(
                "Progress file {:?} is {} bytes, expected {}; starting over",
                path,
                bytes.len(),
                Bitfield::byte_len(piece_count)
            );
            let bitfield = Bitfield::new(piece_count);
            persist_sidecar(path, &bitfield).await?;
            Ok(bitfield)
        }
    }
}

async fn persist_sidecar(path: &Path, bitfield: &Bitfield) -> StorageResult<()> {
    let tmp = path.with_extension("bitfield.tmp");
    fs::write(&tmp, bitfield.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::fixtures;
    use tempfile::TempDir;

    async fn open_store(descriptor: TorrentDescriptor, root: &Path) -> PieceStore {
        PieceStore::open(Arc::new(descriptor), root).await.unwrap()
    }

    #[tokio::test]
    async fn test_multi_file_range_round_trip() {
        let temp = TempDir::new().unwrap();
        let descriptor = fixtures::multi_file("t", &[5, 3], b"ABCDEFGH", 8);
        let store = open_store(descriptor, temp.path()).await;

        store.write_range(0, b"ABCDEFGH").await.unwrap();
        assert_eq!(store.read_range(0, 8).await.unwrap(), b"ABCDEFGH");

        let dir = temp.path().join("t");
        assert_eq!(std::fs::read(dir.join("f0")).unwrap(), b"ABCDE");
        assert_eq!(std::fs::read(dir.join("f1")).unwrap(), b"FGH");

        assert!(matches!(
            store.read_range(6, 3).await,
            Err(StorageError::RangeOutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_and_commit_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let content = fixtures::content(25);
        let store = open_store(fixtures::single_file("f", &content, 10), temp.path()).await;

        assert!(store.verify_and_commit(1, &content[10..20]).await.unwrap());
        assert!(store.verify_and_commit(1, &content[10..20]).await.unwrap());

        let bitfield = store.bitfield().await;
        assert_eq!(bitfield.count(), 1);
        assert!(bitfield.has(1));
        assert_eq!(std::fs::read(store.sidecar_path()).unwrap(), vec![0x40]);
    }

    #[tokio::test]
    async fn test_mismatch_leaves_bitmap_untouched() {
        let temp = TempDir::new().unwrap();
        let content = fixtures::content(25);
        let store = open_store(fixtures::single_file("f", &content, 10), temp.path()).await;

        assert!(!store.verify_and_commit(0, &[0u8; 10]).await.unwrap());
        assert!(!store.verify_and_commit(2, &content[20..24]).await.unwrap());
        assert_eq!(store.completed_count().await, 0);
        assert!(matches!(
            store.verify_and_commit(3, b"x").await,
            Err(StorageError::PieceIndexOutOfRange { index: 3, piece_count: 3 })
        ));
    }

    #[tokio::test]
    async fn test_bytes_remaining_weights_short_tail() {
        let temp = TempDir::new().unwrap();
        let content = fixtures::content(25);
        let store = open_store(fixtures::single_file("f", &content, 10), temp.path()).await;

        assert_eq!(store.bytes_remaining().await, 25);
        assert!(store.verify_and_commit(2, &content[20..]).await.unwrap());
        assert_eq!(store.bytes_remaining().await, 20);
    }

    #[tokio::test]
    async fn test_progress_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let content = fixtures::content(25);
        let descriptor = fixtures::single_file("f", &content, 10);

        {
            let store = open_store(descriptor.clone(), temp.path()).await;
            store.verify_and_commit(0, &content[..10]).await.unwrap();
        }

        let store = open_store(descriptor, temp.path()).await;
        assert!(store.has_piece(0).await);
        assert!(!store.has_piece(1).await);
    }

    #[tokio::test]
    async fn test_wrong_sized_sidecar_is_discarded() {
        let temp = TempDir::new().unwrap();
        let content = fixtures::content(25);
        std::fs::write(temp.path().join("f.bitfield"), [0xff, 0xff, 0xff]).unwrap();

        let store = open_store(fixtures::single_file("f", &content, 10), temp.path()).await;
        assert_eq!(store.completed_count().await, 0);
        assert_eq!(std::fs::read(store.sidecar_path()).unwrap(), vec![0x00]);
    }

    #[tokio::test]
    async fn test_recheck_finds_pieces_on_disk() {
        let temp = TempDir::new().unwrap();
        let content = fixtures::content(25);
        let store = open_store(fixtures::single_file("f", &content, 10), temp.path()).await;

        store.write_range(0, &content[..10]).await.unwrap();
        store.write_range(20, &content[20..]).await.unwrap();

        assert_eq!(store.recheck().await.unwrap(), 2);
        assert!(store.has_piece(0).await);
        assert!(!store.has_piece(1).await);
        assert!(store.has_piece(2).await);
        assert_eq!(store.bytes_remaining().await, 10);
    }
}
