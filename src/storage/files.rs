use crate::error::StorageError;
use crate::torrent::TorrentDescriptor;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::debug;

type StorageResult<T> = std::result::Result<T, StorageError>;

/// A backing file and its place in the logical byte stream.
struct FileSlot {
    path: PathBuf,
    /// Global offset in the torrent
    offset: u64,
    length: u64,
    /// Serializes writes to this file against reads and other writes
    lock: RwLock<()>,
}

/// The part of one file covered by a global byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    file: usize,
    file_offset: u64,
    /// Position of this segment within the caller's buffer
    buf_start: usize,
    len: usize,
}

/// Maps global byte ranges onto the ordered list of backing files.
pub struct FileStorage {
    files: Vec<FileSlot>,
    total_length: u64,
}

impl FileStorage {
    /// Create missing directories and files, extending each file to its
    /// declared length without writing data.
    pub async fn open(descriptor: &TorrentDescriptor, root: &Path) -> StorageResult<Self> {
        let mut files = Vec::with_capacity(descriptor.files.len());
        let mut offset = 0u64;

        for file in &descriptor.files {
            let path = descriptor.file_location(root, file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }

            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;
            if handle.metadata().await?.len() < file.length {
                handle.set_len(file.length).await?;
            }

            debug!("Backing file {:?} ({} bytes at offset {})", path, file.length, offset);

            files.push(FileSlot {
                path,
                offset,
                length: file.length,
                lock: RwLock::new(()),
            });
            offset += file.length;
        }

        Ok(Self {
            files,
            total_length: offset,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    fn segments(&self, offset: u64, length: usize) -> StorageResult<Vec<Segment>> {
        let end = offset
            .checked_add(length as u64)
            .filter(|&end| end <= self.total_length)
            .ok_or(StorageError::RangeOutOfBounds {
                offset,
                length: length as u64,
                total: self.total_length,
            })?;

        let mut segments = Vec::new();
        for (index, file) in self.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if file.length == 0 || file_end <= offset {
                continue;
            }
            if file.offset >= end {
                break;
            }

            let start = offset.max(file.offset);
            let stop = end.min(file_end);
            segments.push(Segment {
                file: index,
                file_offset: start - file.offset,
                buf_start: (start - offset) as usize,
                len: (stop - start) as usize,
            });
        }

        Ok(segments)
    }

    /// Read `length` bytes starting at global `offset`.
    pub async fn read(&self, offset: u64, length: usize) -> StorageResult<Vec<u8>> {
        let mut buffer = vec![0u8; length];

        for segment in self.segments(offset, length)? {
            let slot = &self.files[segment.file];
            let _guard = slot.lock.read().await;

            let mut file = File::open(&slot.path).await?;
            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.read_exact(&mut buffer[segment.buf_start..segment.buf_start + segment.len])
                .await?;
        }

        Ok(buffer)
    }

    /// Write `data` starting at global `offset`, splitting it across files.
    pub async fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        for segment in self.segments(offset, data.len())? {
            let slot = &self.files[segment.file];
            let _guard = slot.lock.write().await;

            let mut file = OpenOptions::new().write(true).open(&slot.path).await?;
            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.write_all(&data[segment.buf_start..segment.buf_start + segment.len])
                .await?;
            file.flush().await?;

            debug!(
                "Wrote {} bytes to {:?} at offset {}",
                segment.len, slot.path, segment.file_offset
            );
        }

        Ok(())
    }
}
