//! Torrent save file storage.
//!
//! A torrent save file is the concatenation of the bytes of every piece that
//! overlaps it. The file may start or end in the middle of a piece (multi-file
//! torrents), so the storage knows the absolute byte span it holds and clips
//! writes to it.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{PieceStore, StorageError, check_piece_length, check_piece_range};
use crate::pieces::Piece;

/// File-backed storage for one save file.
pub struct FileStorage {
    path: PathBuf,
    span: Range<u64>,
    file: Mutex<File>,
}

impl FileStorage {
    /// Opens (creating if needed) the save file at `path`, which holds the
    /// absolute torrent bytes in `span`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the file cannot be opened or sized
    pub async fn open(path: impl AsRef<Path>, span: Range<u64>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        let length = span.end.saturating_sub(span.start);
        if file.metadata().await?.len() < length {
            file.set_len(length).await?;
        }

        tracing::debug!(
            "Opened save file {} for bytes {}..{}",
            path.display(),
            span.start,
            span.end
        );
        Ok(Self {
            path,
            span,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute torrent byte range held by the file.
    pub fn span(&self) -> Range<u64> {
        self.span.clone()
    }

    /// Intersection of `absolute` with the file span, as file positions.
    fn file_range(&self, absolute: Range<u64>) -> Option<Range<u64>> {
        let start = absolute.start.max(self.span.start);
        let end = absolute.end.min(self.span.end);
        (start < end).then(|| start - self.span.start..end - self.span.start)
    }
}

#[async_trait]
impl PieceStore for FileStorage {
    async fn read_piece(
        &self,
        piece: Piece,
        offset_in_piece: u64,
        length: usize,
    ) -> Result<Bytes, StorageError> {
        check_piece_range(piece, offset_in_piece, length)?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        let absolute_start = piece.offset() + offset_in_piece;
        let absolute = absolute_start..absolute_start + length as u64;
        let Some(range) = self.file_range(absolute.clone()).filter(|range| {
            range.end - range.start == length as u64
        }) else {
            return Err(StorageError::ShortRead {
                index: piece.index(),
                expected: length,
                actual: self
                    .file_range(absolute)
                    .map(|range| (range.end - range.start) as usize)
                    .unwrap_or(0),
            });
        };

        let mut buffer = vec![0u8; length];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(range.start)).await?;
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }

    async fn write_piece(&self, piece: Piece, piece_bytes: &[u8]) -> Result<(), StorageError> {
        check_piece_length(piece, piece_bytes)?;

        let Some(range) = self.file_range(piece.offset()..piece.end_offset()) else {
            return Ok(());
        };
        let skip = (range.start + self.span.start - piece.offset()) as usize;
        let take = (range.end - range.start) as usize;

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(range.start)).await?;
        file.write_all(&piece_bytes[skip..skip + take]).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pieces::PieceIndex;

    #[tokio::test]
    async fn test_pieces_land_at_their_file_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        let storage = FileStorage::open(&path, 0..25).await.unwrap();

        let second = Piece::new(PieceIndex::new(1), 10, 10);
        storage.write_piece(second, b"abcdefghij").await.unwrap();
        assert_eq!(storage.read_piece(second, 3, 4).await.unwrap(), &b"defg"[..]);

        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk.len(), 25);
        assert_eq!(&on_disk[10..20], b"abcdefghij");
    }

    #[tokio::test]
    async fn test_writes_are_clipped_to_the_span() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("episode.mp4");
        // The file holds absolute bytes 1008..1020 of pieces sized 16.
        let storage = FileStorage::open(&path, 1008..1020).await.unwrap();

        let piece = Piece::new(PieceIndex::new(0), 1000, 16);
        storage
            .write_piece(piece, b"xxxxxxxxLorem Ipsu")
            .await
            .unwrap_err();
        storage.write_piece(piece, b"xxxxxxxxLorem Ip").await.unwrap();

        assert_eq!(storage.read_piece(piece, 8, 8).await.unwrap(), &b"Lorem Ip"[..]);
        assert!(matches!(
            storage.read_piece(piece, 0, 8).await,
            Err(StorageError::ShortRead { actual: 0, .. })
        ));

        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk, b"Lorem Ip\0\0\0\0");
    }
}
