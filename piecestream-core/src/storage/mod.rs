//! Storage seam for finished piece bytes.
//!
//! The download engine persists verified pieces; the streaming reader only
//! reads pieces the state machine reports as finished. Implementations:
//! [`FileStorage`] for a torrent save file and [`MemoryStorage`] for tests
//! and simulation.

pub mod file_storage;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

pub use file_storage::FileStorage;
pub use memory::MemoryStorage;

use crate::pieces::{Piece, PieceIndex};

/// Read and write access to piece bytes.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Reads `length` bytes starting `offset_in_piece` bytes into `piece`.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfPieceBounds` - If the range leaves the piece
    /// - `StorageError::PieceNotFound` - If the piece was never stored
    /// - `StorageError::ShortRead` - If fewer bytes were available than requested
    /// - `StorageError::Io` - If the backing file failed
    async fn read_piece(
        &self,
        piece: Piece,
        offset_in_piece: u64,
        length: usize,
    ) -> Result<Bytes, StorageError>;

    /// Persists a complete piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceSizeMismatch` - If `piece_bytes` is not exactly the piece size
    /// - `StorageError::Io` - If the backing file failed
    async fn write_piece(&self, piece: Piece, piece_bytes: &[u8]) -> Result<(), StorageError>;
}

/// Errors that occur while reading or writing piece data.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Requested piece has not been stored.
    #[error("Piece {index} not found")]
    PieceNotFound {
        /// Index of the missing piece.
        index: PieceIndex,
    },

    /// A read range that does not fit inside its piece.
    #[error("Range {offset}+{length} is outside piece {index} of {size} bytes")]
    OutOfPieceBounds {
        /// Piece addressed.
        index: PieceIndex,
        /// Offset within the piece.
        offset: u64,
        /// Requested length.
        length: usize,
        /// Size of the piece.
        size: u64,
    },

    /// Data handed to `write_piece` does not match the piece size.
    #[error("Piece {index} expects {expected} bytes, got {actual}")]
    PieceSizeMismatch {
        /// Piece written.
        index: PieceIndex,
        /// Piece size.
        expected: u64,
        /// Bytes provided.
        actual: usize,
    },

    /// Backing storage returned fewer bytes than requested.
    #[error("Short read on piece {index}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Piece read.
        index: PieceIndex,
        /// Bytes requested.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Standard I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validates that `offset_in_piece..offset_in_piece + length` lies inside `piece`.
pub(crate) fn check_piece_range(
    piece: Piece,
    offset_in_piece: u64,
    length: usize,
) -> Result<(), StorageError> {
    let in_bounds = offset_in_piece
        .checked_add(length as u64)
        .is_some_and(|end| end <= piece.size());
    if in_bounds {
        Ok(())
    } else {
        Err(StorageError::OutOfPieceBounds {
            index: piece.index(),
            offset: offset_in_piece,
            length,
            size: piece.size(),
        })
    }
}

pub(crate) fn check_piece_length(piece: Piece, piece_bytes: &[u8]) -> Result<(), StorageError> {
    if piece_bytes.len() as u64 == piece.size() {
        Ok(())
    } else {
        Err(StorageError::PieceSizeMismatch {
            index: piece.index(),
            expected: piece.size(),
            actual: piece_bytes.len(),
        })
    }
}
