//! In-memory piece storage.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{PieceStore, StorageError, check_piece_length, check_piece_range};
use crate::pieces::{Piece, PieceIndex};

/// Keeps every written piece in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pieces: RwLock<HashMap<PieceIndex, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `piece_bytes` for `index` without size validation.
    pub fn insert(&self, index: PieceIndex, piece_bytes: impl Into<Bytes>) {
        self.pieces.write().insert(index, piece_bytes.into());
    }

    pub fn contains(&self, index: PieceIndex) -> bool {
        self.pieces.read().contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.pieces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.read().is_empty()
    }
}

#[async_trait]
impl PieceStore for MemoryStorage {
    async fn read_piece(
        &self,
        piece: Piece,
        offset_in_piece: u64,
        length: usize,
    ) -> Result<Bytes, StorageError> {
        check_piece_range(piece, offset_in_piece, length)?;

        let stored = self
            .pieces
            .read()
            .get(&piece.index())
            .cloned()
            .ok_or(StorageError::PieceNotFound {
                index: piece.index(),
            })?;

        let start = offset_in_piece as usize;
        let end = start + length;
        if end > stored.len() {
            return Err(StorageError::ShortRead {
                index: piece.index(),
                expected: length,
                actual: stored.len().saturating_sub(start),
            });
        }
        Ok(stored.slice(start..end))
    }

    async fn write_piece(&self, piece: Piece, piece_bytes: &[u8]) -> Result<(), StorageError> {
        check_piece_length(piece, piece_bytes)?;
        self.insert(piece.index(), Bytes::copy_from_slice(piece_bytes));
        Ok(())
    }
}
