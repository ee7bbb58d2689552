//! Download engine seam.
//!
//! The engine is the only writer of piece state. [`EngineBridge`] is the
//! write side it drives: it verifies arriving piece bytes against their
//! expected digests, persists them, and only then marks pieces finished,
//! so readers never observe unverified data.

#[cfg(feature = "simulation")]
pub mod simulation;

use std::sync::Arc;

use crate::pieces::{PieceError, PieceIndex, PieceList, PieceState};
use crate::storage::{PieceStore, StorageError};
use crate::streaming::StreamingError;
use crate::verify::{PieceDigest, hash_bytes};

/// Errors raised while applying engine results.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Piece bookkeeping rejected the update.
    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    /// Verified bytes could not be persisted or read back.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The engine referenced a piece this bridge does not own.
    #[error("Unknown piece {index}")]
    UnknownPiece {
        /// Index that was not found.
        index: PieceIndex,
    },

    /// Piece bytes hashed to something other than the expected digest.
    #[error("Piece {index} digest mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Piece that failed verification.
        index: PieceIndex,
        /// Digest from the torrent metadata.
        expected: PieceDigest,
        /// Digest of the bytes received.
        actual: PieceDigest,
    },

    /// Expected digests do not line up with the pieces.
    #[error("Expected {expected} piece digests, got {actual}")]
    DigestCountMismatch {
        /// Number of pieces.
        expected: usize,
        /// Number of digests supplied.
        actual: usize,
    },
}

impl EngineError {
    /// Returns true if re-fetching the piece may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::IntegrityMismatch { .. } | EngineError::Storage(_)
        )
    }
}

impl From<EngineError> for StreamingError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::IntegrityMismatch { index, .. } => {
                StreamingError::IntegrityMismatch { index }
            }
            EngineError::Piece(error) => StreamingError::from(error),
            EngineError::Storage(error) => StreamingError::Storage(error),
            EngineError::UnknownPiece { index } => {
                StreamingError::invalid_range(format!("unknown piece {index}"))
            }
            EngineError::DigestCountMismatch { expected, actual } => {
                StreamingError::invalid_range(format!(
                    "expected {expected} piece digests, got {actual}"
                ))
            }
        }
    }
}

/// Engine-facing write API over a piece list and its storage.
pub struct EngineBridge {
    pieces: PieceList,
    storage: Arc<dyn PieceStore>,
    digests: Option<Vec<PieceDigest>>,
}

impl EngineBridge {
    /// Creates a bridge that trusts piece bytes without verification.
    pub fn new(pieces: PieceList, storage: Arc<dyn PieceStore>) -> Self {
        Self {
            pieces,
            storage,
            digests: None,
        }
    }

    /// Creates a bridge verifying every piece against `digests`, given in
    /// piece order.
    ///
    /// # Errors
    ///
    /// - `EngineError::DigestCountMismatch` - If there is not one digest per piece
    pub fn with_digests(
        pieces: PieceList,
        storage: Arc<dyn PieceStore>,
        digests: Vec<PieceDigest>,
    ) -> Result<Self, EngineError> {
        if digests.len() != pieces.len() {
            return Err(EngineError::DigestCountMismatch {
                expected: pieces.len(),
                actual: digests.len(),
            });
        }
        Ok(Self {
            pieces,
            storage,
            digests: Some(digests),
        })
    }

    pub fn pieces(&self) -> &PieceList {
        &self.pieces
    }

    pub fn storage(&self) -> &Arc<dyn PieceStore> {
        &self.storage
    }

    /// Digest the piece must hash to, if verification is enabled.
    pub fn expected_digest(&self, index: PieceIndex) -> Option<&PieceDigest> {
        let position = index.as_u32().checked_sub(self.pieces.first_index().as_u32())?;
        self.digests.as_ref()?.get(position as usize)
    }

    /// Marks a piece as being fetched.
    ///
    /// # Errors
    ///
    /// - `EngineError::Piece` - If the piece is unknown or not `Ready`/`Failed`
    pub fn begin_download(&self, index: PieceIndex) -> Result<(), EngineError> {
        self.pieces.transition(index, PieceState::Downloading)?;
        tracing::trace!("Piece {} downloading", index);
        Ok(())
    }

    /// Verifies, stores and finishes a downloaded piece.
    ///
    /// On a digest mismatch or a storage failure the piece moves to `Failed`
    /// and its bytes are never exposed to readers.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownPiece` - If the piece is not in this bridge
    /// - `EngineError::Piece` - If the piece is not `Downloading`
    /// - `EngineError::IntegrityMismatch` - If the bytes fail verification
    /// - `EngineError::Storage` - If the bytes cannot be persisted
    pub async fn complete_download(
        &self,
        index: PieceIndex,
        piece_bytes: &[u8],
    ) -> Result<(), EngineError> {
        let piece = self
            .pieces
            .get(index)
            .ok_or(EngineError::UnknownPiece { index })?;
        let state = self.pieces.state(index)?;
        if state != PieceState::Downloading {
            return Err(PieceError::IllegalTransition {
                index,
                from: state,
                to: PieceState::Finished,
            }
            .into());
        }

        if let Err(error) = self.check_digest(index, piece_bytes) {
            tracing::warn!("{}", error);
            self.pieces.transition(index, PieceState::Failed)?;
            return Err(error);
        }

        if let Err(error) = self.storage.write_piece(piece, piece_bytes).await {
            tracing::warn!("Failed to store piece {}: {}", index, error);
            self.pieces.transition(index, PieceState::Failed)?;
            return Err(error.into());
        }

        self.pieces.transition(index, PieceState::Finished)?;
        tracing::debug!("Piece {} finished ({} bytes)", index, piece.size());
        Ok(())
    }

    /// Gives up on the current attempt for a piece.
    ///
    /// # Errors
    ///
    /// - `EngineError::Piece` - If the piece is unknown or not `Downloading`
    pub fn fail_download(&self, index: PieceIndex) -> Result<(), EngineError> {
        self.pieces.transition(index, PieceState::Failed)?;
        tracing::debug!("Piece {} failed", index);
        Ok(())
    }

    /// Marks a piece already present in storage as finished after checking
    /// its bytes. Used when resuming a download.
    ///
    /// Returns false, leaving the piece untouched, if the stored bytes are
    /// missing or fail verification.
    ///
    /// # Errors
    ///
    /// - `EngineError::Piece` - If the piece is unknown or not `Ready`/`Failed`
    pub async fn restore_verified(&self, index: PieceIndex) -> Result<bool, EngineError> {
        match self.verify_stored(index).await {
            Ok(()) => {}
            Err(EngineError::Storage(_) | EngineError::IntegrityMismatch { .. }) => {
                return Ok(false);
            }
            Err(error) => return Err(error),
        }

        self.pieces.transition(index, PieceState::Downloading)?;
        self.pieces.transition(index, PieceState::Finished)?;
        tracing::debug!("Piece {} restored from storage", index);
        Ok(true)
    }

    /// Re-reads a stored piece and checks it against its expected digest.
    ///
    /// Succeeds without hashing when verification is disabled.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownPiece` - If the piece is not in this bridge
    /// - `EngineError::Storage` - If the piece cannot be read back
    /// - `EngineError::IntegrityMismatch` - If the stored bytes fail verification
    pub async fn verify_stored(&self, index: PieceIndex) -> Result<(), EngineError> {
        let piece = self
            .pieces
            .get(index)
            .ok_or(EngineError::UnknownPiece { index })?;
        let stored = self
            .storage
            .read_piece(piece, 0, piece.size() as usize)
            .await?;
        self.check_digest(index, &stored)
    }

    fn check_digest(&self, index: PieceIndex, piece_bytes: &[u8]) -> Result<(), EngineError> {
        let Some(expected) = self.expected_digest(index) else {
            return Ok(());
        };
        let actual = hash_bytes(expected.algorithm(), piece_bytes);
        if actual == *expected {
            Ok(())
        } else {
            Err(EngineError::IntegrityMismatch {
                index,
                expected: expected.clone(),
                actual,
            })
        }
    }
}

impl std::fmt::Debug for EngineBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBridge")
            .field("pieces", &self.pieces)
            .field("verified", &self.digests.is_some())
            .finish()
    }
}
