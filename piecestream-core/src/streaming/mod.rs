//! Seekable streaming over partially downloaded pieces.
//!
//! [`TorrentInput`] is the random-access byte source handed to a media
//! decoder. It suspends on pieces the engine has not finished, keeps a
//! bidirectional read buffer of finished bytes, and steers the
//! [`PriorityController`](crate::priority::PriorityController) window as
//! the cursor moves. [`BlockingTorrentInput`] wraps it in `std::io::Read`
//! and `std::io::Seek` for synchronous decoders.

pub mod blocking;
pub mod buffer;
pub mod torrent_input;

use std::io;

pub use blocking::BlockingTorrentInput;
pub use buffer::ReadBuffer;
pub use torrent_input::{StreamContext, TorrentInput};

use crate::pieces::{PieceError, PieceIndex};
use crate::storage::StorageError;

/// Errors surfaced to readers of a [`TorrentInput`].
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// The piece under the cursor failed to download.
    ///
    /// The caller may retry the read once the engine re-requests the piece.
    #[error("Piece {index} failed to download")]
    PieceDownloadFailed {
        /// Piece the read was waiting on.
        index: PieceIndex,
    },

    /// The session was closed, possibly while a read was suspended.
    #[error("Stream session is closed")]
    SessionClosed,

    /// Open or seek parameters outside the session's pieces.
    #[error("Invalid range: {reason}")]
    InvalidRange {
        /// What was out of range.
        reason: String,
    },

    /// A piece's bytes did not hash to the expected digest.
    #[error("Piece {index} failed integrity verification")]
    IntegrityMismatch {
        /// Piece that failed verification.
        index: PieceIndex,
    },

    /// Piece bookkeeping failed.
    #[error("Piece error: {0}")]
    Piece(PieceError),

    /// Finished piece bytes could not be read back.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StreamingError {
    pub(crate) fn invalid_range(reason: impl Into<String>) -> Self {
        StreamingError::InvalidRange {
            reason: reason.into(),
        }
    }

    /// Returns true if a later read of the same range may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamingError::PieceDownloadFailed { .. } | StreamingError::IntegrityMismatch { .. }
        )
    }
}

impl From<PieceError> for StreamingError {
    fn from(error: PieceError) -> Self {
        match error {
            PieceError::DownloadFailed { index } => StreamingError::PieceDownloadFailed { index },
            other => StreamingError::Piece(other),
        }
    }
}

impl From<StreamingError> for io::Error {
    fn from(error: StreamingError) -> Self {
        let kind = match &error {
            StreamingError::SessionClosed => io::ErrorKind::BrokenPipe,
            StreamingError::InvalidRange { .. } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_failures_map_to_stream_errors() {
        let error = StreamingError::from(PieceError::DownloadFailed {
            index: PieceIndex::new(7),
        });
        assert!(matches!(
            error,
            StreamingError::PieceDownloadFailed { index } if index == PieceIndex::new(7)
        ));
        assert!(error.is_retryable());
        assert!(!StreamingError::SessionClosed.is_retryable());
    }

    #[test]
    fn test_io_error_kinds() {
        let closed = io::Error::from(StreamingError::SessionClosed);
        assert_eq!(closed.kind(), io::ErrorKind::BrokenPipe);

        let range = io::Error::from(StreamingError::invalid_range("seek past end"));
        assert_eq!(range.kind(), io::ErrorKind::InvalidInput);
        assert!(range.to_string().contains("seek past end"));

        let failed = io::Error::from(StreamingError::PieceDownloadFailed {
            index: PieceIndex::new(1),
        });
        assert_eq!(failed.kind(), io::ErrorKind::Other);
    }
}
