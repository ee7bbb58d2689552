//! Piecestream Core - random-access streaming over downloading torrents
//!
//! Lets a media decoder read and seek through a file while its pieces are
//! still arriving: piece layout and download state, a sliding-window piece
//! prioritizer driven by playback position, a seekable reader that suspends
//! on missing pieces, piece storage, digests, and the engine seam that feeds
//! verified pieces in.

pub mod config;
pub mod engine;
pub mod pieces;
pub mod priority;
pub mod storage;
pub mod streaming;
pub mod tracing_setup;
pub mod verify;

// Re-export main types for convenient access
pub use config::PiecestreamConfig;
pub use engine::{EngineBridge, EngineError};
pub use pieces::{Piece, PieceError, PieceIndex, PieceList, PieceState};
pub use priority::{PiecePriority, PriorityController, PriorityTable};
pub use storage::{FileStorage, MemoryStorage, PieceStore, StorageError};
pub use streaming::{BlockingTorrentInput, StreamContext, StreamingError, TorrentInput};
pub use tracing_setup::TracingSetupError;
pub use verify::{HashAlgorithm, PieceDigest, VerifyError};

/// Errors that can bubble up from any Piecestream subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PiecestreamError {
    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Verification error: {0}")]
    Verify(#[from] VerifyError),

    #[error("Logging error: {0}")]
    Logging(#[from] TracingSetupError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Streamed bytes differ from the content they were cut from.
    #[error("Content mismatch: {reason}")]
    ContentMismatch { reason: String },

    /// A background download task ended abnormally.
    #[error("Engine stopped: {reason}")]
    EngineStopped { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PiecestreamError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            PiecestreamError::Streaming(e) => match e {
                StreamingError::PieceDownloadFailed { index } => {
                    format!("Piece {index} could not be downloaded")
                }
                StreamingError::SessionClosed => "The stream was closed".to_string(),
                StreamingError::InvalidRange { reason } => format!("Invalid position: {reason}"),
                StreamingError::IntegrityMismatch { index } => {
                    format!("Piece {index} is corrupt and must be downloaded again")
                }
                _ => "Streaming error occurred".to_string(),
            },
            PiecestreamError::Engine(EngineError::IntegrityMismatch { index, .. }) => {
                format!("Piece {index} is corrupt and must be downloaded again")
            }
            PiecestreamError::Piece(_) | PiecestreamError::Engine(_) => {
                "Download error occurred".to_string()
            }
            PiecestreamError::Storage(_) => "Storage error occurred".to_string(),
            PiecestreamError::Verify(e) => e.to_string(),
            PiecestreamError::Logging(e) => e.to_string(),
            PiecestreamError::Configuration { reason } => format!("Configuration error: {reason}"),
            PiecestreamError::ContentMismatch { reason } => {
                format!("Streamed data is wrong: {reason}")
            }
            PiecestreamError::EngineStopped { .. } => "The download engine stopped".to_string(),
            PiecestreamError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if retrying the operation (after the engine re-fetches) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PiecestreamError::Streaming(e) => e.is_retryable(),
            PiecestreamError::Engine(e) => e.is_retryable(),
            PiecestreamError::Piece(PieceError::DownloadFailed { .. }) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PiecestreamError>;
