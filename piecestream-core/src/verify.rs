//! Content digests for piece and whole-file verification.
//!
//! MD5 and SHA-1 over RustCrypto's `Digest` trait. Large inputs go through
//! [`StreamingHasher`] or [`hash_file`], which never hold more than one chunk.

use std::fmt;
use std::path::{Path, PathBuf};

use md5::Md5;
use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Chunk size used when hashing files.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum HashAlgorithm {
    /// 128-bit MD5
    Md5,
    /// 160-bit SHA-1, the BitTorrent v1 piece hash
    Sha1,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Md5 => write!(f, "md5"),
            HashAlgorithm::Sha1 => write!(f, "sha1"),
        }
    }
}

/// Errors that occur while computing or parsing digests.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Hash input could not be read.
    #[error("Failed to read {path} for hashing: {source}")]
    Io {
        /// File being hashed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Text that is not a valid digest for the algorithm.
    #[error("Invalid {algorithm} digest: {reason}")]
    InvalidDigest {
        /// Algorithm the digest was parsed for.
        algorithm: HashAlgorithm,
        /// What was wrong with it.
        reason: String,
    },
}

/// A computed or expected digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PieceDigest {
    algorithm: HashAlgorithm,
    bytes: Vec<u8>,
}

impl PieceDigest {
    /// Parses a hex digest, case-insensitively.
    ///
    /// # Errors
    ///
    /// - `VerifyError::InvalidDigest` - If `text` is not hex or has the wrong length
    pub fn from_hex(algorithm: HashAlgorithm, text: &str) -> Result<Self, VerifyError> {
        let bytes = hex::decode(text.trim()).map_err(|e| VerifyError::InvalidDigest {
            algorithm,
            reason: e.to_string(),
        })?;
        if bytes.len() != algorithm.digest_len() {
            return Err(VerifyError::InvalidDigest {
                algorithm,
                reason: format!(
                    "expected {} bytes, got {}",
                    algorithm.digest_len(),
                    bytes.len()
                ),
            });
        }
        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Returns true if `data` hashes to this digest.
    pub fn matches(&self, data: &[u8]) -> bool {
        hash_bytes(self.algorithm, data) == *self
    }
}

impl fmt::Display for PieceDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PieceDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceDigest({}:{})", self.algorithm, self.to_hex())
    }
}

/// Hashes `data` in one call.
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> PieceDigest {
    let mut hasher = StreamingHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Incremental hasher fed chunk by chunk.
#[derive(Clone)]
pub struct StreamingHasher {
    state: HasherState,
    bytes_hashed: u64,
}

#[derive(Clone)]
enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
}

impl StreamingHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
        };
        Self {
            state,
            bytes_hashed: 0,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self.state {
            HasherState::Md5(_) => HashAlgorithm::Md5,
            HasherState::Sha1(_) => HashAlgorithm::Sha1,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match &mut self.state {
            HasherState::Md5(hasher) => hasher.update(chunk),
            HasherState::Sha1(hasher) => hasher.update(chunk),
        }
        self.bytes_hashed += chunk.len() as u64;
    }

    /// Total bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    pub fn finalize(self) -> PieceDigest {
        let algorithm = self.algorithm();
        let bytes = match self.state {
            HasherState::Md5(hasher) => hasher.finalize().to_vec(),
            HasherState::Sha1(hasher) => hasher.finalize().to_vec(),
        };
        PieceDigest { algorithm, bytes }
    }
}

impl fmt::Debug for StreamingHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingHasher")
            .field("algorithm", &self.algorithm())
            .field("bytes_hashed", &self.bytes_hashed)
            .finish()
    }
}

/// Hashes the file at `path` in [`HASH_CHUNK_SIZE`] chunks.
///
/// # Errors
///
/// - `VerifyError::Io` - If the file cannot be opened or read
pub async fn hash_file(
    path: impl AsRef<Path>,
    algorithm: HashAlgorithm,
) -> Result<PieceDigest, VerifyError> {
    let path = path.as_ref();
    let io_error = |source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).await.map_err(io_error)?;
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut hasher = StreamingHasher::new(algorithm);
    loop {
        let n = file.read(&mut buffer).await.map_err(io_error)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    tracing::debug!(
        "Hashed {} ({} bytes) with {}",
        path.display(),
        hasher.bytes_hashed(),
        algorithm
    );
    Ok(hasher.finalize())
}
