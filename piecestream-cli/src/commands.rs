//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Subcommand;
use piecestream_core::config::PiecestreamConfig;
use piecestream_core::engine::simulation::{SimulatedEngine, piece_digests};
use piecestream_core::verify::{StreamingHasher, hash_file};
use piecestream_core::{
    EngineBridge, FileStorage, HashAlgorithm, MemoryStorage, PieceList, PieceState, PieceStore,
    PiecestreamError, Result, StreamContext, StreamingError, TorrentInput,
};

/// How long a reader waits for the engine to restart a failed piece before
/// giving up on it.
const RETRY_WAIT: Duration = Duration::from_secs(5);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a local file as if it were downloading piece by piece
    Play {
        /// File to stream
        file: PathBuf,
        /// Piece size in bytes
        #[arg(long, default_value_t = 256 * 1024)]
        piece_size: u64,
        /// Positions to seek to before the full pass (comma separated)
        #[arg(long, value_delimiter = ',')]
        seek: Vec<u64>,
        /// Bytes read after each seek
        #[arg(long, default_value_t = 64 * 1024)]
        sample: usize,
        /// Save downloaded pieces to this file instead of memory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Simulation seed
        #[arg(long)]
        seed: Option<u64>,
        /// Simulated latency per piece in milliseconds
        #[arg(long)]
        latency_ms: Option<u64>,
        /// Probability that a fetched piece arrives corrupted
        #[arg(long)]
        failure_rate: Option<f64>,
    },
    /// Print the digest of a file
    Hash {
        /// File to hash
        file: PathBuf,
        /// Digest algorithm
        #[arg(short, long, value_enum, default_value_t = HashAlgorithm::Sha1)]
        algorithm: HashAlgorithm,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Play {
            file,
            piece_size,
            seek,
            sample,
            output,
            seed,
            latency_ms,
            failure_rate,
        } => {
            let mut config = PiecestreamConfig::from_env();
            if let Some(seed) = seed {
                config.simulation.seed = Some(seed);
            }
            if let Some(millis) = latency_ms {
                config.simulation.latency = Duration::from_millis(millis);
            }
            if let Some(rate) = failure_rate {
                config.simulation.failure_rate = rate.clamp(0.0, 1.0);
            }
            let options = PlayOptions {
                piece_size,
                seeks: seek,
                sample,
                output,
                read_retries: config.simulation.max_attempts,
            };
            play_file(&file, options, config).await
        }
        Commands::Hash { file, algorithm } => hash_command(&file, algorithm).await,
    }
}

/// Settings of one `play` run.
pub struct PlayOptions {
    pub piece_size: u64,
    pub seeks: Vec<u64>,
    pub sample: usize,
    pub output: Option<PathBuf>,
    /// Failed-piece errors tolerated by a single read before giving up.
    pub read_retries: u32,
}

/// Streams `file` through a reader session while the simulated engine
/// downloads it, checking every byte against the file on disk.
///
/// # Errors
/// - `PiecestreamError::Io` - File cannot be read
/// - `PiecestreamError::Storage` - The output file cannot be created
/// - `PiecestreamError::Configuration` - Empty file or a seek past its end
/// - `PiecestreamError::Streaming` - A piece stayed failed after retries
/// - `PiecestreamError::ContentMismatch` - Streamed bytes differ from the file
pub async fn play_file(file: &Path, options: PlayOptions, config: PiecestreamConfig) -> Result<()> {
    let source = tokio::fs::read(file).await?;
    let total_size = source.len() as u64;
    if total_size == 0 {
        return Err(PiecestreamError::Configuration {
            reason: format!("{} is empty", file.display()),
        });
    }
    if let Some(position) = options.seeks.iter().find(|position| **position > total_size) {
        return Err(PiecestreamError::Configuration {
            reason: format!(
                "Seek position {position} is past the end of the file ({total_size} bytes)"
            ),
        });
    }

    let pieces = PieceList::from_total_size(total_size, options.piece_size, 0)?;
    let storage: Arc<dyn PieceStore> = match &options.output {
        Some(path) => Arc::new(FileStorage::open(path, 0..total_size).await?),
        None => Arc::new(MemoryStorage::new()),
    };
    let digests = piece_digests(&pieces, &source, HashAlgorithm::Sha1);
    let bridge = Arc::new(EngineBridge::with_digests(
        pieces.clone(),
        Arc::clone(&storage),
        digests,
    )?);
    let context = StreamContext::new(pieces, storage, config.priority.clone());

    println!(
        "Streaming {} ({} bytes, {} pieces, window {} pieces)",
        file.display(),
        total_size,
        context.pieces().len(),
        context.controller().window_pieces()
    );

    let engine = SimulatedEngine::new(
        bridge,
        Arc::clone(context.controller().table()),
        source.clone(),
        config.simulation.clone(),
    );
    let engine_run = tokio::spawn(engine.run());

    let input = context.open_range(0, total_size, config.streaming.buffer_size)?;
    tracing::debug!("Opened {:?}", input);
    for position in &options.seeks {
        let started = Instant::now();
        input.seek(*position)?;
        let sampled = read_up_to(&input, options.sample, options.read_retries).await?;
        let end = *position as usize + sampled.len();
        if sampled != source[*position as usize..end] {
            return Err(PiecestreamError::ContentMismatch {
                reason: format!("bytes after seek to {position} differ from the file"),
            });
        }
        println!(
            "  seek {:>12} -> {:>8} bytes in {:?}",
            position,
            sampled.len(),
            started.elapsed()
        );
    }

    let started = Instant::now();
    input.seek(0)?;
    let mut hasher = StreamingHasher::new(HashAlgorithm::Md5);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let read = read_retrying(&input, &mut chunk, options.read_retries).await?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    let streamed = hasher.finalize();
    let expected = hash_file(file, HashAlgorithm::Md5).await?;
    input.close();

    let stats = engine_run
        .await
        .map_err(|e| PiecestreamError::EngineStopped {
            reason: e.to_string(),
        })??;
    tracing::info!("Simulated engine finished: {:?}", stats);
    println!(
        "  full pass {} bytes in {:?}, md5 {}",
        total_size,
        started.elapsed(),
        streamed
    );
    println!(
        "  engine: {} pieces completed, {} integrity failures, {} abandoned",
        stats.completed,
        stats.integrity_failures,
        stats.abandoned.len()
    );

    if streamed != expected {
        return Err(PiecestreamError::ContentMismatch {
            reason: format!("streamed digest {streamed} does not match file digest {expected}"),
        });
    }
    println!("Stream verified");
    Ok(())
}

/// Reads into `dst`, retrying when the piece under the cursor fails.
///
/// After each failure the read waits for the engine to restart the piece. A
/// piece that stays `Failed` for [`RETRY_WAIT`], or fails more than
/// `retries` times within one call, ends playback.
async fn read_retrying(input: &TorrentInput, dst: &mut [u8], retries: u32) -> Result<usize> {
    let mut failures = 0;
    loop {
        match input.read(dst).await {
            Err(StreamingError::PieceDownloadFailed { index }) if failures < retries => {
                failures += 1;
                tracing::warn!(
                    "Piece {} failed under the cursor, retry {}/{}",
                    index,
                    failures,
                    retries
                );
                let mut state = input.pieces().subscribe(index)?;
                let restarted = tokio::time::timeout(
                    RETRY_WAIT,
                    state.wait_for(|state| *state != PieceState::Failed),
                )
                .await
                .is_ok_and(|changed| changed.is_ok());
                if !restarted {
                    return Err(StreamingError::PieceDownloadFailed { index }.into());
                }
            }
            result => return Ok(result?),
        }
    }
}

/// Reads until `limit` bytes or end of stream.
async fn read_up_to(input: &TorrentInput, limit: usize, retries: u32) -> Result<Vec<u8>> {
    let mut collected = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let read = read_retrying(input, &mut collected[filled..], retries).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    collected.truncate(filled);
    Ok(collected)
}

/// Print the digest of a file
///
/// # Errors
/// - `PiecestreamError::Verify` - File cannot be read
pub async fn hash_command(file: &Path, algorithm: HashAlgorithm) -> Result<()> {
    let digest = hash_file(file, algorithm).await?;
    println!("{digest}  {}", file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use piecestream_core::config::SimulationConfig;

    use super::*;

    fn sample_file(dir: &tempfile::TempDir, len: usize) -> PathBuf {
        let path = dir.path().join("movie.mkv");
        let bytes: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn options(seeks: Vec<u64>, read_retries: u32) -> PlayOptions {
        PlayOptions {
            piece_size: 1024,
            seeks,
            sample: 2048,
            output: None,
            read_retries,
        }
    }

    fn config(failure_rate: f64, max_attempts: u32) -> PiecestreamConfig {
        let mut config = PiecestreamConfig::for_testing();
        config.simulation = SimulationConfig {
            failure_rate,
            max_attempts,
            ..SimulationConfig::deterministic_testing()
        };
        config
    }

    #[tokio::test]
    async fn test_play_rejects_bad_arguments_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample_file(&dir, 10_000);

        let error = play_file(&file, options(vec![10_001], 5), config(0.0, 5))
            .await
            .unwrap_err();
        assert!(matches!(error, PiecestreamError::Configuration { .. }));
        assert!(error.user_message().contains("past the end"));

        let empty = dir.path().join("empty.mkv");
        std::fs::write(&empty, b"").unwrap();
        let error = play_file(&empty, options(Vec::new(), 5), config(0.0, 5))
            .await
            .unwrap_err();
        assert!(matches!(error, PiecestreamError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_play_verifies_stream_with_seeks() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample_file(&dir, 10_000);
        let mut options = options(vec![7_000, 10_000, 0], 5);
        options.output = Some(dir.path().join("downloaded.mkv"));

        play_file(&file, options, config(0.0, 5)).await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("downloaded.mkv")).unwrap(),
            std::fs::read(&file).unwrap()
        );
    }

    #[tokio::test]
    async fn test_play_retries_pieces_that_fail_under_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample_file(&dir, 12_000);

        play_file(&file, options(vec![5_000], 30), config(0.3, 30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hash_command_reads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample_file(&dir, 100);
        hash_command(&file, HashAlgorithm::Md5).await.unwrap();

        let error = hash_command(&dir.path().join("missing"), HashAlgorithm::Sha1)
            .await
            .unwrap_err();
        assert!(matches!(error, PiecestreamError::Verify(_)));
    }
}
