//! Deterministic simulated download engine.
//!
//! Fetches pieces from an in-memory copy of the torrent in the order the
//! [`PriorityTable`] asks for, with configurable latency, concurrency and
//! corruption. Driven by a seeded ChaCha RNG so runs are reproducible.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{EngineBridge, EngineError};
use crate::config::SimulationConfig;
use crate::pieces::{PieceIndex, PieceList, PieceState};
use crate::priority::PriorityTable;
use crate::verify::{HashAlgorithm, PieceDigest, hash_bytes};

/// Outcome of a simulation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationStats {
    /// Pieces verified and finished.
    pub completed: usize,
    /// Attempts rejected by verification.
    pub integrity_failures: usize,
    /// Pieces left `Failed` after exhausting their attempts.
    pub abandoned: Vec<PieceIndex>,
}

/// Engine that "downloads" pieces from a byte buffer.
pub struct SimulatedEngine {
    bridge: Arc<EngineBridge>,
    table: Arc<PriorityTable>,
    source: Bytes,
    config: SimulationConfig,
    elevated_only: bool,
}

impl SimulatedEngine {
    /// `source` holds the bytes of every piece in the bridge's list,
    /// starting at the list's first offset.
    pub fn new(
        bridge: Arc<EngineBridge>,
        table: Arc<PriorityTable>,
        source: impl Into<Bytes>,
        config: SimulationConfig,
    ) -> Self {
        Self {
            bridge,
            table,
            source: source.into(),
            config,
            elevated_only: false,
        }
    }

    /// Only fetches pieces some reader asked for, idling until priorities
    /// change otherwise. Such a run never ends on its own.
    pub fn elevated_only(mut self) -> Self {
        self.elevated_only = true;
        self
    }

    /// Runs until every piece is finished or abandoned.
    ///
    /// # Errors
    ///
    /// - `EngineError::Piece` - If piece bookkeeping rejects an update
    /// - `EngineError::Storage` - If verified bytes cannot be stored
    pub async fn run(self) -> Result<SimulationStats, EngineError> {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut generation = self.table.subscribe();
        let mut attempts: HashMap<PieceIndex, u32> = HashMap::new();
        let mut in_flight = FuturesUnordered::new();
        let mut stats = SimulationStats::default();
        let concurrency = self.config.concurrency.max(1);

        tracing::info!(
            "Simulated engine started: {} pieces, seed {}, concurrency {}",
            self.bridge.pieces().len(),
            seed,
            concurrency
        );

        loop {
            while in_flight.len() < concurrency {
                let Some(index) = self.next_piece(&attempts) else {
                    break;
                };
                self.bridge.begin_download(index)?;
                *attempts.entry(index).or_default() += 1;

                let corrupt = rng.random_bool(self.config.failure_rate.clamp(0.0, 1.0));
                in_flight.push(transfer(
                    index,
                    self.piece_bytes(index),
                    self.config.latency,
                    corrupt,
                ));
            }

            if in_flight.is_empty() {
                if !self.elevated_only || self.bridge.pieces().is_complete() {
                    break;
                }
                if generation.changed().await.is_err() {
                    break;
                }
                continue;
            }

            tokio::select! {
                Some((index, piece_bytes)) = in_flight.next() => {
                    self.settle(index, &piece_bytes, &attempts, &mut stats).await?;
                }
                Ok(()) = generation.changed() => {}
            }
        }

        tracing::info!(
            "Simulated engine done: {} completed, {} integrity failures, {} abandoned",
            stats.completed,
            stats.integrity_failures,
            stats.abandoned.len()
        );
        Ok(stats)
    }

    async fn settle(
        &self,
        index: PieceIndex,
        piece_bytes: &[u8],
        attempts: &HashMap<PieceIndex, u32>,
        stats: &mut SimulationStats,
    ) -> Result<(), EngineError> {
        match self.bridge.complete_download(index, piece_bytes).await {
            Ok(()) => stats.completed += 1,
            Err(EngineError::IntegrityMismatch { .. }) => {
                stats.integrity_failures += 1;
                if attempts.get(&index).copied().unwrap_or(0) >= self.config.max_attempts {
                    tracing::warn!(
                        "Abandoning piece {} after {} attempts",
                        index,
                        self.config.max_attempts
                    );
                    stats.abandoned.push(index);
                }
            }
            Err(error) => return Err(error),
        }
        Ok(())
    }

    /// Highest-priority piece that can start: elevated pieces in ranked
    /// order, then the rest in index order unless `elevated_only`.
    fn next_piece(&self, attempts: &HashMap<PieceIndex, u32>) -> Option<PieceIndex> {
        let pieces = self.bridge.pieces();
        let startable = |index: &PieceIndex| {
            let tries = attempts.get(index).copied().unwrap_or(0);
            match pieces.state(*index) {
                Ok(PieceState::Ready) => true,
                Ok(PieceState::Failed) => tries < self.config.max_attempts,
                _ => false,
            }
        };

        if let Some(index) = self
            .table
            .ranked()
            .into_iter()
            .filter(|index| pieces.contains_index(*index))
            .find(|index| startable(index))
        {
            return Some(index);
        }
        if self.elevated_only {
            return None;
        }
        pieces
            .iter()
            .map(|piece| piece.index())
            .find(|index| startable(index))
    }

    /// Bytes of piece `index` in the source.
    fn piece_bytes(&self, index: PieceIndex) -> Bytes {
        let pieces = self.bridge.pieces();
        pieces
            .get(index)
            .map(|piece| {
                let start = (piece.offset() - pieces.start_offset()) as usize;
                let end = (start + piece.size() as usize).min(self.source.len());
                self.source.slice(start.min(end)..end)
            })
            .unwrap_or_default()
    }
}

/// One simulated transfer: waits `latency`, then yields the bytes, with the
/// first byte flipped when `corrupt` is set.
async fn transfer(
    index: PieceIndex,
    piece_bytes: Bytes,
    latency: Duration,
    corrupt: bool,
) -> (PieceIndex, Bytes) {
    tokio::time::sleep(latency).await;
    if corrupt && !piece_bytes.is_empty() {
        let mut damaged = piece_bytes.to_vec();
        damaged[0] ^= 0xFF;
        return (index, Bytes::from(damaged));
    }
    (index, piece_bytes)
}

/// Digests of every piece of `source`, laid out per `pieces`, as torrent
/// metadata would carry them.
pub fn piece_digests(
    pieces: &PieceList,
    source: &[u8],
    algorithm: HashAlgorithm,
) -> Vec<PieceDigest> {
    pieces
        .iter()
        .map(|piece| {
            let start = ((piece.offset() - pieces.start_offset()) as usize).min(source.len());
            let end = (start + piece.size() as usize).min(source.len());
            hash_bytes(algorithm, &source[start..end])
        })
        .collect()
}
