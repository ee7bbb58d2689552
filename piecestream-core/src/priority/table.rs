//! Shared piece priority table read by the download engine.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

use super::PiecePriority;
use crate::pieces::{PieceIndex, PieceList};

/// Thread-safe map from piece index to [`PiecePriority`].
///
/// Written by the priority controller, read by the engine. Entries are
/// independent atomics; the engine may observe a window half-applied, which
/// only affects ordering and converges on the next read.
pub struct PriorityTable {
    first_index: PieceIndex,
    levels: Vec<AtomicU8>,
    generation: watch::Sender<u64>,
}

impl PriorityTable {
    /// Creates a table covering `pieces`, all at background priority.
    pub fn new(pieces: &PieceList) -> Self {
        let levels = (0..pieces.len())
            .map(|_| AtomicU8::new(PiecePriority::BACKGROUND.0))
            .collect();
        let (generation, _) = watch::channel(0);
        Self {
            first_index: pieces.first_index(),
            levels,
            generation,
        }
    }

    fn slot(&self, index: PieceIndex) -> Option<&AtomicU8> {
        let position = index.as_u32().checked_sub(self.first_index.as_u32())?;
        self.levels.get(position as usize)
    }

    /// Current priority of `index`. Unknown indices read as background.
    pub fn priority(&self, index: PieceIndex) -> PiecePriority {
        self.slot(index)
            .map(|level| PiecePriority(level.load(Ordering::Acquire)))
            .unwrap_or(PiecePriority::BACKGROUND)
    }

    pub(crate) fn set(&self, index: PieceIndex, priority: PiecePriority) {
        if let Some(level) = self.slot(index) {
            level.store(priority.0, Ordering::Release);
        }
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Every piece with its current priority, in index order.
    pub fn snapshot(&self) -> Vec<(PieceIndex, PiecePriority)> {
        self.levels
            .iter()
            .enumerate()
            .map(|(position, level)| {
                (
                    self.first_index.offset_by(position as u32),
                    PiecePriority(level.load(Ordering::Acquire)),
                )
            })
            .collect()
    }

    /// Elevated pieces in fetch order: highest priority first, lower index
    /// first among equals.
    pub fn ranked(&self) -> Vec<PieceIndex> {
        let mut elevated: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|(_, priority)| priority.is_elevated())
            .collect();
        elevated.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        elevated.into_iter().map(|(index, _)| index).collect()
    }

    /// Receiver whose value increases every time the controller publishes a
    /// new set of priorities.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

impl std::fmt::Debug for PriorityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityTable")
            .field("first_index", &self.first_index)
            .field("pieces", &self.levels.len())
            .field("generation", &self.generation())
            .finish()
    }
}
