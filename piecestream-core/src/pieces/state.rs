//! Per-piece download lifecycle.
//!
//! Each piece owns a `watch` cell holding its [`PieceState`]. The download
//! engine is the only writer; readers take snapshots or suspend until the
//! piece settles. A `watch` channel re-checks the value after a waiter
//! registers, so a transition racing with a new waiter is never lost, and
//! dropping a pending wait simply drops its receiver.
//!
//! A `watch` cell only holds the latest value, so a `Failed` state that is
//! immediately retried could slip past a waiter. Every slot therefore also
//! counts its failures; a waiter that sees the count move reports the failure
//! even if the piece is already downloading again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use super::{Piece, PieceError};

/// Download state of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PieceState {
    /// Not yet requested from the swarm.
    #[default]
    Ready,
    /// Actively being fetched.
    Downloading,
    /// Verified and readable from storage.
    Finished,
    /// Fetch attempt exhausted or aborted. May be retried.
    Failed,
}

impl PieceState {
    /// Returns true if the engine may move a piece from `self` to `next`.
    ///
    /// Allowed edges: `Ready -> Downloading`, `Failed -> Downloading`,
    /// `Downloading -> Finished` and `Downloading -> Failed`.
    pub fn can_transition_to(self, next: PieceState) -> bool {
        matches!(
            (self, next),
            (PieceState::Ready, PieceState::Downloading)
                | (PieceState::Failed, PieceState::Downloading)
                | (PieceState::Downloading, PieceState::Finished)
                | (PieceState::Downloading, PieceState::Failed)
        )
    }

    /// Returns true for states a waiter resumes on.
    pub fn is_settled(self) -> bool {
        matches!(self, PieceState::Finished | PieceState::Failed)
    }
}

impl fmt::Display for PieceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PieceState::Ready => "ready",
            PieceState::Downloading => "downloading",
            PieceState::Finished => "finished",
            PieceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A piece's immutable geometry together with its observable state cell.
pub(crate) struct PieceSlot {
    piece: Piece,
    state: watch::Sender<PieceState>,
    /// Number of `-> Failed` edges taken. Only written under the channel's
    /// write lock.
    failures: AtomicU64,
}

impl PieceSlot {
    pub(crate) fn new(piece: Piece) -> Self {
        let (state, _) = watch::channel(PieceState::Ready);
        Self {
            piece,
            state,
            failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn piece(&self) -> Piece {
        self.piece
    }

    pub(crate) fn current(&self) -> PieceState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<PieceState> {
        self.state.subscribe()
    }

    /// How many times the piece has entered `Failed`.
    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// State and failure count read under the channel's read lock, so no
    /// transition can land between the two.
    fn snapshot(&self, receiver: &mut watch::Receiver<PieceState>) -> (PieceState, u64) {
        let state = receiver.borrow_and_update();
        (*state, self.failures())
    }

    fn download_failed(&self) -> PieceError {
        PieceError::DownloadFailed {
            index: self.piece.index(),
        }
    }

    /// Applies `next` if the edge is legal, returning the previous state.
    ///
    /// The check and the write happen under the channel's lock, so two
    /// concurrent transitions cannot both succeed from the same state.
    pub(crate) fn transition(&self, next: PieceState) -> Result<PieceState, PieceError> {
        let mut outcome = Err(PieceState::Ready);
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                outcome = Ok(*current);
                if next == PieceState::Failed {
                    self.failures.fetch_add(1, Ordering::AcqRel);
                }
                *current = next;
                true
            } else {
                outcome = Err(*current);
                false
            }
        });

        outcome.map_err(|from| {
            tracing::warn!(
                "Rejected piece {} transition {} -> {}",
                self.piece.index(),
                from,
                next
            );
            PieceError::IllegalTransition {
                index: self.piece.index(),
                from,
                to: next,
            }
        })
    }

    /// Suspends until the piece is `Finished` or has failed.
    ///
    /// Returns without suspending when the piece is already finished. A
    /// failure observed while waiting is reported even when the engine has
    /// already moved the piece back to `Downloading`.
    pub(crate) async fn wait_finished(&self) -> Result<(), PieceError> {
        match self.current() {
            PieceState::Finished => return Ok(()),
            PieceState::Failed => return Err(self.download_failed()),
            PieceState::Ready | PieceState::Downloading => {}
        }

        let mut receiver = self.state.subscribe();
        let (mut state, failures_at_start) = self.snapshot(&mut receiver);
        loop {
            match state {
                PieceState::Finished => return Ok(()),
                PieceState::Failed => return Err(self.download_failed()),
                PieceState::Ready | PieceState::Downloading => {}
            }
            if receiver.changed().await.is_err() {
                return Err(self.download_failed());
            }
            let (next, failures) = self.snapshot(&mut receiver);
            if failures != failures_at_start {
                return Err(self.download_failed());
            }
            state = next;
        }
    }
}

impl fmt::Debug for PieceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceSlot")
            .field("piece", &self.piece)
            .field("state", &self.current())
            .finish()
    }
}
