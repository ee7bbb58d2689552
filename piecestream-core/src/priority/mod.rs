//! Playback-driven piece prioritization.
//!
//! The [`PriorityController`] turns "session S is reading at piece P" into
//! per-piece priorities published through a [`PriorityTable`] that the
//! download engine reads. Each open session owns a sliding window of
//! `window_pieces` pieces starting at its cursor piece; priorities descend
//! strictly across the window, and everything outside every window falls
//! back to [`PiecePriority::BACKGROUND`].

mod table;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::PriorityConfig;
use crate::pieces::{PieceIndex, PieceList};
pub use table::PriorityTable;

/// Download priority of a piece. Higher values are fetched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PiecePriority(pub u8);

impl PiecePriority {
    /// Not wanted by any reader. The engine may still fetch it opportunistically.
    pub const BACKGROUND: Self = Self(0);
    /// Tail pieces kept warm for container indexes stored at the end of a file.
    pub const FOOTER: Self = Self(32);
    /// The piece a reader is blocked on.
    pub const TOP: Self = Self(255);

    /// Space left between consecutive window priorities.
    const WINDOW_SPAN: u8 = 200;

    /// Priority of the piece `distance` pieces past the target in a window of
    /// `window_pieces` pieces. Strictly decreasing in `distance` and always
    /// above [`PiecePriority::FOOTER`].
    pub fn for_window_distance(distance: u32, window_pieces: u32) -> Self {
        let window_pieces = window_pieces.clamp(1, Self::WINDOW_SPAN as u32);
        let step = (Self::WINDOW_SPAN as u32 / window_pieces).max(1);
        let drop = distance.min(window_pieces - 1) * step;
        Self(Self::TOP.0 - drop as u8)
    }

    pub fn is_elevated(self) -> bool {
        self > Self::BACKGROUND
    }
}

/// Identifies one reader session registered with a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Priorities a single session currently asks for.
#[derive(Debug, Clone)]
struct SessionWindow {
    target: Option<PieceIndex>,
    bounds: Range<PieceIndex>,
    assignments: Vec<(PieceIndex, PiecePriority)>,
}

impl SessionWindow {
    fn priority_of(&self, index: PieceIndex) -> Option<PiecePriority> {
        self.assignments
            .iter()
            .find(|(assigned, _)| *assigned == index)
            .map(|(_, priority)| *priority)
    }
}

/// Sliding-window scheduler shared by all sessions reading one torrent.
pub struct PriorityController {
    table: Arc<PriorityTable>,
    config: PriorityConfig,
    window_pieces: u32,
    windows: Mutex<HashMap<SessionId, SessionWindow>>,
    next_session: AtomicU64,
}

impl PriorityController {
    /// Creates a controller publishing into a fresh table covering `pieces`.
    ///
    /// The window length is derived from the nominal (first) piece size.
    pub fn new(pieces: &PieceList, config: PriorityConfig) -> Self {
        let table = Arc::new(PriorityTable::new(pieces));
        Self::with_table(table, pieces, config)
    }

    /// Creates a controller publishing into an existing table.
    pub fn with_table(table: Arc<PriorityTable>, pieces: &PieceList, config: PriorityConfig) -> Self {
        let piece_size = pieces.first().map(|piece| piece.size()).unwrap_or(1);
        let window_pieces = config.window_pieces(piece_size);
        tracing::debug!(
            "Priority window: {} pieces of {} bytes",
            window_pieces,
            piece_size
        );

        Self {
            table,
            config,
            window_pieces,
            windows: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Table the download engine reads priorities from.
    pub fn table(&self) -> &Arc<PriorityTable> {
        &self.table
    }

    /// Number of pieces in each session's window (`K`).
    pub fn window_pieces(&self) -> u32 {
        self.window_pieces
    }

    /// Registers a session reading the pieces in `bounds`.
    ///
    /// Applies the footer prefetch immediately; the sliding window starts
    /// with the first [`PriorityController::reposition`] call.
    pub fn register(&self, bounds: Range<PieceIndex>) -> SessionId {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let window = SessionWindow {
            target: None,
            assignments: self.footer_assignments(&bounds),
            bounds,
        };

        let mut windows = self.windows.lock();
        let affected: Vec<PieceIndex> = window.assignments.iter().map(|(index, _)| *index).collect();
        windows.insert(id, window);
        self.publish(&windows, affected);
        id
    }

    /// Target piece of a session's window, if it has one.
    pub fn target(&self, session: SessionId) -> Option<PieceIndex> {
        self.windows.lock().get(&session).and_then(|window| window.target)
    }

    /// Moves a session's window so it starts at `target`.
    ///
    /// The old window's elevations are dropped before the new ones are
    /// published, in one step, so a stale window can never outrank the new
    /// target. Repositioning onto the current target is a no-op.
    pub fn reposition(&self, session: SessionId, target: PieceIndex) {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(&session) else {
            tracing::warn!("Reposition for unknown {}", session);
            return;
        };
        if window.target == Some(target) {
            return;
        }

        let bounds = window.bounds.clone();
        let mut assignments = self.footer_assignments(&bounds);
        let window_end = target.offset_by(self.window_pieces).min(bounds.end);
        let mut index = target.max(bounds.start);
        while index < window_end {
            let distance = index.as_u32() - target.as_u32();
            let priority = PiecePriority::for_window_distance(distance, self.window_pieces);
            assignments.retain(|(assigned, _)| *assigned != index);
            assignments.push((index, priority));
            index = index.offset_by(1);
        }

        let mut affected: Vec<PieceIndex> = window.assignments.iter().map(|(index, _)| *index).collect();
        affected.extend(assignments.iter().map(|(index, _)| *index));

        tracing::debug!(
            "{} window {:?} -> {}..{}",
            session,
            window.target,
            target,
            window_end
        );
        window.target = Some(target);
        window.assignments = assignments;
        self.publish(&windows, affected);
    }

    /// Drops every elevation held by `session`.
    pub fn detach(&self, session: SessionId) {
        let mut windows = self.windows.lock();
        if let Some(window) = windows.remove(&session) {
            tracing::debug!("{} detached from priority window", session);
            let affected = window.assignments.iter().map(|(index, _)| *index).collect();
            self.publish(&windows, affected);
        }
    }

    /// Number of sessions currently holding a window.
    pub fn session_count(&self) -> usize {
        self.windows.lock().len()
    }

    fn footer_assignments(&self, bounds: &Range<PieceIndex>) -> Vec<(PieceIndex, PiecePriority)> {
        let span = bounds.end.as_u32().saturating_sub(bounds.start.as_u32());
        let footer = self.config.footer_pieces.min(span);
        (bounds.end.as_u32() - footer..bounds.end.as_u32())
            .map(|index| (PieceIndex::new(index), PiecePriority::FOOTER))
            .collect()
    }

    /// Recomputes the published priority of `affected` pieces as the maximum
    /// over all sessions' windows. The table's generation only moves when a
    /// published value actually changed.
    fn publish(&self, windows: &HashMap<SessionId, SessionWindow>, mut affected: Vec<PieceIndex>) {
        affected.sort_unstable();
        affected.dedup();

        let mut changed = false;
        for index in affected {
            let priority = windows
                .values()
                .filter_map(|window| window.priority_of(index))
                .max()
                .unwrap_or(PiecePriority::BACKGROUND);
            if self.table.priority(index) != priority {
                self.table.set(index, priority);
                changed = true;
            }
        }
        if changed {
            self.table.bump_generation();
        }
    }
}
