//! Reader sessions over a torrent's pieces.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::{ReadBuffer, StreamingError};
use crate::config::PriorityConfig;
use crate::pieces::{Piece, PieceIndex, PieceList, PieceState};
use crate::priority::{PriorityController, SessionId};
use crate::storage::PieceStore;

/// Everything reader sessions of one torrent share: the piece list, the
/// priority controller and the storage holding finished pieces.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct StreamContext {
    pieces: PieceList,
    controller: Arc<PriorityController>,
    storage: Arc<dyn PieceStore>,
}

impl StreamContext {
    /// Creates a context with a fresh priority controller over `pieces`.
    pub fn new(pieces: PieceList, storage: Arc<dyn PieceStore>, config: PriorityConfig) -> Self {
        let controller = Arc::new(PriorityController::new(&pieces, config));
        Self::with_controller(pieces, controller, storage)
    }

    pub fn with_controller(
        pieces: PieceList,
        controller: Arc<PriorityController>,
        storage: Arc<dyn PieceStore>,
    ) -> Self {
        Self {
            pieces,
            controller,
            storage,
        }
    }

    pub fn pieces(&self) -> &PieceList {
        &self.pieces
    }

    pub fn controller(&self) -> &Arc<PriorityController> {
        &self.controller
    }

    pub fn storage(&self) -> &Arc<dyn PieceStore> {
        &self.storage
    }

    /// Opens a session over the absolute bytes `start..start + length`,
    /// bound to just the pieces covering them.
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidRange` - If the range is not covered by the pieces
    pub fn open_range(
        &self,
        start: u64,
        length: u64,
        buffer_size: usize,
    ) -> Result<TorrentInput, StreamingError> {
        let end = start.checked_add(length).ok_or_else(|| {
            StreamingError::invalid_range(format!("range {start}+{length} overflows"))
        })?;
        let first = self.pieces.find_by_offset(start).ok_or_else(|| {
            StreamingError::invalid_range(format!("offset {start} is not in any piece"))
        })?;
        let last_byte = end.saturating_sub(1).max(start);
        let last = self.pieces.find_by_offset(last_byte).ok_or_else(|| {
            StreamingError::invalid_range(format!(
                "range {start}..{end} exceeds pieces ending at {}",
                self.pieces.end_offset()
            ))
        })?;

        let pieces = self.pieces.slice(first.index()..last.index().offset_by(1))?;
        TorrentInput::open(self, pieces, start, buffer_size, length)
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("pieces", &self.pieces)
            .field("sessions", &self.controller.session_count())
            .finish()
    }
}

/// Seekable byte source over a contiguous run of pieces.
///
/// Position 0 maps to the absolute offset `logical_start_offset`. Reads
/// suspend until the piece under the cursor is finished, then return the
/// contiguous finished bytes available from the cursor, which may be fewer
/// than requested. A session is meant to be driven by one task at a time;
/// `close` may be called from anywhere and fails a suspended read with
/// [`StreamingError::SessionClosed`].
pub struct TorrentInput {
    pieces: PieceList,
    controller: Arc<PriorityController>,
    storage: Arc<dyn PieceStore>,
    session: SessionId,
    logical_start: u64,
    length: u64,
    position: AtomicU64,
    buffer: Mutex<ReadBuffer>,
    closed: watch::Sender<bool>,
}

impl TorrentInput {
    /// Opens a session over `pieces`, which must come from `context`'s list.
    ///
    /// `buffer_size` bounds the read-ahead in each direction. The window is
    /// positioned at the start of the session right away.
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidRange` - If `pieces` is empty or foreign, the
    ///   start offset lies outside it, or `length` runs past its last byte
    pub fn open(
        context: &StreamContext,
        pieces: PieceList,
        logical_start_offset: u64,
        buffer_size: usize,
        length: u64,
    ) -> Result<Self, StreamingError> {
        if pieces.is_empty() {
            return Err(StreamingError::invalid_range("session has no pieces"));
        }
        if pieces.first_index() < context.pieces.first_index()
            || pieces.end_index() > context.pieces.end_index()
        {
            return Err(StreamingError::invalid_range(format!(
                "pieces {}..{} are not part of the torrent's {}..{}",
                pieces.first_index(),
                pieces.end_index(),
                context.pieces.first_index(),
                context.pieces.end_index()
            )));
        }
        if pieces.find_by_offset(logical_start_offset).is_none() {
            return Err(StreamingError::invalid_range(format!(
                "start offset {logical_start_offset} is not in pieces {}..{}",
                pieces.start_offset(),
                pieces.end_offset()
            )));
        }
        let covered = logical_start_offset
            .checked_add(length)
            .is_some_and(|end| end <= pieces.end_offset());
        if !covered {
            return Err(StreamingError::invalid_range(format!(
                "length {length} from {logical_start_offset} exceeds pieces ending at {}",
                pieces.end_offset()
            )));
        }

        let session = context
            .controller
            .register(pieces.first_index()..pieces.end_index());
        let (closed, _) = watch::channel(false);
        let input = Self {
            pieces,
            controller: Arc::clone(&context.controller),
            storage: Arc::clone(&context.storage),
            session,
            logical_start: logical_start_offset,
            length,
            position: AtomicU64::new(0),
            buffer: Mutex::new(ReadBuffer::new(buffer_size)),
            closed,
        };

        tracing::info!(
            "Opened {} over bytes {}..{} (pieces {}..{})",
            session,
            logical_start_offset,
            logical_start_offset + length,
            input.pieces.first_index(),
            input.pieces.end_index()
        );
        if length > 0 {
            input.steer(0)?;
        }
        Ok(input)
    }

    /// Reads into `dst`, returning the number of bytes copied.
    ///
    /// Returns 0 at end of stream without suspending. Otherwise suspends
    /// until the cursor's piece is finished and copies the contiguous
    /// finished bytes that follow, stopping at the first unfinished piece.
    ///
    /// # Errors
    ///
    /// - `StreamingError::SessionClosed` - If the session is or becomes closed
    /// - `StreamingError::PieceDownloadFailed` - If the cursor's piece failed
    /// - `StreamingError::Storage` - If finished bytes cannot be read back
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, StreamingError> {
        self.ensure_open()?;
        let position = self.position();
        if position >= self.length || dst.is_empty() {
            return Ok(0);
        }

        let piece = self.steer(position)?;

        let buffered = self.buffer.lock().read_at(position, dst);
        if buffered > 0 {
            return Ok(self.advance(position, buffered));
        }

        self.wait_for(piece).await?;
        self.fill_buffer(position, piece).await?;

        let copied = self.buffer.lock().read_at(position, dst);
        if copied == 0 {
            // Only a concurrent close empties a freshly filled buffer.
            return Err(StreamingError::SessionClosed);
        }
        Ok(self.advance(position, copied))
    }

    /// Moves the cursor to `position` and slides the priority window there.
    ///
    /// Performs no I/O and never suspends. Seeking to `length()` is allowed
    /// and leaves the window where it was.
    ///
    /// # Errors
    ///
    /// - `StreamingError::SessionClosed` - If the session is closed
    /// - `StreamingError::InvalidRange` - If `position` is past `length()`
    pub fn seek(&self, position: u64) -> Result<(), StreamingError> {
        self.ensure_open()?;
        if position > self.length {
            return Err(StreamingError::invalid_range(format!(
                "seek to {position} past end {}",
                self.length
            )));
        }

        self.position.store(position, Ordering::Release);
        if position < self.length {
            self.steer(position)?;
        }
        Ok(())
    }

    /// Total logical size of the session.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Current logical cursor.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Cursor as an absolute torrent offset.
    pub fn absolute_position(&self) -> u64 {
        self.logical_start + self.position()
    }

    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.position())
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn pieces(&self) -> &PieceList {
        &self.pieces
    }

    /// Logical range currently held by the read buffer.
    pub fn buffered_range(&self) -> Range<u64> {
        self.buffer.lock().range()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Closes the session: wakes any suspended read with
    /// [`StreamingError::SessionClosed`], releases the buffer and drops the
    /// session's priority window. Idempotent.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.controller.detach(self.session);
        self.buffer.lock().clear();
        tracing::info!("Closed {} at position {}", self.session, self.position());
    }

    fn ensure_open(&self) -> Result<(), StreamingError> {
        if self.is_closed() {
            Err(StreamingError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn advance(&self, position: u64, count: usize) -> usize {
        self.position
            .store(position + count as u64, Ordering::Release);
        count
    }

    fn piece_at(&self, position: u64) -> Result<Piece, StreamingError> {
        let offset = self.logical_start + position;
        self.pieces.find_by_offset(offset).ok_or_else(|| {
            StreamingError::invalid_range(format!("offset {offset} is not in any piece"))
        })
    }

    /// Points the session's window at the piece holding `position`.
    fn steer(&self, position: u64) -> Result<Piece, StreamingError> {
        let piece = self.piece_at(position)?;
        self.controller.reposition(self.session, piece.index());
        Ok(piece)
    }

    fn is_finished(&self, index: PieceIndex) -> bool {
        matches!(self.pieces.state(index), Ok(PieceState::Finished))
    }

    async fn wait_for(&self, piece: Piece) -> Result<(), StreamingError> {
        if self.is_finished(piece.index()) {
            return Ok(());
        }

        tracing::debug!("{} waiting for piece {}", self.session, piece.index());
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                Err(StreamingError::SessionClosed)
            }
            finished = self.pieces.await_finished(piece.index()) => {
                finished.map_err(StreamingError::from)
            }
        }
    }

    /// Buffers the finished bytes around `position`, whose piece is known to
    /// be finished. Never waits for any other piece.
    async fn fill_buffer(&self, position: u64, piece: Piece) -> Result<(), StreamingError> {
        let cap = self.buffer.lock().per_direction() as u64;
        let forward = self.finished_forward(position, piece, cap);
        let backward = self.finished_backward(position, piece, cap);
        let wanted = position - backward..position + forward;

        let plan = self.buffer.lock().plan(wanted);
        let before = self.read_range(plan.before.clone()).await?;
        let after = self.read_range(plan.after.clone()).await?;

        tracing::trace!(
            "{} buffered {:?} (reused {} bytes)",
            self.session,
            plan.wanted,
            plan.kept_len()
        );
        let mut buffer = self.buffer.lock();
        if self.is_closed() {
            return Err(StreamingError::SessionClosed);
        }
        buffer.install(plan, &before, &after);
        Ok(())
    }

    /// Bytes from `position` (inclusive) to the end of the finished run,
    /// capped at `cap` and at the session end.
    fn finished_forward(&self, position: u64, piece: Piece, cap: u64) -> u64 {
        let logical_end = self.logical_start + self.length;
        let mut cursor = self.logical_start + position;
        let mut total = 0;
        let mut current = Some(piece);

        while let Some(piece) = current {
            if !self.is_finished(piece.index()) {
                break;
            }
            let end = piece.end_offset().min(logical_end);
            total += end - cursor;
            if total >= cap || end == logical_end {
                break;
            }
            cursor = end;
            current = self.pieces.get(piece.index().offset_by(1));
        }
        total.min(cap)
    }

    /// Bytes before `position` (exclusive) back to the start of the
    /// finished run, capped at `cap` and at the session start.
    fn finished_backward(&self, position: u64, piece: Piece, cap: u64) -> u64 {
        let mut cursor = self.logical_start + position;
        let mut total = 0;
        let mut current = Some(piece);

        while let Some(piece) = current {
            if !self.is_finished(piece.index()) {
                break;
            }
            let start = piece.offset().max(self.logical_start);
            total += cursor - start;
            if total >= cap || start == self.logical_start {
                break;
            }
            cursor = start;
            current = piece
                .index()
                .as_u32()
                .checked_sub(1)
                .and_then(|previous| self.pieces.get(PieceIndex::new(previous)));
        }
        total.min(cap)
    }

    /// Reads the logical `range` from storage, piece by piece.
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, StreamingError> {
        let mut bytes = Vec::with_capacity((range.end - range.start) as usize);
        let mut cursor = self.logical_start + range.start;
        let end = self.logical_start + range.end;

        while cursor < end {
            let piece = self.pieces.find_by_offset(cursor).ok_or_else(|| {
                StreamingError::invalid_range(format!("offset {cursor} is not in any piece"))
            })?;
            let take = piece.end_offset().min(end) - cursor;
            let chunk = self
                .storage
                .read_piece(piece, cursor - piece.offset(), take as usize)
                .await?;
            bytes.extend_from_slice(&chunk);
            cursor += take;
        }
        Ok(bytes)
    }
}

impl Drop for TorrentInput {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TorrentInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentInput")
            .field("session", &self.session)
            .field("logical_start", &self.logical_start)
            .field("length", &self.length)
            .field("position", &self.position())
            .field("closed", &self.is_closed())
            .finish()
    }
}
