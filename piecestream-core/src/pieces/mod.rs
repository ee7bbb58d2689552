//! Decomposition of a torrent's byte space into pieces.
//!
//! A [`PieceList`] is built once per download and never changes shape. Each
//! piece carries its own state cell (see [`state`]); slices of a list share
//! those cells and the absolute piece index space with the list they were
//! cut from.

pub mod state;

use std::fmt;
use std::ops::{Range, RangeInclusive};
use std::sync::Arc;

use tokio::sync::watch;

pub use state::PieceState;
use state::PieceSlot;

/// Zero-based index of a piece within a torrent.
///
/// Indices are absolute: a slice covering pieces `50..60` still addresses
/// its first piece as `PieceIndex(50)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index `distance` pieces after this one.
    pub fn offset_by(self, distance: u32) -> Self {
        Self(self.0.saturating_add(distance))
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One contiguous chunk of the torrent's linear byte space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Piece {
    index: PieceIndex,
    offset: u64,
    size: u64,
}

impl Piece {
    /// Creates a piece. `size` must be non-zero; [`PieceList`] constructors
    /// reject zero sizes before getting here.
    pub(crate) fn new(index: PieceIndex, offset: u64, size: u64) -> Self {
        debug_assert!(size > 0, "pieces are never empty");
        Self {
            index,
            offset,
            size,
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// Absolute offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Absolute offset of the last byte (inclusive).
    pub fn last_offset(&self) -> u64 {
        self.offset + self.size - 1
    }

    /// Absolute offset one past the last byte.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }

    pub fn offset_range(&self) -> RangeInclusive<u64> {
        self.offset..=self.last_offset()
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end_offset()
    }
}

/// Errors raised by piece construction and the piece state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PieceError {
    /// A size function returned zero for a piece.
    #[error("Piece {index} has zero size")]
    ZeroSizedPiece {
        /// Index of the empty piece.
        index: PieceIndex,
    },

    /// Nominal piece size of zero passed to a size-based constructor.
    #[error("Piece size must be positive")]
    InvalidPieceSize,

    /// Accumulated offsets or indices no longer fit their integer type.
    #[error("Piece layout overflows at piece {index}")]
    LayoutOverflow {
        /// First index whose offset could not be represented.
        index: PieceIndex,
    },

    /// An index outside the list (or slice) was addressed.
    #[error("Piece {index} out of bounds {start}..{end}")]
    IndexOutOfBounds {
        /// Requested index.
        index: PieceIndex,
        /// First valid index.
        start: PieceIndex,
        /// One past the last valid index.
        end: PieceIndex,
    },

    /// A slice range that is reversed or exceeds the list.
    #[error("Invalid piece slice {start}..{end}")]
    InvalidSlice {
        /// Requested first index.
        start: PieceIndex,
        /// Requested end index (exclusive).
        end: PieceIndex,
    },

    /// The engine attempted a transition the lifecycle does not allow.
    #[error("Illegal transition of piece {index}: {from} -> {to}")]
    IllegalTransition {
        /// Piece the transition was attempted on.
        index: PieceIndex,
        /// State at the time of the attempt.
        from: PieceState,
        /// Requested state.
        to: PieceState,
    },

    /// The piece entered `Failed` while a caller was waiting for it.
    #[error("Piece {index} download failed")]
    DownloadFailed {
        /// Piece that failed.
        index: PieceIndex,
    },
}

/// Ordered, gap-free sequence of pieces with shared download state.
///
/// Cloning is cheap; clones and slices observe the same state cells.
#[derive(Clone)]
pub struct PieceList {
    slots: Arc<[PieceSlot]>,
    start: usize,
    end: usize,
    first_index: PieceIndex,
    start_offset: u64,
}

impl PieceList {
    /// Builds `count` pieces starting at offset 0 and index 0.
    ///
    /// # Errors
    ///
    /// - `PieceError::ZeroSizedPiece` - If `size_of` returns 0 for any piece
    /// - `PieceError::LayoutOverflow` - If offsets exceed `u64`
    pub fn build(
        count: u32,
        size_of: impl FnMut(PieceIndex) -> u64,
    ) -> Result<Self, PieceError> {
        Self::build_from(count, 0, PieceIndex::new(0), size_of)
    }

    /// Builds `count` pieces whose first piece sits at `initial_offset` with
    /// absolute index `initial_index`. Offsets accumulate `size_of` in index
    /// order.
    ///
    /// # Errors
    ///
    /// - `PieceError::ZeroSizedPiece` - If `size_of` returns 0 for any piece
    /// - `PieceError::LayoutOverflow` - If offsets or indices overflow
    pub fn build_from(
        count: u32,
        initial_offset: u64,
        initial_index: PieceIndex,
        mut size_of: impl FnMut(PieceIndex) -> u64,
    ) -> Result<Self, PieceError> {
        if initial_index.as_u32().checked_add(count).is_none() {
            return Err(PieceError::LayoutOverflow {
                index: initial_index,
            });
        }

        let mut slots = Vec::with_capacity(count as usize);
        let mut offset = initial_offset;
        for i in 0..count {
            let index = initial_index.offset_by(i);
            let size = size_of(index);
            if size == 0 {
                return Err(PieceError::ZeroSizedPiece { index });
            }
            slots.push(PieceSlot::new(Piece::new(index, offset, size)));
            offset = offset
                .checked_add(size)
                .ok_or(PieceError::LayoutOverflow { index })?;
        }

        let end = slots.len();
        Ok(Self {
            slots: slots.into(),
            start: 0,
            end,
            first_index: initial_index,
            start_offset: initial_offset,
        })
    }

    /// Splits `total_size` bytes into pieces of `piece_size`; the last piece
    /// holds the remainder.
    ///
    /// # Errors
    ///
    /// - `PieceError::InvalidPieceSize` - If `piece_size` is 0
    /// - `PieceError::LayoutOverflow` - If more than `u32::MAX` pieces result
    pub fn from_total_size(
        total_size: u64,
        piece_size: u64,
        initial_offset: u64,
    ) -> Result<Self, PieceError> {
        if piece_size == 0 {
            return Err(PieceError::InvalidPieceSize);
        }

        let count = u32::try_from(total_size.div_ceil(piece_size)).map_err(|_| {
            PieceError::LayoutOverflow {
                index: PieceIndex::new(u32::MAX),
            }
        })?;
        let last = count.saturating_sub(1);

        Self::build_from(count, initial_offset, PieceIndex::new(0), |index| {
            if index.as_u32() == last && total_size % piece_size != 0 {
                total_size % piece_size
            } else {
                piece_size
            }
        })
    }

    /// Creates an empty list.
    pub fn empty() -> Self {
        Self {
            slots: Vec::new().into(),
            start: 0,
            end: 0,
            first_index: PieceIndex::new(0),
            start_offset: 0,
        }
    }

    fn visible(&self) -> &[PieceSlot] {
        &self.slots[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// First absolute index in this list.
    pub fn first_index(&self) -> PieceIndex {
        self.first_index
    }

    /// One past the last absolute index in this list.
    pub fn end_index(&self) -> PieceIndex {
        self.first_index().offset_by(self.len() as u32)
    }

    pub fn first(&self) -> Option<Piece> {
        self.visible().first().map(PieceSlot::piece)
    }

    pub fn last(&self) -> Option<Piece> {
        self.visible().last().map(PieceSlot::piece)
    }

    /// Absolute offset of the first byte covered by this list. An empty
    /// list reports the offset it was built or sliced at.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Absolute offset one past the last byte covered by this list.
    pub fn end_offset(&self) -> u64 {
        self.last()
            .map(|piece| piece.end_offset())
            .unwrap_or_else(|| self.start_offset())
    }

    /// Sum of all piece sizes.
    pub fn total_size(&self) -> u64 {
        self.end_offset() - self.start_offset()
    }

    pub fn contains_index(&self, index: PieceIndex) -> bool {
        index >= self.first_index() && index < self.end_index()
    }

    pub fn get(&self, index: PieceIndex) -> Option<Piece> {
        self.slot(index).ok().map(PieceSlot::piece)
    }

    pub fn iter(&self) -> impl Iterator<Item = Piece> + '_ {
        self.visible().iter().map(PieceSlot::piece)
    }

    /// Finds the piece containing the absolute byte `offset`.
    pub fn find_by_offset(&self, offset: u64) -> Option<Piece> {
        let slots = self.visible();
        let position = slots.partition_point(|slot| slot.piece().end_offset() <= offset);
        slots
            .get(position)
            .map(PieceSlot::piece)
            .filter(|piece| piece.contains_offset(offset))
    }

    /// Returns a view of the pieces in `range` (absolute indices).
    ///
    /// The view shares state cells with `self`.
    ///
    /// # Errors
    ///
    /// - `PieceError::InvalidSlice` - If the range is reversed or not within this list
    pub fn slice(&self, range: Range<PieceIndex>) -> Result<Self, PieceError> {
        let invalid = PieceError::InvalidSlice {
            start: range.start,
            end: range.end,
        };
        if range.start > range.end
            || range.start < self.first_index()
            || range.end > self.end_index()
        {
            return Err(invalid);
        }

        let base = self.first_index().as_u32();
        let start_offset = self
            .get(range.start)
            .map(|piece| piece.offset())
            .unwrap_or_else(|| self.end_offset());
        Ok(Self {
            slots: Arc::clone(&self.slots),
            start: self.start + (range.start.as_u32() - base) as usize,
            end: self.start + (range.end.as_u32() - base) as usize,
            first_index: range.start,
            start_offset,
        })
    }

    pub(crate) fn slot(&self, index: PieceIndex) -> Result<&PieceSlot, PieceError> {
        if !self.contains_index(index) {
            return Err(PieceError::IndexOutOfBounds {
                index,
                start: self.first_index(),
                end: self.end_index(),
            });
        }
        let position = (index.as_u32() - self.first_index().as_u32()) as usize;
        Ok(&self.visible()[position])
    }

    /// Non-blocking snapshot of a piece's state.
    ///
    /// # Errors
    ///
    /// - `PieceError::IndexOutOfBounds` - If `index` is not in this list
    pub fn state(&self, index: PieceIndex) -> Result<PieceState, PieceError> {
        Ok(self.slot(index)?.current())
    }

    /// Suspends until the piece is `Finished`.
    ///
    /// Completes without suspending when the piece is already finished. Any
    /// number of callers may wait on the same piece; dropping the returned
    /// future unregisters only that caller.
    ///
    /// # Errors
    ///
    /// - `PieceError::IndexOutOfBounds` - If `index` is not in this list
    /// - `PieceError::DownloadFailed` - If the piece is or becomes `Failed`
    pub async fn await_finished(&self, index: PieceIndex) -> Result<(), PieceError> {
        self.slot(index)?.wait_finished().await
    }

    /// Moves a piece to `next`, returning its previous state. Called by the
    /// download engine only.
    ///
    /// # Errors
    ///
    /// - `PieceError::IndexOutOfBounds` - If `index` is not in this list
    /// - `PieceError::IllegalTransition` - If the lifecycle forbids the edge
    pub fn transition(&self, index: PieceIndex, next: PieceState) -> Result<PieceState, PieceError> {
        self.slot(index)?.transition(next)
    }

    /// Observes every state change of one piece.
    ///
    /// # Errors
    ///
    /// - `PieceError::IndexOutOfBounds` - If `index` is not in this list
    pub fn subscribe(&self, index: PieceIndex) -> Result<watch::Receiver<PieceState>, PieceError> {
        Ok(self.slot(index)?.subscribe())
    }

    /// Number of finished pieces in this list.
    pub fn finished_count(&self) -> usize {
        self.visible()
            .iter()
            .filter(|slot| slot.current() == PieceState::Finished)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.finished_count() == self.len()
    }
}

impl fmt::Debug for PieceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceList")
            .field("indices", &(self.first_index()..self.end_index()))
            .field("offsets", &(self.start_offset()..self.end_offset()))
            .field("finished", &self.finished_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ten_by_five() -> PieceList {
        PieceList::build(10, |_| 5).unwrap()
    }

    #[test]
    fn test_piece_offsets_accumulate() {
        let pieces = ten_by_five();
        let piece = pieces.get(PieceIndex::new(3)).unwrap();
        assert_eq!(piece.offset(), 15);
        assert_eq!(piece.last_offset(), 19);
        assert_eq!(piece.offset_range(), 15..=19);
        assert_eq!(pieces.total_size(), 50);
    }

    #[test]
    fn test_from_total_size_keeps_remainder_in_last_piece() {
        let pieces = PieceList::from_total_size(592, 16, 1000).unwrap();
        assert_eq!(pieces.len(), 37);
        assert_eq!(pieces.start_offset(), 1000);
        assert_eq!(pieces.end_offset(), 1592);

        let pieces = PieceList::from_total_size(100, 30, 0).unwrap();
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces.last().unwrap().size(), 10);
        assert_eq!(pieces.last().unwrap().offset(), 90);
    }

    #[test]
    fn test_empty_lists() {
        let pieces = PieceList::build(0, |_| 5).unwrap();
        assert!(pieces.is_empty());
        assert_eq!(pieces.total_size(), 0);
        assert!(pieces.find_by_offset(0).is_none());
        assert!(PieceList::from_total_size(0, 16, 0).unwrap().is_empty());
        assert!(PieceList::empty().is_complete());
    }

    #[test]
    fn test_empty_lists_keep_their_base_offset() {
        let pieces = PieceList::build_from(0, 1, PieceIndex::new(0), |_| 5).unwrap();
        assert_eq!(pieces.start_offset(), 1);
        assert_eq!(pieces.end_offset(), 1);
        assert_eq!(pieces.total_size(), 0);

        let pieces = PieceList::from_total_size(0, 16, 1000).unwrap();
        assert_eq!(pieces.start_offset(), 1000);

        let pieces = PieceList::build_from(4, 100, PieceIndex::new(0), |_| 5).unwrap();
        let middle = pieces.slice(PieceIndex::new(2)..PieceIndex::new(2)).unwrap();
        assert!(middle.is_empty());
        assert_eq!(middle.start_offset(), 110);
        assert_eq!(middle.end_offset(), 110);
        let tail = pieces.slice(PieceIndex::new(4)..PieceIndex::new(4)).unwrap();
        assert_eq!(tail.start_offset(), 120);
    }

    #[test]
    fn test_rejects_degenerate_sizes() {
        assert_eq!(
            PieceList::build(3, |index| if index.as_u32() == 1 { 0 } else { 4 }).unwrap_err(),
            PieceError::ZeroSizedPiece {
                index: PieceIndex::new(1)
            }
        );
        assert_eq!(
            PieceList::from_total_size(10, 0, 0).unwrap_err(),
            PieceError::InvalidPieceSize
        );
        assert!(matches!(
            PieceList::build_from(2, u64::MAX - 1, PieceIndex::new(0), |_| 4),
            Err(PieceError::LayoutOverflow { .. })
        ));
    }

    #[test]
    fn test_find_by_offset() {
        let pieces = ten_by_five();
        assert_eq!(pieces.find_by_offset(0).unwrap().index(), PieceIndex::new(0));
        assert_eq!(pieces.find_by_offset(4).unwrap().index(), PieceIndex::new(0));
        assert_eq!(pieces.find_by_offset(5).unwrap().index(), PieceIndex::new(1));
        assert_eq!(pieces.find_by_offset(49).unwrap().index(), PieceIndex::new(9));
        assert!(pieces.find_by_offset(50).is_none());
    }

    #[test]
    fn test_slice_shares_state_and_index_space() {
        let pieces = ten_by_five();
        let slice = pieces
            .slice(PieceIndex::new(2)..PieceIndex::new(5))
            .unwrap();
        assert_eq!(slice.len(), 3);
        assert_eq!(slice.first_index(), PieceIndex::new(2));
        assert_eq!(slice.start_offset(), 10);
        assert_eq!(slice.end_offset(), 25);
        assert!(slice.find_by_offset(5).is_none());

        slice
            .transition(PieceIndex::new(3), PieceState::Downloading)
            .unwrap();
        assert_eq!(
            pieces.state(PieceIndex::new(3)).unwrap(),
            PieceState::Downloading
        );

        assert!(matches!(
            slice.state(PieceIndex::new(5)),
            Err(PieceError::IndexOutOfBounds { .. })
        ));

        let nested = slice.slice(PieceIndex::new(3)..PieceIndex::new(4)).unwrap();
        assert_eq!(nested.first().unwrap().offset(), 15);
        assert!(
            slice
                .slice(PieceIndex::new(1)..PieceIndex::new(3))
                .is_err()
        );
    }

    #[test]
    fn test_states_are_independent_per_piece() {
        let pieces = ten_by_five();
        pieces
            .transition(PieceIndex::new(0), PieceState::Downloading)
            .unwrap();
        assert_eq!(pieces.state(PieceIndex::new(0)).unwrap(), PieceState::Downloading);
        for index in 1..10 {
            assert_eq!(
                pieces.state(PieceIndex::new(index)).unwrap(),
                PieceState::Ready
            );
        }
    }

    #[tokio::test]
    async fn test_all_waiters_resume_once() {
        let pieces = ten_by_five();
        let index = PieceIndex::new(4);

        let waiters: Vec<_> = (0..16)
            .map(|_| {
                let pieces = pieces.clone();
                tokio::spawn(async move { pieces.await_finished(index).await })
            })
            .collect();
        tokio::task::yield_now().await;

        pieces.transition(index, PieceState::Downloading).unwrap();
        pieces.transition(index, PieceState::Finished).unwrap();

        let results = futures::future::join_all(waiters).await;
        assert_eq!(results.len(), 16);
        for result in results {
            assert!(result.unwrap().is_ok());
        }
        assert!(!pieces.is_complete());
        assert_eq!(pieces.finished_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_build_is_contiguous(
            sizes in proptest::collection::vec(1u64..10_000, 0..200),
            initial_offset in 0u64..1_000_000,
        ) {
            let pieces = PieceList::build_from(
                sizes.len() as u32,
                initial_offset,
                PieceIndex::new(0),
                |index| sizes[index.as_u32() as usize],
            ).unwrap();

            prop_assert_eq!(pieces.len(), sizes.len());
            prop_assert_eq!(pieces.total_size(), sizes.iter().sum::<u64>());
            prop_assert_eq!(pieces.start_offset(), initial_offset);

            let mut expected_offset = initial_offset;
            for (position, piece) in pieces.iter().enumerate() {
                prop_assert_eq!(piece.index().as_u32() as usize, position);
                prop_assert_eq!(piece.offset(), expected_offset);
                prop_assert_eq!(piece.size(), sizes[position]);
                expected_offset = piece.end_offset();
            }
        }

        #[test]
        fn prop_every_offset_maps_to_its_piece(
            total in 1u64..5_000,
            piece_size in 1u64..300,
            offset in 0u64..5_000,
        ) {
            let pieces = PieceList::from_total_size(total, piece_size, 0).unwrap();
            match pieces.find_by_offset(offset) {
                Some(piece) => {
                    prop_assert!(offset < total);
                    prop_assert!(piece.contains_offset(offset));
                    prop_assert_eq!(piece.index().as_u32() as u64, offset / piece_size);
                }
                None => prop_assert!(offset >= total),
            }
        }
    }
}
