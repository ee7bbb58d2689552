//! Bidirectional read buffer.
//!
//! Holds a contiguous run of finished bytes around the cursor, up to
//! `per_direction` bytes on each side, so short seeks backwards or forwards
//! are served without touching storage. Positions are logical stream
//! positions.

use std::ops::Range;

/// Contiguous window of already-read stream bytes.
#[derive(Debug)]
pub struct ReadBuffer {
    per_direction: usize,
    start: u64,
    data: Vec<u8>,
}

/// Result of [`ReadBuffer::plan`]: what a refill keeps and what it must fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillPlan {
    /// Range the buffer will hold after the fill.
    pub wanted: Range<u64>,
    /// Missing bytes in front of the reused part.
    pub before: Range<u64>,
    /// Missing bytes after the reused part.
    pub after: Range<u64>,
    kept: Vec<u8>,
}

impl FillPlan {
    /// Bytes carried over from the current buffer.
    pub fn kept_len(&self) -> usize {
        self.kept.len()
    }
}

impl ReadBuffer {
    /// Creates an empty buffer holding at most `per_direction` bytes on each
    /// side of the cursor.
    pub fn new(per_direction: usize) -> Self {
        Self {
            per_direction: per_direction.max(1),
            start: 0,
            data: Vec::new(),
        }
    }

    pub fn per_direction(&self) -> usize {
        self.per_direction
    }

    /// Logical range currently buffered.
    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains(&self, position: u64) -> bool {
        self.range().contains(&position)
    }

    /// Copies buffered bytes starting at `position` into `dst`.
    ///
    /// Returns 0 when `position` is not buffered.
    pub fn read_at(&self, position: u64, dst: &mut [u8]) -> usize {
        if !self.contains(position) {
            return 0;
        }
        let from = (position - self.start) as usize;
        let count = dst.len().min(self.data.len() - from);
        dst[..count].copy_from_slice(&self.data[from..from + count]);
        count
    }

    /// Plans a refill so the buffer holds `wanted`, reusing the overlap
    /// with the current contents.
    pub fn plan(&self, wanted: Range<u64>) -> FillPlan {
        let current = self.range();
        let kept_start = wanted.start.max(current.start);
        let kept_end = wanted.end.min(current.end);

        if kept_start >= kept_end {
            return FillPlan {
                before: wanted.clone(),
                after: wanted.end..wanted.end,
                wanted,
                kept: Vec::new(),
            };
        }

        let kept = self.data[(kept_start - self.start) as usize..(kept_end - self.start) as usize]
            .to_vec();
        FillPlan {
            before: wanted.start..kept_start,
            after: kept_end..wanted.end,
            wanted,
            kept,
        }
    }

    /// Replaces the contents with `plan.wanted`, given the fetched `before`
    /// and `after` bytes.
    pub fn install(&mut self, plan: FillPlan, before: &[u8], after: &[u8]) {
        debug_assert_eq!(before.len() as u64, plan.before.end - plan.before.start);
        debug_assert_eq!(after.len() as u64, plan.after.end - plan.after.start);

        let mut data = Vec::with_capacity(before.len() + plan.kept.len() + after.len());
        data.extend_from_slice(before);
        data.extend_from_slice(&plan.kept);
        data.extend_from_slice(after);

        self.start = plan.wanted.start;
        self.data = data;
    }

    /// Drops the buffered bytes and releases their memory.
    pub fn clear(&mut self) {
        self.start = 0;
        self.data = Vec::new();
    }
}
