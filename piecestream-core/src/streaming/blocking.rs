//! `std::io` adapter for synchronous decoders.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tokio::runtime::Handle;

use super::{StreamingError, TorrentInput};

/// Blocking `Read + Seek` view of a [`TorrentInput`].
///
/// Each call blocks the current thread on the given runtime, so it must be
/// used from outside the runtime's worker threads (for example inside
/// `tokio::task::spawn_blocking` or on a decoder thread).
#[derive(Debug)]
pub struct BlockingTorrentInput {
    input: Arc<TorrentInput>,
    handle: Handle,
}

impl BlockingTorrentInput {
    pub fn new(input: Arc<TorrentInput>, handle: Handle) -> Self {
        Self { input, handle }
    }

    pub fn input(&self) -> &Arc<TorrentInput> {
        &self.input
    }

    pub fn into_inner(self) -> Arc<TorrentInput> {
        self.input
    }
}

impl Read for BlockingTorrentInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let input = &self.input;
        self.handle
            .block_on(input.read(buf))
            .map_err(io::Error::from)
    }
}

impl Seek for BlockingTorrentInput {
    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match position {
            SeekFrom::Start(offset) => (offset, 0),
            SeekFrom::Current(delta) => (self.input.position(), delta),
            SeekFrom::End(delta) => (self.input.length(), delta),
        };
        let target = base.checked_add_signed(delta).ok_or_else(|| {
            io::Error::from(StreamingError::invalid_range(format!(
                "seek to {base}{delta:+} is out of range"
            )))
        })?;

        self.input.seek(target)?;
        Ok(target)
    }
}
