//! Integration tests for reader sessions.
//!
//! Drive `TorrentInput` sessions through the public API while an engine
//! (hand-driven through `EngineBridge`, or the simulated engine) completes
//! pieces underneath them.

use std::sync::Arc;
use std::time::Duration;

use piecestream_core::config::{PriorityConfig, SimulationConfig};
use piecestream_core::engine::simulation::{SimulatedEngine, piece_digests};
use piecestream_core::verify::{StreamingHasher, hash_bytes};
use piecestream_core::{
    EngineBridge, EngineError, FileStorage, HashAlgorithm, MemoryStorage, PiecePriority,
    PieceIndex, PieceList, PieceState, PieceStore, StreamContext, StreamingError, TorrentInput,
};
use tokio::time::timeout;

/// Pieces, storage and a verifying bridge over deterministic source bytes.
struct StreamFixture {
    context: StreamContext,
    bridge: Arc<EngineBridge>,
    source: Vec<u8>,
}

impl StreamFixture {
    fn new(piece_count: u32, piece_size: u64, window_pieces: u32) -> Self {
        let pieces = PieceList::build(piece_count, |_| piece_size).unwrap();
        let storage: Arc<dyn PieceStore> = Arc::new(MemoryStorage::new());
        Self::with_storage(pieces, storage, window_pieces)
    }

    fn with_storage(pieces: PieceList, storage: Arc<dyn PieceStore>, window_pieces: u32) -> Self {
        let source: Vec<u8> = (0..pieces.total_size())
            .map(|offset| (offset * 7 % 251) as u8)
            .collect();
        let digests = piece_digests(&pieces, &source, HashAlgorithm::Sha1);
        let bridge = Arc::new(
            EngineBridge::with_digests(pieces.clone(), Arc::clone(&storage), digests).unwrap(),
        );
        let config = PriorityConfig {
            window_pieces: Some(window_pieces),
            ..PriorityConfig::default()
        };
        let context = StreamContext::new(pieces, storage, config);
        Self {
            context,
            bridge,
            source,
        }
    }

    fn piece_bytes(&self, index: u32) -> &[u8] {
        let piece = self.context.pieces().get(PieceIndex::new(index)).unwrap();
        &self.source[piece.offset() as usize..piece.end_offset() as usize]
    }

    async fn deliver(&self, index: u32) {
        let bytes = self.piece_bytes(index).to_vec();
        self.bridge.begin_download(PieceIndex::new(index)).unwrap();
        self.bridge
            .complete_download(PieceIndex::new(index), &bytes)
            .await
            .unwrap();
    }
}

async fn read_to_end(input: &TorrentInput) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 700];
    loop {
        let read = input.read(&mut chunk).await.unwrap();
        if read == 0 {
            return collected;
        }
        collected.extend_from_slice(&chunk[..read]);
    }
}

#[tokio::test]
async fn test_read_returns_finished_prefix_then_waits() {
    let fixture = StreamFixture::new(10, 5, 4);
    fixture.deliver(2).await;

    let pieces = fixture
        .context
        .pieces()
        .slice(PieceIndex::new(2)..PieceIndex::new(5))
        .unwrap();
    let input = Arc::new(TorrentInput::open(&fixture.context, pieces, 10, 128, 15).unwrap());

    let mut dst = [0u8; 20];
    assert_eq!(input.read(&mut dst).await.unwrap(), 5);
    assert_eq!(&dst[..5], fixture.piece_bytes(2));
    assert_eq!(input.position(), 5);
    assert_eq!(input.absolute_position(), 15);

    let pending = tokio::spawn({
        let input = Arc::clone(&input);
        async move {
            let mut dst = [0u8; 20];
            let read = input.read(&mut dst).await?;
            Ok::<_, StreamingError>(dst[..read].to_vec())
        }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());

    fixture.deliver(3).await;
    let bytes = timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(bytes, fixture.piece_bytes(3));
    assert_eq!(input.absolute_position(), 20);
}

#[tokio::test]
async fn test_closing_one_session_leaves_others_waiting() {
    let fixture = StreamFixture::new(4, 16, 2);
    let closing = Arc::new(fixture.context.open_range(0, 64, 64).unwrap());
    let staying = Arc::new(fixture.context.open_range(0, 64, 64).unwrap());

    let spawn_read = |input: Arc<TorrentInput>| {
        tokio::spawn(async move {
            let mut dst = [0u8; 8];
            input.read(&mut dst).await.map(|read| dst[..read].to_vec())
        })
    };
    let closed_read = spawn_read(Arc::clone(&closing));
    let open_read = spawn_read(Arc::clone(&staying));
    tokio::time::sleep(Duration::from_millis(20)).await;

    closing.close();
    let result = timeout(Duration::from_secs(5), closed_read)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StreamingError::SessionClosed)));

    // The surviving session still holds piece 0 at top priority.
    assert_eq!(fixture.context.controller().session_count(), 1);
    assert_eq!(
        fixture
            .context
            .controller()
            .table()
            .priority(PieceIndex::new(0)),
        PiecePriority::TOP
    );
    assert!(!open_read.is_finished());

    fixture.deliver(0).await;
    let bytes = timeout(Duration::from_secs(5), open_read)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(bytes, &fixture.piece_bytes(0)[..8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_waiter_resumes_once() {
    let fixture = StreamFixture::new(3, 32, 2);
    let pieces = fixture.context.pieces().clone();

    let waiters: Vec<_> = (0..32)
        .map(|_| {
            let pieces = pieces.clone();
            tokio::spawn(async move { pieces.await_finished(PieceIndex::new(1)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    fixture.deliver(1).await;
    for waiter in waiters {
        let result = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}

#[tokio::test]
async fn test_seek_moves_the_priority_window() {
    let fixture = StreamFixture::new(100, 4, 5);
    let input = fixture.context.open_range(0, 400, 64).unwrap();
    let table = Arc::clone(fixture.context.controller().table());

    assert_eq!(table.priority(PieceIndex::new(0)), PiecePriority::TOP);

    input.seek(200).unwrap();
    for index in 50..55 {
        assert!(table.priority(PieceIndex::new(index)).is_elevated());
    }
    assert_eq!(table.priority(PieceIndex::new(50)), PiecePriority::TOP);
    assert_eq!(table.priority(PieceIndex::new(55)), PiecePriority::BACKGROUND);
    assert_eq!(table.priority(PieceIndex::new(0)), PiecePriority::BACKGROUND);
    assert_eq!(
        table.ranked(),
        (50..55).map(PieceIndex::new).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_corrupt_piece_is_never_exposed() {
    let fixture = StreamFixture::new(4, 8, 2);
    let input = fixture.context.open_range(0, 32, 64).unwrap();
    let index = PieceIndex::new(0);

    fixture.bridge.begin_download(index).unwrap();
    let error = fixture
        .bridge
        .complete_download(index, &[0u8; 8])
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::IntegrityMismatch { .. }));
    assert!(matches!(
        StreamingError::from(error),
        StreamingError::IntegrityMismatch { .. }
    ));

    let mut dst = [0u8; 8];
    let failed = input.read(&mut dst).await.unwrap_err();
    assert!(matches!(failed, StreamingError::PieceDownloadFailed { .. }));

    fixture.deliver(0).await;
    assert_eq!(input.read(&mut dst).await.unwrap(), 8);
    assert_eq!(&dst[..], fixture.piece_bytes(0));
}

#[tokio::test]
async fn test_playback_against_simulated_engine_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let total_size = 64 * 1024 - 100;
    let pieces = PieceList::from_total_size(total_size, 1024, 0).unwrap();
    assert_eq!(pieces.len(), 64);
    assert_eq!(pieces.last().unwrap().size(), 924);

    let storage: Arc<dyn PieceStore> = Arc::new(
        FileStorage::open(dir.path().join("movie.mkv"), 0..total_size)
            .await
            .unwrap(),
    );
    let fixture = StreamFixture::with_storage(pieces, storage, 4);
    let engine = SimulatedEngine::new(
        Arc::clone(&fixture.bridge),
        Arc::clone(fixture.context.controller().table()),
        fixture.source.clone(),
        SimulationConfig {
            concurrency: 3,
            ..SimulationConfig::deterministic_testing()
        },
    );
    let run = tokio::spawn(engine.run());

    let input = fixture.context.open_range(0, total_size, 4096).unwrap();

    // Jump into the middle first, like a player reading the container index.
    input.seek(40_000).unwrap();
    let tail = timeout(Duration::from_secs(10), read_to_end(&input))
        .await
        .unwrap();
    assert_eq!(tail, &fixture.source[40_000..]);

    input.seek(0).unwrap();
    let whole = timeout(Duration::from_secs(10), read_to_end(&input))
        .await
        .unwrap();
    let mut hasher = StreamingHasher::new(HashAlgorithm::Md5);
    hasher.update(&whole);
    assert_eq!(
        hasher.finalize(),
        hash_bytes(HashAlgorithm::Md5, &fixture.source)
    );

    let stats = run.await.unwrap().unwrap();
    assert_eq!(stats.completed, 64);
    assert!(fixture.context.pieces().is_complete());
    assert_eq!(
        fixture.context.pieces().state(PieceIndex::new(63)).unwrap(),
        PieceState::Finished
    );
}
