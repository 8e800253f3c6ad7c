use super::*;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::source::{SourceError, SourceStream};
use crate::storage::{piece_checksum, MemoryPieceStore};

const PIECE: usize = 1024;

fn content(len: usize) -> Bytes {
    (0..len).map(|i| (i * 7 % 253) as u8).collect::<Vec<_>>().into()
}

/// Emits one piece per gate permit and counts how often it is opened.
struct GatedSource {
    data: Bytes,
    fail_at: Option<usize>,
    gate: Arc<Semaphore>,
    opens: AtomicU32,
}

impl GatedSource {
    fn open(data: Bytes) -> Arc<Self> {
        Arc::new(Self::with_gate(data, Semaphore::MAX_PERMITS))
    }

    fn gated(data: Bytes) -> Arc<Self> {
        Arc::new(Self::with_gate(data, 0))
    }

    fn with_gate(data: Bytes, permits: usize) -> Self {
        Self {
            data,
            fail_at: None,
            gate: Arc::new(Semaphore::new(permits)),
            opens: AtomicU32::new(0),
        }
    }

    fn release(&self, pieces: usize) {
        self.gate.add_permits(pieces);
    }

    fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for GatedSource {
    async fn open_range(
        &self,
        _source: &SourceDescriptor,
        start: u64,
    ) -> Result<SourceStream, SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let data = self.data.clone();
        let gate = self.gate.clone();
        let end = self.fail_at.unwrap_or(data.len()).min(data.len());
        let fails = self.fail_at.is_some();

        let body = stream::unfold((start as usize, false), move |(offset, done)| {
            let data = data.clone();
            let gate = gate.clone();
            async move {
                if done {
                    return None;
                }
                if offset >= end {
                    if !fails {
                        return None;
                    }
                    let err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
                    return Some((Err(SourceError::Io(err)), (offset, true)));
                }
                gate.acquire().await.ok()?.forget();
                let next = (offset + PIECE).min(end);
                Some((Ok(data.slice(offset..next)), (next, false)))
            }
        })
        .boxed();

        Ok(SourceStream {
            body,
            start,
            supports_range: true,
            content_length: Some(self.data.len() as u64),
        })
    }
}

fn config() -> CdnConfig {
    let mut config = CdnConfig::default();
    config.task.piece_length = PIECE as u64;
    config.storage.capacity = 1 << 20;
    config.fetch.backoff_base_ms = 1;
    config.fetch.backoff_max_ms = 4;
    config.gc.min_free_capacity = 0;
    config
}

fn cache(source: Arc<GatedSource>, capacity: u64) -> Arc<SeedCache> {
    let store = Arc::new(MemoryPieceStore::new(capacity));
    Arc::new(SeedCache::new(store, source, &config()).unwrap())
}

fn origin(name: &str) -> SourceDescriptor {
    SourceDescriptor::new(format!("http://origin/{name}"))
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[tokio::test]
async fn test_round_trip() {
    let data = content(2500);
    let source = GatedSource::open(data.clone());
    let cache = cache(source.clone(), 1 << 20);
    let src = origin("blob");

    let mut assembled = Vec::new();
    for seq in 0..3 {
        let piece = cache.request_piece("blob", &src, seq, soon()).await.unwrap();
        assert_eq!(piece.seq(), seq);
        assert_eq!(piece.record.checksum, piece_checksum(&piece.data));
        assembled.extend_from_slice(&piece.data);
    }
    assert_eq!(assembled, data);

    let info = cache.wait_for_task("blob", soon()).await.unwrap();
    assert_eq!(info.state, TaskState::Success);
    assert_eq!(info.total_length, Some(2500));
    assert_eq!(info.piece_count, Some(3));
    assert_eq!(info.piece_length, PIECE as u64);
    assert_eq!(info.digest.as_deref(), Some(piece_checksum(&data).as_str()));
    assert_eq!(info.supports_range, Some(true));

    assert!(matches!(
        cache.request_piece("blob", &src, 3, soon()).await,
        Err(CdnError::PieceOutOfRange {
            seq: 3,
            piece_count: 3
        })
    ));
    assert_eq!(source.opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_under_concurrent_first_touch() {
    let data = content(8 * PIECE);
    let source = GatedSource::open(data.clone());
    let cache = cache(source.clone(), 1 << 20);

    let requests = (0..32u32).map(|i| {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .request_piece("shared", &origin("shared"), i % 8, soon())
                .await
        })
    });
    let pieces = join_all(requests).await;

    for (i, piece) in pieces.into_iter().enumerate() {
        let piece = piece.unwrap().unwrap();
        let start = (i % 8) * PIECE;
        assert_eq!(piece.data, data.slice(start..start + PIECE));
    }
    assert_eq!(source.opens(), 1);
    assert_eq!(cache.registry().len(), 1);
}

#[tokio::test]
async fn test_attach_mid_download() {
    let data = content(6 * PIECE);
    let source = GatedSource::gated(data.clone());
    let cache = cache(source.clone(), 1 << 20);
    let src = origin("video");

    source.release(2);
    let first = cache.request_piece("video", &src, 1, soon()).await.unwrap();
    assert_eq!(first.data, data.slice(PIECE..2 * PIECE));

    let info = cache.get_task_info("video").unwrap();
    assert_eq!(info.state, TaskState::Fetching);
    assert_eq!(info.available_pieces, 2);
    assert_eq!(info.total_length, Some(6 * PIECE as u64));

    let late = {
        let cache = cache.clone();
        let src = src.clone();
        tokio::spawn(async move { cache.request_piece("video", &src, 5, soon()).await })
    };
    // an attached reader does not start a second fetch
    let early = cache.request_piece("video", &src, 0, soon()).await.unwrap();
    assert_eq!(early.data, data.slice(0..PIECE));

    source.release(4);
    let last = late.await.unwrap().unwrap();
    assert_eq!(last.data, data.slice(5 * PIECE..));
    assert_eq!(source.opens(), 1);
}

#[tokio::test]
async fn test_timeout_leaves_fetch_running() {
    let source = GatedSource::gated(content(2 * PIECE));
    let cache = cache(source.clone(), 1 << 20);
    let src = origin("slow");

    let deadline = Instant::now() + Duration::from_millis(50);
    match cache.request_piece("slow", &src, 0, deadline).await {
        Err(CdnError::Timeout { key, seq }) => {
            assert_eq!(key, "slow");
            assert_eq!(seq, Some(0));
        }
        other => panic!("expected timeout, got {:?}", other.map(|p| p.seq())),
    }
    assert_eq!(
        cache.get_task_info("slow").unwrap().state,
        TaskState::Fetching
    );

    source.release(2);
    let piece = cache.request_piece("slow", &src, 1, soon()).await.unwrap();
    assert_eq!(piece.seq(), 1);
    assert_eq!(source.opens(), 1);
}

#[tokio::test]
async fn test_failed_fetch_closes_waiters() {
    let data = content(10 * PIECE);
    let mut gated = GatedSource::with_gate(data.clone(), 0);
    gated.fail_at = Some(5 * PIECE);
    let source = Arc::new(gated);
    let cache = cache(source.clone(), 1 << 20);
    let src = origin("flaky");

    let waiters: Vec<_> = [6u32, 9]
        .into_iter()
        .map(|seq| {
            let cache = cache.clone();
            let src = src.clone();
            tokio::spawn(async move { cache.request_piece("flaky", &src, seq, soon()).await })
        })
        .collect();
    let early = {
        let cache = cache.clone();
        let src = src.clone();
        tokio::spawn(async move { cache.request_piece("flaky", &src, 4, soon()).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    source.release(100);

    for waiter in waiters {
        assert!(matches!(
            waiter.await.unwrap(),
            Err(CdnError::TaskClosed(key)) if key == "flaky"
        ));
    }
    assert_eq!(early.await.unwrap().unwrap().seq(), 4);

    let info = cache.wait_for_task("flaky", soon()).await.unwrap();
    assert_eq!(info.state, TaskState::Fail);
    assert_eq!(info.available_pieces, 5);
    // one initial attempt plus three retries
    assert_eq!(source.opens(), 4);

    // a new request re-creates the task and reuses the persisted prefix
    let piece = cache.request_piece("flaky", &src, 2, soon()).await.unwrap();
    assert_eq!(piece.data, data.slice(2 * PIECE..3 * PIECE));
}

#[tokio::test]
async fn test_invalidate_task() {
    let source = GatedSource::gated(content(2 * PIECE));
    let cache = cache(source.clone(), 1 << 20);
    let src = origin("doc");

    cache.seed("doc", &src);
    assert!(matches!(
        cache.invalidate_task("doc").await,
        Err(CdnError::InvalidTransition {
            state: TaskState::Fetching,
            ..
        })
    ));

    source.release(2);
    cache.wait_for_task("doc", soon()).await.unwrap();
    cache.invalidate_task("doc").await.unwrap();
    assert!(matches!(
        cache.get_task_info("doc"),
        Err(CdnError::UnknownTask(_))
    ));
    assert_eq!(cache.store().stat("doc").total_bytes, 0);
    assert!(matches!(
        cache.invalidate_task("doc").await,
        Err(CdnError::UnknownTask(_))
    ));

    source.release(2);
    cache.request_piece("doc", &src, 1, soon()).await.unwrap();
    assert_eq!(source.opens(), 2);
}

#[tokio::test]
async fn test_eviction_makes_room_for_new_task() {
    let source = GatedSource::open(content(PIECE));
    let cache = cache(source.clone(), 2 * PIECE as u64);

    cache.request_piece("a", &origin("a"), 0, soon()).await.unwrap();
    cache.wait_for_task("a", soon()).await.unwrap();
    cache.request_piece("b", &origin("b"), 0, soon()).await.unwrap();
    cache.wait_for_task("b", soon()).await.unwrap();
    // a becomes the most recently used
    cache.request_piece("a", &origin("a"), 0, soon()).await.unwrap();

    cache.request_piece("c", &origin("c"), 0, soon()).await.unwrap();
    cache.wait_for_task("c", soon()).await.unwrap();

    assert!(cache.get_task_info("a").is_ok());
    assert!(cache.get_task_info("b").is_err());
    assert!(cache.get_task_info("c").is_ok());
    assert_eq!(source.opens(), 3);
}

#[tokio::test]
async fn test_stream_pieces() {
    let data = content(2500);
    let cache = cache(GatedSource::open(data.clone()), 1 << 20);
    let src = origin("stream");

    let pieces: Vec<_> = cache
        .stream_pieces("stream", &src, 0, Duration::from_secs(5))
        .collect()
        .await;
    let bytes: Vec<u8> = pieces
        .into_iter()
        .flat_map(|p| p.unwrap().data.to_vec())
        .collect();
    assert_eq!(bytes, data);

    let tail: Vec<_> = cache
        .stream_pieces("stream", &src, 2, Duration::from_secs(5))
        .collect()
        .await;
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].as_ref().unwrap().data.len(), 452);
}

#[tokio::test]
async fn test_shutdown_cancels_fetches() {
    let source = GatedSource::gated(content(4 * PIECE));
    let cache = cache(source.clone(), 1 << 20);

    let info = cache.seed("pending", &origin("pending"));
    assert_eq!(info.state, TaskState::Fetching);

    tokio::time::timeout(Duration::from_secs(5), cache.shutdown())
        .await
        .unwrap();
    assert_eq!(
        cache.get_task_info("pending").unwrap().state,
        TaskState::Fail
    );
}

#[tokio::test]
async fn test_open_restores_completed_tasks() {
    let dir = TempDir::new().unwrap();
    let data = content(3 * PIECE + 10);
    let mut config = config();
    config.storage.base_dir = dir.path().to_path_buf();

    let first = GatedSource::open(data.clone());
    let cache = SeedCache::open(config.clone(), first.clone()).await.unwrap();
    cache.seed("kept", &origin("kept"));
    let before = cache.wait_for_task("kept", soon()).await.unwrap();
    cache.shutdown().await;
    drop(cache);

    // leftovers of an unfinished task
    {
        let store = DiskPieceStore::open(dir.path(), 1 << 20).await.unwrap();
        store
            .put("partial", 0, 0, Bytes::from(vec![1u8; PIECE]))
            .await
            .unwrap();
    }

    let second = GatedSource::open(data.clone());
    let cache = SeedCache::open(config, second.clone()).await.unwrap();

    let after = cache.get_task_info("kept").unwrap();
    assert_eq!(after.state, TaskState::Success);
    assert_eq!(after.digest, before.digest);
    assert_eq!(after.piece_count, Some(4));

    let piece = cache.request_piece("kept", &origin("kept"), 3, soon()).await.unwrap();
    assert_eq!(piece.data, data.slice(3 * PIECE..));
    assert_eq!(second.opens(), 0);

    assert!(cache.get_task_info("partial").is_err());
    assert!(!cache.store().task_keys().contains(&"partial".to_string()));
    cache.shutdown().await;
}

#[tokio::test]
async fn test_open_rejects_invalid_config() {
    let mut config = config();
    config.task.piece_length = 1;
    let result = SeedCache::open(config, GatedSource::open(Bytes::new())).await;
    assert!(matches!(result, Err(CdnError::Config(_))));
}

#[tokio::test]
async fn test_new_rejects_zero_piece_length() {
    let mut config = config();
    config.task.piece_length = 0;
    let store = Arc::new(MemoryPieceStore::new(1 << 20));
    let result = SeedCache::new(store, GatedSource::open(Bytes::new()), &config);
    assert!(matches!(result, Err(CdnError::Config(_))));
}

#[tokio::test]
async fn test_failed_task_read_surfaces_storage_errors() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DiskPieceStore::open(dir.path(), 1 << 20).await.unwrap());
    let mut gated = GatedSource::with_gate(content(4 * PIECE), Semaphore::MAX_PERMITS);
    gated.fail_at = Some(2 * PIECE);
    let cache = SeedCache::new(store, Arc::new(gated), &config()).unwrap();

    cache.seed("broken", &origin("broken"));
    let info = cache.wait_for_task("broken", soon()).await.unwrap();
    assert_eq!(info.state, TaskState::Fail);
    assert_eq!(info.available_pieces, 2);

    std::fs::write(dir.path().join("broken").join("0.piece"), vec![0u8; PIECE]).unwrap();
    let handle = cache.registry().get("broken").unwrap();

    assert!(matches!(
        cache.read_piece(&handle, 0, soon()).await,
        Err(CdnError::Storage(StorageError::ChecksumMismatch { seq: 0, .. }))
    ));
    assert_eq!(cache.read_piece(&handle, 1, soon()).await.unwrap().seq(), 1);
    assert!(matches!(
        cache.read_piece(&handle, 3, soon()).await,
        Err(CdnError::FetchFailed(key)) if key == "broken"
    ));
}
