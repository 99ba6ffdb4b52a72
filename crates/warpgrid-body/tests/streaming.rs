//! Integration tests for the streaming body pipeline.
//!
//! - Identity: pushed chunks arrive unchanged and in order
//! - 10 MB streaming body: byte count and chunk ordering
//! - 1 MB chunked transform: chunked body → uppercase → adapted stream
//! - Memory bound: the stream adapter holds at most 2× chunk size
//! - Terminal paths: upstream errors, buffer limits, leak accounting

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use bytes::Bytes;
use futures_util::StreamExt;
use warpgrid_body::{
    BodyConfig, BodyError, BoxError, BufferConsumer, ByteBodyFactory, Chunk, EventLoopFlow,
    Subscription,
};

static TRACING_INIT: Once = Once::new();

/// Controlled by `RUST_LOG` (e.g. `RUST_LOG=warpgrid_body=trace`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Default)]
struct Recording {
    chunks: Vec<Bytes>,
    completed: bool,
    error: Option<BodyError>,
}

/// Requests everything up front and records what it receives.
struct Recorder(Arc<Mutex<Recording>>);

impl BufferConsumer for Recorder {
    fn on_subscribe(&mut self, subscription: Subscription) {
        subscription.request(u64::MAX);
    }

    fn add(&mut self, chunk: Chunk) -> Result<(), BoxError> {
        self.0.lock().unwrap().chunks.push(chunk.to_bytes());
        Ok(())
    }

    fn complete(&mut self) {
        self.0.lock().unwrap().completed = true;
    }

    fn error(&mut self, cause: BodyError) {
        self.0.lock().unwrap().error = Some(cause);
    }
}

// ── Identity ────────────────────────────────────────────────────────

#[test]
fn pushed_chunks_arrive_unchanged_and_in_order() {
    init_tracing();
    let factory = ByteBodyFactory::default();
    let (feed, body) = factory.streaming(None);
    let recording = Arc::new(Mutex::new(Recording::default()));
    body.subscribe(Recorder(recording.clone())).unwrap();

    let parts: Vec<Bytes> = (0..50).map(|i| Bytes::from(format!("part-{i}"))).collect();
    for part in &parts {
        feed.push_chunk(part.clone()).unwrap();
    }
    feed.push_complete().unwrap();

    let recording = recording.lock().unwrap();
    assert_eq!(recording.chunks, parts);
    assert!(recording.completed);
    assert!(recording.error.is_none());
}

#[tokio::test]
async fn hello_is_buffered_from_two_pushes() {
    init_tracing();
    let (feed, body) = ByteBodyFactory::default().streaming(Some(5));
    feed.push_chunk("He").unwrap();
    feed.push_chunk("llo").unwrap();
    feed.push_complete().unwrap();

    assert_eq!(body.expected_length(), Some(5));
    let buffered = body.buffer().await.unwrap();
    assert_eq!(buffered.bytes().unwrap(), "Hello");
}

// ── 10 MB streaming body ────────────────────────────────────────────

#[tokio::test]
async fn streaming_10mb_correct_byte_count_and_chunk_ordering() {
    init_tracing();
    let chunk_size = 1024; // 1 KB
    let total_chunks: usize = 10 * 1024; // 10,240 chunks = 10 MB

    // Each chunk encodes its index in the first 4 bytes for ordering verification.
    let stream = futures_util::stream::iter((0..total_chunks).map(move |i| {
        let mut chunk = vec![0u8; chunk_size];
        chunk[0..4].copy_from_slice(&(i as u32).to_le_bytes());
        Ok::<_, std::io::Error>(Bytes::from(chunk))
    }));

    let (body, pump) = ByteBodyFactory::default().adapt_stream(stream);
    let pumping = tokio::spawn(pump.run());
    let buffered = body.buffer().await.unwrap();
    pumping.await.unwrap().unwrap();

    let body = buffered.bytes().unwrap();
    assert_eq!(body.len(), 10 * 1024 * 1024, "body should be exactly 10 MB");
    for i in 0..total_chunks {
        let offset = i * chunk_size;
        let chunk_id = u32::from_le_bytes(body[offset..offset + 4].try_into().unwrap());
        assert_eq!(chunk_id, i as u32, "chunk {i} out of order");
    }
}

// ── 1 MB chunked transform ──────────────────────────────────────────

#[tokio::test]
async fn chunked_transform_1mb_uppercase() {
    init_tracing();
    let factory = ByteBodyFactory::default();
    let body_data: Vec<u8> = (0u32..1024 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
    let expected: Vec<u8> = body_data.iter().map(|b| b.to_ascii_uppercase()).collect();

    let input = factory.chunked(body_data, 1024).into_stream().unwrap();
    let transformed = input.map(|chunk| {
        let chunk = chunk?;
        Ok::<_, BodyError>(Bytes::from(
            chunk.iter().map(|b| b.to_ascii_uppercase()).collect::<Vec<_>>(),
        ))
    });

    let (output, pump) = factory.adapt_stream(transformed);
    let pumping = tokio::spawn(pump.run());
    let result = output.buffer().await.unwrap();
    pumping.await.unwrap().unwrap();

    assert_eq!(result.len(), 1024 * 1024, "result should be 1 MB");
    assert_eq!(&result.bytes().unwrap()[..], &expected[..], "uppercase transform mismatch");
}

// ── Memory bound verification ───────────────────────────────────────

/// The body stream requests one chunk per poll, so a transform over it holds
/// at most the input chunk and its output at any time.
#[tokio::test]
async fn stream_adapter_bounded_memory_2x_chunk_size() {
    init_tracing();
    let chunk_size = 1024;
    let num_chunks: usize = 100;

    let peak_bytes = Arc::new(AtomicUsize::new(0));
    let current_bytes = Arc::new(AtomicUsize::new(0));

    let body = ByteBodyFactory::default().chunked(vec![b'x'; chunk_size * num_chunks], chunk_size);
    let peak = peak_bytes.clone();
    let current = current_bytes.clone();

    let total: usize = body
        .into_stream()
        .unwrap()
        .map(move |chunk| {
            let chunk = chunk.expect("chunk should be Ok");
            let input_len = chunk.len();
            current.fetch_add(input_len, Ordering::SeqCst);
            peak.fetch_max(current.load(Ordering::SeqCst), Ordering::SeqCst);

            let output: Vec<u8> = chunk.iter().map(|b| b.to_ascii_uppercase()).collect();
            let output_len = output.len();
            current.fetch_add(output_len, Ordering::SeqCst);
            peak.fetch_max(current.load(Ordering::SeqCst), Ordering::SeqCst);

            current.fetch_sub(input_len, Ordering::SeqCst);
            current.fetch_sub(output_len, Ordering::SeqCst);
            output.len()
        })
        .fold(0, |acc, len| async move { acc + len })
        .await;

    assert_eq!(total, chunk_size * num_chunks);
    let measured_peak = peak_bytes.load(Ordering::SeqCst);
    assert!(
        measured_peak <= 2 * chunk_size,
        "peak intermediate bytes ({measured_peak}) exceeds 2x chunk_size ({})",
        2 * chunk_size,
    );
}

// ── Terminal paths ──────────────────────────────────────────────────

#[test]
fn error_after_two_chunks_never_completes() {
    init_tracing();
    let (feed, body) = ByteBodyFactory::default().streaming(None);
    let recording = Arc::new(Mutex::new(Recording::default()));
    body.subscribe(Recorder(recording.clone())).unwrap();

    feed.push_chunk("one").unwrap();
    feed.push_chunk("two").unwrap();
    feed.push_error("connection reset").unwrap();

    let recording = recording.lock().unwrap();
    assert_eq!(recording.chunks, vec!["one", "two"]);
    assert!(!recording.completed);
    assert!(matches!(recording.error, Some(BodyError::Upstream(_))));
}

#[tokio::test]
async fn eleven_bytes_exceed_limit_of_ten() {
    init_tracing();
    let factory = ByteBodyFactory::new(
        EventLoopFlow::inline(),
        BodyConfig::default().with_max_buffer_size(10),
    );
    let stream = futures_util::stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from("Hello ")),
        Ok(Bytes::from("world")),
    ]);
    let (body, pump) = factory.adapt_stream(stream);
    let pumping = tokio::spawn(pump.run());

    match body.buffer().await {
        Err(BodyError::LimitExceeded { limit, received }) => {
            assert_eq!(limit, 10);
            assert_eq!(received, 11);
        }
        other => panic!("expected LimitExceeded, got {other:?}"),
    }
    pumping.await.unwrap().unwrap();
}

#[tokio::test]
async fn acquisitions_equal_releases_once_terminal() {
    init_tracing();
    let factory = ByteBodyFactory::new(
        EventLoopFlow::inline(),
        BodyConfig::default().with_leak_detection(true),
    );
    let detector = factory.leak_detector().unwrap().clone();

    let (feed, body) = factory.streaming(None);
    let (left, right) = body.split(warpgrid_body::BackpressureMode::Fastest).unwrap();
    for part in ["a", "bb", "ccc"] {
        feed.push_chunk(part).unwrap();
    }
    feed.push_complete().unwrap();

    let left: Vec<Chunk> = left.into_stream().unwrap().map(Result::unwrap).collect().await;
    let right = right.buffer().await.unwrap();
    assert_eq!(left.len(), 3);
    assert_eq!(right.bytes().unwrap(), "abbccc");

    drop(left);
    drop(right);
    let report = detector.report();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.acquisitions, report.releases);
    assert_eq!(detector.live_bytes(), 0);
}

#[test]
fn closing_unread_body_cancels_transport() {
    init_tracing();
    let (feed, mut body) = ByteBodyFactory::default().streaming(None);
    feed.push_chunk("pending").unwrap();

    body.close();
    body.close();
    assert!(body.is_closed());
    assert!(feed.is_cancelled());
    assert_eq!(feed.queued_bytes(), 0);
}
