//! Construction boundary between transports and byte bodies.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;
use tracing::trace;

use crate::body::{AvailableByteBody, ByteBody, StreamingByteBody};
use crate::chunk::Chunk;
use crate::concat::{ConcatenatingSubscriber, Separators};
use crate::config::BodyConfig;
use crate::consumer::Upstream;
use crate::error::BoxError;
use crate::event_loop::EventLoopFlow;
use crate::feed::{BodyFeed, StreamPump};
use crate::leak::LeakDetector;
use crate::shared::{BufferSink, SharedBuffer};

/// Everything a body needs from the factory that created it.
#[derive(Clone)]
pub(crate) struct BodyContext {
    pub(crate) flow: EventLoopFlow,
    pub(crate) config: Arc<BodyConfig>,
    pub(crate) detector: Option<Arc<LeakDetector>>,
}

impl BodyContext {
    pub(crate) fn new(
        flow: EventLoopFlow,
        config: BodyConfig,
        detector: Option<Arc<LeakDetector>>,
    ) -> Self {
        Self {
            flow,
            config: Arc::new(config),
            detector,
        }
    }

    /// Inline execution, default limits, no tracking.
    pub(crate) fn detached() -> Self {
        Self::new(EventLoopFlow::inline(), BodyConfig::default(), None)
    }

    pub(crate) fn chunk(&self, bytes: impl Into<Bytes>) -> Chunk {
        match &self.detector {
            Some(detector) => Chunk::tracked(bytes, detector),
            None => Chunk::new(bytes),
        }
    }
}

impl fmt::Debug for BodyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyContext")
            .field("flow", &self.flow)
            .field("config", &self.config)
            .field("leak_detection", &self.detector.is_some())
            .finish()
    }
}

/// Creates byte bodies bound to one event loop and configuration.
///
/// A transport typically holds one factory per connection, built over the
/// connection's [`TaskQueue`](crate::TaskQueue) flow.
#[derive(Clone, Debug)]
pub struct ByteBodyFactory {
    ctx: BodyContext,
}

impl ByteBodyFactory {
    /// Creates a factory. A leak detector is attached when
    /// `config.leak_detection` is set.
    pub fn new(flow: EventLoopFlow, config: BodyConfig) -> Self {
        let detector = config
            .leak_detection
            .then(|| Arc::new(LeakDetector::new()));
        Self {
            ctx: BodyContext::new(flow, config, detector),
        }
    }

    /// Track chunks with an existing detector, e.g. one shared by several
    /// connections.
    pub fn with_leak_detector(mut self, detector: Arc<LeakDetector>) -> Self {
        self.ctx.detector = Some(detector);
        self
    }

    pub fn leak_detector(&self) -> Option<&Arc<LeakDetector>> {
        self.ctx.detector.as_ref()
    }

    pub fn config(&self) -> &BodyConfig {
        &self.ctx.config
    }

    pub fn flow(&self) -> &EventLoopFlow {
        &self.ctx.flow
    }

    /// A chunk tracked by this factory's leak detector, if any.
    pub fn chunk(&self, bytes: impl Into<Bytes>) -> Chunk {
        self.ctx.chunk(bytes)
    }

    pub fn empty(&self) -> ByteBody {
        self.available(Bytes::new())
    }

    pub fn available(&self, bytes: impl Into<Bytes>) -> ByteBody {
        self.adopt(self.chunk(bytes))
    }

    /// Wrap an existing chunk without copying.
    pub fn adopt(&self, chunk: Chunk) -> ByteBody {
        ByteBody::Available(AvailableByteBody::from_chunk(chunk, self.ctx.clone()))
    }

    /// A streaming body fed by pushes on the returned [`BodyFeed`].
    pub fn streaming(&self, expected_length: Option<u64>) -> (BodyFeed, ByteBody) {
        let config = &self.ctx.config;
        let (low, high) = (config.feed_low_watermark, config.feed_high_watermark);
        let flow = self.ctx.flow.clone();
        let (buffer, reader, feed) = SharedBuffer::with_producer(self.ctx.clone(), |sink| {
            BodyFeed::new(sink, flow, low, high)
        });
        let body = StreamingByteBody::from_reader(buffer, reader, expected_length);
        (feed, ByteBody::Streaming(body))
    }

    /// A streaming body pulling from a custom [`Upstream`] built around the
    /// body's [`BufferSink`].
    pub fn from_upstream<F, U>(&self, expected_length: Option<u64>, build: F) -> ByteBody
    where
        F: FnOnce(BufferSink) -> U,
        U: Upstream,
    {
        let (buffer, reader) = SharedBuffer::new(self.ctx.clone(), build);
        ByteBody::Streaming(StreamingByteBody::from_reader(buffer, reader, expected_length))
    }

    /// Adapt a single-subscriber stream. Nothing is read until the returned
    /// [`StreamPump`] is run.
    pub fn adapt_stream<S, E>(&self, stream: S) -> (ByteBody, StreamPump<S>)
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: Into<BoxError>,
    {
        let (feed, body) = self.streaming(None);
        (body, StreamPump::new(stream, feed))
    }

    /// Join bodies into one, inserting `separators`. Items are read one at a
    /// time, in order.
    pub fn concatenate<I>(&self, items: I, separators: Separators) -> ByteBody
    where
        I: IntoIterator<Item = ByteBody>,
        I::IntoIter: Send + 'static,
    {
        ConcatenatingSubscriber::body(self.ctx.clone(), items, separators)
    }

    /// A streaming body yielding `bytes` in `chunk_size` slices, without
    /// copying.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn chunked(&self, bytes: impl Into<Bytes>, chunk_size: usize) -> ByteBody {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        let buf = bytes.into();
        let length = buf.len() as u64;
        let (buffer, reader) = SharedBuffer::new(self.ctx.clone(), |sink| ChunkedUpstream {
            buf,
            chunk_size,
            offset: 0,
            sink,
        });
        ByteBody::Streaming(StreamingByteBody::from_reader(buffer, reader, Some(length)))
    }

    /// [`chunked`](Self::chunked) with the configured `chunk_size`.
    pub fn chunked_default(&self, bytes: impl Into<Bytes>) -> ByteBody {
        self.chunked(bytes, self.ctx.config.chunk_size)
    }
}

impl Default for ByteBodyFactory {
    fn default() -> Self {
        Self::new(EventLoopFlow::inline(), BodyConfig::default())
    }
}

/// Yields a `Bytes` buffer in fixed-size chunks on demand.
///
/// # Memory Guarantee
///
/// Each chunk is a `Bytes::slice()` of the original allocation, so no
/// per-chunk allocation or copy occurs.
struct ChunkedUpstream {
    buf: Bytes,
    chunk_size: usize,
    offset: usize,
    sink: BufferSink,
}

impl Upstream for ChunkedUpstream {
    fn request(&mut self, n: u64) {
        let mut remaining = n;
        while remaining > 0 && self.offset < self.buf.len() {
            let end = std::cmp::min(self.offset + self.chunk_size, self.buf.len());
            let slice = self.buf.slice(self.offset..end);
            self.offset = end;
            remaining -= 1;
            self.sink.next(self.sink.chunk(slice));
        }
        if self.offset >= self.buf.len() {
            self.sink.complete();
        }
    }

    fn cancel(&mut self) {
        trace!(offset = self.offset, len = self.buf.len(), "chunked body cancelled");
        self.offset = self.buf.len();
    }
}
