//! Byte bodies: fully available or streaming.
//!
//! A [`ByteBody`] is a single-owner handle. Its primary operations
//! (`subscribe`, `split`, `buffer`, `into_stream`) take the body by value, so
//! a body is consumed at most once. [`close`](ByteBody::close) may be called
//! any number of times; dropping a body closes it.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::consumer::BufferConsumer;
use crate::error::{BodyError, BodyResult, BoxError, UsageError};
use crate::factory::BodyContext;
use crate::shared::{BackpressureMode, ReaderId, SharedBuffer, Subscription};
use crate::stream::BodyStream;

/// An HTTP payload, either already in memory or still arriving.
#[derive(Debug)]
pub enum ByteBody {
    Available(AvailableByteBody),
    Streaming(StreamingByteBody),
}

impl ByteBody {
    /// Known length in bytes: the exact size of an available body, or the
    /// announced size of a streaming one.
    pub fn expected_length(&self) -> Option<u64> {
        match self {
            Self::Available(body) => body.expected_length(),
            Self::Streaming(body) => body.expected_length(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Available(body) => body.is_closed(),
            Self::Streaming(body) => body.is_closed(),
        }
    }

    /// Release this handle's interest in the body. Idempotent.
    pub fn close(&mut self) {
        match self {
            Self::Available(body) => body.close(),
            Self::Streaming(body) => body.close(),
        }
    }

    /// Attach a consumer. An available body is delivered as a single chunk.
    pub fn subscribe<C>(self, consumer: C) -> BodyResult<Subscription>
    where
        C: BufferConsumer,
    {
        self.into_streaming()?.subscribe(consumer)
    }

    /// Split into two handles that each see the whole body.
    pub fn split(self, mode: BackpressureMode) -> BodyResult<(ByteBody, ByteBody)> {
        match self {
            Self::Available(body) => {
                let (left, right) = body.split()?;
                Ok((Self::Available(left), Self::Available(right)))
            }
            Self::Streaming(body) => {
                let (left, right) = body.split(mode)?;
                Ok((Self::Streaming(left), Self::Streaming(right)))
            }
        }
    }

    /// Collect the whole body into memory.
    ///
    /// Fails with [`BodyError::LimitExceeded`] once the body grows past the
    /// configured `max_buffer_size`.
    pub async fn buffer(self) -> BodyResult<AvailableByteBody> {
        match self {
            Self::Available(body) if body.is_closed() => Err(UsageError::Closed.into()),
            Self::Available(body) => Ok(body),
            Self::Streaming(body) => body.buffer().await,
        }
    }

    /// View the body as a stream of chunks.
    pub fn into_stream(self) -> BodyResult<BodyStream> {
        BodyStream::new(self.into_streaming()?)
    }

    /// Convert to the streaming representation.
    pub fn into_streaming(self) -> BodyResult<StreamingByteBody> {
        match self {
            Self::Available(body) => body.into_streaming(),
            Self::Streaming(body) if body.is_closed() => Err(UsageError::Closed.into()),
            Self::Streaming(body) => Ok(body),
        }
    }
}

impl From<AvailableByteBody> for ByteBody {
    fn from(body: AvailableByteBody) -> Self {
        Self::Available(body)
    }
}

impl From<StreamingByteBody> for ByteBody {
    fn from(body: StreamingByteBody) -> Self {
        Self::Streaming(body)
    }
}

/// A body whose bytes are all in memory.
pub struct AvailableByteBody {
    chunk: Option<Chunk>,
    ctx: BodyContext,
}

impl AvailableByteBody {
    /// An untracked body not tied to any connection.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self::from_chunk(Chunk::new(bytes), BodyContext::detached())
    }

    pub(crate) fn from_chunk(chunk: Chunk, ctx: BodyContext) -> Self {
        Self {
            chunk: Some(chunk),
            ctx,
        }
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.chunk.as_ref().map(|chunk| chunk.len() as u64)
    }

    pub fn len(&self) -> usize {
        self.chunk.as_ref().map_or(0, Chunk::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.chunk.is_none()
    }

    /// The body's bytes.
    pub fn bytes(&self) -> BodyResult<&Bytes> {
        Ok(self.chunk()?.as_bytes())
    }

    pub fn chunk(&self) -> BodyResult<&Chunk> {
        self.chunk.as_ref().ok_or(BodyError::Usage(UsageError::Closed))
    }

    /// Take the chunk out of the body.
    pub fn into_chunk(mut self) -> BodyResult<Chunk> {
        self.chunk.take().ok_or(BodyError::Usage(UsageError::Closed))
    }

    pub fn close(&mut self) {
        self.chunk = None;
    }

    fn split(self) -> BodyResult<(Self, Self)> {
        let chunk = self.chunk()?;
        let copy = Self::from_chunk(chunk.acquire(), self.ctx.clone());
        Ok((self, copy))
    }

    /// Convert to a streaming body replaying this body's chunk.
    pub fn into_streaming(mut self) -> BodyResult<StreamingByteBody> {
        let chunk = self.chunk.take().ok_or(UsageError::Closed)?;
        let length = chunk.len() as u64;
        let chunks = (!chunk.is_empty()).then_some(chunk);
        let (buffer, reader) = SharedBuffer::completed(self.ctx.clone(), chunks);
        Ok(StreamingByteBody::from_reader(buffer, reader, Some(length)))
    }
}

impl fmt::Debug for AvailableByteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvailableByteBody")
            .field("chunk", &self.chunk)
            .finish()
    }
}

struct ReaderHandle {
    buffer: SharedBuffer,
    reader: ReaderId,
}

/// A body backed by a shared buffer that is still (or was) receiving data.
pub struct StreamingByteBody {
    handle: Option<ReaderHandle>,
    expected_length: Option<u64>,
}

impl StreamingByteBody {
    pub(crate) fn from_reader(
        buffer: SharedBuffer,
        reader: ReaderId,
        expected_length: Option<u64>,
    ) -> Self {
        Self {
            handle: Some(ReaderHandle { buffer, reader }),
            expected_length,
        }
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.expected_length
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Bytes the underlying buffer holds for readers that have not caught up.
    pub fn buffered_bytes(&self) -> usize {
        self.handle
            .as_ref()
            .map_or(0, |handle| handle.buffer.buffered_bytes())
    }

    fn take_handle(&mut self) -> BodyResult<ReaderHandle> {
        self.handle.take().ok_or(BodyError::Usage(UsageError::Closed))
    }

    pub fn subscribe<C>(mut self, consumer: C) -> BodyResult<Subscription>
    where
        C: BufferConsumer,
    {
        let handle = self.take_handle()?;
        Ok(handle
            .buffer
            .attach(handle.reader, Box::new(consumer), self.expected_length))
    }

    pub fn split(mut self, mode: BackpressureMode) -> BodyResult<(Self, Self)> {
        let handle = self.take_handle()?;
        match handle.buffer.split_reader(handle.reader, mode) {
            Ok(other) => {
                let right = Self::from_reader(handle.buffer.clone(), other, self.expected_length);
                let left = Self {
                    handle: Some(handle),
                    expected_length: self.expected_length,
                };
                Ok((left, right))
            }
            Err(error) => {
                handle.buffer.release_reader(handle.reader);
                Err(error.into())
            }
        }
    }

    pub async fn buffer(mut self) -> BodyResult<AvailableByteBody> {
        let ctx = self
            .handle
            .as_ref()
            .map(|handle| handle.buffer.ctx().clone())
            .ok_or(UsageError::Closed)?;
        let limit = ctx.config.max_buffer_size as u64;
        match self.expected_length {
            Some(expected) if expected > limit => {
                self.close();
                warn!(limit, expected, "announced body length exceeds buffer limit");
                return Err(BodyError::LimitExceeded {
                    limit,
                    received: expected,
                });
            }
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        let mut guard = CancelOnDrop(Some(self.subscribe(Materializer::new(limit, tx))?));
        let received = rx.await;
        guard.0 = None;
        let collected = received.map_err(|_| BodyError::Cancelled)??;
        Ok(AvailableByteBody::from_chunk(collected.into_chunk(&ctx), ctx))
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.buffer.release_reader(handle.reader);
        }
    }
}

impl Drop for StreamingByteBody {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StreamingByteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingByteBody")
            .field("reader", &self.handle.as_ref().map(|handle| handle.reader))
            .field("expected_length", &self.expected_length)
            .finish()
    }
}

/// Bytes gathered while materializing. A lone chunk is kept as is.
enum Collected {
    Empty,
    Single(Chunk),
    Many(BytesMut),
}

impl Collected {
    fn push(&mut self, chunk: Chunk) {
        *self = match std::mem::replace(self, Self::Empty) {
            Self::Empty => Self::Single(chunk),
            Self::Single(first) => {
                let mut buf = BytesMut::with_capacity(first.len() + chunk.len());
                buf.extend_from_slice(&first);
                buf.extend_from_slice(&chunk);
                Self::Many(buf)
            }
            Self::Many(mut buf) => {
                buf.extend_from_slice(&chunk);
                Self::Many(buf)
            }
        };
    }

    fn into_chunk(self, ctx: &BodyContext) -> Chunk {
        match self {
            Self::Empty => ctx.chunk(Bytes::new()),
            Self::Single(chunk) => chunk,
            Self::Many(buf) => ctx.chunk(buf.freeze()),
        }
    }
}

/// Cancels a materializing read when `buffer()` is dropped before it
/// resolves.
struct CancelOnDrop(Option<Subscription>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            debug!("buffering abandoned, cancelling body");
            subscription.cancel();
        }
    }
}

struct Materializer {
    limit: u64,
    received: u64,
    collected: Collected,
    subscription: Option<Subscription>,
    result: Option<oneshot::Sender<BodyResult<Collected>>>,
}

impl Materializer {
    fn new(limit: u64, result: oneshot::Sender<BodyResult<Collected>>) -> Self {
        Self {
            limit,
            received: 0,
            collected: Collected::Empty,
            subscription: None,
            result: Some(result),
        }
    }

    fn finish(&mut self, outcome: BodyResult<Collected>) {
        if let Some(result) = self.result.take() {
            // receiver gone means the buffer() future was dropped
            let _ = result.send(outcome);
        }
    }
}

impl BufferConsumer for Materializer {
    fn on_subscribe(&mut self, subscription: Subscription) {
        subscription.request(u64::MAX);
        self.subscription = Some(subscription);
    }

    fn add(&mut self, chunk: Chunk) -> Result<(), BoxError> {
        if self.result.is_none() {
            return Ok(());
        }
        self.received += chunk.len() as u64;
        if self.received > self.limit {
            warn!(limit = self.limit, received = self.received, "body exceeds buffer limit");
            if let Some(subscription) = self.subscription.take() {
                subscription.cancel();
            }
            self.collected = Collected::Empty;
            self.finish(Err(BodyError::LimitExceeded {
                limit: self.limit,
                received: self.received,
            }));
            return Ok(());
        }
        self.collected.push(chunk);
        Ok(())
    }

    fn complete(&mut self) {
        debug!(bytes = self.received, "body buffered");
        let collected = std::mem::replace(&mut self.collected, Collected::Empty);
        self.finish(Ok(collected));
    }

    fn error(&mut self, cause: BodyError) {
        self.finish(Err(cause));
    }
}
