//! Push-fed bodies.
//!
//! Transports deliver bytes whenever the socket has them. A [`BodyFeed`]
//! queues pushed chunks until the body has demand and, when the queue grows
//! past the high watermark, asks the transport to stop reading through its
//! [`TransportControl`]. Reads resume once the queue drains below the low
//! watermark.
//!
//! [`StreamPump`] drives a feed from a `futures_core::Stream`.

use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::consumer::Upstream;
use crate::error::{BodyError, BodyResult, BoxError, UsageError};
use crate::event_loop::EventLoopFlow;
use crate::shared::BufferSink;

/// Flow-control hooks a transport registers on a [`BodyFeed`].
pub trait TransportControl: Send + Sync + 'static {
    /// The feed's queue reached the high watermark.
    fn pause_reads(&self);

    /// The feed's queue drained to the low watermark.
    fn resume_reads(&self);

    /// Every reader went away; further pushes are discarded.
    fn cancelled(&self) {}
}

enum FeedEnd {
    Complete,
    Error(BodyError),
}

struct FeedState {
    queue: VecDeque<Chunk>,
    queued_bytes: usize,
    demand: u64,
    /// Terminal signal waiting behind queued chunks.
    end: Option<FeedEnd>,
    paused: bool,
    cancelled: bool,
    control: Option<Arc<dyn TransportControl>>,
}

struct FeedShared {
    state: Mutex<FeedState>,
    sink: BufferSink,
    flow: EventLoopFlow,
    terminated: AtomicBool,
    high_watermark: usize,
    low_watermark: usize,
}

impl FeedShared {
    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().expect("body feed lock")
    }

    fn on_chunk(&self, chunk: Chunk) {
        let mut state = self.lock();
        if state.cancelled {
            drop(state);
            trace!(len = chunk.len(), "releasing chunk pushed after cancellation");
            return;
        }
        if state.demand > 0 && state.queue.is_empty() {
            state.demand -= 1;
            drop(state);
            self.sink.next(chunk);
            return;
        }

        state.queued_bytes += chunk.len();
        state.queue.push_back(chunk);
        let pause = if !state.paused && state.queued_bytes >= self.high_watermark {
            state.paused = true;
            state.control.clone()
        } else {
            None
        };
        let queued = state.queued_bytes;
        drop(state);
        if let Some(control) = pause {
            debug!(queued, "feed reached high watermark, pausing reads");
            control.pause_reads();
        }
    }

    fn on_end(&self, end: FeedEnd) {
        let mut state = self.lock();
        if state.cancelled {
            return;
        }
        if !state.queue.is_empty() {
            state.end = Some(end);
            return;
        }
        drop(state);
        self.finish(end);
    }

    fn finish(&self, end: FeedEnd) {
        match end {
            FeedEnd::Complete => self.sink.complete(),
            FeedEnd::Error(error) => self.sink.error(error),
        }
    }
}

/// Producer handle of a push-fed streaming body.
///
/// Clones share the same feed. Pushes may come from any thread; they are
/// applied on the body's event loop.
#[derive(Clone)]
pub struct BodyFeed {
    shared: Arc<FeedShared>,
}

impl BodyFeed {
    /// Create a feed and the upstream the body's shared buffer pulls from.
    pub(crate) fn new(
        sink: BufferSink,
        flow: EventLoopFlow,
        low_watermark: usize,
        high_watermark: usize,
    ) -> (impl Upstream, Self) {
        let shared = Arc::new(FeedShared {
            state: Mutex::new(FeedState {
                queue: VecDeque::new(),
                queued_bytes: 0,
                demand: 0,
                end: None,
                paused: false,
                cancelled: false,
                control: None,
            }),
            sink,
            flow,
            terminated: AtomicBool::new(false),
            high_watermark,
            low_watermark,
        });
        let upstream = FeedUpstream {
            shared: Arc::clone(&shared),
        };
        (upstream, Self { shared })
    }

    /// Push the next chunk of the body.
    ///
    /// After cancellation the chunk is released and the call still succeeds.
    pub fn push_chunk(&self, bytes: impl Into<Bytes>) -> BodyResult<()> {
        if self.shared.terminated.load(Ordering::Acquire) {
            return Err(UsageError::PushAfterTerminal.into());
        }
        let chunk = self.shared.sink.chunk(bytes);
        let shared = Arc::clone(&self.shared);
        self.shared.flow.execute_now(move || shared.on_chunk(chunk));
        Ok(())
    }

    /// Signal the end of the body.
    pub fn push_complete(&self) -> BodyResult<()> {
        self.terminate(FeedEnd::Complete)
    }

    /// Signal that the transport failed, e.g. on a read timeout.
    pub fn push_error(&self, cause: impl Into<BoxError>) -> BodyResult<()> {
        self.terminate(FeedEnd::Error(BodyError::upstream(cause)))
    }

    fn terminate(&self, end: FeedEnd) -> BodyResult<()> {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return Err(UsageError::PushAfterTerminal.into());
        }
        let shared = Arc::clone(&self.shared);
        self.shared.flow.execute_now(move || shared.on_end(end));
        Ok(())
    }

    /// Register the transport's flow-control hooks, replacing any previous ones.
    pub fn set_transport_control(&self, control: Arc<dyn TransportControl>) {
        let cancelled = {
            let mut state = self.shared.lock();
            state.control = Some(Arc::clone(&control));
            state.cancelled
        };
        if cancelled {
            control.cancelled();
        }
    }

    /// Returns `true` while the feed wants the transport to stop reading.
    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Returns `true` once every reader of the body has gone away.
    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    /// Bytes pushed but not yet handed to the body.
    pub fn queued_bytes(&self) -> usize {
        self.shared.lock().queued_bytes
    }
}

impl fmt::Debug for BodyFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("BodyFeed")
            .field("queued_bytes", &state.queued_bytes)
            .field("demand", &state.demand)
            .field("paused", &state.paused)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

struct FeedUpstream {
    shared: Arc<FeedShared>,
}

impl Upstream for FeedUpstream {
    fn request(&mut self, n: u64) {
        let (chunks, end, resume) = {
            let mut state = self.shared.lock();
            state.demand = state.demand.saturating_add(n);
            let mut chunks = Vec::new();
            while state.demand > 0 {
                let Some(chunk) = state.queue.pop_front() else {
                    break;
                };
                state.queued_bytes -= chunk.len();
                state.demand -= 1;
                chunks.push(chunk);
            }
            let end = if state.queue.is_empty() {
                state.end.take()
            } else {
                None
            };
            let resume = if state.paused && state.queued_bytes <= self.shared.low_watermark {
                state.paused = false;
                state.control.clone()
            } else {
                None
            };
            (chunks, end, resume)
        };

        for chunk in chunks {
            self.shared.sink.next(chunk);
        }
        if let Some(control) = resume {
            debug!("feed drained to low watermark, resuming reads");
            control.resume_reads();
        }
        if let Some(end) = end {
            self.shared.finish(end);
        }
    }

    fn cancel(&mut self) {
        let (released, control) = {
            let mut state = self.shared.lock();
            state.cancelled = true;
            state.queued_bytes = 0;
            state.end = None;
            (std::mem::take(&mut state.queue), state.control.clone())
        };
        debug!(released = released.len(), "body feed cancelled");
        drop(released);
        if let Some(control) = control {
            control.cancelled();
        }
    }
}

struct PumpControl {
    wake: Arc<Notify>,
}

impl TransportControl for PumpControl {
    fn pause_reads(&self) {}

    fn resume_reads(&self) {
        self.wake.notify_one();
    }

    fn cancelled(&self) {
        self.wake.notify_one();
    }
}

/// Moves items from a stream into a body feed, honouring pause and cancel.
///
/// Returned by [`ByteBodyFactory::adapt_stream`](crate::ByteBodyFactory::adapt_stream);
/// the caller runs [`run`](Self::run) on its runtime.
pub struct StreamPump<S> {
    stream: S,
    feed: BodyFeed,
    wake: Arc<Notify>,
}

impl<S, E> StreamPump<S>
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
    E: Into<BoxError>,
{
    pub(crate) fn new(stream: S, feed: BodyFeed) -> Self {
        let wake = Arc::new(Notify::new());
        feed.set_transport_control(Arc::new(PumpControl {
            wake: Arc::clone(&wake),
        }));
        Self { stream, feed, wake }
    }

    /// Pump until the stream ends, fails, or the body is cancelled.
    ///
    /// A stream error is delivered to the body and also returned here.
    pub async fn run(mut self) -> BodyResult<()> {
        loop {
            if self.feed.is_cancelled() {
                debug!("body cancelled, stopping stream pump");
                return Ok(());
            }
            if self.feed.is_paused() {
                self.wake.notified().await;
                continue;
            }

            // an idle source must not hide a cancel
            let next = tokio::select! {
                next = poll_fn(|cx| Pin::new(&mut self.stream).poll_next(cx)) => next,
                () = self.wake.notified() => continue,
            };
            match next {
                Some(Ok(bytes)) => self.feed.push_chunk(bytes)?,
                Some(Err(error)) => {
                    let error = BodyError::upstream(error);
                    self.feed.terminate(FeedEnd::Error(error.clone()))?;
                    return Err(error);
                }
                None => {
                    self.feed.push_complete()?;
                    return Ok(());
                }
            }
        }
    }
}

impl<S> fmt::Debug for StreamPump<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPump")
            .field("feed", &self.feed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BodyConfig, ByteBodyFactory, EventLoopFlow};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingControl {
        paused: AtomicUsize,
        resumed: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl TransportControl for RecordingControl {
        fn pause_reads(&self) {
            self.paused.fetch_add(1, Ordering::SeqCst);
        }

        fn resume_reads(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }

        fn cancelled(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn factory(low: usize, high: usize) -> ByteBodyFactory {
        ByteBodyFactory::new(
            EventLoopFlow::inline(),
            BodyConfig::default()
                .with_feed_watermarks(low, high)
                .with_leak_detection(true),
        )
    }

    #[tokio::test]
    async fn pushed_chunks_buffer_to_body() {
        let (feed, body) = factory(4, 8).streaming(None);
        feed.push_chunk("He").unwrap();
        feed.push_chunk("llo").unwrap();
        feed.push_complete().unwrap();

        assert_eq!(body.buffer().await.unwrap().bytes().unwrap(), "Hello");
    }

    #[test]
    fn push_after_terminal_is_rejected() {
        let (feed, _body) = factory(4, 8).streaming(None);
        feed.push_complete().unwrap();

        let err = feed.push_chunk("late").unwrap_err();
        assert_eq!(err.usage(), Some(UsageError::PushAfterTerminal));
        let err = feed.push_error("late failure").unwrap_err();
        assert_eq!(err.usage(), Some(UsageError::PushAfterTerminal));
    }

    #[test]
    fn watermarks_pause_and_resume_reads() {
        let (feed, body) = factory(4, 8).streaming(None);
        let control = Arc::new(RecordingControl::default());
        feed.set_transport_control(control.clone());

        feed.push_chunk("abcd").unwrap();
        assert!(!feed.is_paused());
        feed.push_chunk("efgh").unwrap();
        assert!(feed.is_paused());
        assert_eq!(control.paused.load(Ordering::SeqCst), 1);

        let mut stream = body.into_stream().unwrap();
        let waker = std::task::Waker::noop();
        let mut cx = std::task::Context::from_waker(waker);
        assert!(Pin::new(&mut stream).poll_next(&mut cx).is_ready());

        assert_eq!(feed.queued_bytes(), 4);
        assert!(!feed.is_paused());
        assert_eq!(control.resumed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_releases_queued_chunks() {
        let factory = factory(4, 8);
        let (feed, body) = factory.streaming(None);
        let control = Arc::new(RecordingControl::default());
        feed.set_transport_control(control.clone());

        feed.push_chunk("queued").unwrap();
        assert_eq!(factory.leak_detector().unwrap().live_chunks(), 1);

        drop(body);
        assert!(feed.is_cancelled());
        assert_eq!(control.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(factory.leak_detector().unwrap().live_chunks(), 0);

        feed.push_chunk("after").unwrap();
        assert_eq!(feed.queued_bytes(), 0);
        assert!(factory.leak_detector().unwrap().report().is_clean());
    }

    #[test]
    fn late_control_learns_about_cancellation() {
        let (feed, body) = factory(4, 8).streaming(None);
        drop(body);

        let control = Arc::new(RecordingControl::default());
        feed.set_transport_control(control.clone());
        assert_eq!(control.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pump_feeds_stream_items() {
        let items = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("str")),
            Ok(Bytes::from("eam")),
        ]);
        let (body, pump) = factory(4, 8).adapt_stream(items);
        let pumping = tokio::spawn(pump.run());

        let buffered = body.buffer().await.unwrap();
        assert_eq!(buffered.bytes().unwrap(), "stream");
        pumping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pump_stops_when_idle_stream_is_cancelled() {
        let idle = futures_util::stream::pending::<Result<Bytes, std::io::Error>>();
        let (body, pump) = factory(4, 8).adapt_stream(idle);
        let pumping = tokio::spawn(pump.run());
        tokio::task::yield_now().await;

        drop(body);
        let finished = tokio::time::timeout(std::time::Duration::from_secs(1), pumping).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))), "{finished:?}");
    }

    #[tokio::test]
    async fn pump_reports_stream_error() {
        let items = futures_util::stream::iter(vec![
            Ok(Bytes::from("ok")),
            Err(std::io::Error::other("socket closed")),
        ]);
        let (body, pump) = factory(4, 8).adapt_stream(items);
        let pumping = tokio::spawn(pump.run());

        let err = body.buffer().await.unwrap_err();
        assert!(matches!(err, BodyError::Upstream(_)));
        assert!(pumping.await.unwrap().is_err());
    }
}
