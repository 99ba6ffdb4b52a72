//! [`futures_core::Stream`] view of a byte body.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use futures_core::Stream;

use crate::body::StreamingByteBody;
use crate::chunk::Chunk;
use crate::consumer::BufferConsumer;
use crate::error::{BodyError, BodyResult, BoxError};
use crate::shared::Subscription;

enum End {
    Complete,
    Error(BodyError),
}

#[derive(Default)]
struct StreamSlot {
    ready: VecDeque<Chunk>,
    end: Option<End>,
    waker: Option<Waker>,
    in_flight: bool,
    terminated: bool,
    finished: bool,
}

/// Pull-based adapter over a body subscription.
///
/// Each poll with nothing ready requests exactly one chunk, so the stream
/// never holds more than the chunk it is about to yield. Dropping the
/// stream before the end cancels the subscription.
pub struct BodyStream {
    slot: Arc<Mutex<StreamSlot>>,
    subscription: Subscription,
}

impl BodyStream {
    pub(crate) fn new(body: StreamingByteBody) -> BodyResult<Self> {
        let slot = Arc::new(Mutex::new(StreamSlot::default()));
        let subscription = body.subscribe(StreamConsumer {
            slot: Arc::clone(&slot),
        })?;
        Ok(Self { slot, subscription })
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.subscription.expected_length()
    }

    fn lock(&self) -> MutexGuard<'_, StreamSlot> {
        self.slot.lock().expect("body stream lock")
    }

    fn take_ready(&self) -> Option<Poll<Option<BodyResult<Chunk>>>> {
        let mut slot = self.lock();
        if let Some(chunk) = slot.ready.pop_front() {
            return Some(Poll::Ready(Some(Ok(chunk))));
        }
        match slot.end.take() {
            Some(End::Complete) => {
                slot.finished = true;
                Some(Poll::Ready(None))
            }
            Some(End::Error(error)) => {
                slot.finished = true;
                Some(Poll::Ready(Some(Err(error))))
            }
            None if slot.finished => Some(Poll::Ready(None)),
            None => None,
        }
    }
}

impl Stream for BodyStream {
    type Item = BodyResult<Chunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(ready) = this.take_ready() {
            return ready;
        }

        let request = {
            let mut slot = this.lock();
            slot.waker = Some(cx.waker().clone());
            !std::mem::replace(&mut slot.in_flight, true)
        };
        if request {
            this.subscription.request(1);
            // delivery may have happened inline
            if let Some(ready) = this.take_ready() {
                return ready;
            }
        }
        Poll::Pending
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        let terminated = self.lock().terminated;
        if !terminated {
            self.subscription.cancel();
        }
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

struct StreamConsumer {
    slot: Arc<Mutex<StreamSlot>>,
}

impl StreamConsumer {
    fn update(&self, apply: impl FnOnce(&mut StreamSlot)) {
        let waker = {
            let mut slot = self.slot.lock().expect("body stream lock");
            apply(&mut slot);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl BufferConsumer for StreamConsumer {
    fn add(&mut self, chunk: Chunk) -> Result<(), BoxError> {
        self.update(|slot| {
            slot.in_flight = false;
            slot.ready.push_back(chunk);
        });
        Ok(())
    }

    fn complete(&mut self) {
        self.update(|slot| {
            slot.terminated = true;
            slot.end = Some(End::Complete);
        });
    }

    fn error(&mut self, cause: BodyError) {
        self.update(|slot| {
            slot.terminated = true;
            slot.end = Some(End::Error(cause));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Upstream;
    use crate::factory::BodyContext;
    use crate::shared::{BufferSink, SharedBuffer};
    use bytes::Bytes;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingUpstream {
        cancels: Arc<AtomicUsize>,
    }

    impl Upstream for CountingUpstream {
        fn request(&mut self, _n: u64) {}

        fn cancel(&mut self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pushed_body() -> (BufferSink, StreamingByteBody, Arc<AtomicUsize>) {
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut sink = None;
        let (buffer, reader) = SharedBuffer::new(BodyContext::detached(), |s| {
            sink = Some(s);
            CountingUpstream {
                cancels: Arc::clone(&cancels),
            }
        });
        let body = StreamingByteBody::from_reader(buffer, reader, None);
        (sink.unwrap(), body, cancels)
    }

    fn completed(parts: &[&'static str]) -> StreamingByteBody {
        let chunks: Vec<Chunk> = parts.iter().map(|part| Chunk::new(*part)).collect();
        let (buffer, reader) = SharedBuffer::completed(BodyContext::detached(), chunks);
        StreamingByteBody::from_reader(buffer, reader, None)
    }

    fn collect_sync(stream: &mut BodyStream) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        loop {
            match Pin::new(&mut *stream).poll_next(&mut cx) {
                Poll::Ready(Some(Ok(chunk))) => chunks.push(chunk.to_bytes()),
                Poll::Ready(Some(Err(e))) => panic!("unexpected error: {e}"),
                Poll::Ready(None) => break,
                Poll::Pending => panic!("completed body should never pend"),
            }
        }
        chunks
    }

    #[test]
    fn completed_body_streams_in_order() {
        let mut stream = BodyStream::new(completed(&["a", "b", "c"])).unwrap();
        assert_eq!(collect_sync(&mut stream), vec!["a", "b", "c"]);
    }

    #[test]
    fn stream_stays_finished() {
        let mut stream = BodyStream::new(completed(&[])).unwrap();
        assert!(collect_sync(&mut stream).is_empty());

        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(matches!(
            Pin::new(&mut stream).poll_next(&mut cx),
            Poll::Ready(None)
        ));
    }

    #[test]
    fn pending_until_chunk_arrives() {
        let (sink, body, _cancels) = pushed_body();
        let mut stream = BodyStream::new(body).unwrap();
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);

        assert!(Pin::new(&mut stream).poll_next(&mut cx).is_pending());
        sink.next(Chunk::new("late"));
        match Pin::new(&mut stream).poll_next(&mut cx) {
            Poll::Ready(Some(Ok(chunk))) => assert_eq!(&chunk[..], b"late"),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn dropping_unfinished_stream_cancels_upstream() {
        let (_sink, body, cancels) = pushed_body();
        let mut stream = BodyStream::new(body).unwrap();
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(Pin::new(&mut stream).poll_next(&mut cx).is_pending());

        drop(stream);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_is_yielded_after_chunks() {
        let (sink, body, cancels) = pushed_body();
        let stream = BodyStream::new(body).unwrap();
        sink.next(Chunk::new("one"));
        sink.error(BodyError::upstream("reset"));

        let items: Vec<BodyResult<Chunk>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(&items[0].as_ref().unwrap()[..], b"one");
        assert!(matches!(items[1], Err(BodyError::Upstream(_))));
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }
}
