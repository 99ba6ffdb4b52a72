//! Fan-out of one producer's chunks to many independently paced readers.
//!
//! A [`SharedBuffer`] owns at most one [`Upstream`] and a queue of chunks
//! that some reader has not consumed yet. Every reader has a cursor (the
//! absolute index of the next chunk it will see) and a demand counter (how
//! many more chunks it asked for). A chunk leaves the queue once every
//! reader's cursor has moved past it.
//!
//! # Pacing
//!
//! Upstream is asked for chunks according to the [`BackpressureMode`]:
//! `Fastest` pulls while any reader wants more, bounded by the configured
//! memory limit; `Original` pulls only what every reader wants.
//!
//! # Re-entrancy
//!
//! Consumers and upstreams are called with the state lock released, and
//! they may call straight back into the buffer (request more, cancel, push
//! a chunk). One drain loop per buffer performs all deliveries; a re-entrant
//! call only updates state and leaves the work to the loop already running.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::body::{ByteBody, StreamingByteBody};
use crate::chunk::Chunk;
use crate::consumer::{BufferConsumer, Upstream};
use crate::error::{BodyError, BodyResult, BoxError, UsageError};
use crate::factory::BodyContext;

/// How a split reconciles readers consuming at different speeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackpressureMode {
    /// Upstream is pulled while any reader wants more. A slower reader falls
    /// behind and its backlog is buffered, up to the configured limit.
    Fastest,
    /// Upstream is pulled only as far as every reader wants, throttling the
    /// faster reader to the slowest. This is the pacing of an unsplit body.
    Original,
}

impl BackpressureMode {
    /// Throttling wins when splits of one buffer disagree.
    fn strictest(self, other: Self) -> Self {
        if self == Self::Original || other == Self::Original {
            Self::Original
        } else {
            Self::Fastest
        }
    }
}

pub(crate) type ReaderId = u64;

#[derive(Debug, Clone)]
enum Terminal {
    Complete,
    Error(BodyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamState {
    Idle,
    Started,
    Finished,
    Cancelled,
}

enum Slot {
    /// A body handle exists but nobody subscribed yet.
    Reserved,
    Attached(Box<dyn BufferConsumer>),
    /// The consumer is out of the slot for a callback.
    Busy,
}

struct Reader {
    cursor: u64,
    demand: u64,
    slot: Slot,
    /// Cancelled while busy; removed once the callback returns.
    closed: bool,
}

impl Reader {
    fn new(cursor: u64) -> Self {
        Self {
            cursor,
            demand: 0,
            slot: Slot::Reserved,
            closed: false,
        }
    }

    fn is_reserved(&self) -> bool {
        matches!(self.slot, Slot::Reserved)
    }

    fn is_attached(&self) -> bool {
        matches!(self.slot, Slot::Attached(_)) && !self.closed
    }

    /// Absolute position this reader wants upstream to reach.
    fn target(&self) -> u64 {
        self.cursor.saturating_add(self.demand)
    }

    fn take_consumer(&mut self) -> Option<Box<dyn BufferConsumer>> {
        match std::mem::replace(&mut self.slot, Slot::Busy) {
            Slot::Attached(consumer) => Some(consumer),
            other => {
                self.slot = other;
                None
            }
        }
    }

    fn into_consumer(self) -> Option<Box<dyn BufferConsumer>> {
        match self.slot {
            Slot::Attached(consumer) => Some(consumer),
            _ => None,
        }
    }
}

struct State {
    mode: Option<BackpressureMode>,
    fastest_limit: usize,
    queue: VecDeque<Chunk>,
    /// Absolute index of `queue[0]`; equals the number of discarded chunks.
    base: u64,
    buffered_bytes: usize,
    terminal: Option<Terminal>,
    readers: BTreeMap<ReaderId, Reader>,
    next_reader: ReaderId,
    upstream: Option<Box<dyn Upstream>>,
    upstream_state: UpstreamState,
    /// Chunks requested from upstream and not yet received.
    requested: u64,
    draining: bool,
}

enum Action {
    Start(Box<dyn Upstream>),
    Request(Box<dyn Upstream>, u64),
    Cancel(Box<dyn Upstream>),
    Deliver {
        reader: ReaderId,
        consumer: Box<dyn BufferConsumer>,
        chunk: Chunk,
    },
    Complete(Box<dyn BufferConsumer>),
    Fail(Box<dyn BufferConsumer>, BodyError),
}

impl State {
    fn new(fastest_limit: usize, upstream_state: UpstreamState) -> Self {
        Self {
            mode: None,
            fastest_limit,
            queue: VecDeque::new(),
            base: 0,
            buffered_bytes: 0,
            terminal: None,
            readers: BTreeMap::new(),
            next_reader: 0,
            upstream: None,
            upstream_state,
            requested: 0,
            draining: false,
        }
    }

    /// Absolute index one past the last received chunk.
    fn end(&self) -> u64 {
        self.base + self.queue.len() as u64
    }

    fn add_reader(&mut self) -> ReaderId {
        let id = self.next_reader;
        self.next_reader += 1;
        self.readers.insert(id, Reader::new(self.base));
        id
    }

    fn push(&mut self, chunk: Chunk) {
        self.buffered_bytes += chunk.len();
        self.queue.push_back(chunk);
    }

    /// Release chunks every reader has moved past.
    fn discard_consumed(&mut self) {
        let Some(min_cursor) = self.readers.values().map(|reader| reader.cursor).min() else {
            return;
        };
        while self.base < min_cursor {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            self.buffered_bytes -= chunk.len();
            self.base += 1;
        }
    }

    /// Chunks to request from upstream under the active mode.
    fn upstream_demand(&self) -> u64 {
        let reach = self.end().saturating_add(self.requested);
        let target = match self.mode.unwrap_or(BackpressureMode::Original) {
            BackpressureMode::Fastest => {
                if self.buffered_bytes >= self.fastest_limit {
                    return 0;
                }
                self.readers
                    .values()
                    .filter(|reader| !reader.is_reserved())
                    .map(Reader::target)
                    .max()
            }
            BackpressureMode::Original => self.readers.values().map(Reader::target).min(),
        };
        target.unwrap_or(0).saturating_sub(reach)
    }

    fn next_action(&mut self) -> Option<Action> {
        self.discard_consumed();

        if self.readers.is_empty() {
            self.queue.clear();
            self.buffered_bytes = 0;
            if matches!(self.upstream_state, UpstreamState::Idle | UpstreamState::Started) {
                if let Some(upstream) = self.upstream.take() {
                    self.upstream_state = UpstreamState::Cancelled;
                    return Some(Action::Cancel(upstream));
                }
            }
            return None;
        }

        if self.upstream_state == UpstreamState::Idle
            && self.readers.values().any(Reader::is_attached)
        {
            if let Some(upstream) = self.upstream.take() {
                self.upstream_state = UpstreamState::Started;
                return Some(Action::Start(upstream));
            }
        }

        if self.upstream_state == UpstreamState::Started {
            let wanted = self.upstream_demand();
            if wanted > 0 {
                if let Some(upstream) = self.upstream.take() {
                    self.requested = self.requested.saturating_add(wanted);
                    return Some(Action::Request(upstream, wanted));
                }
            }
        }

        let end = self.end();
        let terminal = self.terminal.is_some();
        let (id, finished) = self.readers.iter().find_map(|(&id, reader)| {
            if !reader.is_attached() {
                None
            } else if reader.cursor < end && reader.demand > 0 {
                Some((id, false))
            } else if reader.cursor == end && terminal {
                Some((id, true))
            } else {
                None
            }
        })?;

        if finished {
            let consumer = self.readers.remove(&id)?.into_consumer()?;
            return Some(match self.terminal.clone()? {
                Terminal::Complete => Action::Complete(consumer),
                Terminal::Error(error) => Action::Fail(consumer, error),
            });
        }

        let base = self.base;
        let reader = self.readers.get_mut(&id)?;
        let chunk = self.queue.get((reader.cursor - base) as usize)?.acquire();
        reader.cursor += 1;
        reader.demand -= 1;
        let consumer = reader.take_consumer()?;
        Some(Action::Deliver {
            reader: id,
            consumer,
            chunk,
        })
    }
}

/// Distributes one upstream to N readers. Cheap to clone; clones share state.
#[derive(Clone)]
pub(crate) struct SharedBuffer {
    state: Arc<Mutex<State>>,
    ctx: BodyContext,
}

impl SharedBuffer {
    fn with_state(ctx: BodyContext, upstream_state: UpstreamState) -> Self {
        let fastest_limit = ctx.config.fastest_limit();
        Self {
            state: Arc::new(Mutex::new(State::new(fastest_limit, upstream_state))),
            ctx,
        }
    }

    /// A buffer fed by the upstream `build` creates around its sink.
    /// Returns the buffer and its first reader.
    pub(crate) fn new<F, U>(ctx: BodyContext, build: F) -> (Self, ReaderId)
    where
        F: FnOnce(BufferSink) -> U,
        U: Upstream,
    {
        let (buffer, reader, ()) = Self::with_producer(ctx, |sink| (build(sink), ()));
        (buffer, reader)
    }

    /// Like [`new`](Self::new), also returning a producer-side handle built
    /// alongside the upstream.
    pub(crate) fn with_producer<F, U, P>(ctx: BodyContext, build: F) -> (Self, ReaderId, P)
    where
        F: FnOnce(BufferSink) -> (U, P),
        U: Upstream,
    {
        let buffer = Self::with_state(ctx, UpstreamState::Idle);
        let (upstream, producer) = build(BufferSink {
            buffer: buffer.clone(),
        });
        let reader = {
            let mut state = buffer.lock();
            state.upstream = Some(Box::new(upstream));
            state.add_reader()
        };
        (buffer, reader, producer)
    }

    /// A buffer that already holds its whole body.
    pub(crate) fn completed(
        ctx: BodyContext,
        chunks: impl IntoIterator<Item = Chunk>,
    ) -> (Self, ReaderId) {
        let buffer = Self::with_state(ctx, UpstreamState::Finished);
        let reader = {
            let mut state = buffer.lock();
            for chunk in chunks {
                state.push(chunk);
            }
            state.terminal = Some(Terminal::Complete);
            state.add_reader()
        };
        (buffer, reader)
    }

    pub(crate) fn ctx(&self) -> &BodyContext {
        &self.ctx
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("shared buffer lock")
    }

    /// Bytes currently held in the queue.
    pub(crate) fn buffered_bytes(&self) -> usize {
        self.lock().buffered_bytes
    }

    /// Readers that have not finished or closed.
    #[cfg(test)]
    pub(crate) fn reader_count(&self) -> usize {
        self.lock().readers.len()
    }

    /// Add a reader positioned at the start of the body.
    ///
    /// Runs synchronously so a late split is reported to the caller.
    pub(crate) fn split_reader(
        &self,
        from: ReaderId,
        mode: BackpressureMode,
    ) -> Result<ReaderId, UsageError> {
        // Not routed through the flow: a late split has to fail here, at the
        // caller. Only bookkeeping changes; nothing is delivered.
        let mut state = self.lock();
        match state.readers.get(&from) {
            Some(reader) if !reader.closed => {}
            _ => return Err(UsageError::AlreadyConsumed),
        }
        if state.base > 0 {
            return Err(UsageError::LateSplit);
        }
        state.mode = Some(match state.mode {
            Some(current) => current.strictest(mode),
            None => mode,
        });
        let id = state.add_reader();
        trace!(reader = id, from, ?mode, "split shared buffer");
        Ok(id)
    }

    /// Attach `consumer` to a reserved reader.
    pub(crate) fn attach(
        &self,
        reader: ReaderId,
        mut consumer: Box<dyn BufferConsumer>,
        expected_length: Option<u64>,
    ) -> Subscription {
        let subscription = Subscription {
            buffer: self.clone(),
            reader,
            expected_length,
        };
        consumer.on_subscribe(subscription.clone());

        let buffer = self.clone();
        self.ctx.flow.execute_now(move || {
            let rejected = {
                let mut state = buffer.lock();
                match state.readers.get_mut(&reader) {
                    Some(entry) if entry.is_reserved() => {
                        entry.slot = Slot::Attached(consumer);
                        None
                    }
                    _ => Some(consumer),
                }
            };
            if let Some(consumer) = rejected {
                trace!(reader, "reader cancelled before it attached");
                drop(consumer);
                return;
            }
            buffer.drain();
        });
        subscription
    }

    pub(crate) fn request(&self, reader: ReaderId, n: u64) {
        if n == 0 {
            return;
        }
        let buffer = self.clone();
        self.ctx.flow.execute_now(move || {
            {
                let mut state = buffer.lock();
                let Some(entry) = state.readers.get_mut(&reader) else {
                    return;
                };
                entry.demand = entry.demand.saturating_add(n);
            }
            buffer.drain();
        });
    }

    /// Remove a reader, cancelling upstream if it was the last one.
    /// Releasing an unknown or already released reader is a no-op.
    pub(crate) fn release_reader(&self, reader: ReaderId) {
        let buffer = self.clone();
        self.ctx.flow.execute_now(move || {
            let removed = {
                let mut state = buffer.lock();
                let busy = match state.readers.get_mut(&reader) {
                    None => return,
                    Some(entry) if matches!(entry.slot, Slot::Busy) => {
                        entry.closed = true;
                        true
                    }
                    Some(_) => false,
                };
                if busy {
                    None
                } else {
                    state.readers.remove(&reader)
                }
            };
            drop(removed);
            buffer.drain();
        });
    }

    fn on_next(&self, chunk: Chunk) {
        let buffer = self.clone();
        self.ctx.flow.execute_now(move || {
            {
                let mut state = buffer.lock();
                let closed = state.terminal.is_some()
                    || state.upstream_state == UpstreamState::Cancelled
                    || state.readers.is_empty();
                if !closed {
                    state.requested = state.requested.saturating_sub(1);
                    state.push(chunk);
                } else {
                    drop(state);
                    trace!(len = chunk.len(), "releasing chunk received after close");
                    return;
                }
            }
            buffer.drain();
        });
    }

    fn on_terminal(&self, terminal: Terminal) {
        let buffer = self.clone();
        self.ctx.flow.execute_now(move || {
            let upstream = {
                let mut state = buffer.lock();
                if state.terminal.is_some() || state.upstream_state == UpstreamState::Cancelled {
                    return;
                }
                match &terminal {
                    Terminal::Complete => debug!(chunks = state.end(), "upstream completed"),
                    Terminal::Error(error) => debug!(error = %error, "upstream failed"),
                }
                state.terminal = Some(terminal);
                state.upstream_state = UpstreamState::Finished;
                state.upstream.take()
            };
            drop(upstream);
            buffer.drain();
        });
    }

    fn drain(&self) {
        {
            let mut state = self.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let action = {
                let mut state = self.lock();
                match state.next_action() {
                    Some(action) => action,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            self.perform(action);
        }
    }

    fn perform(&self, action: Action) {
        match action {
            Action::Start(mut upstream) => {
                trace!("starting upstream");
                upstream.start();
                self.restore_upstream(upstream);
            }
            Action::Request(mut upstream, n) => {
                trace!(n, "requesting chunks from upstream");
                upstream.request(n);
                self.restore_upstream(upstream);
            }
            Action::Cancel(mut upstream) => {
                debug!("every reader left before completion, cancelling upstream");
                upstream.cancel();
            }
            Action::Deliver {
                reader,
                mut consumer,
                chunk,
            } => {
                let result = consumer.add(chunk);
                self.finish_delivery(reader, consumer, result);
            }
            Action::Complete(mut consumer) => consumer.complete(),
            Action::Fail(mut consumer, error) => consumer.error(error),
        }
    }

    fn restore_upstream(&self, upstream: Box<dyn Upstream>) {
        let mut state = self.lock();
        if state.upstream_state == UpstreamState::Started {
            state.upstream = Some(upstream);
        } else {
            // terminated or cancelled during the call
            drop(state);
            drop(upstream);
        }
    }

    fn finish_delivery(
        &self,
        reader: ReaderId,
        mut consumer: Box<dyn BufferConsumer>,
        result: Result<(), BoxError>,
    ) {
        let mut state = self.lock();
        if let Err(error) = result {
            state.readers.remove(&reader);
            drop(state);
            warn!(reader, error = %error, "buffer consumer failed, detaching it");
            consumer.error(BodyError::consumer(error));
            return;
        }

        let keep = state.readers.get(&reader).is_some_and(|entry| !entry.closed);
        if keep {
            if let Some(entry) = state.readers.get_mut(&reader) {
                entry.slot = Slot::Attached(consumer);
            }
            return;
        }
        state.readers.remove(&reader);
        drop(state);
        drop(consumer);
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SharedBuffer")
            .field("mode", &state.mode)
            .field("readers", &state.readers.len())
            .field("queued", &state.queue.len())
            .field("buffered_bytes", &state.buffered_bytes)
            .field("upstream", &state.upstream_state)
            .finish()
    }
}

/// The producer-facing handle of a shared buffer.
///
/// An [`Upstream`] delivers chunks and its terminal signal through the sink
/// it was built with. Signals after the terminal one are ignored, and chunks
/// arriving after cancellation are released.
#[derive(Clone)]
pub struct BufferSink {
    buffer: SharedBuffer,
}

impl BufferSink {
    pub fn next(&self, chunk: Chunk) {
        self.buffer.on_next(chunk);
    }

    pub fn complete(&self) {
        self.buffer.on_terminal(Terminal::Complete);
    }

    pub fn error(&self, cause: BodyError) {
        self.buffer.on_terminal(Terminal::Error(cause));
    }

    /// Build a chunk tracked by the body's leak detector, if any.
    pub fn chunk(&self, bytes: impl Into<bytes::Bytes>) -> Chunk {
        self.buffer.ctx().chunk(bytes)
    }
}

impl fmt::Debug for BufferSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSink").finish_non_exhaustive()
    }
}

/// A consumer's handle for demand, cancellation and late splitting.
///
/// Clones refer to the same reader. Dropping a subscription does not cancel
/// it; a consumer either runs to its terminal callback or calls
/// [`cancel`](Self::cancel).
#[derive(Clone)]
pub struct Subscription {
    buffer: SharedBuffer,
    reader: ReaderId,
    expected_length: Option<u64>,
}

impl Subscription {
    /// Ask for `n` more chunks. Demand saturates at `u64::MAX`.
    pub fn request(&self, n: u64) {
        self.buffer.request(self.reader, n);
    }

    /// Stop receiving data. Idempotent.
    pub fn cancel(&self) {
        self.buffer.release_reader(self.reader);
    }

    /// Add another reader that sees the whole body.
    ///
    /// Fails with [`UsageError::LateSplit`] once the buffer has released a
    /// chunk the new reader would need.
    pub fn split(&self, mode: BackpressureMode) -> BodyResult<ByteBody> {
        let reader = self.buffer.split_reader(self.reader, mode)?;
        Ok(ByteBody::Streaming(StreamingByteBody::from_reader(
            self.buffer.clone(),
            reader,
            self.expected_length,
        )))
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.expected_length
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("reader", &self.reader)
            .field("expected_length", &self.expected_length)
            .finish()
    }
}
