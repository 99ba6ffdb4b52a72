//! Concatenation of byte bodies with separator injection.
//!
//! The output is a streaming body that emits `prefix`, then each item's
//! chunks with `between` at every boundary, then `suffix`. Items are
//! subscribed one at a time, in order, only once the output has demand.
//!
//! Item callbacks and output demand may arrive re-entrantly (or from an
//! item's own event loop), so every input is turned into an event and
//! processed by a single loop; side effects run after the state lock is
//! released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::body::{ByteBody, StreamingByteBody};
use crate::chunk::Chunk;
use crate::consumer::{BufferConsumer, Upstream};
use crate::error::{BodyError, BoxError};
use crate::factory::BodyContext;
use crate::shared::{BufferSink, SharedBuffer, Subscription};

/// Bytes emitted before, between and after concatenated items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Separators {
    prefix: Bytes,
    between: Bytes,
    suffix: Bytes,
}

impl Separators {
    pub fn new(
        prefix: impl Into<Bytes>,
        between: impl Into<Bytes>,
        suffix: impl Into<Bytes>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            between: between.into(),
            suffix: suffix.into(),
        }
    }

    /// Plain concatenation.
    pub fn none() -> Self {
        Self::default()
    }

    /// `[`, `,` and `]`: joins already-encoded JSON values into an array.
    pub fn json_array() -> Self {
        Self::new(
            Bytes::from_static(b"["),
            Bytes::from_static(b","),
            Bytes::from_static(b"]"),
        )
    }

    pub fn prefix(&self) -> &Bytes {
        &self.prefix
    }

    pub fn between(&self) -> &Bytes {
        &self.between
    }

    pub fn suffix(&self) -> &Bytes {
        &self.suffix
    }
}

type Items = Box<dyn Iterator<Item = ByteBody> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingFirstItem,
    StreamingItem,
    BetweenItems,
    Done,
    Failed,
}

enum Event {
    Demand(u64),
    Cancel,
    ItemSubscribed(u64, Subscription),
    ItemChunk(u64, Chunk),
    ItemComplete(u64),
    ItemError(u64, BodyError),
}

enum Effect {
    Separator(Bytes),
    Forward(Chunk),
    Complete,
    Fail(BodyError),
    Subscribe(ByteBody, u64),
    Request(Subscription, u64),
    CancelItem(Subscription),
    DropItems(Items),
}

struct ConcatState {
    phase: Phase,
    items: Option<Items>,
    separators: Separators,
    /// Output chunks requested and not yet emitted.
    demand: u64,
    current: Option<Subscription>,
    /// Generation of the item being streamed; events from older items are stale.
    item: u64,
    events: VecDeque<Event>,
    running: bool,
}

impl ConcatState {
    fn separator(&mut self, bytes: Bytes, effects: &mut Vec<Effect>) {
        if !bytes.is_empty() {
            self.demand = self.demand.saturating_sub(1);
            effects.push(Effect::Separator(bytes));
        }
    }

    fn release_items(&mut self, effects: &mut Vec<Effect>) {
        if let Some(items) = self.items.take() {
            effects.push(Effect::DropItems(items));
        }
    }

    /// Subscribe the next item, or finish the output if there is none.
    fn advance(&mut self, effects: &mut Vec<Effect>) {
        match self.items.as_mut().and_then(Iterator::next) {
            Some(body) => {
                self.item += 1;
                self.phase = Phase::StreamingItem;
                effects.push(Effect::Subscribe(body, self.item));
            }
            None => {
                let suffix = self.separators.suffix.clone();
                self.separator(suffix, effects);
                self.phase = Phase::Done;
                self.release_items(effects);
                effects.push(Effect::Complete);
            }
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Failed)
    }

    fn apply(&mut self, event: Event) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            Event::Demand(n) => {
                if self.is_finished() {
                    return effects;
                }
                self.demand = self.demand.saturating_add(n);
                if self.phase == Phase::AwaitingFirstItem {
                    let prefix = self.separators.prefix.clone();
                    self.separator(prefix, &mut effects);
                    self.advance(&mut effects);
                } else if let Some(current) = &self.current {
                    effects.push(Effect::Request(current.clone(), n));
                }
            }
            Event::Cancel => {
                if self.is_finished() {
                    return effects;
                }
                trace!(item = self.item, "concatenation cancelled");
                self.phase = Phase::Done;
                if let Some(current) = self.current.take() {
                    effects.push(Effect::CancelItem(current));
                }
                self.release_items(&mut effects);
            }
            Event::ItemSubscribed(item, subscription) => {
                if item != self.item || self.is_finished() {
                    effects.push(Effect::CancelItem(subscription));
                    return effects;
                }
                if self.demand > 0 {
                    effects.push(Effect::Request(subscription.clone(), self.demand));
                }
                self.current = Some(subscription);
            }
            Event::ItemChunk(item, chunk) => {
                if item != self.item || self.is_finished() {
                    return effects;
                }
                self.demand = self.demand.saturating_sub(1);
                effects.push(Effect::Forward(chunk));
            }
            Event::ItemComplete(item) => {
                if item != self.item || self.is_finished() {
                    return effects;
                }
                self.current = None;
                self.phase = Phase::BetweenItems;
                let mut next = Vec::new();
                self.advance(&mut next);
                if matches!(next.first(), Some(Effect::Subscribe(..))) {
                    let between = self.separators.between.clone();
                    self.separator(between, &mut effects);
                }
                effects.extend(next);
            }
            Event::ItemError(item, error) => {
                if item != self.item || self.is_finished() {
                    return effects;
                }
                debug!(item, error = %error, "concatenated item failed");
                self.phase = Phase::Failed;
                self.current = None;
                self.release_items(&mut effects);
                effects.push(Effect::Fail(error));
            }
        }
        effects
    }
}

/// Drives one concatenated output body from a sequence of item bodies.
pub(crate) struct ConcatenatingSubscriber {
    state: Mutex<ConcatState>,
    sink: BufferSink,
}

impl ConcatenatingSubscriber {
    /// Build the output body. Nothing is subscribed until it has demand.
    pub(crate) fn body<I>(ctx: BodyContext, items: I, separators: Separators) -> ByteBody
    where
        I: IntoIterator<Item = ByteBody>,
        I::IntoIter: Send + 'static,
    {
        let items: Items = Box::new(items.into_iter());
        let (buffer, reader) = SharedBuffer::new(ctx, |sink| ConcatUpstream {
            core: Arc::new(Self {
                state: Mutex::new(ConcatState {
                    phase: Phase::AwaitingFirstItem,
                    items: Some(items),
                    separators,
                    demand: 0,
                    current: None,
                    item: 0,
                    events: VecDeque::new(),
                    running: false,
                }),
                sink,
            }),
        });
        ByteBody::Streaming(StreamingByteBody::from_reader(buffer, reader, None))
    }

    fn lock(&self) -> MutexGuard<'_, ConcatState> {
        self.state.lock().expect("concatenation state lock")
    }

    fn handle(self: &Arc<Self>, event: Event) {
        {
            let mut state = self.lock();
            state.events.push_back(event);
            if state.running {
                return;
            }
            state.running = true;
        }
        loop {
            let effects = {
                let mut state = self.lock();
                match state.events.pop_front() {
                    Some(event) => state.apply(event),
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };
            for effect in effects {
                self.perform(effect);
            }
        }
    }

    fn perform(self: &Arc<Self>, effect: Effect) {
        match effect {
            Effect::Separator(bytes) => self.sink.next(self.sink.chunk(bytes)),
            Effect::Forward(chunk) => self.sink.next(chunk),
            Effect::Complete => self.sink.complete(),
            Effect::Fail(error) => self.sink.error(error),
            Effect::Subscribe(body, item) => {
                let consumer = ItemConsumer {
                    core: Arc::clone(self),
                    item,
                };
                if let Err(error) = body.subscribe(consumer) {
                    self.handle(Event::ItemError(item, error));
                }
            }
            Effect::Request(subscription, n) => subscription.request(n),
            Effect::CancelItem(subscription) => subscription.cancel(),
            Effect::DropItems(items) => drop(items),
        }
    }
}

struct ConcatUpstream {
    core: Arc<ConcatenatingSubscriber>,
}

impl Upstream for ConcatUpstream {
    fn request(&mut self, n: u64) {
        self.core.handle(Event::Demand(n));
    }

    fn cancel(&mut self) {
        self.core.handle(Event::Cancel);
    }
}

struct ItemConsumer {
    core: Arc<ConcatenatingSubscriber>,
    item: u64,
}

impl BufferConsumer for ItemConsumer {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.core.handle(Event::ItemSubscribed(self.item, subscription));
    }

    fn add(&mut self, chunk: Chunk) -> Result<(), BoxError> {
        self.core.handle(Event::ItemChunk(self.item, chunk));
        Ok(())
    }

    fn complete(&mut self) {
        self.core.handle(Event::ItemComplete(self.item));
    }

    fn error(&mut self, cause: BodyError) {
        self.core.handle(Event::ItemError(self.item, cause));
    }
}
