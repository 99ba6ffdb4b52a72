//! The callback contracts between producers, the engine and consumers.
//!
//! Data flows downstream through [`BufferConsumer`] callbacks; demand and
//! cancellation flow upstream through [`Subscription`] and [`Upstream`].
//! There are no blocking waits anywhere on this path.

use crate::chunk::Chunk;
use crate::error::{BodyError, BoxError};
use crate::shared::Subscription;

/// A sink receiving a body's chunks.
///
/// For one subscription the engine calls `on_subscribe` first, then `add`
/// at most once per unit of requested demand, then exactly one of
/// `complete` or `error` (unless the subscription is cancelled first).
/// Callbacks for one consumer never overlap.
///
/// The consumer owns each chunk it is handed. Keeping the [`Chunk`] keeps
/// the bytes alive; dropping it releases them.
pub trait BufferConsumer: Send + 'static {
    /// Receives the subscription before any data. Demand is signalled
    /// through [`Subscription::request`], here or later.
    fn on_subscribe(&mut self, subscription: Subscription) {
        let _ = subscription;
    }

    /// Receives the next chunk.
    ///
    /// Returning an error detaches this consumer only: it receives a
    /// [`BodyError::Consumer`] through [`error`](Self::error) and sibling
    /// readers continue unaffected.
    fn add(&mut self, chunk: Chunk) -> Result<(), BoxError>;

    /// The body ended normally.
    fn complete(&mut self);

    /// The body ended with an error.
    fn error(&mut self, cause: BodyError);
}

/// The producing side of a shared buffer.
///
/// Calls arrive on the buffer's owning thread, never concurrently. The
/// upstream delivers data through the [`BufferSink`](crate::BufferSink) it
/// was constructed with.
pub trait Upstream: Send + 'static {
    /// The first reader attached. Called at most once.
    fn start(&mut self) {}

    /// The buffer wants `n` more chunks.
    fn request(&mut self, n: u64);

    /// Every reader went away before the body terminated. Called at most once,
    /// and never after the upstream signalled completion or an error.
    fn cancel(&mut self);
}
