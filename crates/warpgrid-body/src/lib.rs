//! WarpGrid byte bodies: buffered and streaming HTTP payloads.
//!
//! A [`ByteBody`] is either [`Available`](ByteBody::Available), a single
//! in-memory [`Chunk`], or [`Streaming`](ByteBody::Streaming), backed by a
//! shared buffer that a transport fills incrementally. Bodies are
//! created by a [`ByteBodyFactory`] bound to a connection's event loop.
//!
//! # Streaming Model
//!
//! Consumption is push-based with explicit demand. A [`BufferConsumer`]
//! subscribes to a body and asks for chunks through its [`Subscription`];
//! the shared buffer pulls from its [`Upstream`] only as far as its readers
//! want. A body can be split into independent readers that each see every
//! chunk in order; [`BackpressureMode`] decides whether the fastest or the
//! slowest reader paces the transport.
//!
//! Push-based transports feed bodies through a [`BodyFeed`], which queues
//! data until there is demand and signals [`TransportControl::pause_reads`]
//! when the queue passes its high watermark. Pull-based sources are adapted
//! with [`ByteBodyFactory::adapt_stream`], and any body can be read as a
//! `futures_core::Stream` via [`ByteBody::into_stream`].
//!
//! # Memory Guarantee
//!
//! Chunks are reference-counted and never copied between readers. A chunk
//! stays in a shared buffer only until every reader has moved past it, and
//! every chunk still queued when a body is closed, cancelled or fails is
//! released. A [`LeakDetector`] can account for every acquisition and
//! release when `leak_detection` is enabled in [`BodyConfig`].
//!
//! # Threading
//!
//! Buffer state belongs to one event loop per connection. Calls from other
//! threads are marshalled through [`EventLoopFlow`] and never block.

mod body;
mod chunk;
mod concat;
mod config;
mod consumer;
mod error;
mod event_loop;
mod factory;
mod feed;
mod leak;
mod shared;
mod stream;

pub use body::{AvailableByteBody, ByteBody, StreamingByteBody};
pub use chunk::Chunk;
pub use concat::Separators;
pub use config::{BodyConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_BUFFER_SIZE};
pub use consumer::{BufferConsumer, Upstream};
pub use error::{BodyError, BodyResult, BoxError, SharedError, UsageError};
pub use event_loop::{EventLoop, EventLoopFlow, InlineEventLoop, Task, TaskQueue};
pub use factory::ByteBodyFactory;
pub use feed::{BodyFeed, StreamPump, TransportControl};
pub use leak::{ChunkId, LeakDetector, LeakReport};
pub use shared::{BackpressureMode, BufferSink, Subscription};
pub use stream::BodyStream;
