//! Reference-counted byte chunks.
//!
//! A [`Chunk`] is the unit of data the engine moves around: an immutable
//! span of bytes behind a shared reference count. [`Chunk::acquire`] hands
//! out another handle to the same storage without copying; dropping (or
//! [`Chunk::release`]-ing) a handle gives that reference back. The storage
//! is freed exactly once, when the last handle goes away.
//!
//! Because releasing consumes the handle, reading a released chunk is a
//! compile error rather than a runtime check.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;

use crate::leak::{ChunkId, LeakDetector};

struct Tracking {
    id: ChunkId,
    detector: Arc<LeakDetector>,
}

struct Storage {
    bytes: Bytes,
    tracking: Option<Tracking>,
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(tracking) = &self.tracking {
            tracking.detector.record_free(tracking.id);
        }
    }
}

/// An immutable, reference-counted span of bytes.
pub struct Chunk {
    storage: Arc<Storage>,
}

impl Chunk {
    /// Create an untracked chunk.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            storage: Arc::new(Storage {
                bytes: bytes.into(),
                tracking: None,
            }),
        }
    }

    /// Create a chunk whose lifecycle is recorded by `detector`.
    pub fn tracked(bytes: impl Into<Bytes>, detector: &Arc<LeakDetector>) -> Self {
        let bytes = bytes.into();
        let id = detector.record_allocate(bytes.len());
        Self {
            storage: Arc::new(Storage {
                bytes,
                tracking: Some(Tracking {
                    id,
                    detector: Arc::clone(detector),
                }),
            }),
        }
    }

    /// Take another handle to the same storage.
    pub fn acquire(&self) -> Chunk {
        if let Some(tracking) = &self.storage.tracking {
            tracking.detector.record_acquire(tracking.id);
        }
        Chunk {
            storage: Arc::clone(&self.storage),
        }
    }

    /// Give this handle back. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// Number of live handles to this chunk's storage.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    /// Tracking id, if this chunk is recorded by a leak detector.
    pub fn id(&self) -> Option<ChunkId> {
        self.storage.tracking.as_ref().map(|tracking| tracking.id)
    }

    pub fn len(&self) -> usize {
        self.storage.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.storage.bytes
    }

    /// Cheap clone of the underlying `Bytes`.
    ///
    /// The returned buffer shares the allocation but is outside the
    /// chunk's reference accounting.
    pub fn to_bytes(&self) -> Bytes {
        self.storage.bytes.clone()
    }

    /// Returns `true` if both handles alias the same storage.
    pub fn ptr_eq(&self, other: &Chunk) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(tracking) = &self.storage.tracking {
            tracking.detector.record_release(tracking.id);
        }
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage.bytes
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.storage.bytes
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .field("id", &self.id())
            .finish()
    }
}
