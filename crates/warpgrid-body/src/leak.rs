//! Chunk lifecycle accounting.
//!
//! A [`LeakDetector`] records every chunk allocation, handle acquisition,
//! handle release and storage free. At test or diagnostic time,
//! [`LeakDetector::report`] lists chunks that were never released (or whose
//! storage was never freed) and chunks released more often than acquired.
//!
//! Tracking is opt-in: only chunks created through a detector-aware
//! [`ByteBodyFactory`](crate::ByteBodyFactory) are recorded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a tracked chunk allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct Record {
    len: usize,
    acquired: u64,
    released: u64,
    freed: bool,
}

impl Record {
    fn is_leaked(&self) -> bool {
        self.acquired > self.released || !self.freed
    }
}

/// Records acquisitions and releases of tracked chunks.
#[derive(Debug, Default)]
pub struct LeakDetector {
    next_id: AtomicU64,
    records: Mutex<HashMap<ChunkId, Record>>,
}

impl LeakDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new allocation counts as the first acquisition of its storage.
    pub(crate) fn record_allocate(&self, len: usize) -> ChunkId {
        let id = ChunkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Record {
            len,
            acquired: 1,
            ..Record::default()
        };
        self.records
            .lock()
            .expect("leak detector lock")
            .insert(id, record);
        id
    }

    pub(crate) fn record_acquire(&self, id: ChunkId) {
        if let Some(record) = self.records.lock().expect("leak detector lock").get_mut(&id) {
            record.acquired += 1;
        }
    }

    pub(crate) fn record_release(&self, id: ChunkId) {
        let mut records = self.records.lock().expect("leak detector lock");
        if let Some(record) = records.get_mut(&id) {
            record.released += 1;
            if record.released > record.acquired {
                tracing::warn!(chunk = id.0, "chunk released more times than acquired");
            }
        }
    }

    pub(crate) fn record_free(&self, id: ChunkId) {
        if let Some(record) = self.records.lock().expect("leak detector lock").get_mut(&id) {
            record.freed = true;
        }
    }

    /// Number of tracked chunks whose storage is still alive.
    pub fn live_chunks(&self) -> usize {
        self.records
            .lock()
            .expect("leak detector lock")
            .values()
            .filter(|record| !record.freed)
            .count()
    }

    /// Bytes held by tracked chunks whose storage is still alive.
    pub fn live_bytes(&self) -> usize {
        self.records
            .lock()
            .expect("leak detector lock")
            .values()
            .filter(|record| !record.freed)
            .map(|record| record.len)
            .sum()
    }

    /// Snapshot the accounting state.
    pub fn report(&self) -> LeakReport {
        let records = self.records.lock().expect("leak detector lock");
        let mut report = LeakReport {
            tracked: records.len(),
            ..LeakReport::default()
        };
        for (id, record) in records.iter() {
            report.acquisitions += record.acquired;
            report.releases += record.released;
            if record.released > record.acquired {
                report.over_released.push(*id);
            } else if record.is_leaked() {
                report.leaked.push(*id);
            }
        }
        report.leaked.sort();
        report.over_released.sort();
        report
    }
}

/// Result of [`LeakDetector::report`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    /// Number of chunk allocations seen.
    pub tracked: usize,
    /// Total acquisitions, counting each allocation once.
    pub acquisitions: u64,
    /// Total releases.
    pub releases: u64,
    /// Chunks with outstanding handles or unfreed storage.
    pub leaked: Vec<ChunkId>,
    /// Chunks released more often than acquired.
    pub over_released: Vec<ChunkId>,
}

impl LeakReport {
    /// `true` when every acquisition was matched by exactly one release.
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
            && self.over_released.is_empty()
            && self.acquisitions == self.releases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_lifecycle_is_clean() {
        let detector = LeakDetector::new();
        let id = detector.record_allocate(4);
        detector.record_acquire(id);
        detector.record_release(id);
        detector.record_release(id);
        detector.record_free(id);

        let report = detector.report();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.tracked, 1);
        assert_eq!(report.acquisitions, 2);
        assert_eq!(report.releases, 2);
        assert_eq!(detector.live_chunks(), 0);
    }

    #[test]
    fn missing_release_is_reported() {
        let detector = LeakDetector::new();
        let id = detector.record_allocate(8);
        detector.record_acquire(id);
        detector.record_release(id);

        let report = detector.report();
        assert!(!report.is_clean());
        assert_eq!(report.leaked, vec![id]);
        assert_eq!(detector.live_bytes(), 8);
    }

    #[test]
    fn double_release_is_reported() {
        let detector = LeakDetector::new();
        let id = detector.record_allocate(1);
        detector.record_release(id);
        detector.record_release(id);
        detector.record_free(id);

        let report = detector.report();
        assert_eq!(report.over_released, vec![id]);
        assert!(report.leaked.is_empty());
        assert!(!report.is_clean());
    }
}
