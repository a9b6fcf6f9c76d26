use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use sink_api::{ChunkCompletion, ChunkId};

/// Terminal state reported for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Acknowledged,
    Rejected,
}

/// Host-side `ChunkCompletion`: remembers what the sink reported so the
/// worker can free the chunk or schedule a redelivery.
#[derive(Default)]
pub struct ChunkLedger {
    reported: Mutex<HashMap<ChunkId, Completion>>,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub acknowledged: u64,
    pub rejected: u64,
}

impl ChunkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the reported state of a chunk. `None` if nothing was reported.
    pub fn take(&self, chunk_id: &ChunkId) -> Option<Completion> {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(chunk_id)
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn record(&self, chunk_id: &ChunkId, completion: Completion) {
        let previous = self
            .reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chunk_id.clone(), completion);
        if let Some(previous) = previous {
            tracing::error!(chunk_id = %chunk_id, ?previous, ?completion, "chunk reported twice");
        }
    }
}

impl ChunkCompletion for ChunkLedger {
    fn acknowledge(&self, chunk_id: &ChunkId) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.record(chunk_id, Completion::Acknowledged);
    }

    fn reject(&self, chunk_id: &ChunkId) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.record(chunk_id, Completion::Rejected);
    }
}
