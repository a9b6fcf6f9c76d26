use std::sync::Arc;

use sink_api::{ChunkId, StoreError};

/// Whether a single failed row sinks the whole chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TolerancePolicy {
    /// Failed rows are logged at warn and dropped; the chunk is always delivered.
    SkipInvalidRows,
    /// Any failed row makes the chunk redeliverable (logged at error).
    /// Rows that did succeed stay in the store, nothing is undone.
    RejectChunk,
}

/// Verdict for a chunk, available only after every write resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// Acknowledge: the pipeline may free the chunk.
    Deliver,
    /// Reject: the pipeline should redeliver the chunk later.
    Redeliver,
}

/// Result of one write task.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub index: usize,
    /// Formatted record (or raw fields when formatting failed), for diagnostics.
    pub payload: Arc<str>,
    pub result: Result<(), StoreError>,
}

impl WriteOutcome {
    pub fn ok(index: usize, payload: Arc<str>) -> Self {
        Self { index, payload, result: Ok(()) }
    }

    pub fn failed(index: usize, payload: Arc<str>, error: StoreError) -> Self {
        Self { index, payload, result: Err(error) }
    }
}

#[derive(Debug, Clone)]
pub struct RowFailure {
    pub index: usize,
    pub payload: Arc<str>,
    pub error: StoreError,
}

#[derive(Debug, Clone)]
pub struct ChunkSummary {
    pub chunk_id: ChunkId,
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<RowFailure>,
    pub verdict: ChunkVerdict,
}

impl ChunkSummary {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

// ═══════════════════════════════════════════════════════════════
//  OutcomeAggregator
// ═══════════════════════════════════════════════════════════════

/// Fan-in side of a chunk dispatch.
///
/// Outcomes arrive in any order; each row index is counted once. No
/// verdict exists until all `expected` rows are resolved, so an early
/// failure never short-circuits the join and every failure gets logged.
pub struct OutcomeAggregator {
    chunk_id: ChunkId,
    policy: TolerancePolicy,
    seen: Vec<bool>,
    resolved: usize,
    succeeded: usize,
    failures: Vec<RowFailure>,
}

impl OutcomeAggregator {
    pub fn new(chunk_id: ChunkId, expected: usize, policy: TolerancePolicy) -> Self {
        Self {
            chunk_id,
            policy,
            seen: vec![false; expected],
            resolved: 0,
            succeeded: 0,
            failures: Vec::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.seen.len()
    }

    pub fn resolved(&self) -> usize {
        self.resolved
    }

    pub fn is_complete(&self) -> bool {
        self.resolved == self.seen.len()
    }

    /// Whether `index` still waits for its outcome.
    pub fn is_pending(&self, index: usize) -> bool {
        self.seen.get(index).is_some_and(|seen| !seen)
    }

    /// Fold one outcome. Duplicate or out-of-range indexes are ignored.
    pub fn observe(&mut self, outcome: WriteOutcome) {
        match self.seen.get_mut(outcome.index) {
            Some(seen) if !*seen => *seen = true,
            _ => {
                tracing::debug!(
                    chunk_id = %self.chunk_id,
                    index = outcome.index,
                    "ignoring duplicate write outcome"
                );
                return;
            }
        }
        self.resolved += 1;

        match outcome.result {
            Ok(()) => self.succeeded += 1,
            Err(error) => {
                match self.policy {
                    TolerancePolicy::SkipInvalidRows => tracing::warn!(
                        chunk_id = %self.chunk_id,
                        record = %outcome.payload,
                        kind = %error.kind(),
                        error = %error,
                        "failed to insert"
                    ),
                    TolerancePolicy::RejectChunk => tracing::error!(
                        chunk_id = %self.chunk_id,
                        record = %outcome.payload,
                        kind = %error.kind(),
                        error = %error,
                        "failed to insert"
                    ),
                }
                self.failures.push(RowFailure {
                    index: outcome.index,
                    payload: outcome.payload,
                    error,
                });
            }
        }
    }

    /// `None` while any row is still unresolved.
    pub fn verdict(&self) -> Option<ChunkVerdict> {
        self.is_complete().then(|| self.decide())
    }

    fn decide(&self) -> ChunkVerdict {
        match self.policy {
            TolerancePolicy::SkipInvalidRows => ChunkVerdict::Deliver,
            TolerancePolicy::RejectChunk if self.failures.is_empty() => ChunkVerdict::Deliver,
            TolerancePolicy::RejectChunk => ChunkVerdict::Redeliver,
        }
    }

    /// Resolve every still-pending row as failed with `reason(index)`, then finish.
    pub fn finish_with(mut self, reason: impl Fn(usize) -> (Arc<str>, StoreError)) -> ChunkSummary {
        for index in 0..self.seen.len() {
            if self.is_pending(index) {
                let (payload, error) = reason(index);
                self.observe(WriteOutcome::failed(index, payload, error));
            }
        }
        let verdict = self.decide();
        self.summary(verdict)
    }

    /// Consume into a summary. Gives the aggregator back if rows are still pending.
    pub fn finish(self) -> Result<ChunkSummary, Self> {
        let Some(verdict) = self.verdict() else {
            return Err(self);
        };
        Ok(self.summary(verdict))
    }

    fn summary(self, verdict: ChunkVerdict) -> ChunkSummary {
        let mut failures = self.failures;
        failures.sort_by_key(|f| f.index);
        ChunkSummary {
            chunk_id: self.chunk_id,
            total: self.seen.len(),
            succeeded: self.succeeded,
            failures,
            verdict,
        }
    }
}
