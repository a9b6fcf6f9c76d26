use sink_api::{ChunkCompletion, ChunkId};

use crate::aggregate::ChunkVerdict;

/// Obligation to report a chunk back to the pipeline.
///
/// Every reporting method takes `self`, so a chunk is acknowledged or
/// rejected at most once. Dropping it unreported logs a warning: the
/// pipeline will only learn about that chunk through its own timeout.
#[must_use = "a chunk must be acknowledged or rejected"]
pub struct CompletionReporter<'a> {
    chunk_id: ChunkId,
    completion: Option<&'a dyn ChunkCompletion>,
}

impl<'a> CompletionReporter<'a> {
    pub fn new(chunk_id: ChunkId, completion: &'a dyn ChunkCompletion) -> Self {
        Self { chunk_id, completion: Some(completion) }
    }

    pub fn chunk_id(&self) -> &ChunkId {
        &self.chunk_id
    }

    pub fn acknowledge(mut self) {
        if let Some(completion) = self.completion.take() {
            tracing::debug!(chunk_id = %self.chunk_id, "acknowledge");
            completion.acknowledge(&self.chunk_id);
        }
    }

    pub fn reject(mut self) {
        if let Some(completion) = self.completion.take() {
            tracing::warn!(chunk_id = %self.chunk_id, "reject, chunk will be redelivered");
            completion.reject(&self.chunk_id);
        }
    }

    pub fn report(self, verdict: ChunkVerdict) {
        match verdict {
            ChunkVerdict::Deliver => self.acknowledge(),
            ChunkVerdict::Redeliver => self.reject(),
        }
    }
}

impl Drop for CompletionReporter<'_> {
    fn drop(&mut self) {
        if self.completion.is_some() {
            tracing::warn!(chunk_id = %self.chunk_id, "chunk dropped without acknowledge/reject");
        }
    }
}
