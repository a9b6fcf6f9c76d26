use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::{Id, JoinSet};

use sink_api::{ChunkId, Statement, StoreError, StoreSession};

use crate::aggregate::{ChunkSummary, OutcomeAggregator, TolerancePolicy, WriteOutcome};

/// One row of a chunk, ready to be written.
#[derive(Debug, Clone)]
pub struct WriteTask {
    pub index: usize,
    pub payload: Arc<str>,
    pub statement: Statement,
}

// ═══════════════════════════════════════════════════════════════
//  WriteDispatcher: fan-out
// ═══════════════════════════════════════════════════════════════

/// Spawns one tokio task per row. Submission never waits on a result;
/// backpressure, if any, comes from the store client's own pool.
pub struct WriteDispatcher {
    session: Arc<dyn StoreSession>,
}

impl WriteDispatcher {
    pub fn new(session: Arc<dyn StoreSession>) -> Self {
        Self { session }
    }

    /// Submit all `tasks` concurrently.
    ///
    /// `resolved` carries rows that already failed before reaching the store
    /// (e.g. the formatter rejected them); they join the same barrier.
    /// Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        chunk_id: ChunkId,
        tasks: Vec<WriteTask>,
        resolved: Vec<WriteOutcome>,
    ) -> InFlightChunk {
        let total = tasks.len() + resolved.len();
        let mut rows = HashMap::with_capacity(tasks.len());
        let mut set = JoinSet::new();

        for task in tasks {
            let row = (task.index, task.payload.clone());
            let session = self.session.clone();
            let spawned = set.spawn(async move {
                let result = session.execute(&task.statement).await;
                WriteOutcome {
                    index: task.index,
                    payload: task.payload,
                    result,
                }
            });
            rows.insert(spawned.id(), row);
        }

        tracing::trace!(chunk_id = %chunk_id, in_flight = set.len(), "writes submitted");

        InFlightChunk {
            chunk_id,
            total,
            tasks: set,
            resolved,
            rows,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  InFlightChunk: fan-in barrier
// ═══════════════════════════════════════════════════════════════

/// All writes of one chunk, in flight.
pub struct InFlightChunk {
    chunk_id: ChunkId,
    total: usize,
    tasks: JoinSet<WriteOutcome>,
    resolved: Vec<WriteOutcome>,
    /// Row index and payload of every spawned write, for tasks that die without an outcome.
    rows: HashMap<Id, (usize, Arc<str>)>,
}

impl InFlightChunk {
    pub fn chunk_id(&self) -> &ChunkId {
        &self.chunk_id
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Wait for every write to resolve, then fold them under `policy`.
    ///
    /// A hung write keeps this pending: timeouts belong to the pipeline.
    pub async fn join(mut self, policy: TolerancePolicy) -> ChunkSummary {
        let mut agg = OutcomeAggregator::new(self.chunk_id.clone(), self.total, policy);
        for outcome in self.resolved.drain(..) {
            agg.observe(outcome);
        }

        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => agg.observe(outcome),
                // panicked or aborted task
                Err(e) => match self.rows.remove(&e.id()) {
                    Some((index, payload)) => agg.observe(WriteOutcome::failed(
                        index,
                        payload,
                        StoreError::new(format!("write task lost: {}", lost_reason(e))),
                    )),
                    None => tracing::warn!(chunk_id = %self.chunk_id, error = %e, "unknown write task lost"),
                },
            }
        }

        // rows still pending here never got an outcome (index missing from the submitted tasks)
        agg.finish_with(|_| (Arc::from(""), StoreError::new("write task lost: no outcome")))
    }
}

/// Panic message of a lost task when it carries one.
fn lost_reason(e: tokio::task::JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}
