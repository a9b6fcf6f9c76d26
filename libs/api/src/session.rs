use std::future::Future;
use std::pin::Pin;

use crate::{ChunkId, Record, Statement, StoreError};

// ════════════════════════════════════════════════════════════════
//  Store seam
// ════════════════════════════════════════════════════════════════

/// Live session against the column store.
///
/// One instance is opened at process start and shared by every worker,
/// so implementations must tolerate concurrent `execute` calls.
///
/// Backends: `storage-cassandra` (native protocol), `storage-memory`.
pub trait StoreSession: Send + Sync {
    /// Execute one statement. Resolves once the store has answered at the
    /// statement's consistency level.
    fn execute(&self, statement: &Statement)
        -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Release connections. Called once at shutdown.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}

// ════════════════════════════════════════════════════════════════
//  Upstream pipeline seams
// ════════════════════════════════════════════════════════════════

/// Terminal chunk actions understood by the upstream pipeline.
///
/// Exactly one of the two is invoked per delivered chunk.
pub trait ChunkCompletion: Send + Sync {
    /// Chunk fully handled; the pipeline may free it.
    fn acknowledge(&self, chunk_id: &ChunkId);

    /// Chunk not delivered; the pipeline should redeliver it later.
    fn reject(&self, chunk_id: &ChunkId);
}

/// Record → JSON document whose top-level keys are table column names.
///
/// The result is embedded into a single-quoted CQL literal as is, so
/// implementations must double every `'` in the output.
pub trait RecordFormatter: Send + Sync {
    fn format(&self, record: &Record) -> Result<String, StoreError>;
}
