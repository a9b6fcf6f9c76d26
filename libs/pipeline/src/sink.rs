use std::future::Future;
use std::sync::Arc;

use sink_api::{Chunk, ChunkCompletion, ErrorKind, Record, RecordFormatter, StoreError, StoreSession};

use crate::aggregate::{ChunkSummary, ChunkVerdict, TolerancePolicy, WriteOutcome};
use crate::config::OutputConfig;
use crate::dispatch::{WriteDispatcher, WriteTask};
use crate::handle::SessionHandle;
use crate::inject::inject_values;
use crate::placeholder::{InsertTarget, has_placeholders};
use crate::report::CompletionReporter;
use crate::statement::{InsertOptions, build_insert};
use crate::SinkError;

// ═══════════════════════════════════════════════════════════════
//  CassandraJsonSink
// ═══════════════════════════════════════════════════════════════

/// Buffered output: one `INSERT ... JSON` per record, one verdict per chunk.
///
/// Shared by all workers (`&self` everywhere); chunks are independent and
/// the only shared state is the session handle.
pub struct CassandraJsonSink {
    output: OutputConfig,
    options: InsertOptions,
    tolerance: TolerancePolicy,
    formatter: Arc<dyn RecordFormatter>,
    handle: SessionHandle,
}

impl CassandraJsonSink {
    pub fn new(
        output: OutputConfig,
        formatter: Arc<dyn RecordFormatter>,
        handle: SessionHandle,
    ) -> Result<Self, SinkError> {
        output.validate()?;
        Ok(Self {
            options: output.insert_options(),
            tolerance: output.tolerance(),
            output,
            formatter,
            handle,
        })
    }

    /// Validate the config, then open the session through `connect`.
    /// `connect` receives the keyspace the session should bind to.
    pub async fn start<C, F>(
        output: OutputConfig,
        formatter: Arc<dyn RecordFormatter>,
        connect: C,
    ) -> Result<Self, SinkError>
    where
        C: FnOnce(Option<String>) -> F,
        F: Future<Output = Result<Arc<dyn StoreSession>, StoreError>>,
    {
        output.validate()?;
        let keyspace = Self::session_keyspace(&output);
        let handle = SessionHandle::open(connect(keyspace.clone()), keyspace).await?;
        Self::new(output, formatter, handle)
    }

    /// Keyspace a new session should bind to: the configured one, unless it is templated.
    pub fn session_keyspace(output: &OutputConfig) -> Option<String> {
        if has_placeholders(&output.keyspace) {
            None
        } else {
            Some(output.keyspace.clone())
        }
    }

    /// Chunks may be written from several workers at once.
    pub fn multi_workers_ready(&self) -> bool {
        true
    }

    pub fn output(&self) -> &OutputConfig {
        &self.output
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Record → JSON line embedded in the insert: inject, then format.
    pub fn format(&self, record: &Record) -> Result<String, SinkError> {
        self.format_row(record).map_err(SinkError::Format)
    }

    fn format_row(&self, record: &Record) -> Result<String, StoreError> {
        let record = inject_values(&self.output.inject, record)?;
        self.formatter.format(&record)
    }

    /// Write one chunk and report it to `completion` exactly once.
    ///
    /// - empty chunk: acknowledged right away, no writes issued
    /// - otherwise every row is written concurrently and the verdict is
    ///   reported only after all of them resolved
    /// - `Err` means the chunk never reached the store (placeholder or
    ///   closed session), or the session closed while rows were in flight
    ///   and some of them failed with an io error; the chunk is rejected
    ///   before returning
    pub async fn try_write(
        &self,
        chunk: &Chunk,
        completion: &dyn ChunkCompletion,
    ) -> Result<ChunkSummary, SinkError> {
        let reporter = CompletionReporter::new(chunk.id().clone(), completion);

        if chunk.is_empty() {
            reporter.acknowledge();
            return Ok(ChunkSummary {
                chunk_id: chunk.id().clone(),
                total: 0,
                succeeded: 0,
                failures: Vec::new(),
                verdict: ChunkVerdict::Deliver,
            });
        }

        let prepared = self
            .handle
            .session()
            .and_then(|session| {
                InsertTarget::resolve(&self.output.keyspace, &self.output.table, chunk.metadata())
                    .map(|target| (session, target))
            });
        let (session, target) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(chunk_id = %chunk.id(), error = %e, "chunk not dispatched");
                reporter.reject();
                return Err(e);
            }
        };

        let mut tasks = Vec::with_capacity(chunk.len());
        let mut resolved = Vec::new();
        for (index, record) in chunk.records().iter().enumerate() {
            match self.format_row(record) {
                Ok(json) => {
                    let statement = build_insert(&target, &self.options, &json);
                    tasks.push(WriteTask { index, payload: Arc::from(json), statement });
                }
                Err(e) => {
                    let raw = serde_json::Value::Object(record.fields.clone()).to_string();
                    resolved.push(WriteOutcome::failed(index, Arc::from(raw), e));
                }
            }
        }

        let summary = WriteDispatcher::new(session)
            .submit(chunk.id().clone(), tasks, resolved)
            .join(self.tolerance)
            .await;

        if !self.handle.is_open() && summary.failures.iter().any(|f| f.error.kind() == ErrorKind::Io) {
            tracing::error!(
                chunk_id = %summary.chunk_id,
                failed = summary.failed(),
                "session closed while chunk was in flight"
            );
            reporter.reject();
            return Err(SinkError::SessionUnavailable("closed while chunk was in flight".into()));
        }

        tracing::debug!(
            chunk_id = %summary.chunk_id,
            target = %target,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed(),
            verdict = ?summary.verdict,
            "chunk written"
        );

        reporter.report(summary.verdict);
        Ok(summary)
    }

    /// Close the session at shutdown. Errors are logged by the handle.
    pub async fn stop(&self) {
        let _ = self.handle.close().await;
    }
}
