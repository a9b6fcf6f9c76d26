use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use codec_json::JsonFormatter;
use pipeline::CassandraJsonSink;
use sink_api::{Chunk, RecordFormatter, StoreError, StoreSession};
use storage_memory::MemoryStore;

use crate::config::{BufferConfig, RunArgs, ServerConfig};
use crate::error::ServerError;
use crate::intake::{Chunker, Event};
use crate::ledger::{ChunkLedger, Completion};

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Chunk>>>;

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_times: u32,
    wait: Duration,
}

#[derive(Debug, Default)]
struct IntakeStats {
    events: u64,
    skipped: u64,
    chunks: u64,
}

#[derive(Debug, Default)]
struct WorkerStats {
    rows_written: usize,
    rows_failed: usize,
    chunks_dropped: usize,
}

impl WorkerStats {
    fn merge(&mut self, other: WorkerStats) {
        self.rows_written += other.rows_written;
        self.rows_failed += other.rows_failed;
        self.chunks_dropped += other.chunks_dropped;
    }
}

pub async fn run(args: RunArgs) -> Result<(), ServerError> {
    tracing::info!("cassandra-json-sink starting");

    // --- Load config ---
    let config = ServerConfig::load(&args.config)?;
    tracing::info!(
        config = %args.config,
        keyspace = %config.output.keyspace,
        table = %config.output.table,
        dry_run = args.dry_run,
        "loaded config"
    );

    let formatter: Arc<dyn RecordFormatter> = Arc::new(JsonFormatter::new());

    // --- Open session ---
    let mut dry_store: Option<Arc<MemoryStore>> = None;
    let sink = if args.dry_run {
        let mut store = MemoryStore::new();
        if let Some(keyspace) = CassandraJsonSink::session_keyspace(&config.output) {
            store = store.with_default_keyspace(keyspace);
        }
        let store = Arc::new(store.with_tables(&config.dry_run.tables)?);
        dry_store = Some(store.clone());
        CassandraJsonSink::start(config.output.clone(), formatter, |_| async move {
            Ok::<Arc<dyn StoreSession>, StoreError>(store)
        })
        .await?
    } else {
        let cluster = config.require_cluster()?;
        CassandraJsonSink::start(config.output.clone(), formatter, |keyspace| async move {
            storage_cassandra::connect(cluster, keyspace.as_deref()).await
        })
        .await?
    };
    let sink = Arc::new(sink);
    let ledger = Arc::new(ChunkLedger::new());

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down...");
            signal_token.cancel();
        }
    });

    // --- Workers ---
    let buffer = config.buffer.clone();
    let retry = RetryPolicy {
        max_times: buffer.retry_max_times,
        wait: Duration::from_millis(buffer.retry_wait_ms),
    };
    let (tx, rx) = mpsc::channel::<Chunk>(buffer.workers * 2);
    let rx: SharedReceiver = Arc::new(Mutex::new(rx));

    let mut workers = JoinSet::new();
    for worker in 0..buffer.workers {
        workers.spawn(worker_loop(
            worker,
            sink.clone(),
            ledger.clone(),
            rx.clone(),
            retry,
            token.clone(),
        ));
    }
    tracing::info!(workers = buffer.workers, multi_workers = sink.multi_workers_ready(), "server ready");

    // --- Intake until EOF or Ctrl+C ---
    let intake_result = intake(args.input.as_deref(), &buffer, tx, &token).await;

    // --- Drain ---
    let mut totals = WorkerStats::default();
    let deadline = tokio::time::sleep(Duration::from_secs(buffer.drain_timeout_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                Some(Ok(stats)) => totals.merge(stats),
                Some(Err(e)) => tracing::error!(error = %e, "worker task failed"),
                None => break,
            },
            _ = &mut deadline => {
                tracing::warn!(remaining = workers.len(), "drain timeout, aborting workers");
                token.cancel();
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                break;
            }
        }
    }

    // Session is closed last, after every worker is gone.
    sink.stop().await;

    if let Some(store) = &dry_store {
        for table in &config.dry_run.tables {
            let rows = store.rows(&table.keyspace, &table.name).await;
            tracing::info!(keyspace = %table.keyspace, table = %table.name, rows = rows.len(), "dry-run table");
        }
        tracing::info!(statements = store.executed(), "dry-run statements executed");
    }

    let ledger_stats = ledger.stats();
    let intake_stats = intake_result?;
    tracing::info!(
        events = intake_stats.events,
        skipped = intake_stats.skipped,
        chunks = intake_stats.chunks,
        acknowledged = ledger_stats.acknowledged,
        rejected = ledger_stats.rejected,
        rows_written = totals.rows_written,
        rows_failed = totals.rows_failed,
        chunks_dropped = totals.chunks_dropped,
        "shutdown complete"
    );
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  Intake: NDJSON → chunks → channel
// ═══════════════════════════════════════════════════════════════

async fn open_input(input: Option<&str>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>, ServerError> {
    match input {
        None | Some("-") => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| ServerError::config("input", format!("'{path}': {e}")))?;
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

async fn intake(
    input: Option<&str>,
    buffer: &BufferConfig,
    tx: mpsc::Sender<Chunk>,
    token: &CancellationToken,
) -> Result<IntakeStats, ServerError> {
    let mut stats = IntakeStats::default();
    let mut chunker = Chunker::new(buffer);
    let mut lines = open_input(input).await?.lines();
    let mut line_no = 0u64;

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => {
                tracing::info!(pending = chunker.pending_records(), "intake stopped");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match Event::parse(&line) {
            Ok(event) => {
                let time = event.time;
                let Some(record) = event.into_record() else {
                    stats.skipped += 1;
                    tracing::warn!(line = line_no, time = ?time, "event time out of range, skipped");
                    continue;
                };
                stats.events += 1;
                if let Some(chunk) = chunker.push(record) {
                    if !send(&tx, chunk, &mut stats).await {
                        return Ok(stats);
                    }
                }
            }
            Err(e) => {
                stats.skipped += 1;
                tracing::warn!(line = line_no, error = %e, "malformed event skipped");
            }
        }
    }

    for chunk in chunker.flush() {
        if !send(&tx, chunk, &mut stats).await {
            break;
        }
    }
    Ok(stats)
}

async fn send(tx: &mpsc::Sender<Chunk>, chunk: Chunk, stats: &mut IntakeStats) -> bool {
    let chunk_id = chunk.id().clone();
    let records = chunk.len();
    if tx.send(chunk).await.is_err() {
        tracing::error!(chunk_id = %chunk_id, "no worker left to take the chunk");
        return false;
    }
    stats.chunks += 1;
    tracing::debug!(chunk_id = %chunk_id, records, "chunk queued");
    true
}

// ═══════════════════════════════════════════════════════════════
//  Worker: chunk → try_write → redelivery
// ═══════════════════════════════════════════════════════════════

async fn worker_loop(
    worker: usize,
    sink: Arc<CassandraJsonSink>,
    ledger: Arc<ChunkLedger>,
    rx: SharedReceiver,
    retry: RetryPolicy,
    token: CancellationToken,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    loop {
        let next = rx.lock().await.recv().await;
        let Some(chunk) = next else { break };
        deliver(&sink, &ledger, &chunk, retry, &token, &mut stats).await;
    }
    tracing::debug!(worker, "worker finished");
    stats
}

async fn deliver(
    sink: &CassandraJsonSink,
    ledger: &ChunkLedger,
    chunk: &Chunk,
    retry: RetryPolicy,
    token: &CancellationToken,
    stats: &mut WorkerStats,
) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Ok(summary) = sink.try_write(chunk, ledger).await {
            stats.rows_written += summary.succeeded;
            stats.rows_failed += summary.failed();
        }

        if ledger.take(chunk.id()) == Some(Completion::Acknowledged) {
            return;
        }
        if attempt > retry.max_times {
            tracing::error!(chunk_id = %chunk.id(), attempts = attempt, "retry limit reached, chunk dropped");
            stats.chunks_dropped += 1;
            return;
        }

        tokio::select! {
            _ = token.cancelled() => {
                tracing::warn!(chunk_id = %chunk.id(), attempts = attempt, "shutdown during retry wait, chunk dropped");
                stats.chunks_dropped += 1;
                return;
            }
            _ = tokio::time::sleep(retry.wait) => {}
        }
        tracing::info!(chunk_id = %chunk.id(), attempt = attempt + 1, "redelivering chunk");
    }
}
