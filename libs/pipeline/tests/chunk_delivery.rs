use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::Notify;

use codec_json::JsonFormatter;
use pipeline::{CassandraJsonSink, ChunkVerdict, OutputConfig, SessionHandle, SinkError, TimeType};
use sink_api::{
    Chunk, ChunkCompletion, ChunkId, ChunkMetadata, ErrorKind, EventTime, Record, RecordFormatter,
    Statement, StoreError, StoreSession,
};
use storage_memory::{MemoryStore, TableSchema};

// ═══════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct Completions(Mutex<Vec<(&'static str, ChunkId)>>);

impl Completions {
    fn calls(&self) -> Vec<(&'static str, ChunkId)> {
        self.0.lock().unwrap().clone()
    }
}

impl ChunkCompletion for Completions {
    fn acknowledge(&self, chunk_id: &ChunkId) {
        self.0.lock().unwrap().push(("ack", chunk_id.clone()));
    }

    fn reject(&self, chunk_id: &ChunkId) {
        self.0.lock().unwrap().push(("reject", chunk_id.clone()));
    }
}

/// Records every statement; fails those containing `"bad"`.
#[derive(Default)]
struct Recording {
    statements: Mutex<Vec<Statement>>,
}

impl StoreSession for Recording {
    fn execute(&self, statement: &Statement)
        -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>
    {
        let statement = statement.clone();
        Box::pin(async move {
            let fail = statement.cql.contains("bad");
            self.statements.lock().unwrap().push(statement);
            tokio::task::yield_now().await;
            if fail { Err(StoreError::format_err("invalid row")) } else { Ok(()) }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Every write waits until the test opens its gate. Rows are identified by
/// `"row":<n>` in the statement; rows listed in `failing` resolve to an error,
/// and after `close` every released row fails like a dropped connection.
struct Gated {
    gates: Vec<Arc<Notify>>,
    failing: Vec<usize>,
    started: AtomicUsize,
    closed: AtomicBool,
}

impl Gated {
    fn new(rows: usize, failing: &[usize]) -> Self {
        Self {
            gates: (0..rows).map(|_| Arc::new(Notify::new())).collect(),
            failing: failing.to_vec(),
            started: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn open(&self, row: usize) {
        self.gates[row].notify_one();
    }

    async fn wait_started(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }
}

fn row_of(cql: &str) -> usize {
    let start = cql.find("\"row\":").unwrap() + "\"row\":".len();
    cql[start..].chars().take_while(char::is_ascii_digit).collect::<String>().parse().unwrap()
}

impl StoreSession for Gated {
    fn execute(&self, statement: &Statement)
        -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>
    {
        let row = row_of(&statement.cql);
        let gate = self.gates[row].clone();
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            if self.closed.load(Ordering::SeqCst) {
                Err(StoreError::io("session closed"))
            } else if self.failing.contains(&row) {
                Err(StoreError::io("write timeout"))
            } else {
                Ok(())
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn record(value: Value) -> Record {
    Record::new("test.tag", EventTime::new(1_525_788_605, 0), fields(value))
}

fn chunk(id: &str, records: Vec<Record>) -> Chunk {
    Chunk::new(ChunkId::new(id), ChunkMetadata::default(), records)
}

fn sink(session: Arc<dyn StoreSession>, output: OutputConfig) -> CassandraJsonSink {
    let keyspace = CassandraJsonSink::session_keyspace(&output);
    CassandraJsonSink::new(output, Arc::new(JsonFormatter::new()), SessionHandle::new(session, keyspace))
        .unwrap()
}

fn output(skip_invalid_rows: bool) -> OutputConfig {
    let mut output = OutputConfig::new("test_keyspace", "test_table");
    output.skip_invalid_rows = skip_invalid_rows;
    output
}

async fn test_table() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    let schema = TableSchema::new(
        [
            ("id", "bigint"),
            ("col1", "text"),
            ("col2", "timestamp"),
            ("col3", "boolean"),
            ("col4", "double"),
            ("col5", "list<int>"),
            ("col6", "set<text>"),
            ("col7", "map<text, text>"),
        ],
        &["id"],
    )
    .unwrap();
    store.create_table("test_keyspace", "test_table", schema).await;
    Arc::new(store)
}

fn data(id: Value) -> Value {
    json!({
        "id": id,
        "col1": "textdata",
        "col2": "2018-05-08T14:10:05+09:00",
        "col3": true,
        "col4": 1.23,
        "col5": [1, 2, 3],
        "col6": ["one", "two", "three", "two"],
        "col7": {"key1": "val1", "key2": "it's"},
    })
}

fn three_records() -> Vec<Record> {
    vec![record(data(json!(1))), record(data(json!(2))), record(data(json!("invalid")))]
}

/// Captures WARN and above as plain text lines.
#[derive(Clone, Default)]
struct Logs(Arc<Mutex<Vec<u8>>>);

impl io::Write for Logs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Logs {
    type Writer = Logs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Logs {
    fn capture(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn row_failure_lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| line.contains("failed to insert"))
            .map(str::to_string)
            .collect()
    }

    /// Levels of the "failed to insert" lines.
    fn row_failure_levels(&self) -> Vec<String> {
        self.row_failure_lines()
            .iter()
            .filter_map(|line| line.split_whitespace().next().map(str::to_string))
            .collect()
    }

    /// `kind` field of the "failed to insert" lines.
    fn row_failure_kinds(&self) -> Vec<String> {
        self.row_failure_lines()
            .iter()
            .filter_map(|line| {
                line.split_whitespace()
                    .find_map(|field| field.strip_prefix("kind="))
                    .map(str::to_string)
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Verdict
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn empty_chunk_is_acknowledged_without_writes() {
    let session = Arc::new(Recording::default());
    let sink = sink(session.clone(), output(false));
    let completions = Completions::default();

    let summary = sink.try_write(&chunk("empty", Vec::new()), &completions).await.unwrap();

    assert_eq!(summary.total, 0);
    assert_eq!(summary.verdict, ChunkVerdict::Deliver);
    assert_eq!(completions.calls(), vec![("ack", ChunkId::new("empty"))]);
    assert!(session.statements.lock().unwrap().is_empty());
}

#[tokio::test]
async fn tolerant_policy_acknowledges_whatever_fails() {
    for failures in 0..=4 {
        let session = Arc::new(Recording::default());
        let sink = sink(session.clone(), output(true));
        let completions = Completions::default();
        let records = (0..4)
            .map(|i| record(json!({"id": i, "v": if i < failures { "bad" } else { "good" }})))
            .collect();

        let summary = sink.try_write(&chunk("c", records), &completions).await.unwrap();

        assert_eq!(summary.failed(), failures);
        assert_eq!(summary.succeeded, 4 - failures);
        assert_eq!(completions.calls(), vec![("ack", ChunkId::new("c"))]);
        assert_eq!(session.statements.lock().unwrap().len(), 4);
    }
}

#[tokio::test]
async fn strict_policy_acknowledges_only_clean_chunks() {
    for failures in 0..=4 {
        let session = Arc::new(Recording::default());
        let sink = sink(session, output(false));
        let completions = Completions::default();
        let records = (0..4)
            .map(|i| record(json!({"id": i, "v": if i >= 4 - failures { "bad" } else { "good" }})))
            .collect();

        let summary = sink.try_write(&chunk("c", records), &completions).await.unwrap();

        let expected = if failures == 0 { "ack" } else { "reject" };
        assert_eq!(completions.calls(), vec![(expected, ChunkId::new("c"))], "failures = {failures}");
        assert_eq!(summary.failed(), failures);
        // rows that did succeed are not undone
        assert_eq!(summary.succeeded, 4 - failures);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn verdict_waits_for_every_write() {
    let orderings: [&[usize]; 3] = [&[0, 1, 2, 3], &[3, 2, 1, 0], &[2, 0, 3, 1]];
    for (skip_invalid_rows, failing) in [(false, vec![0]), (false, vec![]), (true, vec![1, 2])] {
        for order in orderings {
            let session = Arc::new(Gated::new(4, &failing));
            let sink = Arc::new(sink(session.clone(), output(skip_invalid_rows)));
            let completions = Arc::new(Completions::default());
            let records = (0..4).map(|i| record(json!({"row": i}))).collect();
            let chunk = chunk("gated", records);

            let write = tokio::spawn({
                let sink = sink.clone();
                let completions = completions.clone();
                async move { sink.try_write(&chunk, completions.as_ref()).await }
            });

            session.wait_started(4).await;
            let (last, first) = order.split_last().unwrap();
            for row in first {
                session.open(*row);
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert!(completions.calls().is_empty(), "verdict before row {last} resolved");
            }
            session.open(*last);

            let summary = write.await.unwrap().unwrap();
            assert_eq!(summary.failed(), failing.len());
            let expected = if skip_invalid_rows || failing.is_empty() { "ack" } else { "reject" };
            assert_eq!(completions.calls(), vec![(expected, ChunkId::new("gated"))]);
        }
    }
}

#[tokio::test]
async fn statement_carries_options_in_fixed_order() {
    let session = Arc::new(Recording::default());
    let mut out = output(true);
    out.if_not_exists = true;
    out.ttl = Some(30);
    out.consistency = sink_api::Consistency::Quorum;
    let sink = sink(session.clone(), out);

    sink.try_write(&chunk("c", vec![record(json!({"id": 1}))]), &Completions::default())
        .await
        .unwrap();

    let statements = session.statements.lock().unwrap();
    assert_eq!(
        statements[0].cql,
        r#"INSERT INTO test_keyspace.test_table JSON '{"id":1}' IF NOT EXISTS USING TTL 30"#
    );
    assert_eq!(statements[0].consistency, sink_api::Consistency::Quorum);
}

#[tokio::test]
async fn formatter_failure_is_a_row_failure() {
    struct Picky;
    impl RecordFormatter for Picky {
        fn format(&self, record: &Record) -> Result<String, StoreError> {
            if record.fields.contains_key("poison") {
                return Err(StoreError::format_err("cannot format"));
            }
            JsonFormatter.format(record)
        }
    }

    let session = Arc::new(Recording::default());
    let handle = SessionHandle::new(session.clone(), None);
    let sink = CassandraJsonSink::new(output(true), Arc::new(Picky), handle).unwrap();
    let completions = Completions::default();
    let records = vec![record(json!({"id": 1})), record(json!({"id": 2, "poison": true}))];

    let summary = sink.try_write(&chunk("c", records), &completions).await.unwrap();

    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].index, 1);
    assert!(summary.failures[0].payload.contains("poison"));
    assert_eq!(session.statements.lock().unwrap().len(), 1);
    assert_eq!(completions.calls(), vec![("ack", ChunkId::new("c"))]);
}

#[tokio::test]
async fn event_time_beyond_millisecond_range_is_a_row_failure() {
    assert_eq!(EventTime::from_secs_f64(1e16), None);

    for skip_invalid_rows in [true, false] {
        let session = Arc::new(Recording::default());
        let mut out = output(skip_invalid_rows);
        out.inject.time_key = Some("ts".into());
        out.inject.time_type = TimeType::UnixtimeMillis;
        let sink = sink(session.clone(), out);
        let completions = Completions::default();
        let far = Record::new("test.tag", EventTime::new(10_000_000_000_000_000, 0), fields(json!({"id": 2})));
        let records = vec![record(json!({"id": 1})), far];

        let summary = sink.try_write(&chunk("far", records), &completions).await.unwrap();

        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.failures[0].index, 1);
        assert_eq!(summary.failures[0].error.kind(), ErrorKind::Format);
        let expected = if skip_invalid_rows { "ack" } else { "reject" };
        assert_eq!(completions.calls(), vec![(expected, ChunkId::new("far"))]);

        let statements = session.statements.lock().unwrap();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].cql.contains(r#""ts":1525788605000"#));
    }
}

// ═══════════════════════════════════════════════════════════════
//  Chunk-level failures
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn closed_session_rejects_chunk_without_writes() {
    let session = Arc::new(Recording::default());
    let sink = sink(session.clone(), output(true));
    sink.stop().await;
    let completions = Completions::default();

    let err = sink
        .try_write(&chunk("late", vec![record(json!({"id": 1}))]), &completions)
        .await
        .unwrap_err();

    assert!(matches!(err, SinkError::SessionUnavailable(_)));
    assert_eq!(completions.calls(), vec![("reject", ChunkId::new("late"))]);
    assert!(session.statements.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_closed_mid_flight_rejects_tolerant_chunk() {
    let session = Arc::new(Gated::new(3, &[]));
    let sink = Arc::new(sink(session.clone(), output(true)));
    let completions = Arc::new(Completions::default());
    let chunk = chunk("mid", (0..3).map(|i| record(json!({"row": i}))).collect());

    let write = tokio::spawn({
        let sink = sink.clone();
        let completions = completions.clone();
        async move { sink.try_write(&chunk, completions.as_ref()).await }
    });

    session.wait_started(3).await;
    session.open(0);
    tokio::time::sleep(Duration::from_millis(2)).await;
    sink.stop().await;
    session.open(1);
    session.open(2);

    let err = write.await.unwrap().unwrap_err();
    assert!(matches!(err, SinkError::SessionUnavailable(_)));
    assert_eq!(completions.calls(), vec![("reject", ChunkId::new("mid"))]);
}

#[tokio::test]
async fn session_closed_after_clean_writes_still_acknowledges() {
    let session = Arc::new(Recording::default());
    let sink = sink(session.clone(), output(true));
    let completions = Completions::default();

    sink.try_write(&chunk("done", vec![record(json!({"id": 1}))]), &completions)
        .await
        .unwrap();
    sink.stop().await;

    assert_eq!(completions.calls(), vec![("ack", ChunkId::new("done"))]);
}

#[tokio::test]
async fn unresolved_placeholder_rejects_chunk() {
    let session = Arc::new(Recording::default());
    let sink = sink(session.clone(), OutputConfig::new("test_keyspace", "events_${region}"));
    let completions = Completions::default();

    let err = sink
        .try_write(&chunk("c", vec![record(json!({"id": 1}))]), &completions)
        .await
        .unwrap_err();

    assert!(matches!(err, SinkError::Placeholder { .. }));
    assert_eq!(completions.calls(), vec![("reject", ChunkId::new("c"))]);
    assert!(session.statements.lock().unwrap().is_empty());
}

#[tokio::test]
async fn templated_target_follows_chunk_metadata() {
    let session = Arc::new(Recording::default());
    let sink = sink(session.clone(), OutputConfig::new("logs_${tag[0]}", "events_%Y%m_${region}"));
    let metadata = ChunkMetadata {
        tag: Some("web.access".into()),
        timekey: Some(1_525_788_000),
        variables: BTreeMap::from([("region".to_string(), "eu".to_string())]),
    };
    let chunk = Chunk::new(ChunkId::new("c"), metadata, vec![record(json!({"id": 1}))]);

    sink.try_write(&chunk, &Completions::default()).await.unwrap();

    let statements = session.statements.lock().unwrap();
    assert!(statements[0].cql.starts_with("INSERT INTO logs_web.events_201805_eu JSON "));
}

// ═══════════════════════════════════════════════════════════════
//  End-to-end against the in-memory store
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn invalid_row_is_skipped_under_tolerant_policy() {
    let logs = Logs::default();
    let _guard = logs.capture();
    let store = test_table().await;
    let sink = sink(store.clone(), output(true));
    let completions = Completions::default();

    let summary = sink.try_write(&chunk("c", three_records()), &completions).await.unwrap();

    assert_eq!(completions.calls(), vec![("ack", ChunkId::new("c"))]);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.failures[0].index, 2);
    assert!(summary.failures[0].payload.contains("invalid"));
    assert_eq!(logs.row_failure_levels(), vec!["WARN"]);
    assert_eq!(logs.row_failure_kinds(), vec!["format"]);

    let rows = store.rows("test_keyspace", "test_table").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!(1));
    assert_eq!(rows[0]["col2"], json!(1_525_756_205_000_i64));
    assert_eq!(rows[0]["col6"], json!(["one", "three", "two"]));
    assert_eq!(rows[0]["col7"], json!({"key1": "val1", "key2": "it's"}));
    assert_eq!(rows[1]["id"], json!(2));
}

#[tokio::test]
async fn strict_policy_rejects_and_redelivery_adds_no_duplicates() {
    let logs = Logs::default();
    let _guard = logs.capture();
    let store = test_table().await;
    let sink = sink(store.clone(), output(false));
    let completions = Completions::default();
    let chunk = chunk("c", three_records());

    let first = sink.try_write(&chunk, &completions).await.unwrap();
    assert_eq!(first.verdict, ChunkVerdict::Redeliver);
    assert_eq!(logs.row_failure_levels(), vec!["ERROR"]);
    // the two valid rows stay written: reject only asks for redelivery
    let after_first = store.rows("test_keyspace", "test_table").await;
    assert_eq!(after_first.len(), 2);

    // pipeline redelivers the same chunk
    let second = sink.try_write(&chunk, &completions).await.unwrap();
    assert_eq!(second.verdict, ChunkVerdict::Redeliver);

    assert_eq!(
        completions.calls(),
        vec![("reject", ChunkId::new("c")), ("reject", ChunkId::new("c"))]
    );
    assert_eq!(store.rows("test_keyspace", "test_table").await, after_first);
    assert_eq!(store.executed(), 6);
}

#[tokio::test]
async fn conditional_insert_keeps_rows_on_redelivery() {
    let store = test_table().await;
    let mut out = output(true);
    out.if_not_exists = true;
    let sink = sink(store.clone(), out);
    let completions = Completions::default();

    let original = record(json!({"id": 1, "col1": "first"}));
    sink.try_write(&chunk("a", vec![original]), &completions).await.unwrap();

    let changed = record(json!({"id": 1, "col1": "second"}));
    let summary = sink.try_write(&chunk("b", vec![changed]), &completions).await.unwrap();

    assert_eq!(summary.failed(), 0);
    let rows = store.rows("test_keyspace", "test_table").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["col1"], json!("first"));
}

#[tokio::test]
async fn plain_insert_redelivery_overwrites_in_place() {
    let store = test_table().await;
    let sink = sink(store.clone(), output(true));
    let completions = Completions::default();
    let chunk = chunk("c", vec![record(data(json!(1))), record(data(json!(2)))]);

    sink.try_write(&chunk, &completions).await.unwrap();
    let once = store.rows("test_keyspace", "test_table").await;
    sink.try_write(&chunk, &completions).await.unwrap();

    assert_eq!(store.rows("test_keyspace", "test_table").await, once);
    assert_eq!(once.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunks_from_several_workers_are_independent() {
    let store = test_table().await;
    let sink = Arc::new(sink(store.clone(), output(false)));
    assert!(sink.multi_workers_ready());
    let completions = Arc::new(Completions::default());

    let mut workers = tokio::task::JoinSet::new();
    for w in 0..8i64 {
        let sink = sink.clone();
        let completions = completions.clone();
        workers.spawn(async move {
            let records = (0..10).map(|i| record(json!({"id": w * 100 + i, "col1": "x"}))).collect();
            let id = format!("chunk-{w}");
            sink.try_write(&chunk(&id, records), completions.as_ref()).await
        });
    }
    while let Some(joined) = workers.join_next().await {
        assert_eq!(joined.unwrap().unwrap().verdict, ChunkVerdict::Deliver);
    }

    let calls = completions.calls();
    assert_eq!(calls.len(), 8);
    assert!(calls.iter().all(|(action, _)| *action == "ack"));
    assert_eq!(store.rows("test_keyspace", "test_table").await.len(), 80);
}
