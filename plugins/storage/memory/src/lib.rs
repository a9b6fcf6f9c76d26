mod parse;
mod schema;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use sink_api::{Statement, StoreError, StoreSession};

pub use parse::{InsertJson, parse_insert};
pub use schema::{ColumnType, TableSchema};

// ═══════════════════════════════════════════════════════════════
//  MemoryStoreConfig
// ═══════════════════════════════════════════════════════════════

/// Описание таблицы для in-memory store (`[[dry_run.tables]]`).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TableConfig {
    pub keyspace: String,
    pub name: String,
    /// column → CQL type, e.g. `id = "bigint"`, `tags = "set<text>"`.
    pub columns: BTreeMap<String, String>,
    pub primary_key: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStore
// ═══════════════════════════════════════════════════════════════

struct StoredRow {
    values: BTreeMap<String, Value>,
    expires_at: Option<Instant>,
}

impl StoredRow {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

struct Table {
    schema: TableSchema,
    rows: BTreeMap<Vec<String>, StoredRow>,
}

/// In-process wide-column store speaking the `INSERT ... JSON` dialect.
///
/// Rows are keyed by primary key, so re-inserting a row overwrites it;
/// `IF NOT EXISTS` leaves a live row untouched; `USING TTL` expires rows.
/// Для тестов и `--dry-run`, без сети.
pub struct MemoryStore {
    tables: RwLock<HashMap<(String, String), Table>>,
    default_keyspace: Option<String>,
    executed: AtomicUsize,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            default_keyspace: None,
            executed: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Keyspace used for statements that name a bare table.
    pub fn with_default_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.default_keyspace = Some(keyspace.into());
        self
    }

    pub fn with_tables(mut self, tables: &[TableConfig]) -> Result<Self, StoreError> {
        let map = self.tables.get_mut();
        for t in tables {
            let pk: Vec<&str> = t.primary_key.iter().map(String::as_str).collect();
            let schema = TableSchema::new(
                t.columns.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                &pk,
            )
            .map_err(|e| StoreError::config(format!("table {}.{}: {e}", t.keyspace, t.name)))?;
            map.insert(
                (t.keyspace.clone(), t.name.clone()),
                Table { schema, rows: BTreeMap::new() },
            );
        }
        Ok(self)
    }

    pub async fn create_table(&self, keyspace: &str, table: &str, schema: TableSchema) {
        let mut tables = self.tables.write().await;
        tables.insert(
            (keyspace.to_string(), table.to_string()),
            Table { schema, rows: BTreeMap::new() },
        );
    }

    /// Live rows of a table ordered by primary key. Unknown table → empty.
    pub async fn rows(&self, keyspace: &str, table: &str) -> Vec<BTreeMap<String, Value>> {
        let now = Instant::now();
        let tables = self.tables.read().await;
        tables
            .get(&(keyspace.to_string(), table.to_string()))
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| r.is_live(now))
                    .map(|r| r.values.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Statements received, including rejected ones.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    async fn apply(&self, insert: InsertJson) -> Result<(), StoreError> {
        let keyspace = insert
            .keyspace
            .or_else(|| self.default_keyspace.clone())
            .ok_or_else(|| StoreError::format_err("No keyspace has been specified"))?;

        let doc: Value = serde_json::from_str(&insert.json)
            .map_err(|e| StoreError::format_err(format!("Could not decode JSON string: {e}")))?;

        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(&(keyspace.clone(), insert.table.clone()))
            .ok_or_else(|| StoreError::new(format!("unconfigured table {keyspace}.{}", insert.table)))?;

        let values = table.schema.row_from_json(&doc)?;
        let key = table.schema.key_of(&values);
        let now = Instant::now();

        if insert.if_not_exists && table.rows.get(&key).is_some_and(|r| r.is_live(now)) {
            tracing::trace!(keyspace = %keyspace, table = %insert.table, ?key, "row exists, not applied");
            return Ok(());
        }

        let expires_at = insert
            .ttl
            .filter(|ttl| *ttl > 0)
            .map(|ttl| now + Duration::from_secs(ttl as u64));
        table.rows.insert(key, StoredRow { values, expires_at });
        Ok(())
    }
}

impl StoreSession for MemoryStore {
    fn execute(&self, statement: &Statement)
        -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>
    {
        let cql = statement.cql.clone();
        Box::pin(async move {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::Acquire) {
                return Err(StoreError::io("session closed"));
            }
            let insert = parse_insert(&cql)?;
            self.apply(insert).await
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }
}
