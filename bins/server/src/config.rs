use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

pub use pipeline::OutputConfig;
pub use storage_cassandra::CassandraConfig;
pub use storage_memory::TableConfig;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "cassandra-json-sink", about = "Запись событий в Cassandra через INSERT ... JSON")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Прочитать NDJSON события и записать их chunk'ами
    Run(RunArgs),
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "config.toml", env = "CONFIG_PATH")]
    pub config: String,

    /// NDJSON файл с событиями; `-` или отсутствие флага: stdin
    #[arg(long, env = "INPUT_PATH")]
    pub input: Option<String>,

    /// Писать в in-memory store вместо кластера
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Обязателен, кроме `--dry-run`.
    #[serde(default)]
    pub cluster: Option<CassandraConfig>,
    pub output: OutputConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
}

/// Группировка событий в chunk'и и повторная доставка.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// `tag`, `time` или имена полей записи.
    #[serde(default)]
    pub chunk_keys: Vec<String>,
    #[serde(default = "default_chunk_limit_records")]
    pub chunk_limit_records: usize,
    /// Ширина time-bucket'а в секундах (для chunk key `time`).
    #[serde(default = "default_timekey")]
    pub timekey: i64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_max_times")]
    pub retry_max_times: u32,
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_chunk_limit_records() -> usize {
    1000
}
fn default_timekey() -> i64 {
    3600
}
fn default_workers() -> usize {
    1
}
fn default_retry_max_times() -> u32 {
    5
}
fn default_retry_wait_ms() -> u64 {
    1000
}
fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_keys: Vec::new(),
            chunk_limit_records: default_chunk_limit_records(),
            timekey: default_timekey(),
            workers: default_workers(),
            retry_max_times: default_retry_max_times(),
            retry_wait_ms: default_retry_wait_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.chunk_limit_records == 0 {
            return Err(ServerError::config("buffer", "chunk_limit_records must be > 0"));
        }
        if self.workers == 0 {
            return Err(ServerError::config("buffer", "workers must be > 0"));
        }
        if self.timekey <= 0 && self.chunk_keys.iter().any(|k| k == "time") {
            return Err(ServerError::config("buffer", "timekey must be > 0 when chunking by time"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DryRunConfig {
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::config("read", format!("'{path}': {e}")))?;
        Self::parse(&content).map_err(|e| match e {
            ServerError::Config { context, detail } => {
                ServerError::Config { context, detail: format!("'{path}': {detail}") }
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ServerError> {
        let config: Self = toml::from_str(content).map_err(|e| ServerError::config("parse", e.to_string()))?;
        config.buffer.validate()?;
        config.output.validate()?;
        if let Some(cluster) = &config.cluster {
            cluster.validate().map_err(|e| ServerError::config("cluster", e.message()))?;
        }
        config.check_chunk_keys()?;
        Ok(config)
    }

    /// Cluster section for a live run; there is no fallback host.
    pub fn require_cluster(&self) -> Result<&CassandraConfig, ServerError> {
        self.cluster
            .as_ref()
            .ok_or_else(|| ServerError::config("cluster", "[cluster] with hosts is required unless --dry-run"))
    }

    /// Every placeholder in the target templates must be backed by a chunk key,
    /// otherwise each chunk is rejected at write time.
    fn check_chunk_keys(&self) -> Result<(), ServerError> {
        let keys = &self.buffer.chunk_keys;
        for (field, template) in [("keyspace", &self.output.keyspace), ("table", &self.output.table)] {
            for needed in pipeline::placeholder::required_chunk_keys(template) {
                if !keys.iter().any(|k| k == needed) {
                    return Err(ServerError::config(
                        "output",
                        format!("{field} '{template}' needs '{needed}' in buffer.chunk_keys"),
                    ));
                }
            }
        }
        Ok(())
    }
}
