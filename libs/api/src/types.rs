use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  EventTime
// ════════════════════════════════════════════════════════════════

const MAX_SECS: i64 = i64::MAX / 1000;

/// Время события: секунды + наносекунды от Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventTime {
    pub secs: i64,
    pub nanos: u32,
}

impl EventTime {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos: nanos % 1_000_000_000 }
    }

    pub fn from_millis(ms: i64) -> Self {
        Self {
            secs: ms.div_euclid(1000),
            nanos: (ms.rem_euclid(1000) as u32) * 1_000_000,
        }
    }

    /// Fractional seconds, e.g. `1525788605.25`.
    /// `None` for non-finite values and for times whose milliseconds don't fit in `i64`.
    pub fn from_secs_f64(secs: f64) -> Option<Self> {
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        if whole.abs() >= MAX_SECS as f64 {
            return None;
        }
        let nanos = ((secs - whole) * 1e9).round() as u32;
        Some(Self::new(whole as i64, nanos.min(999_999_999)))
    }

    /// Milliseconds since epoch; `None` on overflow.
    pub fn as_millis(&self) -> Option<i64> {
        self.secs
            .checked_mul(1000)?
            .checked_add(i64::from(self.nanos / 1_000_000))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + f64::from(self.nanos) / 1e9
    }
}

// ════════════════════════════════════════════════════════════════
//  Record / Chunk
// ════════════════════════════════════════════════════════════════

/// Одно событие из upstream pipeline: tag + время + произвольный набор полей.
/// Каждая запись становится одной строкой в таблице.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub tag: String,
    pub time: EventTime,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(
        tag: impl Into<String>,
        time: EventTime,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self { tag: tag.into(), time, fields }
    }
}

/// Уникальный идентификатор chunk'а, используется для acknowledge/reject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Метаданные chunk'а: значения chunk keys, по которым резолвятся
/// placeholder'ы в именах keyspace/table.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkMetadata {
    /// Tag, если `tag` входит в chunk keys.
    pub tag: Option<String>,
    /// Начало time-bucket'а (Unix seconds), если `time` входит в chunk keys.
    pub timekey: Option<i64>,
    /// Значения полей записи, выбранных как chunk keys.
    pub variables: BTreeMap<String, String>,
}

/// Запечатанный batch записей.
///
/// Создаётся upstream pipeline'ом и после этого не меняется: полей
/// с `&mut` доступом нет, записи отдаются только как slice.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    metadata: ChunkMetadata,
    records: Vec<Record>,
}

impl Chunk {
    pub fn new(id: ChunkId, metadata: ChunkMetadata, records: Vec<Record>) -> Self {
        Self { id, metadata, records }
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn metadata(&self) -> &ChunkMetadata {
        &self.metadata
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ════════════════════════════════════════════════════════════════
//  Consistency
// ════════════════════════════════════════════════════════════════

/// Replica-acknowledgment level required for a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Any,
    #[default]
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

impl Consistency {
    pub const ALL: [Consistency; 11] = [
        Consistency::Any,
        Consistency::One,
        Consistency::Two,
        Consistency::Three,
        Consistency::Quorum,
        Consistency::All,
        Consistency::LocalQuorum,
        Consistency::EachQuorum,
        Consistency::Serial,
        Consistency::LocalSerial,
        Consistency::LocalOne,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Any => "any",
            Consistency::One => "one",
            Consistency::Two => "two",
            Consistency::Three => "three",
            Consistency::Quorum => "quorum",
            Consistency::All => "all",
            Consistency::LocalQuorum => "local_quorum",
            Consistency::EachQuorum => "each_quorum",
            Consistency::Serial => "serial",
            Consistency::LocalSerial => "local_serial",
            Consistency::LocalOne => "local_one",
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl std::str::FromStr for Consistency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Consistency::ALL
            .into_iter()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| {
                let names: Vec<&str> = Consistency::ALL.iter().map(|c| c.as_str()).collect();
                format!("unknown consistency '{s}', expected one of: {}", names.join(", "))
            })
    }
}

// ════════════════════════════════════════════════════════════════
//  Statement
// ════════════════════════════════════════════════════════════════

/// Готовый CQL statement + consistency, с которым его нужно выполнить.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub cql: String,
    pub consistency: Consistency,
}

impl Statement {
    pub fn new(cql: impl Into<String>, consistency: Consistency) -> Self {
        Self { cql: cql.into(), consistency }
    }
}
