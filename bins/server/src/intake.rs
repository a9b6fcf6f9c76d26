use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use sink_api::{Chunk, ChunkId, ChunkMetadata, EventTime, Record, now_ms};

use crate::config::BufferConfig;

// ═══════════════════════════════════════════════════════════════
//  Event line
// ═══════════════════════════════════════════════════════════════

/// One NDJSON input line: `{"tag": "...", "time": 1525788605.25, "record": {...}}`.
#[derive(Debug, Deserialize)]
pub struct Event {
    pub tag: String,
    /// Unix seconds, fractional allowed. Absent → current time.
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default)]
    pub record: Map<String, Value>,
}

impl Event {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// `None` when `time` is outside the range an event time can carry.
    pub fn into_record(self) -> Option<Record> {
        let time = match self.time {
            Some(secs) => EventTime::from_secs_f64(secs)?,
            None => EventTime::from_millis(now_ms()),
        };
        Some(Record::new(self.tag, time, self.record))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Chunker
// ═══════════════════════════════════════════════════════════════

/// Groups records by chunk keys into sealed chunks.
///
/// A chunk is sealed when it reaches `chunk_limit_records`; the rest is
/// sealed by `flush` at end of input.
pub struct Chunker {
    chunk_keys: Vec<String>,
    limit: usize,
    timekey: i64,
    open: BTreeMap<ChunkMetadata, Vec<Record>>,
    seq: u64,
    prefix: i64,
}

impl Chunker {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            chunk_keys: config.chunk_keys.clone(),
            limit: config.chunk_limit_records.max(1),
            timekey: config.timekey.max(1),
            open: BTreeMap::new(),
            seq: 0,
            prefix: now_ms(),
        }
    }

    /// Chunk key values for one record.
    pub fn metadata_for(&self, record: &Record) -> ChunkMetadata {
        let mut meta = ChunkMetadata::default();
        for key in &self.chunk_keys {
            match key.as_str() {
                "tag" => meta.tag = Some(record.tag.clone()),
                "time" => {
                    meta.timekey = Some(record.time.secs.div_euclid(self.timekey) * self.timekey);
                }
                field => {
                    // records without the field leave the variable unset;
                    // such a chunk fails placeholder resolution if the variable is used
                    if let Some(value) = record.fields.get(field) {
                        let text = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        meta.variables.insert(field.to_string(), text);
                    }
                }
            }
        }
        meta
    }

    /// Add a record. Returns the chunk it sealed, if any.
    pub fn push(&mut self, record: Record) -> Option<Chunk> {
        let meta = self.metadata_for(&record);
        let records = self.open.entry(meta.clone()).or_default();
        records.push(record);
        if records.len() < self.limit {
            return None;
        }
        let records = self.open.remove(&meta).unwrap_or_default();
        Some(self.seal(meta, records))
    }

    /// Seal every open chunk.
    pub fn flush(&mut self) -> Vec<Chunk> {
        let open = std::mem::take(&mut self.open);
        open.into_iter()
            .map(|(meta, records)| self.seal(meta, records))
            .collect()
    }

    pub fn pending_records(&self) -> usize {
        self.open.values().map(Vec::len).sum()
    }

    fn seal(&mut self, meta: ChunkMetadata, records: Vec<Record>) -> Chunk {
        self.seq += 1;
        let id = ChunkId::new(format!("{:x}-{:06}", self.prefix, self.seq));
        Chunk::new(id, meta, records)
    }
}
