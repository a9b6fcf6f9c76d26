use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use sink_api::StoreError;

// ═══════════════════════════════════════════════════════════════
//  ColumnType
// ═══════════════════════════════════════════════════════════════

/// Subset of CQL column types understood by the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    BigInt,
    Text,
    Timestamp,
    Boolean,
    Double,
    List(Box<ColumnType>),
    Set(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
}

impl std::str::FromStr for ColumnType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let generic = |name: &str| -> Option<String> {
            s.strip_prefix(name)
                .and_then(|rest| rest.trim_start().strip_prefix('<'))
                .and_then(|rest| rest.strip_suffix('>'))
                .map(|inner| inner.trim().to_string())
        };

        if let Some(inner) = generic("list") {
            return Ok(ColumnType::List(Box::new(inner.parse()?)));
        }
        if let Some(inner) = generic("set") {
            return Ok(ColumnType::Set(Box::new(inner.parse()?)));
        }
        if let Some(inner) = generic("map") {
            let (k, v) = inner
                .split_once(',')
                .ok_or_else(|| StoreError::config(format!("map type needs two parameters: '{s}'")))?;
            return Ok(ColumnType::Map(Box::new(k.parse()?), Box::new(v.parse()?)));
        }

        match s.as_str() {
            "int" => Ok(ColumnType::Int),
            "bigint" | "counter" => Ok(ColumnType::BigInt),
            "text" | "varchar" | "ascii" => Ok(ColumnType::Text),
            "timestamp" => Ok(ColumnType::Timestamp),
            "boolean" => Ok(ColumnType::Boolean),
            "double" | "float" => Ok(ColumnType::Double),
            other => Err(StoreError::config(format!("unsupported column type '{other}'"))),
        }
    }
}

impl ColumnType {
    /// Coerce a JSON value into this column's canonical representation,
    /// the way `INSERT ... JSON` does server-side.
    pub fn coerce(&self, column: &str, value: &Value) -> Result<Value, StoreError> {
        let bad = || {
            StoreError::format_err(format!(
                "Error decoding JSON value for {column}: unable to make {} from {value}",
                self.name()
            ))
        };
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            ColumnType::Int => {
                let n = integer(value).ok_or_else(bad)?;
                i32::try_from(n).map(Value::from).map_err(|_| bad())
            }
            ColumnType::BigInt => integer(value).map(Value::from).ok_or_else(bad),
            ColumnType::Text => value.as_str().map(|s| Value::String(s.to_string())).ok_or_else(bad),
            ColumnType::Timestamp => timestamp_ms(value).map(Value::from).ok_or_else(bad),
            ColumnType::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                _ => Err(bad()),
            },
            ColumnType::Double => {
                let f = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                f.and_then(serde_json::Number::from_f64).map(Value::Number).ok_or_else(bad)
            }
            ColumnType::List(inner) => {
                let items = value.as_array().ok_or_else(bad)?;
                let items = items
                    .iter()
                    .map(|v| inner.coerce(column, v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(items))
            }
            ColumnType::Set(inner) => {
                let items = value.as_array().ok_or_else(bad)?;
                let mut unique: BTreeMap<String, Value> = BTreeMap::new();
                for v in items {
                    let v = inner.coerce(column, v)?;
                    unique.insert(v.to_string(), v);
                }
                Ok(Value::Array(unique.into_values().collect()))
            }
            ColumnType::Map(key, val) => {
                let entries = value.as_object().ok_or_else(bad)?;
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    let k = match key.coerce(column, &Value::String(k.clone()))? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    out.insert(k, val.coerce(column, v)?);
                }
                Ok(Value::Object(out))
            }
        }
    }

    fn name(&self) -> String {
        match self {
            ColumnType::Int => "int".into(),
            ColumnType::BigInt => "bigint".into(),
            ColumnType::Text => "text".into(),
            ColumnType::Timestamp => "timestamp".into(),
            ColumnType::Boolean => "boolean".into(),
            ColumnType::Double => "double".into(),
            ColumnType::List(t) => format!("list<{}>", t.name()),
            ColumnType::Set(t) => format!("set<{}>", t.name()),
            ColumnType::Map(k, v) => format!("map<{}, {}>", k.name(), v.name()),
        }
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_timestamp(s.trim()),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<i64> {
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.timestamp_millis());
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

// ═══════════════════════════════════════════════════════════════
//  TableSchema
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct TableSchema {
    columns: BTreeMap<String, ColumnType>,
    primary_key: Vec<String>,
}

impl TableSchema {
    /// `columns`: name → CQL type string (e.g. `"map<text, text>"`).
    pub fn new<'a>(
        columns: impl IntoIterator<Item = (&'a str, &'a str)>,
        primary_key: &[&str],
    ) -> Result<Self, StoreError> {
        let mut parsed = BTreeMap::new();
        for (name, ty) in columns {
            parsed.insert(name.to_string(), ty.parse::<ColumnType>()?);
        }
        if primary_key.is_empty() {
            return Err(StoreError::config("primary key must have at least one column"));
        }
        for pk in primary_key {
            if !parsed.contains_key(*pk) {
                return Err(StoreError::config(format!("primary key column '{pk}' is not defined")));
            }
        }
        Ok(Self {
            columns: parsed,
            primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Validate and coerce one JSON document into a full row.
    /// Columns missing from the document are set to null.
    pub fn row_from_json(&self, doc: &Value) -> Result<BTreeMap<String, Value>, StoreError> {
        let object = doc
            .as_object()
            .ok_or_else(|| StoreError::format_err("JSON document is not an object"))?;

        for key in object.keys() {
            if !self.columns.contains_key(key) {
                return Err(StoreError::format_err(format!(
                    "JSON values map contains unrecognized column: {key}"
                )));
            }
        }

        let mut row = BTreeMap::new();
        for (name, ty) in &self.columns {
            let value = match object.get(name) {
                Some(v) => ty.coerce(name, v)?,
                None => Value::Null,
            };
            row.insert(name.clone(), value);
        }

        for pk in &self.primary_key {
            if row.get(pk).is_none_or(Value::is_null) {
                return Err(StoreError::format_err(format!(
                    "Invalid null value in condition for column {pk}"
                )));
            }
        }
        Ok(row)
    }

    /// Primary key of a row produced by `row_from_json`.
    pub fn key_of(&self, row: &BTreeMap<String, Value>) -> Vec<String> {
        self.primary_key
            .iter()
            .map(|pk| row.get(pk).map(Value::to_string).unwrap_or_default())
            .collect()
    }
}
