use std::borrow::Cow;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde_json::Value;

use sink_api::{EventTime, Record, StoreError};

use crate::config::{InjectConfig, TimeType};

/// Add the event tag/time to a record's fields, as configured.
/// Records pass through untouched when injection is off.
pub fn inject_values<'r>(cfg: &InjectConfig, record: &'r Record) -> Result<Cow<'r, Record>, StoreError> {
    if !cfg.is_enabled() {
        return Ok(Cow::Borrowed(record));
    }
    let mut injected = record.clone();
    if let Some(key) = &cfg.tag_key {
        injected.fields.insert(key.clone(), Value::String(record.tag.clone()));
    }
    if let Some(key) = &cfg.time_key {
        injected.fields.insert(key.clone(), time_value(cfg, record.time)?);
    }
    Ok(Cow::Owned(injected))
}

fn time_value(cfg: &InjectConfig, time: EventTime) -> Result<Value, StoreError> {
    Ok(match cfg.time_type {
        TimeType::Float => serde_json::Number::from_f64(time.as_secs_f64())
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(time.secs)),
        TimeType::Unixtime => Value::from(time.secs),
        TimeType::UnixtimeMillis => Value::from(
            time.as_millis()
                .ok_or_else(|| StoreError::format_err(format!("event time {} out of range", time.secs)))?,
        ),
        TimeType::String => {
            let at: DateTime<Utc> = DateTime::from_timestamp(time.secs, time.nanos)
                .ok_or_else(|| StoreError::format_err(format!("event time {} out of range", time.secs)))?;
            let mut out = String::new();
            write!(out, "{}", at.format(cfg.time_format()))
                .map_err(|_| StoreError::format_err(format!("cannot format time with '{}'", cfg.time_format())))?;
            Value::String(out)
        }
    })
}
