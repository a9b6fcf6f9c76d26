use sink_api::{Record, RecordFormatter, StoreError};

/// Record fields → one-line JSON object, ready to be embedded into a
/// single-quoted CQL literal.
///
/// Only `record.fields` is serialized; tag and time reach the document
/// through inject (`tag_key`, `time_key`) if configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl JsonFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl RecordFormatter for JsonFormatter {
    fn format(&self, record: &Record) -> Result<String, StoreError> {
        let json = serde_json::to_string(&record.fields)
            .map_err(|e| StoreError::format_err(format!("JSON formatter: {e}")))?;
        Ok(escape_quotes(&json))
    }
}

/// CQL string literal escaping: `'` → `''`.
pub fn escape_quotes(s: &str) -> String {
    if s.contains('\'') {
        s.replace('\'', "''")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};
    use sink_api::EventTime;

    use super::*;

    fn record(fields: serde_json::Value) -> Record {
        let Ok(fields) = serde_json::from_value::<Map<String, serde_json::Value>>(fields) else {
            panic!("fields must be an object");
        };
        Record::new("app.web", EventTime::new(1, 0), fields)
    }

    #[test]
    fn formats_fields_only() {
        let out = JsonFormatter.format(&record(json!({"id": 1, "col1": "x"}))).unwrap();
        let back: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(back, json!({"id": 1, "col1": "x"}));
        assert!(!out.contains("app.web"));
    }

    #[test]
    fn doubles_single_quotes() {
        let out = JsonFormatter.format(&record(json!({"col1": "it's"}))).unwrap();
        assert_eq!(out, r#"{"col1":"it''s"}"#);
    }

    #[test]
    fn nested_values_survive() {
        let out = JsonFormatter
            .format(&record(json!({"col5": [1, 2], "col7": {"a": "b"}})))
            .unwrap();
        assert_eq!(out, r#"{"col5":[1,2],"col7":{"a":"b"}}"#);
    }
}
