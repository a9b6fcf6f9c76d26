use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};

use sink_api::{ChunkMetadata, tag_part};

use crate::SinkError;

/// Resolved destination of every row in one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertTarget {
    pub keyspace: String,
    pub table: String,
}

impl InsertTarget {
    /// Substitute chunk metadata into the configured keyspace/table names.
    ///
    /// Supported placeholders:
    /// - `%Y`, `%m`, `%d`, ...: strftime over the chunk's timekey (UTC);
    ///   left as is when the chunk carries no timekey
    /// - `${tag}`, `${tag[N]}`: whole tag or N-th dot-separated part (N < 0 counts from the end)
    /// - `${name}`: value of the chunk key `name`
    pub fn resolve(
        keyspace: &str,
        table: &str,
        metadata: &ChunkMetadata,
    ) -> Result<Self, SinkError> {
        Ok(Self {
            keyspace: resolve_template(keyspace, metadata)?,
            table: resolve_template(table, metadata)?,
        })
    }
}

impl std::fmt::Display for InsertTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.table)
    }
}

pub fn has_placeholders(template: &str) -> bool {
    template.contains("${") || template.contains('%')
}

/// Chunk keys a template depends on: `%` needs `time`, `${tag}`/`${tag[N]}` need `tag`,
/// `${name}` needs `name`.
pub fn required_chunk_keys(template: &str) -> Vec<&str> {
    let mut keys = Vec::new();
    if template.contains('%') {
        keys.push("time");
    }
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        let name = after[..end].trim();
        keys.push(if name == "tag" || name.starts_with("tag[") { "tag" } else { name });
        rest = &after[end + 1..];
    }
    keys
}

fn resolve_template(template: &str, metadata: &ChunkMetadata) -> Result<String, SinkError> {
    let err = |detail: String| SinkError::Placeholder {
        template: template.to_string(),
        detail,
    };

    let timed = match metadata.timekey {
        Some(timekey) if template.contains('%') => format_time(template, timekey).map_err(err)?,
        _ => template.to_string(),
    };

    let mut out = String::with_capacity(timed.len());
    let mut rest = timed.as_str();
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| err("unterminated '${'".into()))?;
        let name = after[..end].trim();
        out.push_str(&lookup(name, metadata).map_err(err)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    validate_identifier(&out).map_err(err)?;
    Ok(out)
}

fn lookup(name: &str, metadata: &ChunkMetadata) -> Result<String, String> {
    if name == "tag" {
        return metadata
            .tag
            .clone()
            .ok_or_else(|| "chunk has no tag (add 'tag' to chunk keys)".to_string());
    }
    if let Some(index) = name.strip_prefix("tag[").and_then(|s| s.strip_suffix(']')) {
        let index: i64 = index
            .trim()
            .parse()
            .map_err(|_| format!("invalid tag index '{index}'"))?;
        let tag = metadata
            .tag
            .as_deref()
            .ok_or_else(|| "chunk has no tag (add 'tag' to chunk keys)".to_string())?;
        return tag_part(tag, index)
            .map(str::to_string)
            .ok_or_else(|| format!("tag '{tag}' has no part {index}"));
    }
    metadata
        .variables
        .get(name)
        .cloned()
        .ok_or_else(|| format!("chunk has no key '{name}'"))
}

fn format_time(template: &str, timekey: i64) -> Result<String, String> {
    let items = strftime_items(template)?;
    let at: DateTime<Utc> = DateTime::from_timestamp(timekey, 0)
        .ok_or_else(|| format!("timekey {timekey} out of range"))?;
    Ok(at.format_with_items(items.into_iter()).to_string())
}

fn strftime_items(fmt: &str) -> Result<Vec<Item<'_>>, String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return Err(format!("invalid strftime pattern '{fmt}'"));
    }
    Ok(items)
}

/// Check a strftime pattern up front so formatting can't fail later.
pub fn check_strftime(fmt: &str) -> Result<(), String> {
    strftime_items(fmt).map(|_| ())
}

/// Unquoted CQL identifier: `^[A-Za-z_][A-Za-z0-9_]*$`.
pub fn validate_identifier(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("identifier is empty".into());
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(format!(
            "invalid identifier '{name}': must start with a letter or underscore"
        ));
    }
    for ch in chars {
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            return Err(format!("invalid character '{ch}' in identifier '{name}'"));
        }
    }
    Ok(())
}
