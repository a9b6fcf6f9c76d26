use serde::Deserialize;

use sink_api::Consistency;

use crate::aggregate::TolerancePolicy;
use crate::placeholder::{has_placeholders, validate_identifier};
use crate::statement::InsertOptions;
use crate::SinkError;

// ═══════════════════════════════════════════════════════════════
//  Output Config
// ═══════════════════════════════════════════════════════════════

/// Куда и как писать записи chunk'а.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Target keyspace. Может содержать placeholder'ы (`${tag}`, `${key}`, `%Y%m`).
    pub keyspace: String,
    /// Target table. Может содержать placeholder'ы.
    pub table: String,
    /// Consistency level каждого INSERT.
    #[serde(default)]
    pub consistency: Consistency,
    /// Добавлять `IF NOT EXISTS` к INSERT.
    #[serde(default)]
    pub if_not_exists: bool,
    /// `USING TTL <n>`; применяется только при n > 0.
    #[serde(default)]
    pub ttl: Option<i64>,
    /// true: chunk подтверждается даже если часть строк не записалась.
    /// false: любая ошибка строки отправляет chunk на повторную доставку.
    #[serde(default = "default_skip_invalid_rows")]
    pub skip_invalid_rows: bool,
    #[serde(default)]
    pub format: FormatSection,
    #[serde(default)]
    pub inject: InjectConfig,
}

fn default_skip_invalid_rows() -> bool {
    true
}

impl OutputConfig {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            consistency: Consistency::default(),
            if_not_exists: false,
            ttl: None,
            skip_invalid_rows: default_skip_invalid_rows(),
            format: FormatSection::default(),
            inject: InjectConfig::default(),
        }
    }

    /// Validate at startup. Any error here must prevent the process from starting.
    pub fn validate(&self) -> Result<(), SinkError> {
        for (context, template) in [("keyspace", &self.keyspace), ("table", &self.table)] {
            if template.trim().is_empty() {
                return Err(SinkError::config(context, "must not be empty"));
            }
            if !has_placeholders(template) {
                validate_identifier(template).map_err(|detail| SinkError::config(context, detail))?;
            }
        }
        self.format.validate()?;
        self.inject.validate()?;
        Ok(())
    }

    pub fn insert_options(&self) -> InsertOptions {
        InsertOptions {
            if_not_exists: self.if_not_exists,
            ttl: self.ttl.filter(|t| *t > 0),
            consistency: self.consistency,
        }
    }

    pub fn tolerance(&self) -> TolerancePolicy {
        if self.skip_invalid_rows {
            TolerancePolicy::SkipInvalidRows
        } else {
            TolerancePolicy::RejectChunk
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Format
// ═══════════════════════════════════════════════════════════════

pub const KNOWN_FORMATS: &[&str] = &["json"];

/// Выбор record formatter'а (`[output.format] type = "json"`).
#[derive(Debug, Clone, Deserialize)]
pub struct FormatSection {
    #[serde(rename = "type", default = "default_format_type")]
    pub kind: String,
}

fn default_format_type() -> String {
    "json".into()
}

impl Default for FormatSection {
    fn default() -> Self {
        Self { kind: default_format_type() }
    }
}

impl FormatSection {
    pub fn validate(&self) -> Result<(), SinkError> {
        if KNOWN_FORMATS.contains(&self.kind.as_str()) {
            Ok(())
        } else {
            Err(SinkError::config(
                "format",
                format!("unknown type '{}', expected one of: {}", self.kind, KNOWN_FORMATS.join(", ")),
            ))
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Inject
// ═══════════════════════════════════════════════════════════════

/// Как записывать время события в поле `time_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeType {
    /// Секунды с дробной частью.
    #[default]
    Float,
    /// Целые секунды.
    Unixtime,
    /// Целые миллисекунды (native CQL `timestamp`).
    UnixtimeMillis,
    /// Строка по `time_format` (UTC).
    String,
}

/// Добавление tag/time события в запись перед форматированием.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InjectConfig {
    pub tag_key: Option<String>,
    pub time_key: Option<String>,
    #[serde(default)]
    pub time_type: TimeType,
    /// strftime-шаблон для `time_type = "string"`.
    pub time_format: Option<String>,
}

pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

impl InjectConfig {
    pub fn is_enabled(&self) -> bool {
        self.tag_key.is_some() || self.time_key.is_some()
    }

    pub fn time_format(&self) -> &str {
        self.time_format.as_deref().unwrap_or(DEFAULT_TIME_FORMAT)
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        if self.time_format.is_some() && self.time_type != TimeType::String {
            return Err(SinkError::config("inject", "time_format requires time_type = \"string\""));
        }
        if self.time_type == TimeType::String {
            crate::placeholder::check_strftime(self.time_format())
                .map_err(|detail| SinkError::config("inject", detail))?;
        }
        Ok(())
    }
}
