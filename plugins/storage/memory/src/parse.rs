use sink_api::StoreError;

/// Parsed `INSERT INTO [ks.]table JSON '<doc>' [IF NOT EXISTS] [USING TTL n]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertJson {
    pub keyspace: Option<String>,
    pub table: String,
    pub json: String,
    pub if_not_exists: bool,
    pub ttl: Option<i64>,
}

fn syntax(detail: impl std::fmt::Display) -> StoreError {
    StoreError::format_err(format!("line 1: syntax error, {detail}"))
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let s = s.trim_start();
    let head = s.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(&s[keyword.len()..])
    } else {
        None
    }
}

pub fn parse_insert(cql: &str) -> Result<InsertJson, StoreError> {
    let rest = strip_keyword(cql, "INSERT")
        .and_then(|s| strip_keyword(s, "INTO"))
        .ok_or_else(|| syntax("only INSERT INTO ... JSON is supported"))?
        .trim_start();

    let name_end = rest.find(char::is_whitespace).ok_or_else(|| syntax("missing JSON clause"))?;
    let (name, rest) = rest.split_at(name_end);
    let (keyspace, table) = match name.split_once('.') {
        Some((ks, t)) => (Some(ks.to_string()), t.to_string()),
        None => (None, name.to_string()),
    };
    if table.is_empty() || keyspace.as_deref() == Some("") {
        return Err(syntax(format!("bad table name '{name}'")));
    }

    let rest = strip_keyword(rest, "JSON").ok_or_else(|| syntax("expected JSON"))?;
    let rest = rest
        .trim_start()
        .strip_prefix('\'')
        .ok_or_else(|| syntax("expected string literal after JSON"))?;

    // '' inside the literal is an escaped quote
    let mut json = String::with_capacity(rest.len());
    let mut chars = rest.char_indices().peekable();
    let mut end = None;
    while let Some((i, ch)) = chars.next() {
        if ch == '\'' {
            if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
                json.push('\'');
                continue;
            }
            end = Some(i + 1);
            break;
        }
        json.push(ch);
    }
    let end = end.ok_or_else(|| syntax("unterminated string literal"))?;
    let mut rest = &rest[end..];

    let mut if_not_exists = false;
    if let Some(after) = strip_keyword(rest, "IF")
        .and_then(|s| strip_keyword(s, "NOT"))
        .and_then(|s| strip_keyword(s, "EXISTS"))
    {
        if_not_exists = true;
        rest = after;
    }

    let mut ttl = None;
    if let Some(after) = strip_keyword(rest, "USING").and_then(|s| strip_keyword(s, "TTL")) {
        let after = after.trim_start();
        let digits_end = after.find(|c: char| !c.is_ascii_digit()).unwrap_or(after.len());
        let n: i64 = after[..digits_end]
            .parse()
            .map_err(|_| syntax("TTL must be a non-negative integer"))?;
        ttl = Some(n);
        rest = &after[digits_end..];
    }

    let trailing = rest.trim().trim_end_matches(';').trim();
    if !trailing.is_empty() {
        return Err(syntax(format!("unexpected input '{trailing}'")));
    }

    Ok(InsertJson { keyspace, table, json, if_not_exists, ttl })
}
