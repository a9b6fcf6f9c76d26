/// Текущее Unix-время в миллисекундах.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Split a dot-separated tag and pick one part.
///
/// Negative indexes count from the end:
/// - `tag_part("app.web.access", 0)` → `"app"`
/// - `tag_part("app.web.access", -1)` → `"access"`
///
/// Returns `None` when the index is out of range.
pub fn tag_part(tag: &str, index: i64) -> Option<&str> {
    let parts: Vec<&str> = tag.split('.').collect();
    let len = parts.len() as i64;
    let idx = if index < 0 { len + index } else { index };
    if idx < 0 || idx >= len {
        return None;
    }
    parts.get(idx as usize).copied()
}
