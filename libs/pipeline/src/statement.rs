use sink_api::{Consistency, Statement};

use crate::placeholder::InsertTarget;

/// Per-insert options, identical for every row of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertOptions {
    pub if_not_exists: bool,
    /// Only `Some(n)` with n > 0 produces a TTL clause.
    pub ttl: Option<i64>,
    pub consistency: Consistency,
}

/// Build `INSERT INTO <keyspace>.<table> JSON '<json>' [IF NOT EXISTS] [USING TTL <n>]`.
///
/// `json` is embedded verbatim: quote escaping is the formatter's job and
/// malformed documents are rejected by the store, not here.
pub fn build_insert(target: &InsertTarget, options: &InsertOptions, json: &str) -> Statement {
    let mut cql = String::with_capacity(json.len() + target.keyspace.len() + target.table.len() + 48);
    cql.push_str("INSERT INTO ");
    cql.push_str(&target.keyspace);
    cql.push('.');
    cql.push_str(&target.table);
    cql.push_str(" JSON '");
    cql.push_str(json);
    cql.push('\'');
    if options.if_not_exists {
        cql.push_str(" IF NOT EXISTS");
    }
    if let Some(ttl) = options.ttl.filter(|t| *t > 0) {
        cql.push_str(" USING TTL ");
        cql.push_str(&ttl.to_string());
    }
    Statement::new(cql, options.consistency)
}
