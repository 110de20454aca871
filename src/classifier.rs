//! Query Classifier
//!
//! Decides whether a statement must go through the replicated write path.

use serde::{Deserialize, Serialize};

/// Statement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    /// Executed locally, never enters the backlog
    Read,
    /// Session-scoped configuration, executed locally and never replicated
    Session,
    /// Executed on the master, appended to the backlog and broadcast
    Write,
}

impl QueryKind {
    /// Whether statements of this kind are replicated
    pub fn is_replicated(self) -> bool {
        self == QueryKind::Write
    }
}

/// Read-only verbs and statements with no effect on stored data
const READ_PREFIXES: &[&str] = &["select", "show", "describe", "set names", "kill", "set profiling"];

const SESSION_PREFIXES: &[&str] = &["set session"];

/// Classify one statement.
///
/// Rules are applied in order: read prefixes, the options-table transient
/// polling query, session prefixes, then everything else is a write.
pub fn classify(sql: &str) -> QueryKind {
    let sql = sql.trim_start();

    if READ_PREFIXES.iter().any(|p| starts_with_ignore_case(sql, p)) {
        return QueryKind::Read;
    }

    // WordPress transient polling never enters the backlog
    if sql.contains("`wp_options`") && sql.contains("_transient_") {
        return QueryKind::Read;
    }

    if SESSION_PREFIXES.iter().any(|p| starts_with_ignore_case(sql, p)) {
        return QueryKind::Session;
    }

    QueryKind::Write
}

/// Remove leading `--` comment lines and blank lines from a single query
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut s = sql;
    while s.starts_with("--") || s.starts_with("\r\n") || s.starts_with('\n') {
        s = match s.find('\n') {
            Some(end) => &s[end + 1..],
            None => "",
        };
    }
    s
}

/// Trim and clean a client query, then classify it.
///
/// Returns `None` when nothing executable remains.
pub fn analyze(sql: &str) -> Option<(&str, QueryKind)> {
    let cleaned = strip_leading_comments(sql.trim()).trim();
    if cleaned.is_empty() {
        return None;
    }
    Some((cleaned, classify(cleaned)))
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
