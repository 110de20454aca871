//! Database Executor Module
//!
//! Executes statements against the backing MariaDB engine. The rest of
//! the crate only sees the [`QueryExecutor`] trait.

mod mariadb;
mod recording;

pub use mariadb::MariaDbExecutor;
pub use recording::RecordingExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of one executed statement.
///
/// Values are carried as text, `None` for SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names of the result set (empty for statements without rows)
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Vec<Option<String>>>,
    /// Rows affected by a write
    pub rows_affected: u64,
    /// Last generated AUTO_INCREMENT value, if any
    pub last_insert_id: Option<u64>,
}

impl QueryResult {
    /// Result of a write that returns no rows
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }
}

/// Executes SQL against the local database engine
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute one statement and return its result
    async fn execute(&self, sql: &str) -> Result<QueryResult>;

    /// Drop the current connection and establish a new one
    async fn reconnect(&self) -> Result<()>;

    /// Check that the engine answers
    async fn health_check(&self) -> Result<bool>;
}

/// Short, char-boundary safe prefix of a statement for logs
pub fn preview(sql: &str) -> &str {
    const MAX: usize = 100;
    if sql.len() <= MAX {
        return sql;
    }
    let mut end = MAX;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("SELECT 1"), "SELECT 1");
        let long = "é".repeat(80);
        let p = preview(&long);
        assert!(p.len() <= 100);
        assert!(p.chars().all(|c| c == 'é'));
    }
}
