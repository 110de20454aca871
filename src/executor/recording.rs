//! In-memory executor
//!
//! Records every statement it is asked to run. Used by tests and by
//! `import --dry-run`.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{QueryExecutor, QueryResult};
use crate::error::{Error, Result};

/// Executor that records statements instead of running them
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
    fail_marker: Option<String>,
}

impl RecordingExecutor {
    /// Create a new recording executor
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement containing `marker`
    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            fail_marker: Some(marker.into()),
        }
    }

    /// Statements executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        if let Some(marker) = &self.fail_marker {
            if sql.contains(marker.as_str()) {
                return Err(Error::QueryExecution(format!("rejected: {}", sql)));
            }
        }
        let mut executed = self
            .executed
            .lock()
            .map_err(|_| Error::Internal("recording executor poisoned".into()))?;
        executed.push(sql.to_string());
        Ok(QueryResult::affected(1))
    }

    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
