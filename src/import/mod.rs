//! Bulk Import
//!
//! Streams `.sql` dump files through the statement splitter and submits
//! each statement to a sink: a node's gateway for a live cluster, or a
//! local executor for a dry run.

mod importer;

pub use importer::{FileCompleted, FailedImport, ImportProgress, ImportReport, Importer};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::executor::QueryExecutor;

/// Destination for imported statements
#[async_trait]
pub trait StatementSink: Send + Sync {
    /// Submit one statement, returning once it has been executed
    async fn submit(&self, statement: &str) -> Result<()>;
}

/// Sink that runs statements directly on an executor
pub struct ExecutorSink(pub Arc<dyn QueryExecutor>);

#[async_trait]
impl StatementSink for ExecutorSink {
    async fn submit(&self, statement: &str) -> Result<()> {
        self.0.execute(statement).await.map(|_| ())
    }
}
