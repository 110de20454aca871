//! Query Router
//!
//! Entry point for every `writeQuery`. Reads and session statements run
//! on the local engine; writes go through the master's write path, either
//! locally or forwarded over the master link.

use std::sync::Arc;

use async_trait::async_trait;

use super::coordinator::{ReplicationCoordinator, WriteRoute};
use super::write_path::WritePath;
use crate::classifier::{analyze, QueryKind};
use crate::error::{Error, Result};
use crate::executor::{preview, QueryExecutor};
use crate::import::StatementSink;
use crate::network::WriteOutcome;

/// Routes statements by kind and replication role
pub struct QueryRouter {
    executor: Arc<dyn QueryExecutor>,
    write_path: Arc<WritePath>,
    coordinator: Arc<ReplicationCoordinator>,
}

impl QueryRouter {
    /// Create a new router
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        write_path: Arc<WritePath>,
        coordinator: Arc<ReplicationCoordinator>,
    ) -> Self {
        Self {
            executor,
            write_path,
            coordinator,
        }
    }

    /// Execute one statement
    pub async fn route(&self, sql: &str) -> Result<WriteOutcome> {
        let Some((statement, kind)) = analyze(sql) else {
            return Err(Error::QueryExecution("Query was empty".into()));
        };

        if !kind.is_replicated() {
            tracing::trace!("Local {:?}: {}", kind, preview(statement));
            let result = self.executor.execute(statement).await?;
            return Ok(WriteOutcome {
                sequence_number: None,
                result,
            });
        }

        debug_assert_eq!(kind, QueryKind::Write);
        match self.coordinator.write_route().await {
            WriteRoute::Local => {
                let entry = self.write_path.commit(statement).await?;
                Ok(WriteOutcome {
                    sequence_number: Some(entry.sequence_number),
                    result: entry.result,
                })
            }
            WriteRoute::Forward(master) => {
                tracing::debug!("Forwarding write to {}: {}", master.address(), preview(statement));
                master.write_query(statement).await
            }
            WriteRoute::Unavailable => Err(Error::NoMaster),
        }
    }
}

#[async_trait]
impl StatementSink for QueryRouter {
    async fn submit(&self, statement: &str) -> Result<()> {
        self.route(statement).await.map(|_| ())
    }
}
