//! Master Write Path
//!
//! Execute, append, publish. One write at a time, so the order in which
//! the engine applied statements is the order of their sequence numbers.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::fanout::FanOut;
use crate::backlog::{Backlog, BacklogEntry};
use crate::error::Result;
use crate::executor::{preview, QueryExecutor};

/// Serialized write path used while this node is master
pub struct WritePath {
    executor: Arc<dyn QueryExecutor>,
    backlog: Arc<Backlog>,
    fanout: Arc<FanOut>,
    /// Held across execute, append and publish
    write_lock: Mutex<()>,
}

impl WritePath {
    /// Create a new write path
    pub fn new(executor: Arc<dyn QueryExecutor>, backlog: Arc<Backlog>, fanout: Arc<FanOut>) -> Self {
        Self {
            executor,
            backlog,
            fanout,
            write_lock: Mutex::new(()),
        }
    }

    /// Commit a write statement.
    ///
    /// A statement the engine rejects is returned as an error without
    /// touching the backlog or notifying followers.
    pub async fn commit(&self, statement: &str) -> Result<BacklogEntry> {
        let _guard = self.write_lock.lock().await;

        let result = self.executor.execute(statement).await?;

        let entry = match self.backlog.append(statement, &result).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(
                    "Statement executed but could not be appended to the backlog: {} ({})",
                    preview(statement),
                    e
                );
                return Err(e);
            }
        };

        self.fanout.publish(&entry);
        tracing::debug!("Committed sequence {}: {}", entry.sequence_number, preview(statement));
        Ok(entry)
    }

    /// Backlog written by this path
    pub fn backlog(&self) -> &Arc<Backlog> {
        &self.backlog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_commit_appends_and_publishes() {
        let executor = Arc::new(RecordingExecutor::new());
        let backlog = Arc::new(Backlog::in_memory().unwrap());
        let fanout = FanOut::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = fanout.attach(tx);

        let path = WritePath::new(executor.clone(), backlog.clone(), fanout);
        let first = path.commit("INSERT INTO t VALUES (1)").await.unwrap();
        let second = path.commit("INSERT INTO t VALUES (2)").await.unwrap();

        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
        assert_eq!(backlog.sequence_number(), 2);
        assert_eq!(executor.executed().len(), 2);
        assert_eq!(rx.recv().await.unwrap().sequence_number, 1);
        assert_eq!(rx.recv().await.unwrap().sequence_number, 2);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_advance() {
        let executor = Arc::new(RecordingExecutor::failing_on("missing_table"));
        let backlog = Arc::new(Backlog::in_memory().unwrap());
        let fanout = FanOut::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = fanout.attach(tx);

        let path = WritePath::new(executor, backlog.clone(), fanout);
        path.commit("INSERT INTO t VALUES (1)").await.unwrap();
        assert!(path.commit("INSERT INTO missing_table VALUES (1)").await.is_err());
        let next = path.commit("INSERT INTO t VALUES (2)").await.unwrap();

        assert_eq!(next.sequence_number, 2);
        assert_eq!(rx.recv().await.unwrap().sequence_number, 1);
        assert_eq!(rx.recv().await.unwrap().sequence_number, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_commits_match_engine_order() {
        let executor = Arc::new(RecordingExecutor::new());
        let backlog = Arc::new(Backlog::in_memory().unwrap());
        let path = Arc::new(WritePath::new(executor.clone(), backlog.clone(), FanOut::new()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let path = Arc::clone(&path);
            handles.push(tokio::spawn(async move {
                path.commit(&format!("INSERT INTO t VALUES ({})", i)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let logged: Vec<String> = backlog
            .read(0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.statement)
            .collect();
        assert_eq!(logged, executor.executed());
    }
}
