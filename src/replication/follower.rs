//! Follower Implementation
//!
//! Catch-up from the master's backlog, then live application of pushed
//! writes. Both sources feed one gapless, duplicate-free ordering:
//! pushes buffer while catch-up runs, anything at or below the applied
//! position is skipped, and a gap re-runs catch-up.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backlog::{Backlog, BacklogEntry, BacklogPage, Seq};
use crate::error::{Error, Result};
use crate::executor::{preview, QueryExecutor};

/// Connection to the master's backlog
#[async_trait]
pub trait MasterLink: Send + Sync {
    /// Fetch entries strictly after `from`
    async fn fetch_backlog(&self, from: Seq) -> Result<BacklogPage>;
}

/// Applies the master's history to the local engine and backlog
pub struct Follower {
    executor: Arc<dyn QueryExecutor>,
    backlog: Arc<Backlog>,
}

impl Follower {
    /// Create a new follower
    pub fn new(executor: Arc<dyn QueryExecutor>, backlog: Arc<Backlog>) -> Self {
        Self { executor, backlog }
    }

    /// Last sequence number applied locally
    pub fn applied(&self) -> Seq {
        self.backlog.sequence_number()
    }

    /// Catch up, call `on_live`, then apply pushes until the connection ends.
    ///
    /// Always returns an error: `ConnectionClosed` when the push stream
    /// ends, or whatever stopped replication.
    pub async fn run<L, F>(
        &self,
        link: &L,
        mut pushes: mpsc::Receiver<BacklogEntry>,
        on_live: F,
    ) -> Result<()>
    where
        L: MasterLink + ?Sized,
        F: FnOnce(Seq),
    {
        self.catch_up(link).await?;
        on_live(self.applied());

        while let Some(entry) = pushes.recv().await {
            let applied = self.applied();
            if entry.sequence_number <= applied {
                tracing::trace!("Skipping duplicate sequence {}", entry.sequence_number);
                continue;
            }

            if entry.sequence_number > applied + 1 {
                tracing::warn!(
                    "Gap in live stream (have {}, got {}), catching up",
                    applied,
                    entry.sequence_number
                );
                self.catch_up(link).await?;

                let applied = self.applied();
                if entry.sequence_number <= applied {
                    continue;
                }
                if entry.sequence_number != applied + 1 {
                    return Err(Error::Desync {
                        requested: applied + 1,
                        high_water: entry.sequence_number,
                    });
                }
            }

            self.apply(&entry).await?;
        }

        Err(Error::ConnectionClosed)
    }

    /// Page through the master's backlog until caught up with its high-water mark
    pub async fn catch_up<L: MasterLink + ?Sized>(&self, link: &L) -> Result<Seq> {
        let start = Instant::now();
        let initial = self.applied();

        loop {
            let from = self.applied();
            let page = link.fetch_backlog(from).await?;

            if page.sequence_number < from {
                // Master has less history than we already applied
                return Err(Error::Desync {
                    requested: from,
                    high_water: page.sequence_number,
                });
            }

            if page.records.is_empty() {
                if page.sequence_number > from {
                    return Err(Error::Desync {
                        requested: from + 1,
                        high_water: page.sequence_number,
                    });
                }
                break;
            }

            for entry in &page.records {
                let expected = self.applied() + 1;
                if entry.sequence_number != expected {
                    return Err(Error::Desync {
                        requested: expected,
                        high_water: page.sequence_number,
                    });
                }
                self.apply(entry).await?;
            }

            tracing::debug!(
                "Catch-up page applied, at {} of {}",
                self.applied(),
                page.sequence_number
            );

            if self.applied() >= page.sequence_number {
                break;
            }
        }

        let applied = self.applied();
        if applied > initial {
            tracing::info!(
                "Caught up {} entries ({} -> {}) in {:.1}s",
                applied - initial,
                initial,
                applied,
                start.elapsed().as_secs_f64()
            );
        }
        Ok(applied)
    }

    /// Apply one entry and record it.
    ///
    /// A statement the engine rejects is logged and still recorded; the
    /// master already committed it. Losing the database connection stops
    /// replication so the entry is retried after reconnecting.
    async fn apply(&self, entry: &BacklogEntry) -> Result<()> {
        match self.executor.execute(&entry.statement).await {
            Ok(_) => {}
            Err(e) if e.is_connection_lost() || matches!(e, Error::QueryTimeout(_)) => {
                return Err(e);
            }
            Err(e) => {
                tracing::error!(
                    "Sequence {} failed locally: {} - continuing ({})",
                    entry.sequence_number,
                    e,
                    preview(&entry.statement)
                );
            }
        }
        self.backlog.mirror(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{QueryResult, RecordingExecutor};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Master stand-in serving pages from a local backlog
    struct LocalMaster {
        backlog: Arc<Backlog>,
        page_size: usize,
        fetches: AtomicUsize,
        /// High-water mark reported by the next fetch only
        visible: AtomicU64,
    }

    impl LocalMaster {
        async fn with_entries(count: u64) -> Self {
            let backlog = Arc::new(Backlog::in_memory().unwrap());
            for i in 1..=count {
                backlog
                    .append(&format!("INSERT INTO t VALUES ({})", i), &QueryResult::affected(1))
                    .await
                    .unwrap();
            }
            Self {
                backlog,
                page_size: 4,
                fetches: AtomicUsize::new(0),
                visible: AtomicU64::new(u64::MAX),
            }
        }
    }

    #[async_trait]
    impl MasterLink for LocalMaster {
        async fn fetch_backlog(&self, from: Seq) -> Result<BacklogPage> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let limit = self.visible.swap(u64::MAX, Ordering::SeqCst);
            let high_water = self.backlog.sequence_number().min(limit);
            let records = self
                .backlog
                .read(from, self.page_size)
                .await?
                .into_iter()
                .filter(|e| e.sequence_number <= high_water)
                .collect();
            Ok(BacklogPage {
                sequence_number: high_water,
                records,
            })
        }
    }

    async fn follower_at(seq: u64, master: &LocalMaster) -> (Follower, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor::new());
        let backlog = Arc::new(Backlog::in_memory().unwrap());
        for entry in master.backlog.read(0, seq as usize).await.unwrap() {
            backlog.mirror(&entry).await.unwrap();
        }
        (Follower::new(executor.clone(), backlog), executor)
    }

    fn applied_values(executor: &RecordingExecutor) -> Vec<String> {
        executor.executed()
    }

    #[tokio::test]
    async fn test_catch_up_in_pages() {
        let master = LocalMaster::with_entries(20).await;
        let (follower, executor) = follower_at(5, &master).await;

        assert_eq!(follower.catch_up(&master).await.unwrap(), 20);

        let expected: Vec<String> = (6..=20).map(|i| format!("INSERT INTO t VALUES ({})", i)).collect();
        assert_eq!(applied_values(&executor), expected);
        // 15 entries in pages of 4
        assert_eq!(master.fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_catch_up_when_current() {
        let master = LocalMaster::with_entries(3).await;
        let (follower, executor) = follower_at(3, &master).await;
        assert_eq!(follower.catch_up(&master).await.unwrap(), 3);
        assert!(applied_values(&executor).is_empty());
    }

    #[tokio::test]
    async fn test_follower_ahead_of_master_is_desync() {
        let master = LocalMaster::with_entries(10).await;
        let (follower, _) = follower_at(10, &master).await;
        let short_master = LocalMaster::with_entries(4).await;

        let err = follower.catch_up(&short_master).await.unwrap_err();
        assert!(err.is_desync());
    }

    #[tokio::test]
    async fn test_live_stream_merges_without_gaps_or_duplicates() {
        let master = LocalMaster::with_entries(20).await;
        let (follower, executor) = follower_at(5, &master).await;

        // Pushes buffered during catch-up overlap with the catch-up range
        let (tx, rx) = mpsc::channel(64);
        for seq in 18..=20 {
            tx.send(master.backlog.read(seq - 1, 1).await.unwrap().remove(0)).await.unwrap();
        }
        for seq in 21..=23 {
            let entry = master
                .backlog
                .append(&format!("INSERT INTO t VALUES ({})", seq), &QueryResult::affected(1))
                .await
                .unwrap();
            assert_eq!(entry.sequence_number, seq);
            tx.send(entry).await.unwrap();
        }
        drop(tx);

        let mut live_at = None;
        let result = follower.run(&master, rx, |seq| live_at = Some(seq)).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(live_at.unwrap() >= 20);

        let expected: Vec<String> = (6..=23).map(|i| format!("INSERT INTO t VALUES ({})", i)).collect();
        assert_eq!(applied_values(&executor), expected);
        assert_eq!(follower.applied(), 23);
    }

    #[tokio::test]
    async fn test_gap_in_live_stream_triggers_catch_up() {
        let master = LocalMaster::with_entries(5).await;
        // At subscription time the master was at 2
        master.visible.store(2, Ordering::SeqCst);
        let (follower, executor) = follower_at(2, &master).await;

        // Pushes for 3 and 4 were lost; 5 arrives first
        let (tx, rx) = mpsc::channel(8);
        tx.send(master.backlog.read(4, 1).await.unwrap().remove(0)).await.unwrap();
        drop(tx);

        let mut live_at = None;
        let result = follower.run(&master, rx, |seq| live_at = Some(seq)).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(live_at, Some(2));
        assert_eq!(follower.applied(), 5);
        assert_eq!(
            applied_values(&executor),
            vec![
                "INSERT INTO t VALUES (3)",
                "INSERT INTO t VALUES (4)",
                "INSERT INTO t VALUES (5)"
            ]
        );
        assert_eq!(master.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_statement_still_advances() {
        let master = LocalMaster::with_entries(3).await;
        let executor = Arc::new(RecordingExecutor::failing_on("VALUES (2)"));
        let follower = Follower::new(executor.clone(), Arc::new(Backlog::in_memory().unwrap()));

        assert_eq!(follower.catch_up(&master).await.unwrap(), 3);
        assert_eq!(
            executor.executed(),
            vec!["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (3)"]
        );
    }
}
