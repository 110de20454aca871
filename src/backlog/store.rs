//! Backlog Store
//!
//! SQLite-backed storage for backlog entries.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::{BacklogEntry, BacklogPage, Seq};
use crate::error::{Error, Result};
use crate::executor::QueryResult;

/// Persistent, sequenced backlog
pub struct Backlog {
    /// Database connection
    conn: Mutex<Connection>,
    /// Highest sequence number stored
    high_water: AtomicU64,
}

impl Backlog {
    /// Create or open the backlog database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Self::with_connection(conn)
    }

    /// Create a backlog that lives only in memory
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS backlog (
                seq INTEGER PRIMARY KEY,
                statement TEXT NOT NULL,
                result TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;

        let high_water: i64 =
            conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM backlog", [], |row| row.get(0))?;
        tracing::info!("Backlog opened at sequence {}", high_water);

        Ok(Self {
            conn: Mutex::new(conn),
            high_water: AtomicU64::new(high_water as Seq),
        })
    }

    /// Current high-water sequence number (0 when empty)
    pub fn sequence_number(&self) -> Seq {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Append a committed write under the next sequence number
    pub async fn append(&self, statement: &str, result: &QueryResult) -> Result<BacklogEntry> {
        let conn = self.conn.lock().await;
        let entry = BacklogEntry {
            sequence_number: self.high_water.load(Ordering::SeqCst) + 1,
            statement: statement.to_string(),
            result: result.clone(),
            timestamp: Utc::now(),
        };
        insert(&conn, &entry)?;
        self.high_water.store(entry.sequence_number, Ordering::SeqCst);
        Ok(entry)
    }

    /// Store an entry received from the master under its own sequence number.
    ///
    /// The entry must directly follow the current high-water mark.
    pub async fn mirror(&self, entry: &BacklogEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        let high_water = self.high_water.load(Ordering::SeqCst);
        if entry.sequence_number != high_water + 1 {
            return Err(Error::Desync {
                requested: entry.sequence_number,
                high_water,
            });
        }
        insert(&conn, entry)?;
        self.high_water.store(entry.sequence_number, Ordering::SeqCst);
        Ok(())
    }

    /// Read up to `max` entries strictly after `from`, ascending.
    ///
    /// Returns an empty page when `from` is the high-water mark. Asking
    /// for a position beyond it, or for a range this backlog does not
    /// hold, is a desync.
    pub async fn read(&self, from: Seq, max: usize) -> Result<Vec<BacklogEntry>> {
        Ok(self.page(from, max).await?.records)
    }

    /// Like [`Backlog::read`], also returning the high-water mark observed
    /// under the same lock. An empty page always reports `from`.
    pub async fn page(&self, from: Seq, max: usize) -> Result<BacklogPage> {
        let conn = self.conn.lock().await;
        let high_water = self.high_water.load(Ordering::SeqCst);
        if from > high_water {
            return Err(Error::Desync {
                requested: from,
                high_water,
            });
        }
        if from == high_water || max == 0 {
            return Ok(BacklogPage {
                sequence_number: high_water,
                records: Vec::new(),
            });
        }

        let mut stmt = conn.prepare_cached(
            "SELECT seq, statement, result, created_at FROM backlog WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![from as i64, max as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, statement, result, created_at) = row?;
            entries.push(decode(seq as Seq, statement, &result, &created_at)?);
        }

        // Rows must continue exactly where the caller left off
        let mut expected = from + 1;
        for entry in &entries {
            if entry.sequence_number != expected {
                return Err(Error::Desync {
                    requested: expected,
                    high_water,
                });
            }
            expected += 1;
        }

        Ok(BacklogPage {
            sequence_number: high_water,
            records: entries,
        })
    }
}

fn insert(conn: &Connection, entry: &BacklogEntry) -> Result<()> {
    let result = serde_json::to_string(&entry.result).map_err(|e| Error::BacklogCorrupted {
        sequence: entry.sequence_number,
        reason: e.to_string(),
    })?;
    conn.execute(
        "INSERT INTO backlog (seq, statement, result, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            entry.sequence_number as i64,
            entry.statement,
            result,
            entry.timestamp.to_rfc3339()
        ],
    )?;
    Ok(())
}

fn decode(seq: Seq, statement: String, result: &str, created_at: &str) -> Result<BacklogEntry> {
    let corrupted = |reason: String| Error::BacklogCorrupted {
        sequence: seq,
        reason,
    };
    let result: QueryResult =
        serde_json::from_str(result).map_err(|e| corrupted(e.to_string()))?;
    let timestamp = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| corrupted(e.to_string()))?
        .with_timezone(&Utc);

    Ok(BacklogEntry {
        sequence_number: seq,
        statement,
        result,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn statements(entries: &[BacklogEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.statement.as_str()).collect()
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let backlog = Backlog::in_memory().unwrap();
        assert_eq!(backlog.sequence_number(), 0);

        let a = backlog.append("A", &QueryResult::affected(1)).await.unwrap();
        let b = backlog.append("B", &QueryResult::affected(2)).await.unwrap();
        let c = backlog.append("C", &QueryResult::default()).await.unwrap();
        assert_eq!((a.sequence_number, b.sequence_number, c.sequence_number), (1, 2, 3));
        assert_eq!(backlog.sequence_number(), 3);

        let all = backlog.read(0, 10).await.unwrap();
        assert_eq!(statements(&all), vec!["A", "B", "C"]);
        assert_eq!(all[1].result.rows_affected, 2);

        let tail = backlog.read(2, 10).await.unwrap();
        assert_eq!(statements(&tail), vec!["C"]);

        assert!(backlog.read(3, 10).await.unwrap().is_empty());

        let page = backlog.read(0, 2).await.unwrap();
        assert_eq!(statements(&page), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_page_reports_high_water() {
        let backlog = Backlog::in_memory().unwrap();
        for s in ["A", "B", "C"] {
            backlog.append(s, &QueryResult::default()).await.unwrap();
        }

        let page = backlog.page(0, 2).await.unwrap();
        assert_eq!(page.sequence_number, 3);
        assert_eq!(statements(&page.records), vec!["A", "B"]);

        let caught_up = backlog.page(3, 10).await.unwrap();
        assert_eq!(caught_up.sequence_number, 3);
        assert!(caught_up.records.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_page_never_runs_ahead_of_records() {
        let backlog = Arc::new(Backlog::in_memory().unwrap());
        let writer = {
            let backlog = Arc::clone(&backlog);
            tokio::spawn(async move {
                for i in 0..300 {
                    backlog
                        .append(&format!("INSERT INTO t VALUES ({})", i), &QueryResult::default())
                        .await
                        .unwrap();
                }
            })
        };

        while !writer.is_finished() {
            let from = backlog.sequence_number();
            let page = backlog.page(from, 10).await.unwrap();
            if page.records.is_empty() {
                assert_eq!(page.sequence_number, from);
            } else {
                assert!(page.sequence_number >= page.records.last().unwrap().sequence_number);
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(backlog.page(0, 1000).await.unwrap().records.len(), 300);
    }

    #[tokio::test]
    async fn test_read_beyond_high_water_is_desync() {
        let backlog = Backlog::in_memory().unwrap();
        backlog.append("A", &QueryResult::default()).await.unwrap();

        match backlog.read(5, 10).await {
            Err(Error::Desync { requested, high_water }) => {
                assert_eq!(requested, 5);
                assert_eq!(high_water, 1);
            }
            other => panic!("expected desync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mirror_requires_contiguity() {
        let master = Backlog::in_memory().unwrap();
        let follower = Backlog::in_memory().unwrap();

        let first = master.append("A", &QueryResult::default()).await.unwrap();
        let second = master.append("B", &QueryResult::default()).await.unwrap();
        let third = master.append("C", &QueryResult::default()).await.unwrap();

        follower.mirror(&first).await.unwrap();
        assert!(follower.mirror(&third).await.unwrap_err().is_desync());
        // Replaying an entry already held is also rejected
        assert!(follower.mirror(&first).await.unwrap_err().is_desync());
        follower.mirror(&second).await.unwrap();
        follower.mirror(&third).await.unwrap();

        assert_eq!(follower.sequence_number(), 3);
        assert_eq!(follower.read(0, 10).await.unwrap(), master.read(0, 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_preserves_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node").join("backlog.db");

        {
            let backlog = Backlog::open(&path).unwrap();
            backlog.append("CREATE TABLE t (id INT)", &QueryResult::default()).await.unwrap();
            backlog.append("INSERT INTO t VALUES (1)", &QueryResult::affected(1)).await.unwrap();
        }

        let backlog = Backlog::open(&path).unwrap();
        assert_eq!(backlog.sequence_number(), 2);
        let next = backlog.append("INSERT INTO t VALUES (2)", &QueryResult::affected(1)).await.unwrap();
        assert_eq!(next.sequence_number, 3);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_gapless() {
        let backlog = Arc::new(Backlog::in_memory().unwrap());
        let mut handles = Vec::new();
        for i in 0..20 {
            let backlog = Arc::clone(&backlog);
            handles.push(tokio::spawn(async move {
                backlog
                    .append(&format!("INSERT INTO t VALUES ({})", i), &QueryResult::default())
                    .await
                    .unwrap()
                    .sequence_number
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
        assert_eq!(backlog.read(0, 100).await.unwrap().len(), 20);
    }
}
