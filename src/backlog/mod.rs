//! Backlog Module
//!
//! Append-only, gaplessly sequenced record of every replicated write and
//! its result. Followers catch up by reading ranges of it.

mod store;

pub use store::Backlog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::QueryResult;

/// Backlog sequence number. The first entry is 1; 0 means "nothing yet".
pub type Seq = u64;

/// One committed write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogEntry {
    /// Position in the master's history
    pub sequence_number: Seq,
    /// Statement text as executed
    pub statement: String,
    /// Result the master produced
    pub result: QueryResult,
    /// Commit time on the master
    pub timestamp: DateTime<Utc>,
}

/// Page of entries plus the high-water mark seen while reading it
#[derive(Debug, Clone)]
pub struct BacklogPage {
    /// High-water mark at read time, never below the last record
    pub sequence_number: Seq,
    /// Entries after the requested position, ascending
    pub records: Vec<BacklogEntry>,
}
