//! Cluster Operator Error Types

use thiserror::Error;

use crate::backlog::Seq;

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster operator error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Statement stream errors
    #[error("Parse error at statement {statement}: {reason}")]
    Parse { statement: usize, reason: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Query timed out after {0}s")]
    QueryTimeout(u64),

    // Backlog errors
    #[error("Backlog error: {0}")]
    Backlog(#[from] rusqlite::Error),

    #[error("Backlog record corrupted at sequence {sequence}: {reason}")]
    BacklogCorrupted { sequence: Seq, reason: String },

    #[error("Desync: sequence {requested} is not available (high-water mark {high_water})")]
    Desync { requested: Seq, high_water: Seq },

    // Replication errors
    #[error("Not master: current master is {0}")]
    NotMaster(String),

    #[error("No master available")]
    NoMaster,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] bincode::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Import of {path} failed: {reason}")]
    Import { path: String, reason: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a transport failure that rediscovery can recover from
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::ConnectionClosed
                | Error::Io(_)
                | Error::NoMaster
                | Error::NotMaster(_)
        )
    }

    /// Check if this error means the local history diverged from the master
    pub fn is_desync(&self) -> bool {
        matches!(self, Error::Desync { .. })
    }

    /// Check if the database connection itself failed (as opposed to the engine rejecting a statement)
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}
