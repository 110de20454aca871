//! Cluster Operator - Single-Writer Replication for MariaDB
//!
//! Keeps a group of MariaDB servers identical by funnelling every write
//! through one master node. The master executes each write, records it in
//! an ordered backlog under a sequence number and pushes it to followers;
//! followers replay the backlog to catch up and then apply pushed writes
//! in the same order.
//!
//! # Architecture
//!
//! - `splitter` turns SQL dump text into statements, honouring quotes,
//!   escapes and `DELIMITER` directives
//! - `classifier` decides which statements are replicated
//! - `backlog` is the durable, gapless log of committed writes
//! - `replication` holds the write path, push fan-out, follower catch-up
//!   and the coordinator that picks this node's role
//! - `network` is the framed TCP gateway and its client
//! - `import` bulk-loads `.sql` files through a gateway

pub mod api;
pub mod auth;
pub mod backlog;
pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod import;
pub mod network;
pub mod replication;
pub mod splitter;
pub mod state;

pub use config::OperatorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backlog::{Backlog, BacklogEntry, Seq};
    pub use crate::classifier::{classify, QueryKind};
    pub use crate::config::OperatorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{QueryExecutor, QueryResult};
    pub use crate::network::{ClusterGateway, GatewayClient};
    pub use crate::replication::{CoordinatorState, ReplicationCoordinator};
    pub use crate::splitter::{Statement, StatementSplitter};
}
