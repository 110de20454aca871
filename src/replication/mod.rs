//! Replication Module
//!
//! Master write path, push fan-out, follower catch-up and the coordinator
//! that decides which role this node plays.

pub mod protocol;
mod coordinator;
mod fanout;
mod follower;
mod router;
mod write_path;

pub use coordinator::{CoordinatorConfig, CoordinatorState, ReplicationCoordinator, WriteRoute};
pub use fanout::{FanOut, Subscription};
pub use follower::{Follower, MasterLink};
pub use protocol::{ErrorCode, FrameHeader, Message, Request, RequestId, Response, Status};
pub use router::QueryRouter;
pub use write_path::WritePath;
