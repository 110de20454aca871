//! Gateway Protocol
//!
//! Defines the wire protocol spoken between clients, followers and the
//! gateway: id-tagged request/response pairs plus unsolicited `Query`
//! pushes from the master to subscribed followers.

use serde::{Deserialize, Serialize};

use crate::backlog::{BacklogEntry, Seq};
use crate::error::Error;
use crate::executor::QueryResult;

/// Request identifier, chosen by the caller and echoed in the response
pub type RequestId = u64;

/// Top-level frame payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Request from client or follower
    Request { id: RequestId, request: Request },

    /// Response to the request with the same id
    Response { id: RequestId, response: Response },

    /// Newly committed write, pushed by the master
    Query(BacklogEntry),
}

/// Requests understood by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Liveness check
    GetStatus,

    /// Caller's address as seen by the gateway
    GetMyIp,

    /// Address of the current master
    GetMaster,

    /// Up to one page of backlog entries after `from_sequence`
    GetBackLog { from_sequence: Seq },

    /// Execute a statement, replicating it if it is a write
    WriteQuery {
        statement: String,
        session: Option<String>,
    },

    /// Register this connection for `Query` pushes
    Subscribe,

    /// Current login phrase to sign
    GetLoginPhrase,

    /// Exchange a signed login phrase for a session token
    Login { phrase: String, signature: String },

    /// Invalidate a session token
    Logout { token: String },
}

impl Request {
    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::GetStatus => "getStatus",
            Request::GetMyIp => "getMyIp",
            Request::GetMaster => "getMaster",
            Request::GetBackLog { .. } => "getBackLog",
            Request::WriteQuery { .. } => "writeQuery",
            Request::Subscribe => "subscribe",
            Request::GetLoginPhrase => "getLoginPhrase",
            Request::Login { .. } => "login",
            Request::Logout { .. } => "logout",
        }
    }
}

/// Response status field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Success,
    Error,
}

/// Responses sent by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Answer to `GetStatus`, carrying the address the node advertises for itself
    Status { status: Status, address: String },

    /// Answer to `GetMyIp` and `GetMaster`
    Address { status: Status, message: String },

    /// Answer to `GetBackLog`
    BackLog {
        status: Status,
        /// Master's high-water mark when the page was read
        sequence_number: Seq,
        records: Vec<BacklogEntry>,
    },

    /// Answer to `WriteQuery`. Reads carry no sequence number.
    Query {
        status: Status,
        sequence_number: Option<Seq>,
        result: QueryResult,
    },

    /// Answer to `Subscribe`
    Subscribed { status: Status, sequence_number: Seq },

    /// Answer to `GetLoginPhrase`
    LoginPhrase { status: Status, phrase: String },

    /// Answer to `Login`
    Session { status: Status, token: String },

    /// Answer to `Logout`
    LoggedOut { status: Status },

    /// Any failed request
    Error {
        status: Status,
        code: ErrorCode,
        message: String,
    },
}

impl Response {
    /// Build an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            status: Status::Error,
            code,
            message: message.into(),
        }
    }

    /// Status carried by the response
    pub fn status(&self) -> Status {
        match self {
            Response::Status { status, .. }
            | Response::Address { status, .. }
            | Response::BackLog { status, .. }
            | Response::Query { status, .. }
            | Response::Subscribed { status, .. }
            | Response::LoginPhrase { status, .. }
            | Response::Session { status, .. }
            | Response::LoggedOut { status }
            | Response::Error { status, .. } => *status,
        }
    }
}

/// Error codes for failed requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Write sent to a node that cannot reach the master
    NotMaster,
    /// No master elected yet
    NoMaster,
    /// Requested backlog position is not available
    Desync { requested: Seq, high_water: Seq },
    /// The database rejected the statement
    Execution,
    /// Login failed
    Unauthorized,
    /// Malformed or unsupported request
    BadRequest,
    /// Anything else
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request { request, .. } => request.type_name(),
            Message::Response { .. } => "response",
            Message::Query(_) => "query",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// CRC32 of the body
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted
    pub const MAX_BODY: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

impl ErrorCode {
    /// Wire code for a local error
    pub fn for_error(error: &Error) -> Self {
        match error {
            Error::NotMaster(_) => ErrorCode::NotMaster,
            Error::NoMaster => ErrorCode::NoMaster,
            Error::Desync { requested, high_water } => ErrorCode::Desync {
                requested: *requested,
                high_water: *high_water,
            },
            Error::QueryExecution(_) | Error::QueryTimeout(_) | Error::Database(_) => {
                ErrorCode::Execution
            }
            Error::Parse { .. } => ErrorCode::BadRequest,
            Error::Unauthorized(_) => ErrorCode::Unauthorized,
            // Forwarding failed because the master is gone
            e if e.is_transport() => ErrorCode::NoMaster,
            _ => ErrorCode::Internal,
        }
    }

    /// Local error for a remote error response
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorCode::NotMaster => Error::NotMaster(message),
            ErrorCode::NoMaster => Error::NoMaster,
            ErrorCode::Desync { requested, high_water } => Error::Desync { requested, high_water },
            ErrorCode::Execution => Error::QueryExecution(message),
            ErrorCode::Unauthorized => Error::Unauthorized(message),
            ErrorCode::BadRequest | ErrorCode::Internal => {
                Error::Internal(format!("remote error: {}", message))
            }
        }
    }
}
