//! HTTP API Module
//!
//! JSON status endpoints for operators and the `status` CLI command.

mod http;

pub use http::{AppState, ClusterInfoResponse, HealthResponse, HttpServer, StatusResponse};
