//! HTTP API Server
//!
//! Read-only status, health and cluster views of this node.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::backlog::{Backlog, Seq};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::executor::QueryExecutor;
use crate::replication::{CoordinatorState, FanOut, ReplicationCoordinator};
use crate::state::{ClusterMembership, ClusterNode, ClusterSummary};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    pub coordinator: Arc<ReplicationCoordinator>,
    pub membership: Arc<ClusterMembership>,
    pub backlog: Arc<Backlog>,
    pub fanout: Arc<FanOut>,
    pub executor: Arc<dyn QueryExecutor>,
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .route("/cluster", get(handle_cluster_info))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server, returning on shutdown
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);
        let app = Self::create_router(Arc::clone(&self.state));

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub address: String,
    pub state: CoordinatorState,
    pub is_master: bool,
    pub master: Option<String>,
    /// Backlog high-water mark
    pub sequence_number: Seq,
    /// Followers receiving pushes from this node
    pub subscribers: usize,
    pub uptime_seconds: u64,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub state: CoordinatorState,
}

/// Cluster info response
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterInfoResponse {
    pub summary: ClusterSummary,
    pub nodes: Vec<ClusterNode>,
}

// ============ Handlers ============

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coordinator_state = state.coordinator.state();
    Json(StatusResponse {
        node_id: state.node_id.clone(),
        address: state.membership.self_address().to_string(),
        state: coordinator_state,
        is_master: coordinator_state == CoordinatorState::Master,
        master: state.membership.master_address().await,
        sequence_number: state.backlog.sequence_number(),
        subscribers: state.fanout.subscriber_count(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = match state.executor.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            tracing::warn!("Database health check failed: {}", e);
            false
        }
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            healthy,
            node_id: state.node_id.clone(),
            state: state.coordinator.state(),
        }),
    )
}

async fn handle_cluster_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.membership.summary().await;
    let mut nodes = state.membership.peers().await;
    if let Some(self_node) = state.membership.get_node(state.membership.self_address()).await {
        nodes.insert(0, self_node);
    }

    Json(ClusterInfoResponse { summary, nodes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use crate::replication::CoordinatorConfig;

    #[tokio::test]
    async fn test_status_endpoints() {
        let membership = Arc::new(ClusterMembership::new("127.0.0.1:7071".into()));
        membership.add_peer("127.0.0.1:7072".into()).await;
        let backlog = Arc::new(Backlog::in_memory().unwrap());
        let executor: Arc<dyn QueryExecutor> = Arc::new(RecordingExecutor::new());
        let coordinator = Arc::new(ReplicationCoordinator::new(
            CoordinatorConfig::default(),
            membership.clone(),
            backlog.clone(),
            executor.clone(),
        ));

        let server = HttpServer::new(
            ApiConfig::default(),
            AppState {
                node_id: "node-1".into(),
                coordinator,
                membership,
                backlog,
                fanout: FanOut::new(),
                executor,
                started_at: Instant::now(),
            },
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

        let status: StatusResponse = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.node_id, "node-1");
        assert_eq!(status.state, CoordinatorState::Discovering);
        assert!(!status.is_master);
        assert_eq!(status.sequence_number, 0);

        let health = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(health.status().as_u16(), 200);
        let health: HealthResponse = health.json().await.unwrap();
        assert!(health.healthy);

        let cluster: ClusterInfoResponse = reqwest::get(format!("{}/cluster", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cluster.summary.total_nodes, 2);
        assert_eq!(cluster.nodes[0].address, "127.0.0.1:7071");
        assert_eq!(cluster.nodes[1].address, "127.0.0.1:7072");

        shutdown_tx.send(true).unwrap();
        serving.await.unwrap().unwrap();
    }
}
