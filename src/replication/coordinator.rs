//! Replication Coordinator
//!
//! Decides whether this node is master or follower and drives the
//! follower through catch-up and live replication. States:
//!
//! - `Discovering`: ask peers for a master
//! - `FollowerSyncing`: paging the master's backlog
//! - `FollowerLive`: applying pushed writes
//! - `Master`: owns the write path
//!
//! A lost master connection returns to `Discovering`. There is no
//! automatic failover: a node only promotes itself when every configured
//! peer answered, none of them knows a master, and this node's advertised
//! address sorts below every address the peers report for themselves.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};

use super::follower::Follower;
use crate::backlog::Backlog;
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::executor::QueryExecutor;
use crate::network::GatewayClient;
use crate::state::ClusterMembership;

/// Replication state of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CoordinatorState {
    Discovering,
    FollowerSyncing,
    FollowerLive,
    Master,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Discovering => write!(f, "DISCOVERING"),
            CoordinatorState::FollowerSyncing => write!(f, "FOLLOWER_SYNCING"),
            CoordinatorState::FollowerLive => write!(f, "FOLLOWER_LIVE"),
            CoordinatorState::Master => write!(f, "MASTER"),
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Become master without probing peers
    pub bootstrap: bool,
    /// Delay between discovery rounds
    pub discovery_retry: Duration,
    /// Period of peer health checks
    pub health_interval: Duration,
    /// Timeout for opening a peer connection
    pub connect_timeout: Duration,
    /// Timeout for a single peer request
    pub request_timeout: Duration,
    /// Pushes buffered while catching up
    pub push_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            discovery_retry: Duration::from_secs(5),
            health_interval: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            push_buffer: 4096,
        }
    }
}

impl CoordinatorConfig {
    /// Settings from the operator configuration
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            bootstrap: config.cluster.bootstrap,
            discovery_retry: config.discovery_retry(),
            health_interval: config.health_check_interval(),
            connect_timeout: config.peer_connect_timeout(),
            request_timeout: config.peer_request_timeout(),
            push_buffer: config.gateway.subscriber_buffer,
        }
    }
}

/// Where a write statement should go
pub enum WriteRoute {
    /// This node is master
    Local,
    /// Forward over the master link
    Forward(Arc<GatewayClient>),
    /// No master reachable
    Unavailable,
}

/// Outcome of one discovery round
#[derive(Debug, Clone, PartialEq, Eq)]
enum Discovery {
    Master,
    Follow(String),
    Retry,
}

/// What a peer said about itself
#[derive(Debug, Clone)]
struct PeerReport {
    /// Address the peer advertises for itself
    address: String,
    /// Master the peer knows of
    master: Option<String>,
}

impl PeerReport {
    fn claims_master(&self) -> bool {
        self.master.as_deref() == Some(self.address.as_str())
    }
}

/// Drives the node's replication role
pub struct ReplicationCoordinator {
    config: CoordinatorConfig,
    membership: Arc<ClusterMembership>,
    backlog: Arc<Backlog>,
    executor: Arc<dyn QueryExecutor>,
    state_tx: watch::Sender<CoordinatorState>,
    master_link: RwLock<Option<Arc<GatewayClient>>>,
}

impl ReplicationCoordinator {
    /// Create a new coordinator in the `Discovering` state
    pub fn new(
        config: CoordinatorConfig,
        membership: Arc<ClusterMembership>,
        backlog: Arc<Backlog>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        let (state_tx, _) = watch::channel(CoordinatorState::Discovering);
        Self {
            config,
            membership,
            backlog,
            executor,
            state_tx,
            master_link: RwLock::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> CoordinatorState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    /// Cluster membership used for discovery
    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// Run until shutdown. Returns an error only for a desync, which
    /// needs manual re-synchronization.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            self.set_state(CoordinatorState::Discovering);
            let discovery = tokio::select! {
                d = self.discover() => d,
                _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            };

            match discovery {
                Discovery::Master => {
                    self.become_master().await;
                    wait_for_shutdown(&mut shutdown).await;
                    return Ok(());
                }
                Discovery::Follow(master) => {
                    let result = tokio::select! {
                        r = self.follow(&master) => r,
                        _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                    };
                    match result {
                        Err(e) if e.is_desync() => {
                            tracing::error!(
                                "Replication from {} stopped: {}. Manual re-sync required",
                                master,
                                e
                            );
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::warn!("Lost master {}: {}", master, e);
                        }
                        Ok(()) => {}
                    }
                    self.membership.set_master(None).await;
                    self.set_state(CoordinatorState::Discovering);
                }
                Discovery::Retry => {
                    tracing::info!(
                        "No master found, retrying in {}ms",
                        self.config.discovery_retry.as_millis()
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.discovery_retry) => {}
                _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            }
        }
    }

    /// Where a write should be sent right now
    pub async fn write_route(&self) -> WriteRoute {
        if self.state() == CoordinatorState::Master {
            return WriteRoute::Local;
        }
        match self.master_link.read().await.as_ref() {
            Some(client) if !client.is_closed() => WriteRoute::Forward(Arc::clone(client)),
            _ => WriteRoute::Unavailable,
        }
    }

    /// Health-check peers every `health_interval` until shutdown
    pub async fn run_health_checks(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.health_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_peers().await;
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
    }

    /// One round of peer health checks. Results are informational only;
    /// returns the peers that claim to be master while this node is.
    pub async fn check_peers(&self) -> Vec<String> {
        self.membership.refresh_unresolved().await;
        let is_master = self.state() == CoordinatorState::Master;
        let mut rivals = Vec::new();

        for address in self.membership.peer_addresses().await {
            match self.survey(&address).await {
                Ok(report) => {
                    self.membership.record_health(&address, true).await;
                    if is_master && report.claims_master() {
                        tracing::warn!(
                            "Split-brain: peer {} ({}) also claims to be master",
                            address,
                            report.address
                        );
                        rivals.push(address);
                    }
                }
                Err(e) => {
                    self.membership.record_health(&address, false).await;
                    tracing::warn!("Health check of {} failed: {}", address, e);
                }
            }
        }
        rivals
    }

    async fn discover(&self) -> Discovery {
        let peers = self.membership.peer_addresses().await;
        if self.config.bootstrap || peers.is_empty() {
            return Discovery::Master;
        }

        let self_address = self.membership.self_address().to_string();
        let mut reports = Vec::new();
        let mut candidates = Vec::new();

        for address in &peers {
            match self.survey(address).await {
                Ok(report) => {
                    self.membership.record_health(address, true).await;
                    if let Some(master) = &report.master {
                        if *master != self_address && !candidates.contains(master) {
                            candidates.push(master.clone());
                        }
                    }
                    reports.push(report);
                }
                Err(e) => {
                    self.membership.record_health(address, false).await;
                    tracing::debug!("Peer {} unreachable during discovery: {}", address, e);
                }
            }
        }

        for candidate in candidates {
            match self.survey(&candidate).await {
                Ok(report) if report.claims_master() => {
                    tracing::info!("Found master {}", candidate);
                    return Discovery::Follow(candidate);
                }
                Ok(_) => {
                    tracing::debug!("{} was reported as master but does not claim it", candidate);
                }
                Err(e) => {
                    tracing::debug!("Reported master {} unreachable: {}", candidate, e);
                }
            }
        }

        if reports.len() < peers.len() {
            return Discovery::Retry;
        }
        // Compare advertised addresses, which every node sees the same way
        if let Some(twin) = reports.iter().find(|r| r.address == self_address) {
            tracing::warn!("A peer advertises this node's own address {}", twin.address);
            return Discovery::Retry;
        }
        if reports.iter().all(|r| self_address < r.address) {
            Discovery::Master
        } else {
            Discovery::Retry
        }
    }

    async fn become_master(&self) {
        self.membership
            .set_master(Some(self.membership.self_address()))
            .await;
        self.set_state(CoordinatorState::Master);
        tracing::info!(
            "Acting as master at sequence {}",
            self.backlog.sequence_number()
        );
    }

    async fn follow(&self, master: &str) -> Result<()> {
        self.set_state(CoordinatorState::FollowerSyncing);
        self.membership.set_master(Some(master)).await;

        let (push_tx, push_rx) = mpsc::channel(self.config.push_buffer);
        let client = Arc::new(
            GatewayClient::connect(
                master,
                self.config.connect_timeout,
                self.config.request_timeout,
                Some(push_tx),
            )
            .await?,
        );

        // Subscribe first so writes committed during catch-up are buffered
        let high_water = client.subscribe().await?;
        tracing::info!(
            "Following {} (master at {}, local at {})",
            master,
            high_water,
            self.backlog.sequence_number()
        );
        *self.master_link.write().await = Some(Arc::clone(&client));

        let follower = Follower::new(Arc::clone(&self.executor), Arc::clone(&self.backlog));
        let result = follower
            .run(&*client, push_rx, |applied| {
                tracing::info!("Live replication from {} at sequence {}", master, applied);
                self.set_state(CoordinatorState::FollowerLive);
            })
            .await;

        *self.master_link.write().await = None;
        result
    }

    async fn survey(&self, address: &str) -> Result<PeerReport> {
        let client = self.connect(address).await?;
        let advertised = client.get_status().await?;
        let master = client.get_master().await?;
        Ok(PeerReport {
            address: advertised,
            master,
        })
    }

    async fn connect(&self, address: &str) -> Result<GatewayClient> {
        GatewayClient::connect(
            address,
            self.config.connect_timeout,
            self.config.request_timeout,
            None,
        )
        .await
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!("Replication state {} -> {}", previous, state);
        }
    }
}

/// Resolve once shutdown is signalled. Never resolves if the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
