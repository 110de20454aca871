//! Cluster Gateway
//!
//! TCP server for clients, peers and followers. Each connection carries
//! id-tagged requests that are answered independently, so a slow
//! statement does not hold up other requests. Followers that subscribe
//! also receive every committed write on the same connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{is_eof, read_message, write_message};
use crate::auth::{AllowList, IdentityService};
use crate::backlog::{Backlog, BacklogEntry};
use crate::error::{Error, Result};
use crate::replication::{
    ErrorCode, FanOut, Message, QueryRouter, Request, RequestId, Response, Status,
};
use crate::state::{canonical_ip, ClusterMembership};

/// Everything a connection needs to answer requests
pub struct GatewayContext {
    pub router: Arc<QueryRouter>,
    pub backlog: Arc<Backlog>,
    pub membership: Arc<ClusterMembership>,
    pub fanout: Arc<FanOut>,
    pub identity: Arc<IdentityService>,
    pub allow_list: AllowList,
    /// Require a login session for `writeQuery` from non-peers
    pub require_session: bool,
    /// Entries per `getBackLog` page
    pub page_size: usize,
    /// Pushes buffered per subscriber
    pub subscriber_buffer: usize,
}

impl GatewayContext {
    /// Whether a connection from `ip` may be served
    async fn admits(&self, ip: IpAddr) -> bool {
        self.allow_list.allows(ip) || self.membership.is_peer_ip(ip).await
    }
}

/// Gateway server
pub struct ClusterGateway {
    bind_address: String,
    ctx: Arc<GatewayContext>,
    shutdown: watch::Sender<bool>,
}

impl ClusterGateway {
    /// Create a new gateway
    pub fn new(bind_address: String, ctx: GatewayContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_address,
            ctx: Arc::new(ctx),
            shutdown,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Cluster gateway listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => self.admit(socket, addr).await,
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Cluster gateway stopped");
        Ok(())
    }

    /// Stop accepting connections
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn admit(&self, socket: TcpStream, addr: SocketAddr) {
        let ip = canonical_ip(addr.ip());
        if !self.ctx.admits(ip).await {
            // Dropped without reading anything
            tracing::warn!("Rejected connection from {}", addr);
            return;
        }

        tracing::debug!("Accepted connection from {}", addr);
        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, ip, ctx, shutdown).await {
                tracing::warn!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

/// Serve one connection until it closes
async fn handle_connection(
    socket: TcpStream,
    ip: IpAddr,
    ctx: Arc<GatewayContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let (push_tx, mut push_rx) = mpsc::channel::<BacklogEntry>(ctx.subscriber_buffer.max(1));
    let mut push_tx = Some(push_tx);
    let mut subscription = None;

    // Single writer: responses and pushes interleave on one socket
    let mut writer_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                message = out_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                entry = push_rx.recv() => match entry {
                    Some(entry) => Message::Query(entry),
                    // Fan-out dropped this subscriber
                    None => break,
                },
            };
            if let Err(e) = write_message(&mut writer, &message).await {
                tracing::debug!("Write failed: {}", e);
                break;
            }
        }
    });

    let result = loop {
        let message = tokio::select! {
            message = read_message(&mut reader) => message,
            _ = &mut writer_task => break Ok(()),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
                continue;
            }
        };

        let (id, request) = match message {
            Ok(Message::Request { id, request }) => (id, request),
            Ok(other) => {
                tracing::warn!("Unexpected {} message from {}", other.type_name(), ip);
                continue;
            }
            Err(e) if is_eof(&e) => break Ok(()),
            Err(e) => break Err(e),
        };
        tracing::trace!("<- {} #{} from {}", request.type_name(), id, ip);

        match request {
            Request::Subscribe => {
                let is_master = ctx.membership.is_self_master().await;
                let response = match push_tx.take() {
                    Some(sender) if is_master => {
                        // Attach before reading the high-water mark so no write is missed
                        subscription = Some(ctx.fanout.attach(sender));
                        tracing::info!("Follower {} subscribed", ip);
                        Response::Subscribed {
                            status: Status::Success,
                            sequence_number: ctx.backlog.sequence_number(),
                        }
                    }
                    Some(sender) => {
                        push_tx = Some(sender);
                        not_master(&ctx).await
                    }
                    None => Response::error(ErrorCode::BadRequest, "already subscribed"),
                };
                if send(&out_tx, id, response).await.is_err() {
                    break Ok(());
                }
            }
            Request::WriteQuery { statement, session } => {
                if ctx.require_session && !ctx.membership.is_peer_ip(ip).await {
                    let authorized = session
                        .as_deref()
                        .is_some_and(|token| ctx.identity.sessions().verify(token, &ip.to_string()));
                    if !authorized {
                        tracing::warn!("Unauthenticated write from {}, disconnecting", ip);
                        break Ok(());
                    }
                }
                let ctx = Arc::clone(&ctx);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = match ctx.router.route(&statement).await {
                        Ok(outcome) => Response::Query {
                            status: Status::Success,
                            sequence_number: outcome.sequence_number,
                            result: outcome.result,
                        },
                        Err(e) => error_response(&e),
                    };
                    let _ = send(&out_tx, id, response).await;
                });
            }
            request => {
                let ctx = Arc::clone(&ctx);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = handle(&ctx, ip, request).await;
                    let _ = send(&out_tx, id, response).await;
                });
            }
        }
    };

    if let Some(subscription) = subscription {
        subscription.detach();
        tracing::info!("Follower {} unsubscribed", ip);
    }
    writer_task.abort();
    result
}

/// Answer a request that needs no per-connection state
async fn handle(ctx: &GatewayContext, ip: IpAddr, request: Request) -> Response {
    match request {
        Request::GetStatus => Response::Status {
            status: Status::Ok,
            address: ctx.membership.self_address().to_string(),
        },

        Request::GetMyIp => Response::Address {
            status: Status::Success,
            message: ip.to_string(),
        },

        Request::GetMaster => Response::Address {
            status: Status::Success,
            message: ctx.membership.master_address().await.unwrap_or_default(),
        },

        Request::GetBackLog { from_sequence } => {
            match ctx.backlog.page(from_sequence, ctx.page_size).await {
                Ok(page) => Response::BackLog {
                    status: Status::Success,
                    sequence_number: page.sequence_number,
                    records: page.records,
                },
                Err(e) => {
                    tracing::warn!("getBackLog from {} at {} failed: {}", ip, from_sequence, e);
                    error_response(&e)
                }
            }
        }

        Request::GetLoginPhrase => Response::LoginPhrase {
            status: Status::Success,
            phrase: ctx.identity.login_phrase(),
        },

        Request::Login { phrase, signature } => {
            match ctx.identity.login(&phrase, &signature, &ip.to_string()) {
                Ok(token) => Response::Session {
                    status: Status::Success,
                    token,
                },
                Err(e) => {
                    tracing::warn!("Login from {} rejected: {}", ip, e);
                    error_response(&e)
                }
            }
        }

        Request::Logout { token } => {
            ctx.identity.sessions().remove(&token);
            Response::LoggedOut {
                status: Status::Success,
            }
        }

        Request::WriteQuery { .. } | Request::Subscribe => {
            Response::error(ErrorCode::BadRequest, "connection-scoped request")
        }
    }
}

async fn not_master(ctx: &GatewayContext) -> Response {
    match ctx.membership.master_address().await {
        Some(master) => Response::error(ErrorCode::NotMaster, master),
        None => Response::error(ErrorCode::NoMaster, "no master"),
    }
}

fn error_response(error: &Error) -> Response {
    Response::error(ErrorCode::for_error(error), error.to_string())
}

async fn send(out_tx: &mpsc::Sender<Message>, id: RequestId, response: Response) -> Result<()> {
    out_tx
        .send(Message::Response { id, response })
        .await
        .map_err(|_| Error::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::executor::{QueryExecutor, RecordingExecutor};
    use crate::network::GatewayClient;
    use crate::replication::{
        CoordinatorConfig, CoordinatorState, ReplicationCoordinator, WritePath,
    };
    use std::time::Duration;

    struct TestGateway {
        gateway: Arc<ClusterGateway>,
        address: String,
        executor: Arc<RecordingExecutor>,
        backlog: Arc<Backlog>,
        coordinator: Arc<ReplicationCoordinator>,
        shutdown: watch::Sender<bool>,
    }

    impl TestGateway {
        /// Start a gateway on an ephemeral port
        async fn start(master: bool, allow: &[&str], require_session: bool) -> Self {
            let executor = Arc::new(RecordingExecutor::new());
            let backlog = Arc::new(Backlog::in_memory().unwrap());
            let fanout = FanOut::new();

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = listener.local_addr().unwrap().to_string();
            let membership = Arc::new(ClusterMembership::new(address.clone()));

            let dyn_executor: Arc<dyn QueryExecutor> = executor.clone();
            let coordinator = Arc::new(ReplicationCoordinator::new(
                CoordinatorConfig::default(),
                membership.clone(),
                backlog.clone(),
                dyn_executor.clone(),
            ));
            let (shutdown, shutdown_rx) = watch::channel(false);
            if master {
                let running = coordinator.clone();
                tokio::spawn(async move { running.run(shutdown_rx).await });
                coordinator
                    .subscribe_state()
                    .wait_for(|s| *s == CoordinatorState::Master)
                    .await
                    .unwrap();
            }

            let write_path = Arc::new(WritePath::new(dyn_executor.clone(), backlog.clone(), fanout.clone()));
            let ctx = GatewayContext {
                router: Arc::new(QueryRouter::new(dyn_executor, write_path, coordinator.clone())),
                backlog: backlog.clone(),
                membership,
                fanout,
                identity: Arc::new(IdentityService::new(&AuthConfig::default())),
                allow_list: AllowList::new(allow),
                require_session,
                page_size: 100,
                subscriber_buffer: 64,
            };
            let gateway = Arc::new(ClusterGateway::new(address.clone(), ctx));
            let serving = gateway.clone();
            tokio::spawn(async move { serving.serve(listener).await });

            Self {
                gateway,
                address,
                executor,
                backlog,
                coordinator,
                shutdown,
            }
        }

        async fn client(&self, pushes: Option<mpsc::Sender<BacklogEntry>>) -> GatewayClient {
            GatewayClient::connect(
                &self.address,
                Duration::from_secs(2),
                Duration::from_secs(5),
                pushes,
            )
            .await
            .unwrap()
        }
    }

    impl Drop for TestGateway {
        fn drop(&mut self) {
            self.gateway.stop();
            let _ = self.shutdown.send(true);
        }
    }

    #[tokio::test]
    async fn test_basic_requests() {
        let node = TestGateway::start(true, &["127.0.0.1"], false).await;
        let client = node.client(None).await;

        assert_eq!(client.get_status().await.unwrap(), node.address);
        assert_eq!(client.get_my_ip().await.unwrap(), "127.0.0.1");
        assert_eq!(client.get_master().await.unwrap(), Some(node.address.clone()));

        let read = client.write_query("SELECT 1").await.unwrap();
        assert_eq!(read.sequence_number, None);
        assert_eq!(node.backlog.sequence_number(), 0);

        let write = client.write_query("INSERT INTO t VALUES (1)").await.unwrap();
        assert_eq!(write.sequence_number, Some(1));
        assert_eq!(write.result.rows_affected, 1);

        let page = client.get_backlog(0).await.unwrap();
        assert_eq!(page.sequence_number, 1);
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].statement, "INSERT INTO t VALUES (1)");
        assert!(client.get_backlog(1).await.unwrap().records.is_empty());
        assert!(client.get_backlog(5).await.unwrap_err().is_desync());
    }

    #[tokio::test]
    async fn test_backlog_pages_are_capped() {
        let node = TestGateway::start(true, &["127.0.0.1"], false).await;
        let client = node.client(None).await;
        for i in 0..130 {
            client.write_query(&format!("INSERT INTO t VALUES ({})", i)).await.unwrap();
        }

        let first = client.get_backlog(0).await.unwrap();
        assert_eq!(first.sequence_number, 130);
        assert_eq!(first.records.len(), 100);
        let second = client.get_backlog(100).await.unwrap();
        assert_eq!(second.records.len(), 30);
        assert_eq!(second.records[0].sequence_number, 101);
    }

    #[tokio::test]
    async fn test_subscriber_receives_pushes() {
        let node = TestGateway::start(true, &["127.0.0.1"], false).await;
        let writer = node.client(None).await;
        writer.write_query("INSERT INTO t VALUES (1)").await.unwrap();

        let (push_tx, mut push_rx) = mpsc::channel(16);
        let follower = node.client(Some(push_tx)).await;
        assert_eq!(follower.subscribe().await.unwrap(), 1);

        writer.write_query("INSERT INTO t VALUES (2)").await.unwrap();
        writer.write_query("SELECT * FROM t").await.unwrap();
        writer.write_query("INSERT INTO t VALUES (3)").await.unwrap();

        let second = push_rx.recv().await.unwrap();
        let third = push_rx.recv().await.unwrap();
        assert_eq!(second.sequence_number, 2);
        assert_eq!(third.sequence_number, 3);
        assert_eq!(third.statement, "INSERT INTO t VALUES (3)");

        // A connection subscribes once
        assert!(follower.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_write_reported_without_advance() {
        let node = TestGateway::start(true, &["127.0.0.1"], false).await;
        let client = node.client(None).await;

        client.write_query("INSERT INTO t VALUES (1)").await.unwrap();
        // The recording executor accepts everything; an empty statement is rejected by the router
        let err = client.write_query("-- nothing here\n").await.unwrap_err();
        assert!(matches!(err, Error::QueryExecution(_)));
        assert_eq!(node.backlog.sequence_number(), 1);
        assert_eq!(node.executor.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_follower_gateway_without_master() {
        let node = TestGateway::start(false, &["127.0.0.1"], false).await;
        assert_eq!(node.coordinator.state(), CoordinatorState::Discovering);
        let client = node.client(None).await;

        assert_eq!(client.get_master().await.unwrap(), None);
        assert!(matches!(
            client.write_query("INSERT INTO t VALUES (1)").await,
            Err(Error::NoMaster)
        ));
        // Reads are still served locally
        client.write_query("SELECT 1").await.unwrap();
        assert!(client.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn test_disallowed_address_is_dropped() {
        let node = TestGateway::start(true, &["10.9.9.9"], false).await;
        let client = node.client(None).await;

        assert!(client.get_status().await.is_err());
        assert!(node.executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_write_without_session_drops_connection() {
        let node = TestGateway::start(true, &["127.0.0.1"], true).await;
        let client = node.client(None).await;

        // Reads of cluster state need no session
        client.get_status().await.unwrap();
        assert!(client.write_query("INSERT INTO t VALUES (1)").await.is_err());
        assert!(client.get_status().await.is_err());
        assert_eq!(node.backlog.sequence_number(), 0);
    }
}
