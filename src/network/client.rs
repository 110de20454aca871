//! Gateway Client
//!
//! Persistent connection to a node's gateway. Requests are tagged with an
//! id and may be in flight concurrently; a background reader task routes
//! responses back to their callers and forwards `Query` pushes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{is_eof, read_message, write_message};
use crate::backlog::{BacklogEntry, BacklogPage, Seq};
use crate::error::{Error, Result};
use crate::executor::QueryResult;
use crate::import::StatementSink;
use crate::replication::{MasterLink, Message, Request, RequestId, Response};

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Response>>>>;

/// Reply to a `writeQuery`
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Sequence number assigned to a replicated write, `None` for reads
    pub sequence_number: Option<Seq>,
    /// Engine result
    pub result: QueryResult,
}

/// Client for one gateway connection
pub struct GatewayClient {
    address: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
    session: tokio::sync::RwLock<Option<String>>,
    reader_task: JoinHandle<()>,
}

impl GatewayClient {
    /// Connect to a gateway.
    ///
    /// Pushes are delivered to `pushes` if given. A push that does not fit
    /// in the channel closes the connection.
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
        pushes: Option<mpsc::Sender<BacklogEntry>>,
    ) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            address.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
            pushes,
        ));

        tracing::debug!("Connected to gateway at {}", address);

        Ok(Self {
            address: address.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            closed,
            session: tokio::sync::RwLock::new(None),
            reader_task,
        })
    }

    /// Gateway address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the connection has ended
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Liveness check; returns the address the node advertises for itself
    pub async fn get_status(&self) -> Result<String> {
        match self.request(Request::GetStatus).await? {
            Response::Status { address, .. } => Ok(address),
            other => Err(unexpected("getStatus", &other)),
        }
    }

    /// This client's address as seen by the gateway
    pub async fn get_my_ip(&self) -> Result<String> {
        match self.request(Request::GetMyIp).await? {
            Response::Address { message, .. } => Ok(message),
            other => Err(unexpected("getMyIp", &other)),
        }
    }

    /// Master address known to the gateway, if any
    pub async fn get_master(&self) -> Result<Option<String>> {
        match self.request(Request::GetMaster).await? {
            Response::Address { message, .. } if message.is_empty() => Ok(None),
            Response::Address { message, .. } => Ok(Some(message)),
            other => Err(unexpected("getMaster", &other)),
        }
    }

    /// One page of backlog entries after `from_sequence`
    pub async fn get_backlog(&self, from_sequence: Seq) -> Result<BacklogPage> {
        match self.request(Request::GetBackLog { from_sequence }).await? {
            Response::BackLog {
                sequence_number,
                records,
                ..
            } => Ok(BacklogPage {
                sequence_number,
                records,
            }),
            other => Err(unexpected("getBackLog", &other)),
        }
    }

    /// Register for pushes; returns the master's high-water mark at subscription
    pub async fn subscribe(&self) -> Result<Seq> {
        match self.request(Request::Subscribe).await? {
            Response::Subscribed {
                sequence_number, ..
            } => Ok(sequence_number),
            other => Err(unexpected("subscribe", &other)),
        }
    }

    /// Send a statement through the gateway's write path
    pub async fn write_query(&self, statement: &str) -> Result<WriteOutcome> {
        let session = self.session.read().await.clone();
        let request = Request::WriteQuery {
            statement: statement.to_string(),
            session,
        };
        match self.request(request).await? {
            Response::Query {
                sequence_number,
                result,
                ..
            } => Ok(WriteOutcome {
                sequence_number,
                result,
            }),
            other => Err(unexpected("writeQuery", &other)),
        }
    }

    /// Current login phrase to sign
    pub async fn get_login_phrase(&self) -> Result<String> {
        match self.request(Request::GetLoginPhrase).await? {
            Response::LoginPhrase { phrase, .. } => Ok(phrase),
            other => Err(unexpected("getLoginPhrase", &other)),
        }
    }

    /// Log in with a signed phrase. The session is attached to later writes.
    pub async fn login(&self, phrase: &str, signature: &str) -> Result<String> {
        let request = Request::Login {
            phrase: phrase.to_string(),
            signature: signature.to_string(),
        };
        match self.request(request).await? {
            Response::Session { token, .. } => {
                *self.session.write().await = Some(token.clone());
                Ok(token)
            }
            other => Err(unexpected("login", &other)),
        }
    }

    /// End the current session
    pub async fn logout(&self) -> Result<()> {
        let Some(token) = self.session.write().await.take() else {
            return Ok(());
        };
        match self.request(Request::Logout { token }).await? {
            Response::LoggedOut { .. } => Ok(()),
            other => Err(unexpected("logout", &other)),
        }
    }

    /// Send a request and wait for its response
    async fn request(&self, request: Request) -> Result<Response> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if self.is_closed() {
            // The reader may have cleared pending before the insert
            lock(&self.pending).remove(&id);
            return Err(Error::ConnectionClosed);
        }

        tracing::trace!("-> {} #{} to {}", request.type_name(), id, self.address);
        let message = Message::Request { id, request };
        let sent = {
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, &message).await
        };
        if let Err(e) = sent {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        let response = match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(Error::ConnectionTimeout(self.address.clone()));
            }
        };

        match response {
            Response::Error { code, message, .. } => Err(code.into_error(message)),
            response => Ok(response),
        }
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl MasterLink for GatewayClient {
    async fn fetch_backlog(&self, from: Seq) -> Result<BacklogPage> {
        self.get_backlog(from).await
    }
}

#[async_trait]
impl StatementSink for GatewayClient {
    async fn submit(&self, statement: &str) -> Result<()> {
        self.write_query(statement).await.map(|_| ())
    }
}

async fn read_loop(
    address: String,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    pending: Pending,
    closed: Arc<AtomicBool>,
    pushes: Option<mpsc::Sender<BacklogEntry>>,
) {
    loop {
        match read_message(&mut reader).await {
            Ok(Message::Response { id, response }) => {
                if let Some(tx) = lock(&pending).remove(&id) {
                    let _ = tx.send(response);
                } else {
                    tracing::debug!("Dropping response #{} from {} with no waiter", id, address);
                }
            }
            Ok(Message::Query(entry)) => {
                let Some(pushes) = &pushes else {
                    tracing::warn!("Unexpected push from {}", address);
                    continue;
                };
                if pushes.try_send(entry).is_err() {
                    tracing::warn!("Push buffer for {} full or closed, disconnecting", address);
                    break;
                }
            }
            Ok(other) => {
                tracing::warn!("Unexpected {} message from {}", other.type_name(), address);
            }
            Err(e) => {
                if is_eof(&e) {
                    tracing::debug!("Gateway {} closed the connection", address);
                } else {
                    tracing::warn!("Connection to {} failed: {}", address, e);
                }
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Waiters see their sender dropped and fail with ConnectionClosed
    lock(&pending).clear();
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Response>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unexpected(request: &str, response: &Response) -> Error {
    Error::Network(format!(
        "Unexpected response to {}: {:?}",
        request,
        response.status()
    ))
}
