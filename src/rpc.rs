//! RPC message set and the abstract client transport.
//!
//! The network itself is an external collaborator; the core only consumes
//! the contract below: send a typed request to an endpoint with a required
//! positive deadline, get a typed response back. `ChannelClientService`
//! provides the in-process implementation used by multi-node tests: every
//! node owns an inbound channel, and [`RpcCall`]s carry a oneshot for the
//! reply.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{RaftError, Result};
use crate::types::{Endpoint, LogEntry, PeerId, SnapshotMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub group_id: String,
    pub server_id: PeerId,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub group_id: String,
    pub server_id: PeerId,
    pub term: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub committed_index: u64,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Follower's last index: the back-off hint on conflict.
    pub last_log_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub group_id: String,
    pub server_id: PeerId,
    pub term: u64,
    pub meta: SnapshotMeta,
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadIndexRequest {
    pub group_id: String,
    pub server_id: PeerId,
    /// One opaque context per batched waiter.
    pub entries: Vec<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadIndexResponse {
    /// Leader's commit index at the moment the read was served; shared by
    /// every waiter in the batch.
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub group_id: String,
    pub server_id: PeerId,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub send_timestamp_ms: u64,
}

/// Universal error envelope; `code == 0` means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub msg: String,
}

impl ErrorResponse {
    pub fn success() -> Self {
        Self {
            code: 0,
            msg: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

impl From<RaftError> for ErrorResponse {
    fn from(err: RaftError) -> Self {
        Self {
            code: err.code(),
            msg: err.to_string(),
        }
    }
}

impl From<ErrorResponse> for RaftError {
    fn from(resp: ErrorResponse) -> Self {
        RaftError::from_code(resp.code, resp.msg)
    }
}

/// Tagged union of every request the core sends or serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    ReadIndex(ReadIndexRequest),
    TimeoutNow(TimeoutNowRequest),
    Ping(PingRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    ReadIndex(ReadIndexResponse),
    TimeoutNow(TimeoutNowResponse),
    Error(ErrorResponse),
}

impl RpcResponse {
    /// Unwrap into a typed result, mapping the error envelope back.
    fn expect_kind<T>(self, pick: impl FnOnce(RpcResponse) -> Option<T>) -> Result<T> {
        if let RpcResponse::Error(err) = self {
            return Err(err.into());
        }
        pick(self).ok_or_else(|| RaftError::Transport("mismatched response kind".to_string()))
    }
}

/// One in-flight call on the in-process transport.
#[derive(Debug)]
pub struct RpcCall {
    pub request: RpcRequest,
    pub reply: oneshot::Sender<RpcResponse>,
}

pub type RpcSender = mpsc::Sender<RpcCall>;
pub type RpcReceiver = mpsc::Receiver<RpcCall>;

/// Abstract typed transport consumed by the core.
#[async_trait]
pub trait ClientService: Send + Sync {
    /// Send a request and await the typed response within `timeout`.
    /// Expiry surfaces as [`RaftError::Timeout`].
    async fn invoke(
        &self,
        endpoint: &Endpoint,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse>;

    /// Ping round-trip; true when the peer answered in time.
    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> bool;

    fn check_connection(&self, endpoint: &Endpoint) -> bool;

    async fn disconnect(&self, endpoint: &Endpoint) -> bool;
}

/// Typed convenience wrappers over [`ClientService::invoke`].
pub struct RaftClient;

impl RaftClient {
    pub async fn request_vote(
        client: &dyn ClientService,
        endpoint: &Endpoint,
        request: RequestVoteRequest,
        timeout: Duration,
    ) -> Result<RequestVoteResponse> {
        client
            .invoke(endpoint, RpcRequest::RequestVote(request), timeout)
            .await?
            .expect_kind(|r| match r {
                RpcResponse::RequestVote(r) => Some(r),
                _ => None,
            })
    }

    pub async fn append_entries(
        client: &dyn ClientService,
        endpoint: &Endpoint,
        request: AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse> {
        client
            .invoke(endpoint, RpcRequest::AppendEntries(request), timeout)
            .await?
            .expect_kind(|r| match r {
                RpcResponse::AppendEntries(r) => Some(r),
                _ => None,
            })
    }

    pub async fn install_snapshot(
        client: &dyn ClientService,
        endpoint: &Endpoint,
        request: InstallSnapshotRequest,
        timeout: Duration,
    ) -> Result<InstallSnapshotResponse> {
        client
            .invoke(endpoint, RpcRequest::InstallSnapshot(request), timeout)
            .await?
            .expect_kind(|r| match r {
                RpcResponse::InstallSnapshot(r) => Some(r),
                _ => None,
            })
    }

    pub async fn read_index(
        client: &dyn ClientService,
        endpoint: &Endpoint,
        request: ReadIndexRequest,
        timeout: Duration,
    ) -> Result<ReadIndexResponse> {
        client
            .invoke(endpoint, RpcRequest::ReadIndex(request), timeout)
            .await?
            .expect_kind(|r| match r {
                RpcResponse::ReadIndex(r) => Some(r),
                _ => None,
            })
    }

    pub async fn timeout_now(
        client: &dyn ClientService,
        endpoint: &Endpoint,
        request: TimeoutNowRequest,
        timeout: Duration,
    ) -> Result<TimeoutNowResponse> {
        client
            .invoke(endpoint, RpcRequest::TimeoutNow(request), timeout)
            .await?
            .expect_kind(|r| match r {
                RpcResponse::TimeoutNow(r) => Some(r),
                _ => None,
            })
    }
}

/// In-process transport: endpoints map to bounded channels.
///
/// Removing a peer simulates a partition: subsequent invokes fail with a
/// transport error, exactly like a refused connection.
pub struct ChannelClientService {
    peers: RwLock<HashMap<Endpoint, RpcSender>>,
}

impl ChannelClientService {
    pub fn new(peers: HashMap<Endpoint, RpcSender>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    pub fn add_peer(&self, endpoint: Endpoint, sender: RpcSender) {
        self.peers.write().insert(endpoint, sender);
    }

    pub fn remove_peer(&self, endpoint: &Endpoint) {
        self.peers.write().remove(endpoint);
    }

    fn sender(&self, endpoint: &Endpoint) -> Result<RpcSender> {
        self.peers
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| RaftError::Transport(format!("no route to {endpoint}")))
    }
}

impl Default for ChannelClientService {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

#[async_trait]
impl ClientService for ChannelClientService {
    async fn invoke(
        &self,
        endpoint: &Endpoint,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let sender = self.sender(endpoint)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(RpcCall {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::Transport(format!("{endpoint} closed its inbox")))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RaftError::Transport(format!(
                "{endpoint} dropped the reply"
            ))),
            Err(_) => Err(RaftError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> bool {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let request = RpcRequest::Ping(PingRequest {
            send_timestamp_ms: now_ms,
        });
        matches!(
            self.invoke(endpoint, request, timeout).await,
            Ok(RpcResponse::Error(resp)) if resp.is_success()
        )
    }

    fn check_connection(&self, endpoint: &Endpoint) -> bool {
        self.peers.read().contains_key(endpoint)
    }

    async fn disconnect(&self, endpoint: &Endpoint) -> bool {
        self.peers.write().remove(endpoint).is_some()
    }
}
