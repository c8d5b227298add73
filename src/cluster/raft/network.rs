//! Cluster RPC transport.
//!
//! One TCP transport carries both raft traffic and the replication data path:
//! every frame is `[u32 len][bincode payload]`, a connection carries any
//! number of request/response pairs in order, and clients cache one
//! connection per peer.
//!
//! Message kinds:
//! - raft `AppendEntries`, `Vote` and `InstallSnapshot`;
//! - `ClientWrite`: a metadata proposal forwarded to the raft leader;
//! - `ReplicaFetch`: a follower pulling records from a partition leader.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Raft};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{MetadataCommand, MetadataResponse};
use super::types::{RaftNodeId, TypeConfig};
use crate::cluster::error::{ClusterError, ClusterResult};

/// Largest frame accepted from a peer.
const MAX_RPC_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Retries after the first attempt of one RPC.
const RPC_MAX_RETRIES: u32 = 2;

const RPC_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const RPC_RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Consecutive failed calls before the circuit breaker opens.
const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// How long an open breaker rejects calls before allowing a probe.
const CIRCUIT_BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of hops for a forwarded proposal.
const MAX_FORWARD_HOPS: u8 = 3;

/// Follower request for records of one partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaFetchRequest {
    pub topic: String,
    pub partition: i32,
    pub replica_id: i32,
    /// The follower's log end offset. Doubles as its acknowledgement.
    pub fetch_offset: i64,
    pub max_bytes: usize,
    /// How long the leader may wait for new data before answering empty.
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReplicaFetchResponse {
    /// Kafka error code, 0 on success.
    pub error_code: i16,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub log_end_offset: i64,
    /// Whole record batches starting at `fetch_offset`.
    pub records: Vec<u8>,
}

impl ReplicaFetchResponse {
    pub fn error(code: crate::error::KafkaCode) -> Self {
        Self {
            error_code: code as i16,
            ..Default::default()
        }
    }
}

/// Serves `ReplicaFetch` requests; implemented by the replica manager.
#[async_trait]
pub trait ReplicaFetchService: Send + Sync {
    async fn replica_fetch(&self, request: ReplicaFetchRequest) -> ReplicaFetchResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<RaftNodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// Proposal forwarded from a non-leader. Never forwarded again by the
    /// receiver; `forward_hops` guards against loops anyway.
    ClientWrite {
        command: MetadataCommand,
        forward_hops: u8,
    },
    ReplicaFetch(ReplicaFetchRequest),
}

impl RpcMessage {
    fn kind(&self) -> &'static str {
        match self {
            RpcMessage::AppendEntries(_) => "append_entries",
            RpcMessage::Vote(_) => "vote",
            RpcMessage::InstallSnapshot(_) => "install_snapshot",
            RpcMessage::ClientWrite { .. } => "client_write",
            RpcMessage::ReplicaFetch(_) => "replica_fetch",
        }
    }
}

/// Structured RPC error that preserves retry semantics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// This node is not the raft leader. Carries the leader if known.
    NotLeader { leader_hint: Option<RaftNodeId> },
    ForwardLoopDetected,
    /// The request can never succeed as sent.
    InvalidRequest,
    Internal,
    Timeout,
}

impl RpcErrorKind {
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcErrorKind::NotLeader { .. } | RpcErrorKind::Internal | RpcErrorKind::Timeout => {
                true
            }
            RpcErrorKind::ForwardLoopDetected | RpcErrorKind::InvalidRequest => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcErrorInfo {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::new(RpcErrorKind::Internal, e.to_string())
    }
}

impl From<&ClusterError> for RpcErrorInfo {
    fn from(e: &ClusterError) -> Self {
        let kind = match e {
            ClusterError::NotLeader { leader_id, .. } => RpcErrorKind::NotLeader {
                leader_hint: *leader_id,
            },
            ClusterError::NoLeader => RpcErrorKind::NotLeader { leader_hint: None },
            ClusterError::ProposalTimeout => RpcErrorKind::Timeout,
            _ => RpcErrorKind::Internal,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<RpcErrorInfo> for ClusterError {
    fn from(info: RpcErrorInfo) -> Self {
        match info.kind {
            RpcErrorKind::NotLeader { leader_hint } => ClusterError::NotLeader {
                leader_id: leader_hint,
                leader_addr: None,
            },
            RpcErrorKind::Timeout => ClusterError::ProposalTimeout,
            RpcErrorKind::Internal => ClusterError::Raft(info.message),
            RpcErrorKind::ForwardLoopDetected | RpcErrorKind::InvalidRequest => {
                ClusterError::Rpc(info.message)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    AppendEntries(AppendEntriesResponse<RaftNodeId>),
    Vote(VoteResponse<RaftNodeId>),
    InstallSnapshot(InstallSnapshotResponse<RaftNodeId>),
    ClientWrite(MetadataResponse),
    ReplicaFetch(ReplicaFetchResponse),
    Error(RpcErrorInfo),
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> std::io::Result<()> {
    let data = bincode::serialize(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await
}

/// Read one frame. `Ok(None)` on a clean end of stream.
async fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut TcpStream,
) -> std::io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RPC_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("RPC frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    bincode::deserialize(&buf)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Circuit breaker state for a peer.
struct CircuitBreakerState {
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_time: None,
        }
    }

    fn is_open(&self) -> bool {
        self.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD
            && self
                .last_failure_time
                .is_some_and(|t| t.elapsed() < CIRCUIT_BREAKER_RESET_TIMEOUT)
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure_time = None;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure_time = Some(Instant::now());
    }
}

/// Client for one peer with connection reuse, retries and a circuit breaker.
pub struct RpcClient {
    target_addr: String,
    timeout: Duration,
    cached_conn: Mutex<Option<TcpStream>>,
    circuit_breaker: Mutex<CircuitBreakerState>,
}

impl RpcClient {
    /// `timeout` bounds connecting and each request/response exchange.
    pub fn new(target_addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target_addr: target_addr.into(),
            timeout,
            cached_conn: Mutex::new(None),
            circuit_breaker: Mutex::new(CircuitBreakerState::new()),
        }
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }

    /// Send a message, retrying transport failures with jittered backoff.
    pub async fn call(&self, message: &RpcMessage) -> std::io::Result<RpcResponse> {
        {
            let cb = self.circuit_breaker.lock().await;
            if cb.is_open() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!(
                        "circuit breaker open for {} ({} consecutive failures)",
                        self.target_addr, cb.consecutive_failures
                    ),
                ));
            }
        }

        let mut last_error = None;
        for attempt in 0..=RPC_MAX_RETRIES {
            if attempt > 0 {
                let delay = std::cmp::min(
                    RPC_RETRY_BASE_DELAY * (1 << (attempt - 1)),
                    RPC_RETRY_MAX_DELAY,
                );
                let jitter = 0.75 + fastrand::f64() * 0.5;
                tokio::time::sleep(delay.mul_f64(jitter)).await;
            }

            match self.try_call(message).await {
                Ok(response) => {
                    self.circuit_breaker.lock().await.record_success();
                    return Ok(response);
                }
                Err(e) => {
                    debug!(
                        target = %self.target_addr,
                        rpc = message.kind(),
                        attempt,
                        error = %e,
                        "RPC attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let mut cb = self.circuit_breaker.lock().await;
        cb.record_failure();
        if cb.consecutive_failures == CIRCUIT_BREAKER_THRESHOLD {
            warn!(
                target = %self.target_addr,
                consecutive_failures = cb.consecutive_failures,
                "Circuit breaker opened"
            );
        }
        Err(last_error.unwrap_or_else(|| std::io::Error::other("RPC failed")))
    }

    async fn try_call(&self, message: &RpcMessage) -> std::io::Result<RpcResponse> {
        let mut guard = self.cached_conn.lock().await;
        if let Some(stream) = guard.as_mut() {
            match self.exchange(stream, message).await {
                Ok(response) => return Ok(response),
                Err(_) => *guard = None,
            }
        }

        let mut stream = timeout(self.timeout, TcpStream::connect(&self.target_addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection timeout to {}", self.target_addr),
                )
            })??;
        stream.set_nodelay(true)?;

        let response = self.exchange(&mut stream, message).await?;
        *guard = Some(stream);
        Ok(response)
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        message: &RpcMessage,
    ) -> std::io::Result<RpcResponse> {
        timeout(self.timeout, async {
            write_frame(stream, message).await?;
            read_frame(stream).await?.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed connection")
            })
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "RPC timeout"))?
    }
}

/// Forward a proposal to the raft leader at `addr`.
pub async fn forward_client_write(
    addr: &str,
    command: MetadataCommand,
    rpc_timeout: Duration,
) -> ClusterResult<MetadataResponse> {
    let client = RpcClient::new(addr, rpc_timeout);
    let message = RpcMessage::ClientWrite {
        command,
        forward_hops: 1,
    };
    match client.call(&message).await {
        Ok(RpcResponse::ClientWrite(resp)) => Ok(resp),
        Ok(RpcResponse::Error(info)) => Err(info.into()),
        Ok(other) => Err(ClusterError::Rpc(format!(
            "unexpected response to client write: {other:?}"
        ))),
        Err(e) => Err(ClusterError::Rpc(format!("forward to {addr} failed: {e}"))),
    }
}

/// Factory for raft connections.
#[derive(Clone)]
pub struct RaftNetworkFactoryImpl {
    rpc_timeout: Duration,
}

impl RaftNetworkFactoryImpl {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout }
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkFactoryImpl {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, _target: RaftNodeId, node: &BasicNode) -> Self::Network {
        RaftNetworkConnection {
            client: RpcClient::new(node.addr.clone(), self.rpc_timeout),
        }
    }
}

/// A connection to a remote raft node.
pub struct RaftNetworkConnection {
    client: RpcClient,
}

fn network_error<E>(e: &E) -> RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>
where
    E: std::error::Error + 'static,
{
    RPCError::Network(NetworkError::new(e))
}

impl RaftNetworkConnection {
    async fn send(&self, message: RpcMessage) -> Result<RpcResponse, std::io::Error> {
        match self.client.call(&message).await? {
            RpcResponse::Error(info) => Err(std::io::Error::other(info.message)),
            response => Ok(response),
        }
    }
}

fn unexpected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "unexpected response type")
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>,
    > {
        match self.send(RpcMessage::AppendEntries(req)).await {
            Ok(RpcResponse::AppendEntries(resp)) => Ok(resp),
            Ok(_) => Err(network_error(&unexpected())),
            Err(e) => Err(network_error(&e)),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        match self.send(RpcMessage::Vote(req)).await {
            Ok(RpcResponse::Vote(resp)) => Ok(resp),
            Ok(_) => Err(network_error(&unexpected())),
            Err(e) => Err(network_error(&e)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        let network = |e: &std::io::Error| RPCError::Network(NetworkError::new(e));
        match self.send(RpcMessage::InstallSnapshot(req)).await {
            Ok(RpcResponse::InstallSnapshot(resp)) => Ok(resp),
            Ok(_) => Err(network(&unexpected())),
            Err(e) => Err(network(&e)),
        }
    }
}

/// Handlers behind the RPC server. The replica service is attached once the
/// replica manager exists, which is after raft has started.
pub struct RpcHandlers {
    raft: Raft<TypeConfig>,
    proposal_timeout: Duration,
    replica: OnceLock<Arc<dyn ReplicaFetchService>>,
}

impl RpcHandlers {
    pub fn new(raft: Raft<TypeConfig>, proposal_timeout: Duration) -> Self {
        Self {
            raft,
            proposal_timeout,
            replica: OnceLock::new(),
        }
    }

    /// Attach the replica fetch service. Later calls are ignored.
    pub fn set_replica_service(&self, service: Arc<dyn ReplicaFetchService>) {
        if self.replica.set(service).is_err() {
            warn!("Replica fetch service already attached");
        }
    }

    async fn handle(&self, message: RpcMessage) -> RpcResponse {
        match message {
            RpcMessage::AppendEntries(req) => match self.raft.append_entries(req).await {
                Ok(resp) => RpcResponse::AppendEntries(resp),
                Err(e) => RpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RpcMessage::Vote(req) => match self.raft.vote(req).await {
                Ok(resp) => RpcResponse::Vote(resp),
                Err(e) => RpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RpcMessage::InstallSnapshot(req) => match self.raft.install_snapshot(req).await {
                Ok(resp) => RpcResponse::InstallSnapshot(resp),
                Err(e) => RpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RpcMessage::ClientWrite {
                command,
                forward_hops,
            } => {
                if forward_hops > MAX_FORWARD_HOPS {
                    return RpcResponse::Error(RpcErrorInfo::new(
                        RpcErrorKind::ForwardLoopDetected,
                        format!("{forward_hops} hops exceeds limit of {MAX_FORWARD_HOPS}"),
                    ));
                }
                match super::node::client_write(&self.raft, command, self.proposal_timeout).await
                {
                    Ok(resp) => RpcResponse::ClientWrite(resp),
                    Err(e) => RpcResponse::Error(RpcErrorInfo::from(&e)),
                }
            }
            RpcMessage::ReplicaFetch(req) => match self.replica.get() {
                Some(service) => RpcResponse::ReplicaFetch(service.replica_fetch(req).await),
                None => RpcResponse::Error(RpcErrorInfo::new(
                    RpcErrorKind::Internal,
                    "replica fetch service not ready",
                )),
            },
        }
    }
}

/// Server for incoming cluster RPCs.
pub struct RpcServer {
    listener: TcpListener,
    handlers: Arc<RpcHandlers>,
}

impl RpcServer {
    /// Bind the listener so address errors surface at startup.
    pub async fn bind(addr: &str, handlers: Arc<RpcHandlers>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "Cluster RPC server listening");
        Ok(Self { listener, handlers })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handlers = self.handlers.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(handlers, stream).await {
                                debug!(peer = %peer, error = %e, "Cluster RPC connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept cluster RPC connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Cluster RPC server shutting down");
                    return;
                }
            }
        }
    }

    async fn handle_connection(
        handlers: Arc<RpcHandlers>,
        mut stream: TcpStream,
    ) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        while let Some(message) = read_frame::<RpcMessage>(&mut stream).await? {
            let response = handlers.handle(message).await;
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KafkaCode;

    #[test]
    fn test_vote_message_roundtrip() {
        let msg = RpcMessage::Vote(VoteRequest {
            vote: openraft::Vote::new(1, 42),
            last_log_id: None,
        });
        let raw = bincode::serialize(&msg).unwrap();
        match bincode::deserialize::<RpcMessage>(&raw).unwrap() {
            RpcMessage::Vote(req) => assert_eq!(req.vote.leader_id().voted_for(), Some(42)),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_replica_fetch_error_response() {
        let resp = ReplicaFetchResponse::error(KafkaCode::NotLeaderForPartition);
        assert_eq!(resp.error_code, 6);
        assert!(resp.records.is_empty());
    }

    #[test]
    fn test_rpc_error_kind_retry_semantics() {
        assert!(RpcErrorKind::NotLeader { leader_hint: None }.is_retryable());
        assert!(RpcErrorKind::Timeout.is_retryable());
        assert!(!RpcErrorKind::ForwardLoopDetected.is_retryable());
        assert!(!RpcErrorKind::InvalidRequest.is_retryable());
    }

    #[test]
    fn test_cluster_error_mapping_keeps_leader_hint() {
        let err = ClusterError::NotLeader {
            leader_id: Some(3),
            leader_addr: Some("10.0.0.3:9093".to_string()),
        };
        let info = RpcErrorInfo::from(&err);
        assert_eq!(
            info.kind,
            RpcErrorKind::NotLeader {
                leader_hint: Some(3)
            }
        );
        let back: ClusterError = info.into();
        assert!(matches!(
            back,
            ClusterError::NotLeader {
                leader_id: Some(3),
                ..
            }
        ));
        let timeout: ClusterError = RpcErrorInfo::from(&ClusterError::ProposalTimeout).into();
        assert!(matches!(timeout, ClusterError::ProposalTimeout));
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let mut cb = CircuitBreakerState::new();
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD - 1 {
            cb.record_failure();
        }
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
        cb.record_success();
        assert!(!cb.is_open());
    }

    struct EchoOffsets;

    #[async_trait]
    impl ReplicaFetchService for EchoOffsets {
        async fn replica_fetch(&self, request: ReplicaFetchRequest) -> ReplicaFetchResponse {
            ReplicaFetchResponse {
                log_end_offset: request.fetch_offset,
                high_watermark: request.fetch_offset - 1,
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_frames_over_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service: Arc<dyn ReplicaFetchService> = Arc::new(EchoOffsets);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Some(RpcMessage::ReplicaFetch(req)) =
                read_frame::<RpcMessage>(&mut stream).await.unwrap()
            {
                let resp = RpcResponse::ReplicaFetch(service.replica_fetch(req).await);
                write_frame(&mut stream, &resp).await.unwrap();
            }
        });

        let client = RpcClient::new(addr.to_string(), Duration::from_secs(2));
        for offset in [5, 9] {
            let msg = RpcMessage::ReplicaFetch(ReplicaFetchRequest {
                topic: "t".to_string(),
                partition: 0,
                replica_id: 2,
                fetch_offset: offset,
                max_bytes: 1024,
                max_wait_ms: 0,
            });
            match client.call(&msg).await.unwrap() {
                RpcResponse::ReplicaFetch(resp) => {
                    assert_eq!(resp.log_end_offset, offset);
                    assert_eq!(resp.high_watermark, offset - 1);
                }
                other => panic!("unexpected response {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_call_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RpcClient::new(addr.to_string(), Duration::from_millis(200));
        let msg = RpcMessage::ClientWrite {
            command: MetadataCommand::DeleteTopic {
                name: "t".to_string(),
            },
            forward_hops: 1,
        };
        assert!(client.call(&msg).await.is_err());
    }
}
