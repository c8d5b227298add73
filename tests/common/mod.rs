//! Shared helpers for integration tests: in-process brokers on loopback and
//! a small Kafka wire client.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use jockey::cluster::{
    Broker, BrokerConfig, LogConfig, MembershipConfig, RaftConfig, ReplicationConfig, ServerConfig,
};
use jockey::protocol::{Record, decode_records, encode_record_batch};

// ============================================================================
// Brokers
// ============================================================================

/// Configuration for an in-process broker with every listener on an
/// ephemeral loopback port and timings shortened for tests.
pub fn broker_config(dir: &TempDir, broker_id: i32, seeds: Vec<String>) -> BrokerConfig {
    BrokerConfig {
        broker_id,
        advertised_host: "127.0.0.1".to_string(),
        log: LogConfig {
            dir: dir.path().join("logs"),
            segment_bytes: 64 * 1024,
            ..LogConfig::default()
        },
        replication: ReplicationConfig {
            replica_lag_time_max: Duration::from_secs(2),
            replica_fetch_wait_max: Duration::from_millis(100),
            replica_fetch_backoff: Duration::from_millis(50),
            fetch_max_wait: Duration::from_millis(500),
            hw_checkpoint_interval: Duration::from_millis(500),
            ..ReplicationConfig::default()
        },
        raft: RaftConfig {
            node_id: broker_id as u64,
            raft_dir: dir.path().join("raft"),
            rpc_addr: "127.0.0.1:0".to_string(),
            rpc_timeout: Duration::from_secs(2),
            ..RaftConfig::default()
        },
        membership: MembershipConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            seeds,
            gossip_interval: Duration::from_millis(100),
            failure_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_millis(200),
            ..MembershipConfig::default()
        },
        server: ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        },
    }
}

/// A broker together with the directory holding its state.
pub struct TestBroker {
    pub broker: Broker,
    pub dir: TempDir,
}

impl TestBroker {
    pub fn id(&self) -> i32 {
        self.broker.broker_id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.broker.kafka_addr()
    }
}

/// Start `size` brokers with ids `1..=size`. The first bootstraps the
/// cluster, the rest join through its gossip address. Returns once every
/// broker is registered in metadata.
pub async fn start_cluster(size: i32) -> Vec<TestBroker> {
    start_cluster_with(size, |_| {}).await
}

pub async fn start_cluster_with(size: i32, tweak: impl Fn(&mut BrokerConfig)) -> Vec<TestBroker> {
    let mut brokers = Vec::new();

    let dir = TempDir::new().unwrap();
    let mut config = broker_config(&dir, 1, Vec::new());
    tweak(&mut config);
    let first = Broker::start(config).await.unwrap();
    let seed = first.gossip_addr().to_string();
    brokers.push(TestBroker { broker: first, dir });

    for id in 2..=size {
        let dir = TempDir::new().unwrap();
        let mut config = broker_config(&dir, id, vec![seed.clone()]);
        tweak(&mut config);
        let broker = Broker::start(config).await.unwrap();
        brokers.push(TestBroker { broker, dir });
    }

    let bootstrap = brokers[0].addr();
    eventually(Duration::from_secs(30), move || async move {
        let mut client = TestClient::connect(bootstrap).await;
        client.metadata(Some(&[])).await.brokers.len() == size as usize
    })
    .await;
    brokers
}

/// Poll `check` until it returns true, panicking after `within`.
pub async fn eventually<F, Fut>(within: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + within;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "condition not met within {within:?}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// One uncompressed batch of `count` records with values `v{first}..`.
pub fn batch(first: usize, count: usize) -> Bytes {
    let records: Vec<Record> = (first..first + count)
        .map(|i| {
            Record::new(
                Some(Bytes::from(format!("k{i}"))),
                Some(Bytes::from(format!("v{i}"))),
                1_700_000_000_000 + i as i64,
            )
        })
        .collect();
    encode_record_batch(0, &records)
}

pub fn decode(records: &Bytes) -> Vec<Record> {
    decode_records(records).unwrap()
}

// ============================================================================
// Wire client
// ============================================================================

pub const API_PRODUCE: i16 = 0;
pub const API_FETCH: i16 = 1;
pub const API_LIST_OFFSETS: i16 = 2;
pub const API_METADATA: i16 = 3;
pub const API_API_VERSIONS: i16 = 18;
pub const API_CREATE_TOPICS: i16 = 19;
pub const API_DELETE_TOPICS: i16 = 20;

#[derive(Debug, Clone)]
pub struct BrokerMeta {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone)]
pub struct PartitionMeta {
    pub error_code: i16,
    pub partition: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct TopicMeta {
    pub error_code: i16,
    pub name: String,
    pub partitions: Vec<PartitionMeta>,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub brokers: Vec<BrokerMeta>,
    pub controller_id: i32,
    pub topics: Vec<TopicMeta>,
}

impl Metadata {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionMeta> {
        self.topics
            .iter()
            .find(|t| t.name == topic)?
            .partitions
            .iter()
            .find(|p| p.partition == partition)
    }

    pub fn broker_addr(&self, node_id: i32) -> Option<SocketAddr> {
        let b = self.brokers.iter().find(|b| b.node_id == node_id)?;
        format!("{}:{}", b.host, b.port).parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPartition {
    pub error_code: i16,
    pub high_watermark: i64,
    pub records: Bytes,
}

pub struct TestClient {
    stream: TcpStream,
    correlation_id: i32,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            correlation_id: 0,
        }
    }

    pub async fn try_connect(addr: SocketAddr) -> Option<Self> {
        TcpStream::connect(addr).await.ok().map(|stream| Self {
            stream,
            correlation_id: 0,
        })
    }

    async fn send(&mut self, api_key: i16, version: i16, body: &[u8]) -> i32 {
        self.correlation_id += 1;
        let client_id = b"jockey-test";
        let mut frame = BytesMut::new();
        frame.put_i32((2 + 2 + 4 + 2 + client_id.len() + body.len()) as i32);
        frame.put_i16(api_key);
        frame.put_i16(version);
        frame.put_i32(self.correlation_id);
        frame.put_i16(client_id.len() as i16);
        frame.put_slice(client_id);
        frame.put_slice(body);
        self.stream.write_all(&frame).await.unwrap();
        self.correlation_id
    }

    async fn receive(&mut self, correlation_id: i32) -> Bytes {
        let size = self.stream.read_i32().await.unwrap();
        let mut buf = vec![0u8; size as usize];
        self.stream.read_exact(&mut buf).await.unwrap();
        let mut body = Bytes::from(buf);
        assert_eq!(body.get_i32(), correlation_id, "correlation id mismatch");
        body
    }

    /// Send a request and return the response body (after the correlation id).
    pub async fn request(&mut self, api_key: i16, version: i16, body: &[u8]) -> Bytes {
        let id = self.send(api_key, version, body).await;
        self.receive(id).await
    }

    /// Send raw bytes, bypassing framing.
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Whether the server closed the connection within `within`.
    pub async fn is_closed(&mut self, within: Duration) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            tokio::time::timeout(within, self.stream.read(&mut byte)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    /// ApiVersions v0: error code and `(api_key, min, max)` entries.
    pub async fn api_versions(&mut self, version: i16) -> (i16, Vec<(i16, i16, i16)>) {
        let mut body = self.request(API_API_VERSIONS, version, &[]).await;
        let error_code = body.get_i16();
        let count = body.get_i32();
        let apis = (0..count)
            .map(|_| (body.get_i16(), body.get_i16(), body.get_i16()))
            .collect();
        (error_code, apis)
    }

    /// Metadata v1. `None` asks for every topic.
    pub async fn metadata(&mut self, topics: Option<&[&str]>) -> Metadata {
        let mut req = BytesMut::new();
        match topics {
            None => req.put_i32(-1),
            Some(names) => {
                req.put_i32(names.len() as i32);
                for name in names {
                    put_string(&mut req, name);
                }
            }
        }
        let mut body = self.request(API_METADATA, 1, &req).await;

        let brokers = (0..body.get_i32())
            .map(|_| {
                let node_id = body.get_i32();
                let host = get_string(&mut body);
                let port = body.get_i32();
                let _rack = get_nullable_string(&mut body);
                BrokerMeta { node_id, host, port }
            })
            .collect();
        let controller_id = body.get_i32();
        let topics = (0..body.get_i32())
            .map(|_| {
                let error_code = body.get_i16();
                let name = get_string(&mut body);
                let _internal = body.get_u8();
                let partitions = (0..body.get_i32())
                    .map(|_| PartitionMeta {
                        error_code: body.get_i16(),
                        partition: body.get_i32(),
                        leader: body.get_i32(),
                        replicas: get_i32_array(&mut body),
                        isr: get_i32_array(&mut body),
                    })
                    .collect();
                TopicMeta {
                    error_code,
                    name,
                    partitions,
                }
            })
            .collect();
        Metadata {
            brokers,
            controller_id,
            topics,
        }
    }

    /// CreateTopics v0 for a single topic; returns its error code.
    pub async fn create_topic(&mut self, name: &str, partitions: i32, replication_factor: i16) -> i16 {
        let mut req = BytesMut::new();
        req.put_i32(1);
        put_string(&mut req, name);
        req.put_i32(partitions);
        req.put_i16(replication_factor);
        req.put_i32(0); // assignments
        req.put_i32(0); // configs
        req.put_i32(10_000);
        let mut body = self.request(API_CREATE_TOPICS, 0, &req).await;
        assert_eq!(body.get_i32(), 1);
        assert_eq!(get_string(&mut body), name);
        body.get_i16()
    }

    /// DeleteTopics v0 for a single topic; returns its error code.
    pub async fn delete_topic(&mut self, name: &str) -> i16 {
        let mut req = BytesMut::new();
        req.put_i32(1);
        put_string(&mut req, name);
        req.put_i32(10_000);
        let mut body = self.request(API_DELETE_TOPICS, 0, &req).await;
        assert_eq!(body.get_i32(), 1);
        assert_eq!(get_string(&mut body), name);
        body.get_i16()
    }

    fn produce_body(topic: &str, partition: i32, records: &Bytes, acks: i16, timeout_ms: i32) -> BytesMut {
        let mut req = BytesMut::new();
        req.put_i16(acks);
        req.put_i32(timeout_ms);
        req.put_i32(1);
        put_string(&mut req, topic);
        req.put_i32(1);
        req.put_i32(partition);
        req.put_i32(records.len() as i32);
        req.put_slice(records);
        req
    }

    /// Produce v2 to one partition; returns `(error_code, base_offset)`.
    pub async fn produce(&mut self, topic: &str, partition: i32, records: Bytes, acks: i16) -> (i16, i64) {
        let req = Self::produce_body(topic, partition, &records, acks, 10_000);
        let mut body = self.request(API_PRODUCE, 2, &req).await;
        assert_eq!(body.get_i32(), 1);
        assert_eq!(get_string(&mut body), topic);
        assert_eq!(body.get_i32(), 1);
        assert_eq!(body.get_i32(), partition);
        let error_code = body.get_i16();
        let base_offset = body.get_i64();
        (error_code, base_offset)
    }

    /// Produce with `acks=0`: no response frame is expected.
    pub async fn produce_no_ack(&mut self, topic: &str, partition: i32, records: Bytes) {
        let req = Self::produce_body(topic, partition, &records, 0, 10_000);
        self.send(API_PRODUCE, 2, &req).await;
    }

    /// Fetch v4 from one partition.
    pub async fn fetch(&mut self, topic: &str, partition: i32, offset: i64, max_wait_ms: i32) -> FetchedPartition {
        let mut req = BytesMut::new();
        req.put_i32(-1); // replica id
        req.put_i32(max_wait_ms);
        req.put_i32(1); // min bytes
        req.put_i32(1024 * 1024);
        req.put_i8(0);
        req.put_i32(1);
        put_string(&mut req, topic);
        req.put_i32(1);
        req.put_i32(partition);
        req.put_i64(offset);
        req.put_i32(1024 * 1024);
        let mut body = self.request(API_FETCH, 4, &req).await;

        let _throttle = body.get_i32();
        assert_eq!(body.get_i32(), 1);
        assert_eq!(get_string(&mut body), topic);
        assert_eq!(body.get_i32(), 1);
        assert_eq!(body.get_i32(), partition);
        let error_code = body.get_i16();
        let high_watermark = body.get_i64();
        let _last_stable = body.get_i64();
        let aborted = body.get_i32();
        for _ in 0..aborted.max(0) {
            body.get_i64();
            body.get_i64();
        }
        let len = body.get_i32();
        let records = if len > 0 {
            body.split_to(len as usize)
        } else {
            Bytes::new()
        };
        FetchedPartition {
            error_code,
            high_watermark,
            records,
        }
    }

    /// ListOffsets v1 for one partition; returns `(error_code, offset)`.
    pub async fn list_offset(&mut self, topic: &str, partition: i32, timestamp: i64) -> (i16, i64) {
        let mut req = BytesMut::new();
        req.put_i32(-1);
        req.put_i32(1);
        put_string(&mut req, topic);
        req.put_i32(1);
        req.put_i32(partition);
        req.put_i64(timestamp);
        let mut body = self.request(API_LIST_OFFSETS, 1, &req).await;
        assert_eq!(body.get_i32(), 1);
        assert_eq!(get_string(&mut body), topic);
        assert_eq!(body.get_i32(), 1);
        assert_eq!(body.get_i32(), partition);
        let error_code = body.get_i16();
        let _timestamp = body.get_i64();
        (error_code, body.get_i64())
    }
}

/// Ask `via` for the current leader of `topic`/`partition` and connect to it.
pub async fn leader_client(via: SocketAddr, topic: &str, partition: i32) -> Option<(i32, TestClient)> {
    let mut client = TestClient::try_connect(via).await?;
    let metadata = client.metadata(Some(&[topic])).await;
    let p = metadata.partition(topic, partition)?;
    if p.leader < 0 {
        return None;
    }
    let addr = metadata.broker_addr(p.leader)?;
    Some((p.leader, TestClient::try_connect(addr).await?))
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

pub fn get_string(buf: &mut Bytes) -> String {
    let len = buf.get_i16();
    String::from_utf8(buf.split_to(len as usize).to_vec()).unwrap()
}

pub fn get_nullable_string(buf: &mut Bytes) -> Option<String> {
    let len = buf.get_i16();
    if len < 0 {
        return None;
    }
    Some(String::from_utf8(buf.split_to(len as usize).to_vec()).unwrap())
}

fn get_i32_array(buf: &mut Bytes) -> Vec<i32> {
    let count = buf.get_i32();
    (0..count.max(0)).map(|_| buf.get_i32()).collect()
}
