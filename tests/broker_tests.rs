//! Single-broker protocol behavior over a real socket.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};

use jockey::error::KafkaCode;

use common::*;

const WAIT: Duration = Duration::from_secs(20);

/// Create `topic` and wait until its partitions accept requests here.
async fn create_ready_topic(addr: SocketAddr, topic: &str, partitions: i32) {
    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.create_topic(topic, partitions, 1).await, 0);

    let topic = topic.to_string();
    eventually(WAIT, move || {
        let topic = topic.clone();
        async move {
            let mut client = TestClient::connect(addr).await;
            for p in 0..partitions {
                if client.fetch(&topic, p, 0, 0).await.error_code != 0 {
                    return false;
                }
            }
            true
        }
    })
    .await;
}

async fn single_broker() -> TestBroker {
    start_cluster(1).await.remove(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_api_versions_lists_supported_apis() {
    let b = single_broker().await;
    let mut client = TestClient::connect(b.addr()).await;

    let (error, apis) = client.api_versions(0).await;
    assert_eq!(error, 0);
    let keys: Vec<i16> = apis.iter().map(|(key, _, _)| *key).collect();
    assert_eq!(keys, vec![0, 1, 2, 3, 18, 19, 20]);
    for (_, min, max) in &apis {
        assert_eq!(*min, 0);
        assert!(*max >= 1);
    }

    // Unknown versions are answered in v0 with the supported ranges.
    let (error, apis) = client.api_versions(99).await;
    assert_eq!(error, KafkaCode::UnsupportedVersion as i16);
    assert_eq!(apis.len(), 7);

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metadata_for_missing_and_invalid_topics() {
    let b = single_broker().await;
    let mut client = TestClient::connect(b.addr()).await;

    let metadata = client.metadata(Some(&["missing", "bad/name"])).await;
    assert_eq!(metadata.brokers.len(), 1);
    assert_eq!(metadata.brokers[0].node_id, b.id());
    assert_eq!(metadata.brokers[0].port, i32::from(b.addr().port()));
    assert_eq!(metadata.controller_id, b.id());
    assert_eq!(metadata.topics[0].name, "missing");
    assert_eq!(
        metadata.topics[0].error_code,
        KafkaCode::UnknownTopicOrPartition as i16
    );
    assert_eq!(metadata.topics[1].name, "bad/name");
    assert_eq!(metadata.topics[1].error_code, KafkaCode::InvalidTopic as i16);

    // Asking about a topic does not create it.
    assert!(client.metadata(None).await.topics.is_empty());

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_topic_rejections() {
    let b = single_broker().await;
    let mut client = TestClient::connect(b.addr()).await;

    assert_eq!(client.create_topic("t", 2, 1).await, 0);
    assert_eq!(
        client.create_topic("t", 2, 1).await,
        KafkaCode::TopicAlreadyExists as i16
    );
    assert_eq!(
        client.create_topic("zero", 0, 1).await,
        KafkaCode::InvalidPartitions as i16
    );
    assert_eq!(
        client.create_topic("wide", 1, 3).await,
        KafkaCode::InvalidReplicationFactor as i16
    );
    assert_eq!(
        client.create_topic("a b", 1, 1).await,
        KafkaCode::InvalidTopic as i16
    );

    let metadata = client.metadata(None).await;
    let names: Vec<&str> = metadata.topics.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["t"]);

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_produce_and_fetch_single_partition() {
    let b = single_broker().await;
    create_ready_topic(b.addr(), "logs", 2).await;
    let mut client = TestClient::connect(b.addr()).await;

    assert_eq!(client.produce("logs", 1, batch(0, 3), 1).await, (0, 0));
    assert_eq!(client.produce("logs", 1, batch(3, 2), -1).await, (0, 3));

    let fetched = client.fetch("logs", 1, 0, 100).await;
    assert_eq!(fetched.error_code, 0);
    assert_eq!(fetched.high_watermark, 5);
    let records = decode(&fetched.records);
    let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    assert_eq!(records[4].value.as_deref(), Some(&b"v4"[..]));

    // A fetch from the middle of a batch starts at that batch.
    let fetched = client.fetch("logs", 1, 4, 100).await;
    let records = decode(&fetched.records);
    assert_eq!(records.first().map(|r| r.offset), Some(3));

    // The other partition is untouched.
    let fetched = client.fetch("logs", 0, 0, 0).await;
    assert_eq!(fetched.high_watermark, 0);
    assert!(fetched.records.is_empty());

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_at_or_past_the_end_is_empty() {
    let b = single_broker().await;
    create_ready_topic(b.addr(), "quiet", 1).await;
    let mut client = TestClient::connect(b.addr()).await;
    client.produce("quiet", 0, batch(0, 2), 1).await;

    for offset in [2, 1000] {
        let fetched = client.fetch("quiet", 0, offset, 200).await;
        assert_eq!(fetched.error_code, 0);
        assert_eq!(fetched.high_watermark, 2);
        assert!(fetched.records.is_empty());
    }

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_long_poll_wakes_on_produce() {
    let b = single_broker().await;
    create_ready_topic(b.addr(), "poll", 1).await;
    let addr = b.addr();

    let waiter = tokio::spawn(async move {
        let mut client = TestClient::connect(addr).await;
        client.fetch("poll", 0, 0, 5_000).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut producer = TestClient::connect(addr).await;
    assert_eq!(producer.produce("poll", 0, batch(0, 1), 1).await, (0, 0));

    let fetched = tokio::time::timeout(Duration::from_secs(3), waiter)
        .await
        .expect("long poll should return once data arrives")
        .unwrap();
    assert_eq!(fetched.error_code, 0);
    assert_eq!(decode(&fetched.records).len(), 1);

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_produce_rejections() {
    let b = single_broker().await;
    create_ready_topic(b.addr(), "strict", 1).await;
    let mut client = TestClient::connect(b.addr()).await;

    let (error, _) = client.produce("strict", 0, batch(0, 1), 5).await;
    assert_eq!(error, KafkaCode::InvalidRequiredAcks as i16);

    let (error, _) = client.produce("missing", 0, batch(0, 1), 1).await;
    assert_eq!(error, KafkaCode::UnknownTopicOrPartition as i16);

    let (error, _) = client.produce("strict", 7, batch(0, 1), 1).await;
    assert_eq!(error, KafkaCode::UnknownTopicOrPartition as i16);

    let mut corrupt = BytesMut::from(&batch(0, 1)[..]);
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xff;
    let (error, _) = client.produce("strict", 0, corrupt.freeze(), 1).await;
    assert_eq!(error, KafkaCode::CorruptMessage as i16);

    // Nothing above reached the log.
    assert_eq!(client.list_offset("strict", 0, -1).await, (0, 0));

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_produce_without_acks_sends_no_response() {
    let b = single_broker().await;
    create_ready_topic(b.addr(), "fire", 1).await;
    let mut client = TestClient::connect(b.addr()).await;

    client.produce_no_ack("fire", 0, batch(0, 3)).await;
    // The next response on this connection belongs to the next request.
    let (error, base_offset) = client.produce("fire", 0, batch(3, 1), 1).await;
    assert_eq!(error, 0);
    assert_eq!(base_offset, 3);

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_list_offsets() {
    let b = single_broker().await;
    create_ready_topic(b.addr(), "times", 1).await;
    let mut client = TestClient::connect(b.addr()).await;
    client.produce("times", 0, batch(0, 4), 1).await;
    client.produce("times", 0, batch(4, 4), 1).await;

    assert_eq!(client.list_offset("times", 0, -2).await, (0, 0));
    assert_eq!(client.list_offset("times", 0, -1).await, (0, 8));
    // First batch whose max timestamp reaches the target.
    assert_eq!(
        client.list_offset("times", 0, 1_700_000_000_000 + 5).await,
        (0, 4)
    );
    // Past every record: the end of the log.
    assert_eq!(
        client.list_offset("times", 0, 1_800_000_000_000).await,
        (0, 8)
    );
    let (error, _) = client.list_offset("nope", 0, -1).await;
    assert_eq!(error, KafkaCode::UnknownTopicOrPartition as i16);

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_topic() {
    let b = single_broker().await;
    create_ready_topic(b.addr(), "doomed", 1).await;
    let mut client = TestClient::connect(b.addr()).await;
    client.produce("doomed", 0, batch(0, 2), 1).await;

    assert_eq!(client.delete_topic("doomed").await, 0);
    assert_eq!(
        client.delete_topic("doomed").await,
        KafkaCode::UnknownTopicOrPartition as i16
    );
    let metadata = client.metadata(Some(&["doomed"])).await;
    assert_eq!(
        metadata.topics[0].error_code,
        KafkaCode::UnknownTopicOrPartition as i16
    );

    // A recreated topic starts from an empty log.
    create_ready_topic(b.addr(), "doomed", 1).await;
    assert_eq!(client.list_offset("doomed", 0, -1).await, (0, 0));

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_frame_closes_connection() {
    let b = single_broker().await;
    let mut client = TestClient::connect(b.addr()).await;

    let mut frame = BytesMut::new();
    frame.put_i32(i32::MAX);
    client.write_raw(&frame).await;
    assert!(client.is_closed(Duration::from_secs(2)).await);

    // The listener keeps serving other connections.
    let mut client = TestClient::connect(b.addr()).await;
    assert_eq!(client.api_versions(0).await.0, 0);

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_undecodable_body_keeps_connection_open() {
    let b = single_broker().await;
    let mut client = TestClient::connect(b.addr()).await;

    // Produce v2 cut off after acks.
    let mut body = client.request(API_PRODUCE, 2, &1i16.to_be_bytes()).await;
    assert_eq!(body.get_i16(), KafkaCode::InvalidRequest as i16);

    assert_eq!(client.api_versions(0).await.0, 0);
    assert!(!client.is_closed(Duration::from_millis(200)).await);

    b.broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(&dir, 1, Vec::new());

    let broker = jockey::cluster::Broker::start(config.clone()).await.unwrap();
    let addr = broker.kafka_addr();
    create_ready_topic(addr, "durable", 1).await;
    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.produce("durable", 0, batch(0, 6), -1).await, (0, 0));
    drop(client);
    broker.shutdown().await.unwrap();

    let broker = jockey::cluster::Broker::start(config).await.unwrap();
    let addr = broker.kafka_addr();
    eventually(WAIT, move || async move {
        let mut client = TestClient::connect(addr).await;
        client.fetch("durable", 0, 0, 0).await.error_code == 0
    })
    .await;

    let mut client = TestClient::connect(addr).await;
    let fetched = client.fetch("durable", 0, 0, 100).await;
    assert_eq!(fetched.high_watermark, 6);
    assert_eq!(decode(&fetched.records).len(), 6);

    broker.shutdown().await.unwrap();
}
