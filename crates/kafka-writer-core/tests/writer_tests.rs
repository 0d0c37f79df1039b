//! Integration tests for the writer against an in-memory cluster.
//!
//! Covers batching limits, partition routing, retries, deadlines,
//! rebalancing and shutdown.

use std::sync::Arc;
use std::time::Duration;

use kafka_writer_core::testing::{messages, TestHarnessBuilder, WriterTestHarness, MOCK_BROKER};
use kafka_writer_core::{Balancer, BalancerKind, Message, WriterError};

#[tokio::test]
async fn test_close_returns_promptly() {
    let harness = WriterTestHarness::new();
    let writer = harness.writer().unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(1), writer.close()).await;
    assert!(closed.is_ok(), "close should not hang");
}

#[tokio::test]
async fn test_batch_size_limit_flushes_once() {
    let harness = TestHarnessBuilder::new()
        .batch_size(3)
        .batch_timeout_ms(60_000)
        .build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, messages(&["a", "b", "c"]))
        .await
        .unwrap();

    assert_eq!(writer.stats().writes, 1);
    assert_eq!(harness.cluster.write_calls()[0].count, 3);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_bytes_limit_flushes_when_reached() {
    // Two 2-byte values with 22 bytes of overhead each fill 48 bytes exactly
    let harness = TestHarnessBuilder::new()
        .batch_bytes(48)
        .batch_timeout_ms(60_000)
        .build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, messages(&["Hi", "By"]))
        .await
        .unwrap();

    let stats = writer.stats();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.bytes, 48);
    assert_eq!(harness.read_values(0, 0), vec!["Hi", "By"]);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_bytes_limit_splits_batches() {
    let harness = TestHarnessBuilder::new()
        .batch_bytes(25)
        .batch_timeout_ms(500)
        .build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, messages(&["Hi", "Hi"]))
        .await
        .unwrap();

    assert_eq!(writer.stats().writes, 2);
    assert_eq!(harness.cluster.write_count(0), 2);
    assert_eq!(harness.read_values(0, 0), vec!["Hi", "Hi"]);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_timeout_flushes_partial_batch() {
    let harness = TestHarnessBuilder::new()
        .batch_size(100)
        .batch_timeout_ms(20)
        .build();
    let writer = harness.writer().unwrap();

    let started = tokio::time::Instant::now();
    writer
        .write_messages(None, messages(&["lonely"]))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(writer.stats().writes, 1);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_oversize_message_is_counted_not_returned() {
    let harness = TestHarnessBuilder::new().batch_bytes(25).build();
    let writer = harness.writer().unwrap();

    let result = writer
        .write_messages(None, messages(&["Hello World!"]))
        .await;

    assert!(result.is_ok());
    let stats = writer.stats();
    assert!(stats.errors >= 1);
    assert_eq!(stats.writes, 0);
    assert!(harness.read_values(0, 0).is_empty());
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_writes_surface_cause_after_retries() {
    let harness = TestHarnessBuilder::new().retries(5).build();
    let writer = harness.writer().unwrap();
    harness.cluster.fail_writes(Some("bad attempt"));

    let err = writer
        .write_messages(None, messages(&["Hi"]))
        .await
        .unwrap_err();

    assert!(matches!(err, WriterError::DeliveryExhausted { retries: 5, .. }));
    assert!(err.to_string().contains("bad attempt"));

    let stats = writer.stats();
    assert_eq!(stats.retries.max, 5);
    assert_eq!(stats.errors, 1);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_recovers_after_switching_brokers() {
    let harness = TestHarnessBuilder::new().retries(2).build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, messages(&["before"]))
        .await
        .unwrap();

    // The connection breaks and its broker stops answering
    harness.cluster.fail_writes(Some("connection reset"));
    harness.cluster.set_unreachable(MOCK_BROKER, true);
    let err = writer
        .write_messages(None, messages(&["NetworkError"]))
        .await
        .unwrap_err();
    assert!(matches!(err, WriterError::DeliveryExhausted { .. }));

    harness.cluster.fail_writes(None);
    writer.set_brokers(vec!["backup:9092".to_string()]).await;
    let offset = harness.cluster.end_offset(0);

    writer
        .write_messages(None, messages(&["FindMe"]))
        .await
        .unwrap();

    assert_eq!(harness.read_values(0, offset), vec!["FindMe"]);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_deadline_exceeded() {
    let harness = TestHarnessBuilder::new().batch_size(1).build();
    harness.cluster.set_write_delay(Duration::from_millis(300));
    let writer = harness.writer().unwrap();

    let err = writer
        .write_messages_timeout(Duration::from_millis(50), messages(&["slow"]))
        .await
        .unwrap_err();
    assert!(matches!(err, WriterError::DeadlineExceeded));

    // The handed-off message is still delivered
    writer.close().await.unwrap();
    assert_eq!(harness.read_values(0, 0), vec!["slow"]);
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let harness = WriterTestHarness::new();
    let writer = harness.writer().unwrap();
    writer.close().await.unwrap();
    writer.close().await.unwrap();

    let err = writer
        .write_messages(None, messages(&["late"]))
        .await
        .unwrap_err();
    assert!(matches!(err, WriterError::WriterClosed));
}

#[tokio::test]
async fn test_empty_write_does_not_discover_partitions() {
    let harness = WriterTestHarness::new();
    let writer = harness.writer().unwrap();

    writer.write_messages(None, Vec::new()).await.unwrap();

    assert_eq!(harness.cluster.lookup_count(), 0);
    assert!(writer.partitions().await.is_empty());
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_topic_fails_first_write() {
    let harness = WriterTestHarness::new();
    let writer = harness
        .writer_with(|config| config.topic = "missing".to_string())
        .unwrap();

    let err = writer
        .write_messages(None, messages(&["x"]))
        .await
        .unwrap_err();
    assert!(matches!(err, WriterError::TopicNotFound { .. }));
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_explicit_partition_is_honored() {
    let harness = TestHarnessBuilder::new().partitions(3).batch_size(1).build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, vec![Message::new("pinned").with_partition(2)])
        .await
        .unwrap();

    assert_eq!(harness.read_values(2, 0), vec!["pinned"]);
    assert!(harness.read_values(0, 0).is_empty());
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_explicit_partition_writes_nothing() {
    let harness = TestHarnessBuilder::new().partitions(2).build();
    let writer = harness.writer().unwrap();

    let err = writer
        .write_messages(
            None,
            vec![Message::new("ok"), Message::new("bad").with_partition(7)],
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        WriterError::UnknownPartition { partition: 7, .. }
    ));
    writer.close().await.unwrap();
    assert!(harness.cluster.write_calls().is_empty());
}

#[tokio::test]
async fn test_round_robin_spreads_messages() {
    let harness = TestHarnessBuilder::new().partitions(3).batch_size(1).build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, messages(&["1", "2", "3", "4", "5", "6"]))
        .await
        .unwrap();

    for partition in 0..3 {
        assert_eq!(harness.cluster.end_offset(partition), 2);
    }
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_hash_balancer_keeps_key_on_one_partition() {
    let harness = TestHarnessBuilder::new().partitions(4).build();
    let writer = harness
        .writer_with(|config| config.balancer_kind = BalancerKind::Hash)
        .unwrap();

    let batch: Vec<Message> = (0..10)
        .map(|i| Message::new(format!("event-{i}")).with_key("user-42"))
        .collect();
    writer.write_messages(None, batch).await.unwrap();

    let populated: Vec<i32> = (0..4)
        .filter(|p| harness.cluster.end_offset(*p) > 0)
        .collect();
    assert_eq!(populated.len(), 1);

    // Order within the key is preserved
    let values = harness.read_values(populated[0], 0);
    let expected: Vec<String> = (0..10).map(|i| format!("event-{i}")).collect();
    assert_eq!(values, expected);
    writer.close().await.unwrap();
}

#[derive(Debug)]
struct LastPartition;

impl Balancer for LastPartition {
    fn assign(&self, _message: &Message, partitions: &[i32]) -> i32 {
        partitions[partitions.len() - 1]
    }
}

#[tokio::test]
async fn test_custom_balancer() {
    let harness = TestHarnessBuilder::new().partitions(3).build();
    let writer = harness
        .writer_with(|config| config.balancer = Some(Arc::new(LastPartition)))
        .unwrap();

    writer
        .write_messages(None, messages(&["a", "b"]))
        .await
        .unwrap();

    assert_eq!(harness.read_values(2, 0), vec!["a", "b"]);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_manual_rebalance_adds_partitions() {
    let harness = TestHarnessBuilder::new().partitions(1).build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, messages(&["first"]))
        .await
        .unwrap();
    assert_eq!(writer.partitions().await, vec![0]);

    harness.cluster.set_partition_count(3);
    let added = writer.rebalance().await.unwrap();

    assert_eq!(added, 2);
    assert_eq!(writer.partitions().await, vec![0, 1, 2]);
    assert_eq!(writer.stats().rebalances, 1);

    writer
        .write_messages(None, vec![Message::new("new").with_partition(2)])
        .await
        .unwrap();
    assert_eq!(harness.read_values(2, 0), vec!["new"]);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_background_rebalance_discovers_partitions() {
    let harness = TestHarnessBuilder::new()
        .partitions(1)
        .rebalance_interval_ms(20)
        .build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, messages(&["first"]))
        .await
        .unwrap();
    harness.cluster.set_partition_count(2);

    let discovered = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if writer.partitions().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(discovered.is_ok(), "rebalancer should find the new partition");
    assert!(writer.stats().rebalances >= 1);
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_writes_are_all_delivered() {
    let harness = TestHarnessBuilder::new().partitions(2).batch_size(10).build();
    let writer = Arc::new(harness.writer().unwrap());

    let mut tasks = Vec::new();
    for task in 0..8 {
        let writer = Arc::clone(&writer);
        tasks.push(tokio::spawn(async move {
            let batch: Vec<Message> = (0..25)
                .map(|i| Message::new(format!("{task}-{i}")))
                .collect();
            writer.write_messages(None, batch).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    writer.close().await.unwrap();
    let stats = writer.stats();
    assert_eq!(stats.messages, 200);
    assert_eq!(
        harness.cluster.end_offset(0) + harness.cluster.end_offset(1),
        200
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_racing_close_are_flushed_or_rejected() {
    let harness = TestHarnessBuilder::new()
        .partitions(16)
        .batch_timeout_ms(60_000)
        .build();
    let writer = Arc::new(harness.writer().unwrap());
    // discover partitions without starting any partition writer
    assert_eq!(writer.rebalance().await.unwrap(), 0);

    let mut tasks = Vec::new();
    for partition in 0..16 {
        let writer = Arc::clone(&writer);
        tasks.push(tokio::spawn(async move {
            let message = Message::new(format!("p{partition}")).with_partition(partition);
            writer.write_messages(None, vec![message]).await
        }));
    }
    writer.close().await.unwrap();

    // a partition writer spawned after close would hold its batch for a minute
    let mut delivered = 0;
    for task in tasks {
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("write should resolve once close returns")
            .unwrap();
        match result {
            Ok(()) => delivered += 1,
            Err(e) => assert!(matches!(e, WriterError::WriterClosed), "{e}"),
        }
    }

    let written: i64 = (0..16).map(|p| harness.cluster.end_offset(p)).sum();
    assert_eq!(written, delivered);
}

#[tokio::test]
async fn test_stats_snapshot_reports_topic() {
    let harness = TestHarnessBuilder::new().topic("orders").build();
    let writer = harness.writer().unwrap();

    writer
        .write_messages(None, messages(&["Hi"]))
        .await
        .unwrap();

    let stats = writer.stats();
    assert_eq!(stats.topic, "orders");
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.bytes, 24);
    assert!(stats.dials >= 1);
    assert_eq!(stats.batch_size.max, 1);
    writer.close().await.unwrap();
}
