//! StreamAdapter: delivers `(rawBytes, offset, ackHandle)` tuples one at a
//! time and exposes `store_offset` as the only path to commit. The adapter
//! never auto-commits — commit is always triggered by downstream success
//! (`tci-persist` calling `store_offset` after a batch transaction commits).
//!
//! The transport is behind a trait so `tci-testkit` can provide an
//! in-memory fake for scenario tests that don't want a live Kafka broker —
//! the same transport/logic trait boundary pattern used elsewhere for
//! broker adapters.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tci_schemas::AckHandle;
use tracing::{info, warn};

/// One message pulled off the source stream, not yet classified.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub raw_bytes: Vec<u8>,
    pub offset: i64,
    pub ack_handle: AckHandle,
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Block until the next message is available.
    async fn recv(&self) -> Result<StreamMessage>;

    /// Durably record that `handle`'s offset has been processed. Does not
    /// read or write application data; purely an offset-tracking call.
    fn store_offset(&self, handle: AckHandle) -> Result<()>;

    /// Advisory pause hint used by backpressure. A transport that cannot
    /// pause server-side should make this a no-op and rely on natural
    /// backpressure from not draining the transport buffer.
    fn pause(&self) -> Result<()>;

    fn resume(&self) -> Result<()>;
}

pub struct KafkaStreamTransport {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaStreamTransport {
    /// Connect and subscribe, resuming from the last stored offset for
    /// `consumer_name` on start.
    pub fn connect(bootstrap_servers: &str, topic: &str, consumer_name: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", consumer_name)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .context("failed to build Kafka consumer")?;

        consumer
            .subscribe(&[topic])
            .with_context(|| format!("failed to subscribe to topic {topic}"))?;

        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl StreamTransport for KafkaStreamTransport {
    async fn recv(&self) -> Result<StreamMessage> {
        let msg = self
            .consumer
            .recv()
            .await
            .context("stream consumer recv failed")?;

        let raw_bytes = msg.payload().unwrap_or_default().to_vec();
        let offset = msg.offset();
        let partition = msg.partition();

        Ok(StreamMessage {
            raw_bytes,
            offset,
            ack_handle: AckHandle { partition, offset },
        })
    }

    fn store_offset(&self, handle: AckHandle) -> Result<()> {
        self.consumer
            .store_offset(&self.topic, handle.partition, handle.offset)
            .context("store_offset failed")
    }

    fn pause(&self) -> Result<()> {
        let assignment = self
            .consumer
            .assignment()
            .context("failed to read current assignment")?;
        if assignment.count() == 0 {
            // No partitions assigned yet; nothing to pause, and natural
            // backpressure from not polling still applies.
            warn!("pause() called with no partitions assigned");
            return Ok(());
        }
        self.consumer
            .pause(&assignment)
            .context("failed to pause assigned partitions")?;
        info!("stream adapter paused");
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let assignment = self
            .consumer
            .assignment()
            .unwrap_or_else(|_| TopicPartitionList::new());
        if assignment.count() > 0 {
            self.consumer
                .resume(&assignment)
                .context("failed to resume assigned partitions")?;
        }
        info!("stream adapter resumed");
        Ok(())
    }
}
