//! In-process event bus for embedded and test use.
//!
//! A partitioned append-only log per topic, with per-group committed
//! offsets. Redelivery is head-of-partition: an uncommitted message is
//! delivered again with an incremented attempt count until it is committed
//! or dead-lettered.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::error::BusError;

use super::{
    BusConsumer, Delivery, DlqEnvelope, EventBus, LastError, NackOutcome, Topic,
};

const ALL_TOPICS: [Topic; 5] = [
    Topic::RawItems,
    Topic::Claims,
    Topic::Alerts,
    Topic::Notifications,
    Topic::Dlq,
];

struct StoredMessage {
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct GroupCursor {
    /// Next offset to deliver; everything below is committed.
    committed: u64,
    /// Attempts spent on the message at `committed`.
    attempts: u32,
    first_seen_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    logs: HashMap<(Topic, u32), Vec<StoredMessage>>,
    cursors: HashMap<(Topic, String, u32), GroupCursor>,
    notifiers: HashMap<(Topic, u32), Arc<Notify>>,
}

impl Inner {
    fn notifier(&mut self, topic: Topic, partition: u32) -> Arc<Notify> {
        self.notifiers
            .entry((topic, partition))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

/// Process-local [`EventBus`] implementation.
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
    partitions: HashMap<Topic, u32>,
    dlq_attempt_cap: u32,
}

impl MemoryBus {
    /// Bus with default partition sizing and the given DLQ attempt cap.
    pub fn new(dlq_attempt_cap: u32) -> Self {
        let partitions = ALL_TOPICS
            .iter()
            .map(|t| (*t, t.default_partitions()))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            partitions,
            dlq_attempt_cap,
        }
    }

    /// Override partition count for a topic. Panics after consumers exist
    /// is avoided by only calling this during wiring.
    pub fn with_partitions(mut self, topic: Topic, count: u32) -> Self {
        self.partitions.insert(topic, count.max(1));
        self
    }

    fn partition_for(&self, topic: Topic, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions(topic))) as u32
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: Topic, key: &str, payload: &[u8]) -> Result<(), BusError> {
        let partition = self.partition_for(topic, key);
        let notify = {
            let mut inner = self.inner.lock().expect("bus poisoned");
            inner
                .logs
                .entry((topic, partition))
                .or_default()
                .push(StoredMessage {
                    key: key.to_string(),
                    payload: payload.to_vec(),
                });
            inner.notifier(topic, partition)
        };
        notify.notify_waiters();
        Ok(())
    }

    fn partitions(&self, topic: Topic) -> u32 {
        self.partitions.get(&topic).copied().unwrap_or(1)
    }

    async fn consumer(
        &self,
        topic: Topic,
        group: &str,
        partition: u32,
    ) -> Result<Box<dyn BusConsumer>, BusError> {
        if partition >= self.partitions(topic) {
            return Err(BusError::Unavailable(format!(
                "partition {partition} out of range for topic {topic}"
            )));
        }
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            topic,
            group: group.to_string(),
            partition,
            dlq_attempt_cap: self.dlq_attempt_cap,
            dlq_partition_count: self.partitions(Topic::Dlq),
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<Mutex<Inner>>,
    topic: Topic,
    group: String,
    partition: u32,
    dlq_attempt_cap: u32,
    dlq_partition_count: u32,
}

impl MemoryConsumer {
    fn cursor_key(&self) -> (Topic, String, u32) {
        (self.topic, self.group.clone(), self.partition)
    }

    fn first_seen(&self) -> DateTime<Utc> {
        let inner = self.inner.lock().expect("bus poisoned");
        inner
            .cursors
            .get(&(self.topic, self.group.clone(), self.partition))
            .and_then(|c| c.first_seen_at)
            .unwrap_or_else(Utc::now)
    }

    fn advance(&self, offset: u64) {
        let mut inner = self.inner.lock().expect("bus poisoned");
        let cursor = inner.cursors.entry(self.cursor_key()).or_default();
        if cursor.committed == offset {
            cursor.committed = offset + 1;
            cursor.attempts = 0;
            cursor.first_seen_at = None;
        }
    }

    fn route_to_dlq(&self, delivery: &Delivery, error: &LastError) -> Result<(), BusError> {
        let envelope = DlqEnvelope {
            original_topic: delivery.topic.name().to_string(),
            original_partition: delivery.partition,
            original_offset: delivery.offset,
            first_seen_at: self.first_seen(),
            last_error: error.clone(),
            attempts: delivery.attempts,
            payload: delivery.payload.clone(),
        };
        let key = format!("{}:{}", delivery.topic, delivery.offset);
        let blob = serde_json::to_vec(&envelope)
            .map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let partition = (hasher.finish() % u64::from(self.dlq_partition_count)) as u32;

        let notify = {
            let mut inner = self.inner.lock().expect("bus poisoned");
            inner
                .logs
                .entry((Topic::Dlq, partition))
                .or_default()
                .push(StoredMessage {
                    key,
                    payload: blob,
                });
            inner.notifier(Topic::Dlq, partition)
        };
        notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let mut inner = self.inner.lock().expect("bus poisoned");
                let cursor = inner
                    .cursors
                    .entry(self.cursor_key())
                    .or_default();
                let committed = cursor.committed;
                let attempts = cursor.attempts;
                if let Some(log) = inner.logs.get(&(self.topic, self.partition))
                    && (committed as usize) < log.len()
                {
                    let message = &log[committed as usize];
                    let delivery = Delivery {
                        topic: self.topic,
                        partition: self.partition,
                        offset: committed,
                        key: message.key.clone(),
                        payload: message.payload.clone(),
                        attempts: attempts + 1,
                    };
                    let cursor = inner
                        .cursors
                        .entry(self.cursor_key())
                        .or_default();
                    cursor.attempts += 1;
                    cursor.first_seen_at.get_or_insert_with(Utc::now);
                    return Ok(Some(delivery));
                }
                inner.notifier(self.topic, self.partition)
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.advance(delivery.offset);
        Ok(())
    }

    async fn nack(
        &mut self,
        delivery: &Delivery,
        error: &LastError,
    ) -> Result<NackOutcome, BusError> {
        if delivery.attempts >= self.dlq_attempt_cap {
            self.route_to_dlq(delivery, error)?;
            self.advance(delivery.offset);
            Ok(NackOutcome::DeadLettered)
        } else {
            Ok(NackOutcome::Redeliver)
        }
    }

    async fn dead_letter(
        &mut self,
        delivery: &Delivery,
        error: &LastError,
    ) -> Result<(), BusError> {
        self.route_to_dlq(delivery, error)?;
        self.advance(delivery.offset);
        Ok(())
    }
}
