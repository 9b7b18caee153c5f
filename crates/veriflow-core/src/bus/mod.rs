// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed gateway over the partitioned durable log.
//!
//! The gateway exposes the fixed topic taxonomy, per-key partitioning,
//! at-least-once consumption with explicit offset commit, and DLQ routing
//! once a message exhausts its attempt budget. Consumers must be idempotent
//! on workflow id; the orchestrator's dedup lock provides that.

pub mod memory;

pub use self::memory::MemoryBus;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BusError, ErrorKind};

/// The fixed topic taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Work intake, keyed by source id.
    RawItems,
    /// Intra-workflow claim fan-out when offloaded to a separate pool.
    Claims,
    /// High-risk notifications and failures, keyed by workflow id.
    Alerts,
    /// User-visible events, keyed by recipient scope.
    Notifications,
    /// Poison messages, single partition.
    Dlq,
}

impl Topic {
    /// Wire name of the topic.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RawItems => "raw-items",
            Self::Claims => "claims",
            Self::Alerts => "alerts",
            Self::Notifications => "notifications",
            Self::Dlq => "dlq",
        }
    }

    /// Default partition sizing.
    pub fn default_partitions(&self) -> u32 {
        match self {
            Self::RawItems => 4,
            Self::Claims => 4,
            Self::Alerts => 1,
            Self::Notifications => 1,
            Self::Dlq => 1,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One delivered message. Redeliveries carry an incremented attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the message came from.
    pub topic: Topic,
    /// Partition within the topic.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Partition key.
    pub key: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Delivery attempt, 1-based.
    pub attempts: u32,
}

/// What happened to a message that was negatively acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The message stays at the head of the partition for redelivery.
    Redeliver,
    /// The attempt cap was reached; the message moved to the DLQ and the
    /// offset was committed.
    DeadLettered,
}

/// Publishing half of the gateway.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload under a partition key. Per-key ordering is
    /// preserved within a partition.
    async fn publish(&self, topic: Topic, key: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Number of partitions for a topic.
    fn partitions(&self, topic: Topic) -> u32;

    /// Open a consumer bound to one partition of a topic for a group.
    ///
    /// Consumer groups own partitions exclusively; the supervisor spawns
    /// one worker per partition.
    async fn consumer(
        &self,
        topic: Topic,
        group: &str,
        partition: u32,
    ) -> Result<Box<dyn BusConsumer>, BusError>;
}

/// Consuming half of the gateway, bound to one partition.
#[async_trait]
pub trait BusConsumer: Send {
    /// Next uncommitted message, or `None` when the wait times out.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError>;

    /// Commit the offset of a processed delivery. Only called after the
    /// resulting state transition is durably checkpointed.
    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Negatively acknowledge a delivery. The message is redelivered with
    /// an incremented attempt count until the cap, then routed to the DLQ.
    async fn nack(
        &mut self,
        delivery: &Delivery,
        error: &LastError,
    ) -> Result<NackOutcome, BusError>;

    /// Route a delivery straight to the DLQ, committing its offset.
    /// Used for poison payloads that can never deserialize.
    async fn dead_letter(
        &mut self,
        delivery: &Delivery,
        error: &LastError,
    ) -> Result<(), BusError>;
}

/// Last failure recorded for a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    /// Classified kind.
    pub kind: ErrorKind,
    /// Non-sensitive detail.
    pub detail: String,
}

/// Envelope written to the DLQ for operator inspection. Never fed back
/// automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    /// Topic the message originally arrived on.
    pub original_topic: String,
    /// Original partition.
    pub original_partition: u32,
    /// Original offset.
    pub original_offset: u64,
    /// When the first delivery attempt was made.
    pub first_seen_at: DateTime<Utc>,
    /// The failure that exhausted the budget.
    pub last_error: LastError,
    /// Total delivery attempts.
    pub attempts: u32,
    /// Original payload, for inspection.
    pub payload: Vec<u8>,
}

/// Alert severity on the `alerts` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs operator attention.
    Warn,
    /// Needs operator attention now.
    Critical,
}

/// Message published on `alerts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    /// Affected workflow.
    pub workflow_id: Uuid,
    /// review_requested, review_reminder, workflow_failed, ...
    pub kind: String,
    /// Severity for routing.
    pub severity: Severity,
    /// Non-sensitive summary.
    pub summary: String,
    /// When the alert was produced.
    pub at: DateTime<Utc>,
}

/// Message published on `notifications`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Affected workflow.
    pub workflow_id: Uuid,
    /// advisory_published, workflow_completed, ...
    pub kind: String,
    /// Recipient scope, also the partition key.
    pub recipient_scope: String,
    /// Event payload.
    pub payload: Value,
    /// When the notification was produced.
    pub at: DateTime<Utc>,
}
