// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State store abstraction and the typed workflow layer on top of it.
//!
//! The store itself is a plain versioned key-value interface with TTL and
//! pub/sub. [`WorkflowStore`] encodes the key namespaces and blob formats;
//! it is the only place that serializes workflow state.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Checkpoint, Node, NotificationEvent, Workflow, WorkflowStatus};

/// A stored value together with its CAS version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Monotonic per-key version, starting at 1.
    pub version: u64,
    /// Opaque blob.
    pub value: Vec<u8>,
}

/// Versioned key-value store with TTL and pub/sub channels.
///
/// Backends must treat expired keys as absent everywhere, including CAS
/// creation.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a key. Expired keys are a miss.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// Unconditional write. Returns the new version.
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Compare-and-set write.
    ///
    /// `expected = None` creates the key only if absent; `Some(v)` replaces
    /// only if the current version is exactly `v`. Returns the new version,
    /// or [`StoreError::VersionConflict`].
    async fn cas(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All live keys under a prefix, with their values.
    async fn scan_prefix(&self, prefix: &str)
    -> Result<Vec<(String, VersionedValue)>, StoreError>;

    /// Publish a message on a channel. Fire-and-forget; no subscribers is
    /// not an error.
    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), StoreError>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>, StoreError>;
}

/// Key namespace helpers. Everything the engine persists lives under these.
pub mod keys {
    use uuid::Uuid;

    use crate::model::Node;

    /// Authoritative workflow record.
    pub fn workflow(id: &Uuid) -> String {
        format!("wf:state:{id}")
    }

    /// Prefix for scanning all workflow records.
    pub const WORKFLOW_PREFIX: &str = "wf:state:";

    /// Checkpoint for one node of one workflow.
    pub fn checkpoint(id: &Uuid, node: Node) -> String {
        format!("wf:ckpt:{id}:{}", node.name())
    }

    /// Pointer to the most recently checkpointed node.
    pub fn checkpoint_latest(id: &Uuid) -> String {
        format!("wf:ckpt:{id}:latest")
    }

    /// Short-TTL dedup token keyed by source id.
    pub fn dedup_lock(source_id: &str) -> String {
        format!("wf:lock:{source_id}")
    }

    /// Owner lease marking which worker currently drives a workflow.
    pub fn owner_lease(id: &Uuid) -> String {
        format!("wf:owner:{id}")
    }

    /// Cancellation tombstone.
    pub fn cancel(id: &Uuid) -> String {
        format!("wf:cancel:{id}")
    }

    /// Time-ordered index of workflows awaiting review.
    pub const REVIEW_PENDING: &str = "review:pending";

    /// Pub/sub channel carrying every authoritative state transition.
    pub const EVENTS_CHANNEL: &str = "wf:events";
}

/// Outcome of a dedup-lock claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupClaim {
    /// This caller owns the item; create the workflow.
    Claimed,
    /// Another delivery got here first; the existing workflow id.
    Duplicate(Uuid),
}

const CAS_RETRY_BUDGET: usize = 3;

/// Typed layer over a [`StateStore`]: workflow records, checkpoints, leases,
/// the review index and the event channel.
#[derive(Clone)]
pub struct WorkflowStore {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl WorkflowStore {
    /// Wrap a backend with the given workflow retention.
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Access the underlying backend.
    pub fn backend(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Load a workflow record, adopting the store's version.
    pub async fn load(&self, id: &Uuid) -> Result<Option<Workflow>, StoreError> {
        let Some(found) = self.store.get(&keys::workflow(id)).await? else {
            return Ok(None);
        };
        let mut wf: Workflow = serde_json::from_slice(&found.value)?;
        wf.version = found.version;
        Ok(Some(wf))
    }

    /// Create a fresh workflow record. Fails with a version conflict if a
    /// record already exists for this id.
    pub async fn create(&self, wf: &Workflow) -> Result<Workflow, StoreError> {
        let mut next = wf.clone();
        next.version = 1;
        next.updated_at = Utc::now();
        let blob = serde_json::to_vec(&next)?;
        let version = self
            .store
            .cas(&keys::workflow(&wf.workflow_id), None, &blob, Some(self.ttl))
            .await?;
        next.version = version;
        Ok(next)
    }

    /// CAS-update a workflow record against `wf.version`.
    ///
    /// The TTL is refreshed on every write; in-flight workflows therefore
    /// never expire while a worker is making progress.
    pub async fn update(&self, wf: &Workflow) -> Result<Workflow, StoreError> {
        let expected = wf.version;
        let mut next = wf.clone();
        next.version = expected + 1;
        next.updated_at = Utc::now();
        let blob = serde_json::to_vec(&next)?;
        let version = self
            .store
            .cas(
                &keys::workflow(&wf.workflow_id),
                Some(expected),
                &blob,
                Some(self.ttl),
            )
            .await?;
        next.version = version;
        Ok(next)
    }

    /// All non-terminal workflows currently in the store.
    pub async fn list_inflight(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut out = Vec::new();
        for (_, found) in self.store.scan_prefix(keys::WORKFLOW_PREFIX).await? {
            let mut wf: Workflow = serde_json::from_slice(&found.value)?;
            wf.version = found.version;
            if matches!(
                wf.status,
                WorkflowStatus::Running | WorkflowStatus::Resuming
            ) {
                out.push(wf);
            }
        }
        Ok(out)
    }

    /// All workflows parked in `AwaitingReview`.
    pub async fn list_awaiting_review(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut out = Vec::new();
        for (_, found) in self.store.scan_prefix(keys::WORKFLOW_PREFIX).await? {
            let mut wf: Workflow = serde_json::from_slice(&found.value)?;
            wf.version = found.version;
            if wf.status == WorkflowStatus::AwaitingReview {
                out.push(wf);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Persist a checkpoint and move the latest pointer.
    pub async fn save_checkpoint(&self, cp: &Checkpoint) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(cp)?;
        self.store
            .put(
                &keys::checkpoint(&cp.workflow_id, cp.node),
                &blob,
                Some(self.ttl),
            )
            .await?;
        self.store
            .put(
                &keys::checkpoint_latest(&cp.workflow_id),
                cp.node.name().as_bytes(),
                Some(self.ttl),
            )
            .await?;
        Ok(())
    }

    /// Load the checkpoint for a specific node.
    pub async fn load_checkpoint(
        &self,
        id: &Uuid,
        node: Node,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let Some(found) = self.store.get(&keys::checkpoint(id, node)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&found.value)?))
    }

    /// Load the most recently written checkpoint, if any.
    pub async fn latest_checkpoint(&self, id: &Uuid) -> Result<Option<Checkpoint>, StoreError> {
        let Some(pointer) = self.store.get(&keys::checkpoint_latest(id)).await? else {
            return Ok(None);
        };
        let name = String::from_utf8_lossy(&pointer.value).to_string();
        let Some(found) = self.store.get(&format!("wf:ckpt:{id}:{name}")).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&found.value)?))
    }

    // ------------------------------------------------------------------
    // Dedup lock
    // ------------------------------------------------------------------

    /// Claim the dedup token for a source id.
    pub async fn claim_dedup(
        &self,
        source_id: &str,
        workflow_id: &Uuid,
        ttl: Duration,
    ) -> Result<DedupClaim, StoreError> {
        let key = keys::dedup_lock(source_id);
        let value = workflow_id.as_bytes().to_vec();
        match self.store.cas(&key, None, &value, Some(ttl)).await {
            Ok(_) => Ok(DedupClaim::Claimed),
            Err(StoreError::VersionConflict { .. }) => {
                match self.store.get(&key).await? {
                    Some(found) => {
                        let existing = Uuid::from_slice(&found.value)
                            .unwrap_or_else(|_| *workflow_id);
                        Ok(DedupClaim::Duplicate(existing))
                    }
                    // Token expired between cas and get; take it now.
                    None => {
                        self.store.cas(&key, None, &value, Some(ttl)).await?;
                        Ok(DedupClaim::Claimed)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Owner lease
    // ------------------------------------------------------------------

    /// Try to take (or refresh our own) ownership of a workflow.
    pub async fn try_acquire_owner(
        &self,
        id: &Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = keys::owner_lease(id);
        match self
            .store
            .cas(&key, None, owner.as_bytes(), Some(ttl))
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::VersionConflict { .. }) => match self.store.get(&key).await? {
                Some(found) if found.value == owner.as_bytes() => {
                    self.store.put(&key, owner.as_bytes(), Some(ttl)).await?;
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => {
                    self.store
                        .cas(&key, None, owner.as_bytes(), Some(ttl))
                        .await?;
                    Ok(true)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Refresh an owner lease we already hold.
    pub async fn renew_owner(
        &self,
        id: &Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .put(&keys::owner_lease(id), owner.as_bytes(), Some(ttl))
            .await?;
        Ok(())
    }

    /// Release an owner lease so another process may pick the workflow up.
    pub async fn release_owner(&self, id: &Uuid) -> Result<(), StoreError> {
        self.store.delete(&keys::owner_lease(id)).await
    }

    /// Current live owner, if any.
    pub async fn owner_of(&self, id: &Uuid) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(&keys::owner_lease(id))
            .await?
            .map(|v| String::from_utf8_lossy(&v.value).to_string()))
    }

    // ------------------------------------------------------------------
    // Cancellation tombstone
    // ------------------------------------------------------------------

    /// Write the cancellation tombstone. Idempotent.
    pub async fn request_cancel(&self, id: &Uuid) -> Result<(), StoreError> {
        self.store
            .put(&keys::cancel(id), b"1", Some(self.ttl))
            .await?;
        Ok(())
    }

    /// Whether a cancellation tombstone exists.
    pub async fn cancel_requested(&self, id: &Uuid) -> Result<bool, StoreError> {
        Ok(self.store.get(&keys::cancel(id)).await?.is_some())
    }

    // ------------------------------------------------------------------
    // Review index
    // ------------------------------------------------------------------

    /// Add a workflow to the time-ordered review index.
    pub async fn review_enqueue(
        &self,
        id: &Uuid,
        requested_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.review_index_edit(|entries| {
            if !entries.iter().any(|(_, existing)| existing == id) {
                entries.push((requested_at, *id));
                entries.sort();
            }
        })
        .await
    }

    /// Remove a workflow from the review index.
    pub async fn review_dequeue(&self, id: &Uuid) -> Result<(), StoreError> {
        self.review_index_edit(|entries| entries.retain(|(_, existing)| existing != id))
            .await
    }

    /// The review index, oldest request first.
    pub async fn review_pending(&self) -> Result<Vec<(DateTime<Utc>, Uuid)>, StoreError> {
        match self.store.get(keys::REVIEW_PENDING).await? {
            Some(found) => Ok(serde_json::from_slice(&found.value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn review_index_edit<F>(&self, edit: F) -> Result<(), StoreError>
    where
        F: Fn(&mut Vec<(DateTime<Utc>, Uuid)>),
    {
        for _ in 0..CAS_RETRY_BUDGET {
            let current = self.store.get(keys::REVIEW_PENDING).await?;
            let (expected, mut entries): (Option<u64>, Vec<(DateTime<Utc>, Uuid)>) = match &current
            {
                Some(found) => (Some(found.version), serde_json::from_slice(&found.value)?),
                None => (None, Vec::new()),
            };
            edit(&mut entries);
            let blob = serde_json::to_vec(&entries)?;
            match self
                .store
                .cas(keys::REVIEW_PENDING, expected, &blob, None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::VersionConflict {
            key: keys::REVIEW_PENDING.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Event channel
    // ------------------------------------------------------------------

    /// Broadcast an authoritative state transition.
    pub async fn publish_event(&self, event: &NotificationEvent) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(event)?;
        self.store.publish(keys::EVENTS_CHANNEL, &blob).await
    }

    /// Subscribe to the transition channel.
    pub async fn subscribe_events(&self) -> Result<broadcast::Receiver<Vec<u8>>, StoreError> {
        self.store.subscribe(keys::EVENTS_CHANNEL).await
    }
}
