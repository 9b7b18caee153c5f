// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration loaded from environment variables.

use std::time::Duration;

use crate::model::Node;

/// Retry backoff shape used by the node runtime.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay.
    pub base: Duration,
    /// Multiplier per attempt.
    pub factor: f64,
    /// Upper bound on any delay.
    pub cap: Duration,
    /// Symmetric jitter fraction, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

/// Per-node wall-clock limits.
#[derive(Debug, Clone)]
pub struct NodeTimeouts {
    /// Normalize.
    pub normalize: Duration,
    /// Entity extraction.
    pub entity: Duration,
    /// Claim extraction.
    pub claims: Duration,
    /// Per-claim topic assignment.
    pub topic: Duration,
    /// Per-claim evidence retrieval.
    pub evidence: Duration,
    /// Per-claim veracity assessment.
    pub veracity: Duration,
    /// Risk scoring.
    pub risk: Duration,
    /// Advisory drafting.
    pub draft: Duration,
    /// Translation.
    pub translate: Duration,
    /// Publication.
    pub publish: Duration,
}

impl Default for NodeTimeouts {
    fn default() -> Self {
        Self {
            normalize: Duration::from_secs(5),
            entity: Duration::from_secs(30),
            claims: Duration::from_secs(30),
            topic: Duration::from_secs(30),
            evidence: Duration::from_secs(60),
            veracity: Duration::from_secs(30),
            risk: Duration::from_secs(5),
            draft: Duration::from_secs(60),
            translate: Duration::from_secs(60),
            publish: Duration::from_secs(10),
        }
    }
}

impl NodeTimeouts {
    /// Deadline for one node, `None` for nodes that only park or merge.
    pub fn for_node(&self, node: Node) -> Option<Duration> {
        match node {
            Node::Normalize => Some(self.normalize),
            Node::EntityExtract => Some(self.entity),
            Node::ClaimExtract => Some(self.claims),
            Node::TopicAssign => Some(self.topic),
            Node::EvidenceRetrieve => Some(self.evidence),
            Node::VeracityAssess => Some(self.veracity),
            Node::RiskScore => Some(self.risk),
            Node::DraftAdvisory => Some(self.draft),
            Node::Translate => Some(self.translate),
            Node::Publish => Some(self.publish),
            Node::ClaimMerge | Node::AwaitReview => None,
        }
    }
}

/// All recognized options. Defaults match the operational documentation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Risk at or above this parks the workflow for review.
    pub review_threshold: f64,
    /// Max concurrent per-claim sub-pipelines within one workflow.
    pub claim_parallelism: usize,
    /// Per-node wall-clock limits.
    pub node_timeouts: NodeTimeouts,
    /// Max attempts per node for retryable failures.
    pub retry_max_attempts: u32,
    /// Backoff shape between attempts.
    pub retry_backoff: BackoffConfig,
    /// Message attempts before DLQ routing.
    pub dlq_attempt_cap: u32,
    /// Retention of workflow state; refreshed on every write while in flight.
    pub workflow_ttl: Duration,
    /// Operator claim lease duration.
    pub review_lease: Duration,
    /// No decision within this window triggers periodic reminders.
    pub review_deadline: Duration,
    /// Per-subscriber observer buffer.
    pub observer_queue_size: usize,
    /// Observer heartbeat interval; two misses close the connection.
    pub observer_heartbeat: Duration,
    /// Graceful drain window on shutdown.
    pub shutdown_grace: Duration,
    /// Workflow-wide deadline, excluding time spent awaiting review.
    pub workflow_deadline: Duration,
    /// Owner-lease TTL marking which worker drives a workflow.
    pub owner_lease_ttl: Duration,
    /// Owner-lease renewal interval; a third of the TTL.
    pub owner_lease_renew: Duration,
    /// Advisory translation targets.
    pub translate_languages: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            review_threshold: 0.7,
            claim_parallelism: 4,
            node_timeouts: NodeTimeouts::default(),
            retry_max_attempts: 3,
            retry_backoff: BackoffConfig::default(),
            dlq_attempt_cap: 5,
            workflow_ttl: Duration::from_secs(7 * 24 * 3600),
            review_lease: Duration::from_secs(30 * 60),
            review_deadline: Duration::from_secs(24 * 3600),
            observer_queue_size: 100,
            observer_heartbeat: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            workflow_deadline: Duration::from_secs(30 * 60),
            owner_lease_ttl: Duration::from_secs(30),
            owner_lease_renew: Duration::from_secs(10),
            translate_languages: ["hi", "mr", "bn", "ta", "te"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Load configuration from `VERIFLOW_*` environment variables.
    ///
    /// Every option is optional; unset variables fall back to the defaults
    /// above. Durations are given in seconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<f64>("VERIFLOW_REVIEW_THRESHOLD")? {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(
                    "VERIFLOW_REVIEW_THRESHOLD",
                    "must be within [0, 1]",
                ));
            }
            cfg.review_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("VERIFLOW_CLAIM_PARALLELISM")? {
            if v == 0 {
                return Err(ConfigError::Invalid(
                    "VERIFLOW_CLAIM_PARALLELISM",
                    "must be at least 1",
                ));
            }
            cfg.claim_parallelism = v;
        }
        if let Some(v) = env_parse::<u32>("VERIFLOW_RETRY_MAX_ATTEMPTS")? {
            cfg.retry_max_attempts = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("VERIFLOW_DLQ_ATTEMPT_CAP")? {
            cfg.dlq_attempt_cap = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("VERIFLOW_WORKFLOW_TTL_SECS")? {
            cfg.workflow_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("VERIFLOW_REVIEW_LEASE_SECS")? {
            cfg.review_lease = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("VERIFLOW_REVIEW_DEADLINE_SECS")? {
            cfg.review_deadline = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("VERIFLOW_OBSERVER_QUEUE_SIZE")? {
            cfg.observer_queue_size = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("VERIFLOW_SHUTDOWN_GRACE_SECS")? {
            cfg.shutdown_grace = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("VERIFLOW_WORKFLOW_DEADLINE_SECS")? {
            cfg.workflow_deadline = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("VERIFLOW_OWNER_LEASE_SECS")? {
            cfg.owner_lease_ttl = Duration::from_secs(v);
            cfg.owner_lease_renew = Duration::from_secs((v / 3).max(1));
        }
        if let Ok(langs) = std::env::var("VERIFLOW_TRANSLATE_LANGUAGES") {
            cfg.translate_languages = langs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(cfg)
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, "could not be parsed")),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let cfg = Config::default();
        assert_eq!(cfg.review_threshold, 0.7);
        assert_eq!(cfg.claim_parallelism, 4);
        assert_eq!(cfg.retry_max_attempts, 3);
        assert_eq!(cfg.dlq_attempt_cap, 5);
        assert_eq!(cfg.workflow_ttl, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(cfg.review_lease, Duration::from_secs(1800));
        assert_eq!(cfg.observer_queue_size, 100);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn node_timeout_defaults() {
        let t = NodeTimeouts::default();
        assert_eq!(t.for_node(Node::Normalize), Some(Duration::from_secs(5)));
        assert_eq!(
            t.for_node(Node::EvidenceRetrieve),
            Some(Duration::from_secs(60))
        );
        assert_eq!(t.for_node(Node::Publish), Some(Duration::from_secs(10)));
        assert_eq!(t.for_node(Node::AwaitReview), None);
        assert_eq!(t.for_node(Node::ClaimMerge), None);
    }

    #[test]
    fn lease_renewal_is_a_third_of_ttl() {
        let cfg = Config::default();
        assert_eq!(cfg.owner_lease_renew * 3, cfg.owner_lease_ttl);
    }
}
