// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy shared by every layer of the engine.
//!
//! Stage, store and bus failures are all classified into [`ErrorKind`]
//! before they reach the orchestrator, which decides terminal disposition
//! from the kind alone.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed classification of everything that can go wrong while driving a
/// workflow. The orchestrator never inspects error details, only the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient failure; the node runtime retries with backoff.
    Retryable,
    /// Input rejected by a stage; never retried.
    Validation,
    /// Node deadline exceeded; retried like `Retryable` up to the attempt cap.
    Timeout,
    /// An upstream collaborator failed in a way retries cannot fix.
    PermanentUpstreamFailure,
    /// Cancellation tombstone observed at a node boundary.
    Cancelled,
    /// Every per-claim sub-pipeline failed during the merge.
    AllClaimsFailed,
    /// CAS conflicts persisted past the retry budget.
    ConsistencyLost,
    /// The event bus is unreachable; backed off at the supervisor.
    BusUnavailable,
    /// The event bus rejected our credentials; fatal.
    AuthError,
}

impl ErrorKind {
    /// Stable wire code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Retryable => "RETRYABLE",
            Self::Validation => "VALIDATION",
            Self::Timeout => "TIMEOUT",
            Self::PermanentUpstreamFailure => "PERMANENT_UPSTREAM_FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::AllClaimsFailed => "ALL_CLAIMS_FAILED",
            Self::ConsistencyLost => "CONSISTENCY_LOST",
            Self::BusUnavailable => "BUS_UNAVAILABLE",
            Self::AuthError => "AUTH_ERROR",
        }
    }

    /// Whether the node runtime may retry a failure of this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure returned by a pipeline stage or collaborator.
///
/// Stages return these directly; the node runtime classifies anything
/// residual into one of the [`ErrorKind`] variants before surfacing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    /// Classification driving retry/terminal policy.
    pub kind: ErrorKind,
    /// Non-sensitive human-readable detail.
    pub detail: String,
}

impl StageError {
    /// Transient failure worth retrying.
    pub fn retryable(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            detail: detail.into(),
        }
    }

    /// Input rejected; never retried.
    pub fn validation(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            detail: detail.into(),
        }
    }

    /// Deadline exceeded.
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            detail: detail.into(),
        }
    }

    /// Upstream collaborator is permanently broken for this input.
    pub fn upstream(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PermanentUpstreamFailure,
            detail: detail.into(),
        }
    }

    /// Cancellation observed.
    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            detail: "cancellation requested".to_string(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.detail)
    }
}

impl std::error::Error for StageError {}

/// State store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend is unreachable; callers back off.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A CAS write lost the race; callers re-read and re-decide.
    #[error("version conflict on key '{key}'")]
    VersionConflict {
        /// The contested key.
        key: String,
    },

    /// A persisted blob failed to round-trip.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Event bus gateway failures.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Brokers unreachable; retryable with backoff, no state mutation.
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// Payload could not be decoded; non-retryable, routed to the DLQ.
    #[error("bus serialization error: {0}")]
    Serialization(String),

    /// Credentials rejected; fatal at the supervisor.
    #[error("bus auth error: {0}")]
    Auth(String),
}

impl BusError {
    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::BusUnavailable,
            Self::Serialization(_) => ErrorKind::Validation,
            Self::Auth(_) => ErrorKind::AuthError,
        }
    }
}
