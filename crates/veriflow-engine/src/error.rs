// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine-level errors and the operator surface error codes.

use std::fmt;

use uuid::Uuid;

use veriflow_core::error::{BusError, StoreError};
use veriflow_core::model::WorkflowStatus;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures surfaced by the orchestrator and supervisor.
#[derive(Debug)]
pub enum EngineError {
    /// State store failure.
    Store(StoreError),
    /// Event bus failure.
    Bus(BusError),
    /// A blob failed to round-trip.
    Codec(serde_json::Error),
    /// CAS conflicts persisted past the retry budget.
    ConsistencyLost {
        /// The contested workflow.
        workflow_id: Uuid,
    },
    /// A status edge the machine does not allow was requested.
    InvalidTransition {
        /// The workflow.
        workflow_id: Uuid,
        /// Current status.
        from: WorkflowStatus,
        /// Requested status.
        to: WorkflowStatus,
    },
}

impl EngineError {
    /// Classify into the shared taxonomy for DLQ envelopes and alerts.
    pub fn kind(&self) -> veriflow_core::error::ErrorKind {
        use veriflow_core::error::ErrorKind;
        match self {
            Self::Store(StoreError::Unavailable(_)) => ErrorKind::Retryable,
            Self::Store(StoreError::VersionConflict { .. }) => ErrorKind::ConsistencyLost,
            Self::Store(StoreError::Codec(_)) => ErrorKind::Validation,
            Self::Bus(e) => e.kind(),
            Self::Codec(_) => ErrorKind::Validation,
            Self::ConsistencyLost { .. } | Self::InvalidTransition { .. } => {
                ErrorKind::ConsistencyLost
            }
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "state store: {e}"),
            Self::Bus(e) => write!(f, "event bus: {e}"),
            Self::Codec(e) => write!(f, "codec: {e}"),
            Self::ConsistencyLost { workflow_id } => {
                write!(f, "consistency lost on workflow '{workflow_id}'")
            }
            Self::InvalidTransition {
                workflow_id,
                from,
                to,
            } => write!(
                f,
                "invalid transition {from} -> {to} on workflow '{workflow_id}'"
            ),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<BusError> for EngineError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e)
    }
}

/// Errors returned over the operator surface of the review coordinator.
#[derive(Debug)]
pub enum OperatorError {
    /// No workflow with that id.
    NotFound {
        /// The missing workflow.
        workflow_id: Uuid,
    },
    /// Another operator holds a live lease.
    AlreadyClaimed {
        /// Who holds it.
        operator: String,
    },
    /// The presented lease is missing, expired, or belongs to someone else.
    LeaseInvalid,
    /// The workflow is not parked for review.
    NotAwaitingReview {
        /// Its actual status.
        status: WorkflowStatus,
    },
    /// The workflow is already terminal.
    Terminal {
        /// Its terminal status.
        status: WorkflowStatus,
    },
    /// Underlying engine failure.
    Internal(EngineError),
}

impl OperatorError {
    /// Stable wire code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            Self::LeaseInvalid => "LEASE_INVALID",
            Self::NotAwaitingReview { .. } => "NOT_AWAITING_REVIEW",
            Self::Terminal { .. } => "TERMINAL",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => write!(f, "workflow '{workflow_id}' not found"),
            Self::AlreadyClaimed { operator } => {
                write!(f, "review already claimed by '{operator}'")
            }
            Self::LeaseInvalid => write!(f, "review lease is invalid or expired"),
            Self::NotAwaitingReview { status } => {
                write!(f, "workflow is not awaiting review (status: {status})")
            }
            Self::Terminal { status } => write!(f, "workflow is terminal (status: {status})"),
            Self::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<EngineError> for OperatorError {
    fn from(e: EngineError) -> Self {
        Self::Internal(e)
    }
}

impl From<StoreError> for OperatorError {
    fn from(e: StoreError) -> Self {
        Self::Internal(EngineError::Store(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_error_codes() {
        assert_eq!(
            OperatorError::NotFound {
                workflow_id: Uuid::nil()
            }
            .error_code(),
            "NOT_FOUND"
        );
        assert_eq!(OperatorError::LeaseInvalid.error_code(), "LEASE_INVALID");
        assert_eq!(
            OperatorError::Terminal {
                status: WorkflowStatus::Completed
            }
            .error_code(),
            "TERMINAL"
        );
    }
}
