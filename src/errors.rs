//! Typed error hierarchy for the Foreman orchestrator.
//!
//! One enum per subsystem:
//! - `LockError` — named-mutex acquisition failures
//! - `StateError` — state-document validation and persistence failures
//! - `ClaimError` — claim-protocol precondition failures
//! - `DecisionError` — decision-record lifecycle failures
//! - `OrchestratorError` — lifecycle and prerequisite failures

use thiserror::Error;

/// Errors from the named cross-process mutex.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out acquiring lock '{name}' after {waited_secs}s")]
    Timeout { name: String, waited_secs: u64 },

    #[error("Failed to access lock '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    /// Contention errors are retryable; the caller should sleep and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors from the state document and its store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Unknown feature id '{0}'")]
    UnknownFeature(String),

    #[error("Duplicate feature id '{0}' in state document")]
    DuplicateFeature(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the claim protocol.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Feature '{id}' is not claimable: {reason}")]
    Unavailable { id: String, reason: String },

    #[error("Feature '{id}' is not in progress (status: {status})")]
    NotInProgress { id: String, status: String },

    #[error("Unknown feature id '{0}'")]
    UnknownFeature(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors from the decision queue.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Decision '{0}' not found")]
    NotFound(String),

    #[error("Decision '{id}' is not pending (status: {status})")]
    NotPending { id: String, status: String },

    #[error("Answer '{answer}' is not one of the offered options: {options:?}")]
    InvalidAnswer {
        answer: String,
        options: Vec<String>,
    },

    #[error("Decision '{0}' timed out with no default answer")]
    Timeout(String),

    #[error("Decision wait cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from orchestrator lifecycle and prerequisites.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Prerequisite failed: {0}")]
    PrerequisiteFailed(String),

    #[error("Merge planning failed: {0}")]
    MergePlan(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
