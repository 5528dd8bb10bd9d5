//! Error types for the multisig coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Signer {owner} is not an owner of instance {instance}")]
    UnauthorizedSigner { instance: String, owner: String },

    #[error("Owner {owner} already signed proposal {key}")]
    DuplicateSignature { key: String, owner: String },

    #[error("Instance mismatch: expected active {active}, got {requested}")]
    InstanceMismatch { active: String, requested: String },

    #[error("Unknown wallet instance {address}")]
    UnknownInstance { address: String },

    #[error("Proposal {key} is stale: {reason}")]
    StaleProposal { key: String, reason: String },

    #[error("Projection gap on instance {instance}: expected nonce {expected}, saw {observed}")]
    ProjectionGap {
        instance: String,
        expected: u64,
        observed: u64,
    },

    #[error("Submission already in progress for instance {instance}")]
    SubmissionInProgress { instance: String },

    #[error("Execution reverted: {0}")]
    Revert(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Chain connection error: {0}")]
    ChainConnection(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Errors the caller can recover from by correcting input and retrying.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Validation(_)
                | CoordinatorError::UnauthorizedSigner { .. }
                | CoordinatorError::DuplicateSignature { .. }
                | CoordinatorError::InstanceMismatch { .. }
                | CoordinatorError::UnknownInstance { .. }
        )
    }

    /// Errors the coordinator recovers from itself by forcing a resync or an
    /// explicit state transition rather than continuing forward.
    pub fn forces_resync(&self) -> bool {
        matches!(
            self,
            CoordinatorError::ProjectionGap { .. } | CoordinatorError::StaleProposal { .. }
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
