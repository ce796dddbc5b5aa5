//! Error types for the replication subsystem.

use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Misconfiguration detected at runtime (never retried).
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the misconfiguration.
        msg: String,
    },

    /// The primary could not be reached or the link failed mid-call.
    #[error("network error: {msg}")]
    Network {
        /// Error message describing the network issue.
        msg: String,
    },

    /// A replicated commit or lock change could not be applied locally.
    #[error("apply error: {msg}")]
    Apply {
        /// Error message describing the apply failure.
        msg: String,
    },

    /// The commit was rolled back, locally or by the primary.
    #[error("transaction failed: {msg}")]
    Transaction {
        /// Rollback message.
        msg: String,
    },

    /// The requested operation is locked out in the current repository state.
    #[error("locked: {msg}")]
    Locked {
        /// Error message describing why the operation is locked out.
        msg: String,
    },

    /// The operation is not legal for the repository type or state.
    #[error("illegal state: {msg}")]
    IllegalState {
        /// Error message describing the illegal operation.
        msg: String,
    },

    /// A lock or update wait did not complete within its timeout.
    #[error("timed out after {timeout_ms}ms: {msg}")]
    LockTimeout {
        /// What was being waited for.
        msg: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// A collaborator broke a protocol contract.
    #[error("contract violation: {msg}")]
    ContractViolation {
        /// Error message describing the violated contract.
        msg: String,
    },

    /// Revision store failure.
    #[error("store error: {msg}")]
    Store {
        /// Error message from the store.
        msg: String,
    },

    /// Raw replication stream could not be decoded.
    #[error("codec error: {msg}")]
    Codec {
        /// Error message describing the malformed stream.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Synchronizer or repository was shut down.
    #[error("replication shut down")]
    Shutdown,
}

impl ReplError {
    /// Connectivity failures are retried indefinitely by the runner.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Io(_))
    }

    /// Configuration and contract errors stop the synchronizer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::ContractViolation { .. })
    }

    pub(crate) fn locked(msg: impl Into<String>) -> Self {
        Self::Locked { msg: msg.into() }
    }

    pub(crate) fn illegal(msg: impl Into<String>) -> Self {
        Self::IllegalState { msg: msg.into() }
    }

    pub(crate) fn store(msg: impl Into<String>) -> Self {
        Self::Store { msg: msg.into() }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config { msg: msg.into() }
    }

    pub(crate) fn network(msg: impl Into<String>) -> Self {
        Self::Network { msg: msg.into() }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;
