//! Error types for enforcement stats operations.
//!
//! All errors implement `std::error::Error` via `thiserror`. Nothing in this
//! crate treats an error as fatal: install paths fold errors into
//! [`RuleModResult`](crate::types::RuleModResult), the poll cycle logs and
//! waits for the next tick.

use std::io;
use thiserror::Error;

/// Result type alias for enforcement stats operations.
pub type Result<T> = std::result::Result<T, EnforcementStatsError>;

/// Errors that can occur while metering policy usage.
#[derive(Debug, Error)]
pub enum EnforcementStatsError {
    /// Switch unreachable or the control channel is gone.
    #[error("Datapath transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
    },

    /// No barrier acknowledgment within the message channel timeout.
    #[error("No acknowledgment from datapath for xid {xid} within {timeout_ms}ms")]
    ProtocolTimeout {
        /// Transaction id of the unacknowledged directive.
        xid: u32,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// The switch rejected a directive.
    #[error("Datapath rejected xid {xid} (code {code}): {reason}")]
    ProtocolReject {
        /// Transaction id of the rejected directive.
        xid: u32,
        /// Switch error code.
        code: u16,
        /// Switch supplied reason.
        reason: String,
    },

    /// A lookup (rule number, prefix, subscriber id) could not be resolved.
    #[error("Failed to resolve {what} '{key}'")]
    ResolutionFailure {
        /// What was being resolved (e.g., "rule number").
        what: String,
        /// The key that was not found.
        key: String,
    },

    /// Version or restart store unreachable.
    #[error("Storage unavailable during {operation}: {message}")]
    StorageUnavailable {
        /// The operation that failed (e.g., "hget").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Upstream reporting RPC failed or rejected the payload.
    #[error("Upstream rejected report: {message}")]
    UpstreamRejected {
        /// Error message.
        message: String,
    },

    /// Match field encoding or frame decoding failed.
    #[error("Codec error: {message}")]
    Codec {
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    Config {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EnforcementStatsError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a resolution failure.
    pub fn resolution(what: impl Into<String>, key: impl ToString) -> Self {
        Self::ResolutionFailure {
            what: what.into(),
            key: key.to_string(),
        }
    }

    /// Creates a storage unavailable error.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an upstream rejection.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamRejected {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true for failures of the switch control channel
    /// (transport, timeout or rejection).
    pub fn is_datapath_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ProtocolTimeout { .. } | Self::ProtocolReject { .. }
        )
    }

    /// Returns true if the error aborts a whole aggregation or reclamation pass.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}
