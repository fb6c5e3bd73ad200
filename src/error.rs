//! Error types for the local volume operator
//!
//! Provides structured error types for all operator components including
//! the device command layer, capacity ledger, scheduler extender and the
//! CSI driver services.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Update conflict on {kind}/{name} after {attempts} attempts")]
    Conflict {
        kind: String,
        name: String,
        attempts: u32,
    },

    // =========================================================================
    // Capacity Ledger Errors
    // =========================================================================
    #[error("No capacity ledger registered for node: {node}")]
    LedgerMissing { node: String },

    #[error("Insufficient capacity on {node}: requested {requested}GiB, available {available}GiB")]
    InsufficientCapacity {
        node: String,
        requested: u64,
        available: u64,
    },

    // =========================================================================
    // Device Command Errors
    // =========================================================================
    #[error("Device command failed: {command} - {reason}")]
    DeviceCommand { command: String, reason: String },

    #[error("Volume group not found: {vg}")]
    VolumeGroupMissing { vg: String },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Mount target not found: {path}")]
    TargetNotFound { path: String },

    #[error("Pending operation on volume: {volume_id}")]
    OperationPending { volume_id: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::DeviceCommand { .. } | Error::Io(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Ledger conflicts already exhausted bounded retries; give the
            // competing writer time to finish before the next attempt
            Error::Conflict { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Startup transients - the agent registers the ledger shortly
            Error::LedgerMissing { .. } | Error::VolumeGroupMissing { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Capacity pressure clears when volumes are reclaimed
            Error::InsufficientCapacity { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_) | Error::InvalidArgument(_) | Error::CapacityParse(_) => {
                ErrorAction::NoRequeue
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            Error::InvalidArgument(msg) => tonic::Status::invalid_argument(msg.clone()),
            Error::Configuration(msg) => tonic::Status::failed_precondition(msg.clone()),
            Error::TargetNotFound { .. }
            | Error::DeviceNotFound { .. }
            | Error::ResourceNotFound { .. } => tonic::Status::not_found(err.to_string()),
            Error::OperationPending { .. } => tonic::Status::aborted(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Conflict {
            kind: "CapacityLedger".into(),
            name: "node-1".into(),
            attempts: 5,
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(5))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::LedgerMissing {
            node: "node-1".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::DeviceCommand {
            command: "lvcreate".into(),
            reason: "device busy".into(),
        };
        assert!(transient.is_retryable());

        let invalid = Error::InvalidArgument("empty volume id".into());
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn test_grpc_status_mapping() {
        let status: tonic::Status = Error::InvalidArgument("no target path".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = Error::TargetNotFound {
            path: "/var/lib/kubelet/pods/x".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = Error::DeviceCommand {
            command: "mkfs".into(),
            reason: "exit 1".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
