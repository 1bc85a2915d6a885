//! Error types for the Cassandra operator
//!
//! Every failure in the reconcile and operation engines maps to a variant here.
//! [`Error::action`] turns a variant into a requeue decision so callers never
//! need to inspect error kinds themselves.

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

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    /// Optimistic concurrency check failed while writing a status
    #[error("Status update conflict on {kind}/{name}")]
    StatusConflict { kind: String, name: String },

    /// A dependency (pods, sidecar, coordinator) is not available yet
    #[error("Resource not ready: {0}")]
    ResourceNotReady(String),

    // =========================================================================
    // Topology Errors
    // =========================================================================
    #[error("Invalid rack identity '{dc}-{rack}'")]
    InvalidName { dc: String, rack: String },

    // =========================================================================
    // Node Management Errors
    // =========================================================================
    #[error("Management endpoint error on {host}: {reason}")]
    ManagementEndpoint { host: String, reason: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // =========================================================================
    // Operation Errors
    // =========================================================================
    #[error("Invalid argument for operation {operation} on {pod}: {reason}")]
    OperationArgument {
        operation: String,
        pod: String,
        reason: String,
    },

    /// Not a failure: the remote operation has not reached a terminal state
    #[error("Operation {0} still running")]
    OperationRunning(String),

    #[error("Operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    // =========================================================================
    // Backup/Restore Errors
    // =========================================================================
    #[error("Sidecar unreachable on {host}: {reason}")]
    SidecarUnreachable { host: String, reason: String },

    #[error("Invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("Invalid backup secret {secret}: {reason}")]
    InvalidBackupSecret { secret: String, reason: String },

    #[error("Invalid backup spec: {0}")]
    InvalidBackup(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
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

/// Requeue delay for dependencies that are not available yet
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(15);

/// Requeue delay while a remote operation is still running
pub const RUNNING_REQUEUE: Duration = Duration::from_secs(20);

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Dependencies not there yet - short fixed delay
            Error::ResourceNotReady(_) | Error::SidecarUnreachable { .. } => {
                ErrorAction::RequeueAfter(NOT_READY_REQUEUE)
            }

            // Wait signal
            Error::OperationRunning(_) => ErrorAction::RequeueAfter(RUNNING_REQUEUE),

            // Terminal for this resource instance, surfaced as an event
            Error::OperationFailed { .. }
            | Error::InvalidName { .. }
            | Error::Configuration(_)
            | Error::InvalidSchedule { .. }
            | Error::InvalidBackupSecret { .. }
            | Error::InvalidBackup(_) => ErrorAction::NoRequeue,

            // Conflicts, API failures and everything else - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::HttpClient(_)
                | Error::StatusConflict { .. }
                | Error::SidecarUnreachable { .. }
                | Error::ResourceNotReady(_)
        )
    }

    /// Check if this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::StatusConflict { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
