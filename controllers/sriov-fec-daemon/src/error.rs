//! Daemon error types.
//!
//! Errors raised while bootstrapping, watching or reconciling the node's
//! SriovFecNodeConfig. Device failures never surface here: they are
//! absorbed per action and reported through the record's status.

use crate::store::StoreError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the SR-IOV FEC daemon.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// SriovFecNodeConfig store error
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A background task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),

    /// IO error (probe listener, signal handlers)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Returns true when the record changed between read and status write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_conflict())
    }
}
