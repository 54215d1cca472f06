//! Error types for the CubeFS operator
//!
//! Provides structured error types for reconciliation, workload synthesis,
//! address resolution, and status reporting.

use std::time::Duration;
use thiserror::Error;

use crate::synthesis::Role;

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

    #[error("Spec validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Owner object {kind}/{name} has no uid yet")]
    MissingUid { kind: String, name: String },

    // =========================================================================
    // Synthesis Errors
    // =========================================================================
    /// A role's create-or-update call was rejected by the API server.
    /// `resource` names the failing sub-resource (e.g. "Service",
    /// "StatefulSet") so the status condition can point at it.
    #[error("Failed to apply {resource} for role {role}: {source}")]
    ApplyFailed {
        role: Role,
        resource: String,
        #[source]
        source: kube::Error,
    },

    // =========================================================================
    // Address Resolution Errors
    // =========================================================================
    #[error("Address resolution failed for role {role}: {reason}")]
    AddressResolution { role: Role, reason: String },

    // =========================================================================
    // Health Probe Errors
    // =========================================================================
    #[error("Health probe failed: {0}")]
    HealthProbe(#[from] reqwest::Error),

    #[error("Health probe returned status {0}")]
    HealthProbeStatus(u16),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML render error: {0}")]
    YamlRender(#[from] serde_yaml::Error),

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
            Error::Kube(_) | Error::ApplyFailed { .. } => ErrorAction::RequeueWithBackoff,

            // Health probes are best-effort; a later pass will see the
            // cluster once it answers
            Error::HealthProbe(_) | Error::HealthProbeStatus(_) => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Spec problems - a new submission is required, don't spin
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::AddressResolution { .. }
            | Error::MissingUid { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check whether this error means the object is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            Error::ResourceNotFound { .. } => true,
            _ => false,
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
        let err = Error::Validation("dataNode.disks must not be empty".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::AddressResolution {
            role: Role::CtrlNode,
            reason: "replica count is zero".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::HealthProbeStatus(503);
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_error_retryable() {
        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());

        let internal = Error::Internal("boom".into());
        assert!(internal.is_retryable());
    }

    #[test]
    fn test_not_found_detection() {
        let err = Error::ResourceNotFound {
            kind: "StorageCluster".into(),
            name: "mycluster".into(),
        };
        assert!(err.is_not_found());

        let err = Error::Internal("other".into());
        assert!(!err.is_not_found());
    }
}
