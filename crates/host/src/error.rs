//! Error types for host method access

use crate::host::MethodId;

/// Error type for host collaborator operations
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// No method with this name exists in the host
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Method identity was never handed out by this host
    #[error("Unknown method identity: {0}")]
    UnknownMethod(MethodId),

    /// Host has no readable body for the method (abstract, native, ...)
    #[error("Method has no body: {0}")]
    NoBody(String),

    /// Host refused to swap in the replacement body
    #[error("Activation rejected for {method}: {reason}")]
    ActivationRejected { method: String, reason: String },

    /// Replacement body references a label that does not resolve
    #[error("Body for {method} has dangling labels: {labels}")]
    DanglingLabels { method: String, labels: String },
}
