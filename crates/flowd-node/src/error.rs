//! Error types for the node
//!
//! Only lifecycle and startup problems surface here. Poll timeouts and
//! enumeration failures stay inside the pipeline: they are logged, counted
//! by the health monitor and retried on the next cycle.

use flowd_discovery::ResolverError;
use flowd_transport::BackendError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in node operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid lifecycle transition (start twice, stop while stopped)
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Backend construction or delivery failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Address resolver error
    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if the node cannot run until the error is fixed
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::Resolver(ResolverError::InvalidConfig(_))
                | Self::Backend(BackendError::UnknownBackend(_) | BackendError::InvalidConfig(_))
        )
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let unknown: NodeError = BackendError::UnknownBackend("kafka".into()).into();
        assert!(unknown.is_fatal());
        assert_eq!(
            unknown.to_string(),
            "Backend error: unknown backend 'kafka'"
        );

        let state = NodeError::InvalidState("Node already running".into());
        assert!(!state.is_fatal());

        let join = NodeError::TaskJoin("pipeline task: cancelled".into());
        assert!(!join.is_fatal());
    }
}
