//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the control plane surfaces one of these
//! variants so callers (reconcilers, the webhook responder, the lifecycle
//! manager) can decide whether to retry, requeue, or give up loudly.

use thiserror::Error;

use crate::backend::BackendError;
use crate::github::HostingServiceError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("no hosting-service authentication configured (need a token or an app installation)")]
    MissingAuth,

    #[error("group {0:?} has no labels")]
    EmptyLabels(String),

    #[error("group {group:?} has min ({min}) greater than max ({max})")]
    MinExceedsMax { group: String, min: u32, max: u32 },

    #[error("invalid duration {0:?}: expected ISO-8601 (e.g. PT15M) or a bare integer of seconds")]
    InvalidDuration(String),

    #[error("duplicate runner group name {0:?}")]
    DuplicateGroup(String),
}

/// Errors produced by a single lifecycle transition.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("hosting service rejected the request: {0}")]
    Hosting(#[from] HostingServiceError),

    #[error("backend operation failed: {0}")]
    Backend(#[from] BackendError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("runner {0:?} not found in store")]
    NotFound(String),
}

impl TransitionError {
    /// Transient failures are safe to retry on the next reconciler tick;
    /// everything else is logged and surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransitionError::Hosting(HostingServiceError::Transient(_))
                | TransitionError::Backend(BackendError::BackendUnavailable(_))
        )
    }
}
