//! Store error taxonomy.

use thiserror::Error;

use crate::resource::{Owner, ResourceRef, Version};

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("resource not found: {0}")]
    NotFound(ResourceRef),

    #[error("conflict on {reference}: {details}")]
    Conflict { reference: ResourceRef, details: String },

    #[error("owner conflict on {reference}: owned by {owner}")]
    OwnerConflict { reference: ResourceRef, owner: Owner },

    #[error("precondition failed on {reference}: {reason}")]
    PreconditionFailed { reference: ResourceRef, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),
}

impl StateError {
    pub(crate) fn version_conflict(reference: ResourceRef, expected: Version, found: Version) -> Self {
        Self::Conflict {
            reference,
            details: format!("expected version {expected}, found {found}"),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether a caller holding fresh inputs may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::NotFound(_) | Self::Unavailable(_) | Self::Cancelled
        )
    }
}
