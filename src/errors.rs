//! Error taxonomy for the deactivation workflow
//!
//! Failures are classified at the orchestrator call sites: `UserNotFound` and
//! `CredentialRevocationFailed` abort the workflow before any local mutation,
//! per-study withdrawal failures are non-fatal and surface in the outcome,
//! `LocalMutationFailed` is fatal but retryable through the reconciliation
//! queue because credentials are already revoked by that point.

use thiserror::Error;

/// Error returned by an outbound call to a remote platform service.
///
/// The variants preserve the machine-readable distinction the identity
/// service's error channel provides, so callers can tell "not found" apart
/// from a server-side fault without parsing strings.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote resource not found")]
    NotFound,
    #[error("remote service returned HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote call timed out during {operation}")]
    Timeout { operation: String },
}

impl RemoteError {
    /// Whether the remote reported the target as absent (as opposed to a
    /// transient or server-side fault).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound)
    }
}

/// Local participant-store fault.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not found: {user_id}")]
    UserNotFound { user_id: String },
    #[error("enrollment not found: participant {participant_id}, study {study_id}")]
    EnrollmentNotFound {
        participant_id: String,
        study_id: String,
    },
    #[error("storage fault: {reason}")]
    Storage { reason: String },
}

/// Audit sink fault. Contained inside the audit logger: it is reported as an
/// operational fault and never propagates into the workflow result.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink rejected event: {reason}")]
    SinkRejected { reason: String },
    #[error("audit event description contains unresolved placeholder: {description}")]
    UnresolvedPlaceholder { description: String },
    #[error("audit emission timed out")]
    Timeout,
}

/// Aggregate workflow error returned to the caller of
/// [`crate::deactivation::DeactivationService::deactivate`].
#[derive(Debug, Error)]
pub enum DeactivationError {
    /// No profile exists for the requested user. No side effects occurred.
    #[error("user not found: {user_id}")]
    UserNotFound { user_id: String },

    /// Another deactivation run holds the claim on this user. The caller may
    /// retry; the in-flight run will leave the account either Active (it
    /// aborted) or Deactivated.
    #[error("deactivation already in progress for user {user_id}")]
    DeactivationInProgress { user_id: String },

    /// The identity service call failed. The workflow aborted before any
    /// local mutation; the account remains Active.
    #[error("credential revocation failed for user {user_id}")]
    CredentialRevocationFailed {
        user_id: String,
        #[source]
        source: RemoteError,
    },

    /// Local anonymization or enrollment close-out failed after credentials
    /// were already revoked. The run was queued for reconciliation.
    #[error("local state mutation failed for user {user_id}: {reason}")]
    LocalMutationFailed { user_id: String, reason: String },
}

impl DeactivationError {
    /// Stable machine-readable code for the audit trail and API mapping.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            DeactivationError::UserNotFound { .. } => "user_not_found",
            DeactivationError::DeactivationInProgress { .. } => "deactivation_in_progress",
            DeactivationError::CredentialRevocationFailed { .. } => {
                "credential_revocation_failed"
            }
            DeactivationError::LocalMutationFailed { .. } => "local_mutation_failed",
        }
    }
}
