//! Participant Datastore Core
//!
//! Account deactivation / data-withdrawal workflow for a health-study
//! platform. One user action fans out across the identity service, the
//! per-study response datastore, and the local participant-profile store,
//! with ordering guarantees, per-step failure policy, idempotency under
//! retry, and an append-only audit trail of every step.
//!
//! The inbound HTTP surface, request validation, and persistence mapping are
//! boundary collaborators and live outside this crate; the seams here are
//! [`auth_server_client::CredentialRevoker`],
//! [`response_datastore_client::WithdrawalNotifier`],
//! [`participant_store::ParticipantStore`] and [`audit_logging::AuditSink`].

pub mod audit_logging;
pub mod auth_server_client;
pub mod config;
pub mod deactivation;
pub mod errors;
pub mod model;
pub mod participant_store;
pub mod reconciliation;
pub mod response_datastore_client;

pub use audit_logging::{AuditLogEvent, AuditLogger, AuditSink, InMemoryAuditSink, UserMgmtEvent};
pub use auth_server_client::{AuthServerClient, CredentialRevoker};
pub use config::Config;
pub use deactivation::{
    DeactivationOutcome, DeactivationService, StudyWithdrawalOutcome, WithdrawalStatus,
};
pub use errors::{DeactivationError, RemoteError, StoreError};
pub use model::{
    AccountStatus, DeactivationRequest, OnboardingStatus, ParticipantEnrollment,
    StudyWithdrawalChoice, UserProfile, ANONYMIZED_EMAIL_LENGTH, DEACTIVATION_MARKER,
};
pub use participant_store::{InMemoryParticipantStore, ParticipantStore};
pub use reconciliation::ReconciliationQueue;
pub use response_datastore_client::{ResponseDatastoreClient, WithdrawalNotifier};
