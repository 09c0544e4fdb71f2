//! Account deactivation orchestrator
//!
//! Drives one workflow run per request: resolve the profile, claim the
//! account, revoke credentials (must-succeed), intimate withdrawal to the
//! response datastore per study (best-effort, concurrent), mutate local state
//! (anonymize and close enrollments, concurrent with a join), and emit the
//! summary audit event. Every boundary emits one audit event carrying the
//! run's correlation id. Runs for the same user are serialized by a keyed
//! mutex on top of the store's conditional status transition, and a run is
//! never cancelled mid-flight: remote mutation without a completed local
//! record would break the audit contract.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit_logging::{AuditLogEvent, AuditLogger, PlatformComponent, UserMgmtEvent};
use crate::auth_server_client::CredentialRevoker;
use crate::errors::{AuditError, DeactivationError, StoreError};
use crate::model::{DeactivationRequest, ParticipantEnrollment, StudyWithdrawalChoice};
use crate::participant_store::{DeactivationClaim, ParticipantStore};
use crate::reconciliation::{PendingLocalMutation, ReconciliationQueue};
use crate::response_datastore_client::WithdrawalNotifier;

/// Outcome of one per-study withdrawal notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalStatus {
    /// The response datastore acknowledged the notification.
    Notified,
    /// The notification failed; the reason is carried for the caller and the
    /// audit trail. The rest of the workflow continued.
    Failed { reason: String },
}

/// Per-study result surfaced to the caller.
#[derive(Debug, Clone)]
pub struct StudyWithdrawalOutcome {
    pub study_id: String,
    pub participant_id: Option<String>,
    /// The user's original delete/retain choice, passed through unchanged.
    pub delete_responses: bool,
    pub status: WithdrawalStatus,
}

impl StudyWithdrawalOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == WithdrawalStatus::Notified
    }
}

/// Aggregate result of one deactivation run.
#[derive(Debug, Clone)]
pub struct DeactivationOutcome {
    pub user_id: String,
    pub correlation_id: Uuid,
    /// The account was already deactivated and the run was a no-op.
    pub already_deactivated: bool,
    pub study_outcomes: Vec<StudyWithdrawalOutcome>,
}

impl DeactivationOutcome {
    /// Per-study failures, if any. Partial failures never hide behind a
    /// blanket success: callers surface this list.
    #[must_use]
    pub fn failed_studies(&self) -> Vec<&StudyWithdrawalOutcome> {
        self.study_outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .collect()
    }
}

/// Sequences the deactivation workflow across the identity service, the
/// response datastore, and the local participant store.
pub struct DeactivationService {
    store: Arc<dyn ParticipantStore>,
    revoker: Arc<dyn CredentialRevoker>,
    notifier: Arc<dyn WithdrawalNotifier>,
    audit: Arc<AuditLogger>,
    reconciliation: Arc<ReconciliationQueue>,
    // In-process serialization per user id; the store's status CAS covers
    // requests arriving on other processes.
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DeactivationService {
    #[must_use]
    pub fn new(
        store: Arc<dyn ParticipantStore>,
        revoker: Arc<dyn CredentialRevoker>,
        notifier: Arc<dyn WithdrawalNotifier>,
        audit: Arc<AuditLogger>,
        reconciliation: Arc<ReconciliationQueue>,
    ) -> Self {
        Self {
            store,
            revoker,
            notifier,
            audit,
            reconciliation,
            user_locks: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run the full deactivation workflow for one request.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn deactivate(
        &self,
        request: DeactivationRequest,
    ) -> Result<DeactivationOutcome, DeactivationError> {
        let user_id = request.user_id.clone();
        let lock = self.user_lock(&user_id);
        let result = {
            let _guard = lock.lock().await;
            self.run_locked(request).await
        };
        drop(lock);
        // Drop the lock entry once no other run holds a clone; waiters keep
        // the count above one and clean up after their own run instead.
        self.user_locks
            .remove_if(&user_id, |_, entry| Arc::strong_count(entry) == 1);
        result
    }

    async fn run_locked(
        &self,
        request: DeactivationRequest,
    ) -> Result<DeactivationOutcome, DeactivationError> {
        let correlation_id = Uuid::new_v4();

        self.emit(
            UserMgmtEvent::DeactivationRequestReceived,
            correlation_id,
            &[("user_id", &request.user_id)],
            |e| e.with_user_id(&request.user_id).with_app_id(&request.app_id),
        )
        .await;

        // Step 1: resolve the profile. Absence means no side effects beyond
        // the failure event.
        let profile = self
            .store
            .find_user(&request.user_id)
            .await
            .map_err(|e| store_fault(&request.user_id, e))?;
        if profile.is_none() {
            self.emit(
                UserMgmtEvent::ReadOperationFailedForUserProfile,
                correlation_id,
                &[("user_id", &request.user_id)],
                |e| e.with_user_id(&request.user_id).with_app_id(&request.app_id),
            )
            .await;
            return Err(DeactivationError::UserNotFound {
                user_id: request.user_id,
            });
        }

        // Claim the account. A repeat request for a deactivated account is a
        // no-op success; a concurrent claim is reported to the caller.
        match self
            .store
            .try_begin_deactivation(&request.user_id)
            .await
            .map_err(|e| store_fault(&request.user_id, e))?
        {
            DeactivationClaim::Claimed => {}
            DeactivationClaim::AlreadyDeactivated => {
                info!(user_id = %request.user_id, "account already deactivated; no-op");
                return Ok(DeactivationOutcome {
                    user_id: request.user_id,
                    correlation_id,
                    already_deactivated: true,
                    study_outcomes: Vec::new(),
                });
            }
            DeactivationClaim::InProgress => {
                return Err(DeactivationError::DeactivationInProgress {
                    user_id: request.user_id,
                });
            }
        }

        // Step 2: credential revocation, strictly before any local mutation.
        // A revoked UI login with still-active backend state is prevented by
        // this ordering; on failure the claim is released and nothing local
        // has changed.
        if let Err(source) = self.revoker.revoke_credentials(&request.user_id).await {
            if let Err(abort_err) = self.store.abort_deactivation(&request.user_id).await {
                error!(
                    user_id = %request.user_id,
                    error = %abort_err,
                    "failed to release deactivation claim after revocation failure"
                );
            }
            self.emit(
                UserMgmtEvent::CredentialsDeletionFailed,
                correlation_id,
                &[("user_id", &request.user_id), ("reason", &source.to_string())],
                |e| {
                    e.with_user_id(&request.user_id)
                        .with_app_id(&request.app_id)
                        .with_destination(PlatformComponent::ScimAuthServer)
                },
            )
            .await;
            return Err(DeactivationError::CredentialRevocationFailed {
                user_id: request.user_id,
                source,
            });
        }
        self.emit(
            UserMgmtEvent::CredentialsDeleted,
            correlation_id,
            &[("user_id", &request.user_id)],
            |e| {
                e.with_user_id(&request.user_id)
                    .with_app_id(&request.app_id)
                    .with_destination(PlatformComponent::ScimAuthServer)
            },
        )
        .await;

        // Step 3: per-study withdrawal fan-out, concurrent and best-effort.
        // Credentials are revoked by now, so a store fault here is a failed
        // local mutation: it must reach the queue and the audit trail, not
        // return bare.
        let enrollments = match self.store.enrollments_for_user(&request.user_id).await {
            Ok(enrollments) => enrollments,
            Err(err) => {
                return Err(self
                    .fail_local_mutation(&request, correlation_id, err.to_string())
                    .await);
            }
        };
        let study_outcomes = self
            .withdraw_studies(&request, &enrollments, correlation_id)
            .await;

        // Step 4: local mutation. Anonymization and enrollment close-out run
        // concurrently; both must complete before the summary event.
        let processed: Vec<&ParticipantEnrollment> = enrollments
            .iter()
            .filter(|en| {
                request
                    .study_choices
                    .iter()
                    .any(|c| c.study_id == en.study_id)
            })
            .collect();
        let (anonymized, closed) = tokio::join!(
            self.store.anonymize_profile(&request.user_id),
            self.close_enrollments(&processed, correlation_id, &request),
        );
        let local_result = match (anonymized, closed) {
            (Ok(_), Ok(())) => self.store.complete_deactivation(&request.user_id).await,
            (Err(err), _) | (_, Err(err)) => Err(err),
        };
        if let Err(err) = local_result {
            return Err(self
                .fail_local_mutation(&request, correlation_id, err.to_string())
                .await);
        }

        // Step 5: final summary event.
        self.emit(
            UserMgmtEvent::UserDeleted,
            correlation_id,
            &[("user_id", &request.user_id)],
            |e| e.with_user_id(&request.user_id).with_app_id(&request.app_id),
        )
        .await;
        info!(
            user_id = %request.user_id,
            %correlation_id,
            failed_studies = study_outcomes.iter().filter(|o| !o.succeeded()).count(),
            "account deactivated"
        );

        Ok(DeactivationOutcome {
            user_id: request.user_id,
            correlation_id,
            already_deactivated: false,
            study_outcomes,
        })
    }

    /// Concurrent best-effort withdrawal notifications. Each study always
    /// gets a retention-setting event recording the user's choice, then the
    /// success or failure intimation; one study's failure never blocks the
    /// others.
    async fn withdraw_studies(
        &self,
        request: &DeactivationRequest,
        enrollments: &[ParticipantEnrollment],
        correlation_id: Uuid,
    ) -> Vec<StudyWithdrawalOutcome> {
        let calls = request.study_choices.iter().map(|choice| {
            let enrollment = enrollments.iter().find(|en| en.study_id == choice.study_id);
            self.withdraw_one_study(request, choice, enrollment, correlation_id)
        });
        join_all(calls).await
    }

    async fn withdraw_one_study(
        &self,
        request: &DeactivationRequest,
        choice: &StudyWithdrawalChoice,
        enrollment: Option<&ParticipantEnrollment>,
        correlation_id: Uuid,
    ) -> StudyWithdrawalOutcome {
        let retention_setting = if choice.delete_responses {
            "Delete"
        } else {
            "Retain"
        };
        self.emit(
            UserMgmtEvent::DataRetentionSettingCapturedOnWithdrawal,
            correlation_id,
            &[
                ("retention_setting", retention_setting),
                ("study_id", &choice.study_id),
            ],
            |e| {
                let e = e
                    .with_user_id(&request.user_id)
                    .with_app_id(&request.app_id)
                    .with_study_id(&choice.study_id);
                match enrollment {
                    Some(en) => e.with_participant_id(&en.participant_id),
                    None => e,
                }
            },
        )
        .await;

        let Some(enrollment) = enrollment else {
            warn!(
                user_id = %request.user_id,
                study_id = %choice.study_id,
                "withdrawal requested for study without an enrollment record"
            );
            return StudyWithdrawalOutcome {
                study_id: choice.study_id.clone(),
                participant_id: None,
                delete_responses: choice.delete_responses,
                status: WithdrawalStatus::Failed {
                    reason: "no enrollment record for study".to_string(),
                },
            };
        };

        let status = match self
            .notifier
            .notify_withdrawal(
                &choice.study_id,
                &enrollment.participant_id,
                choice.delete_responses,
            )
            .await
        {
            Ok(()) => {
                self.emit(
                    UserMgmtEvent::WithdrawalIntimatedToResponseDatastore,
                    correlation_id,
                    &[("study_id", &choice.study_id)],
                    |e| {
                        e.with_user_id(&request.user_id)
                            .with_app_id(&request.app_id)
                            .with_study_id(&choice.study_id)
                            .with_participant_id(&enrollment.participant_id)
                            .with_destination(PlatformComponent::ResponseDatastore)
                    },
                )
                .await;
                WithdrawalStatus::Notified
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    user_id = %request.user_id,
                    study_id = %choice.study_id,
                    error = %reason,
                    "withdrawal intimation failed; continuing with remaining studies"
                );
                self.emit(
                    UserMgmtEvent::WithdrawalIntimationToResponseDatastoreFailed,
                    correlation_id,
                    &[("study_id", &choice.study_id), ("reason", &reason)],
                    |e| {
                        e.with_user_id(&request.user_id)
                            .with_app_id(&request.app_id)
                            .with_study_id(&choice.study_id)
                            .with_participant_id(&enrollment.participant_id)
                            .with_destination(PlatformComponent::ResponseDatastore)
                    },
                )
                .await;
                WithdrawalStatus::Failed { reason }
            }
        };

        StudyWithdrawalOutcome {
            study_id: choice.study_id.clone(),
            participant_id: Some(enrollment.participant_id.clone()),
            delete_responses: choice.delete_responses,
            status,
        }
    }

    /// Close every processed enrollment, emitting one data-deleted event per
    /// record. The store's nullable-timestamp guards make this safe to
    /// replay.
    async fn close_enrollments(
        &self,
        enrollments: &[&ParticipantEnrollment],
        correlation_id: Uuid,
        request: &DeactivationRequest,
    ) -> Result<(), StoreError> {
        for enrollment in enrollments {
            self.store
                .close_enrollment(&enrollment.participant_id, &enrollment.study_id)
                .await?;
            self.emit(
                UserMgmtEvent::ParticipantDataDeleted,
                correlation_id,
                &[("study_id", &enrollment.study_id)],
                |e| {
                    e.with_user_id(&request.user_id)
                        .with_app_id(&request.app_id)
                        .with_study_id(&enrollment.study_id)
                        .with_participant_id(&enrollment.participant_id)
                },
            )
            .await;
        }
        Ok(())
    }

    /// Shared failure path for local mutation faults after credential
    /// revocation: the run lands on the reconciliation queue and the failure
    /// reaches the audit trail before the error is returned.
    async fn fail_local_mutation(
        &self,
        request: &DeactivationRequest,
        correlation_id: Uuid,
        reason: String,
    ) -> DeactivationError {
        self.reconciliation
            .push(PendingLocalMutation {
                user_id: request.user_id.clone(),
                correlation_id,
                queued_at: Utc::now(),
                reason: reason.clone(),
            })
            .await;
        self.emit(
            UserMgmtEvent::UserDeletionFailed,
            correlation_id,
            &[("user_id", &request.user_id), ("reason", &reason)],
            |e| e.with_user_id(&request.user_id).with_app_id(&request.app_id),
        )
        .await;
        DeactivationError::LocalMutationFailed {
            user_id: request.user_id.clone(),
            reason,
        }
    }

    async fn emit(
        &self,
        event: UserMgmtEvent,
        correlation_id: Uuid,
        values: &[(&str, &str)],
        customize: impl FnOnce(AuditLogEvent) -> AuditLogEvent,
    ) {
        // A rendering failure leaves the unresolved description in place; the
        // logger refuses it and accounts for the loss.
        let description = match event.description(values) {
            Ok(rendered) => rendered,
            Err(AuditError::UnresolvedPlaceholder { description }) => description,
            Err(err) => {
                error!(event_code = event.code(), error = %err, "audit description failed");
                return;
            }
        };
        let audit_event = customize(AuditLogEvent::new(event, correlation_id, description));
        self.audit.emit(audit_event).await;
    }
}

fn store_fault(user_id: &str, err: StoreError) -> DeactivationError {
    match err {
        StoreError::UserNotFound { user_id } => DeactivationError::UserNotFound { user_id },
        other => DeactivationError::LocalMutationFailed {
            user_id: user_id.to_string(),
            reason: other.to_string(),
        },
    }
}
