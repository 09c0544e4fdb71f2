//! Local participant-profile store seam
//!
//! The orchestrator mutates local state only through [`ParticipantStore`], so
//! production persistence stays a boundary concern and tests can substitute
//! doubles. The conditional `Active -> Deactivating` transition is the
//! cross-process serialization point for concurrent deactivation requests:
//! exactly one run wins the claim, and a request against an already
//! deactivated account short-circuits without side effects.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::errors::StoreError;
use crate::model::{anonymized_email, AccountStatus, ParticipantEnrollment, UserProfile};

/// Result of the conditional status transition that opens a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivationClaim {
    /// This run won the `Active -> Deactivating` transition.
    Claimed,
    /// The account is already `Deactivated`; the run must no-op.
    AlreadyDeactivated,
    /// Another run holds the claim.
    InProgress,
}

/// Local state mutator contract.
#[async_trait]
pub trait ParticipantStore: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// Compare-and-swap the account status from `Active` to `Deactivating`.
    async fn try_begin_deactivation(&self, user_id: &str)
        -> Result<DeactivationClaim, StoreError>;

    /// Release a claim without completing: status back to `Active`. Used when
    /// credential revocation fails and the workflow aborts unmutated.
    async fn abort_deactivation(&self, user_id: &str) -> Result<(), StoreError>;

    /// Close a run: status `Deactivating -> Deactivated`.
    async fn complete_deactivation(&self, user_id: &str) -> Result<(), StoreError>;

    /// Replace the profile email with a fresh anonymized value. Applied at
    /// most once: a profile that already carries an anonymized email is
    /// returned unchanged.
    async fn anonymize_profile(&self, user_id: &str) -> Result<UserProfile, StoreError>;

    async fn enrollments_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ParticipantEnrollment>, StoreError>;

    /// Stamp the withdrawal date if unset and disable the registry-site
    /// record if not already disabled. Idempotent through the nullable
    /// timestamps.
    async fn close_enrollment(
        &self,
        participant_id: &str,
        study_id: &str,
    ) -> Result<(), StoreError>;
}

/// In-memory implementation on concurrent maps. Backs tests and single-node
/// deployments.
#[derive(Default)]
pub struct InMemoryParticipantStore {
    profiles: DashMap<String, UserProfile>,
    // Keyed by "{participant_id}:{study_id}".
    enrollments: DashMap<String, ParticipantEnrollment>,
    // user_id -> enrollment keys.
    user_enrollments: DashMap<String, Vec<String>>,
}

impl InMemoryParticipantStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn enrollment_key(participant_id: &str, study_id: &str) -> String {
        format!("{participant_id}:{study_id}")
    }

    pub fn add_profile(&self, profile: UserProfile) {
        self.profiles.insert(profile.user_id.clone(), profile);
    }

    pub fn add_enrollment(&self, user_id: &str, enrollment: ParticipantEnrollment) {
        let key = Self::enrollment_key(&enrollment.participant_id, &enrollment.study_id);
        self.user_enrollments
            .entry(user_id.to_string())
            .or_default()
            .push(key.clone());
        self.enrollments.insert(key, enrollment);
    }

    /// Direct read for assertions.
    #[must_use]
    pub fn enrollment(
        &self,
        participant_id: &str,
        study_id: &str,
    ) -> Option<ParticipantEnrollment> {
        self.enrollments
            .get(&Self::enrollment_key(participant_id, study_id))
            .map(|e| e.value().clone())
    }
}

#[async_trait]
impl ParticipantStore for InMemoryParticipantStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.profiles.get(user_id).map(|p| p.value().clone()))
    }

    async fn try_begin_deactivation(
        &self,
        user_id: &str,
    ) -> Result<DeactivationClaim, StoreError> {
        let mut profile = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        match profile.status {
            AccountStatus::Active => {
                profile.status = AccountStatus::Deactivating;
                Ok(DeactivationClaim::Claimed)
            }
            AccountStatus::Deactivated => Ok(DeactivationClaim::AlreadyDeactivated),
            AccountStatus::Deactivating => Ok(DeactivationClaim::InProgress),
        }
    }

    async fn abort_deactivation(&self, user_id: &str) -> Result<(), StoreError> {
        let mut profile = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        if profile.status == AccountStatus::Deactivating {
            profile.status = AccountStatus::Active;
        }
        Ok(())
    }

    async fn complete_deactivation(&self, user_id: &str) -> Result<(), StoreError> {
        let mut profile = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        profile.status = AccountStatus::Deactivated;
        Ok(())
    }

    async fn anonymize_profile(&self, user_id: &str) -> Result<UserProfile, StoreError> {
        let mut profile = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        if !profile.is_anonymized() {
            profile.email = anonymized_email();
        }
        Ok(profile.value().clone())
    }

    async fn enrollments_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ParticipantEnrollment>, StoreError> {
        let keys = self
            .user_enrollments
            .get(user_id)
            .map(|k| k.value().clone())
            .unwrap_or_default();
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(enrollment) = self.enrollments.get(&key) {
                result.push(enrollment.value().clone());
            }
        }
        Ok(result)
    }

    async fn close_enrollment(
        &self,
        participant_id: &str,
        study_id: &str,
    ) -> Result<(), StoreError> {
        let key = Self::enrollment_key(participant_id, study_id);
        let mut enrollment =
            self.enrollments
                .get_mut(&key)
                .ok_or_else(|| StoreError::EnrollmentNotFound {
                    participant_id: participant_id.to_string(),
                    study_id: study_id.to_string(),
                })?;
        enrollment.close(Utc::now());
        Ok(())
    }
}
