//! Domain records for the participant datastore core
//!
//! `UserProfile` is owned by the local state mutator; `ParticipantEnrollment`
//! carries the per-study registry-site record. Both enforce their lifecycle
//! invariants through the nullable timestamps rather than external locking:
//! `withdrawal_date` is set once and never cleared, and `disabled_date` is
//! present exactly when the onboarding status is `Disabled`.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Platform-wide length of an anonymized email value.
pub const ANONYMIZED_EMAIL_LENGTH: usize = 64;

/// Marker token embedded in every anonymized email so downstream systems can
/// recognize a deactivated identity without a status lookup.
pub const DEACTIVATION_MARKER: &str = "_DEACTIVATED_";

/// Account lifecycle of a user profile.
///
/// `Deactivating` is the transient claim state used to serialize concurrent
/// deactivation requests across processes: only the run that wins the
/// `Active -> Deactivating` transition proceeds with side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Deactivating,
    Deactivated,
}

/// Registry-site onboarding lifecycle of a per-study enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnboardingStatus {
    Active,
    Invited,
    Disabled,
}

/// Local participant profile record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Stable platform-wide user identifier.
    pub user_id: String,
    /// Mutable contact address; replaced by an anonymized value on
    /// deactivation.
    pub email: String,
    pub status: AccountStatus,
}

impl UserProfile {
    #[must_use]
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            status: AccountStatus::Active,
        }
    }

    /// Whether this profile already carries an anonymized email.
    #[must_use]
    pub fn is_anonymized(&self) -> bool {
        self.email.len() == ANONYMIZED_EMAIL_LENGTH && self.email.contains(DEACTIVATION_MARKER)
    }
}

/// Per-study enrollment record of a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantEnrollment {
    pub participant_id: String,
    pub study_id: String,
    pub enrollment_status: String,
    /// Set exactly once when the participant withdraws; never cleared.
    pub withdrawal_date: Option<DateTime<Utc>>,
    pub onboarding_status: OnboardingStatus,
    /// Present iff `onboarding_status == Disabled`.
    pub disabled_date: Option<DateTime<Utc>>,
}

impl ParticipantEnrollment {
    #[must_use]
    pub fn new(
        participant_id: impl Into<String>,
        study_id: impl Into<String>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            study_id: study_id.into(),
            enrollment_status: "ENROLLED".to_string(),
            withdrawal_date: None,
            onboarding_status: OnboardingStatus::Active,
            disabled_date: None,
        }
    }

    /// Close out this enrollment: stamp the withdrawal date if unset and move
    /// the registry-site record to `Disabled` with its timestamp. Each stamp
    /// is applied at most once; repeat calls leave the record unchanged.
    pub fn close(&mut self, now: DateTime<Utc>) {
        if self.withdrawal_date.is_none() {
            self.withdrawal_date = Some(now);
        }
        if self.onboarding_status != OnboardingStatus::Disabled {
            self.onboarding_status = OnboardingStatus::Disabled;
            self.disabled_date = Some(now);
        }
        self.enrollment_status = "WITHDRAWN".to_string();
    }
}

/// Per-study withdrawal choice carried on a deactivation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyWithdrawalChoice {
    pub study_id: String,
    /// Whether previously collected responses should be deleted (`true`) or
    /// retained (`false`). Passed through to the response datastore
    /// unchanged; never inferred or overridden.
    pub delete_responses: bool,
}

/// Validated deactivation request entering the orchestrator. Transient:
/// exists only for the duration of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivationRequest {
    pub user_id: String,
    pub app_id: String,
    pub study_choices: Vec<StudyWithdrawalChoice>,
}

/// Generate a fresh anonymized email value.
///
/// The value is exactly [`ANONYMIZED_EMAIL_LENGTH`] characters, contains
/// [`DEACTIVATION_MARKER`] as a contiguous token, and is unique per call
/// (random alphanumeric padding on both sides of the marker), so it cannot
/// collide with another active or deactivated identity.
#[must_use]
pub fn anonymized_email() -> String {
    let padding = ANONYMIZED_EMAIL_LENGTH - DEACTIVATION_MARKER.len();
    let prefix_len = padding / 2;
    let suffix_len = padding - prefix_len;

    let mut rng = rand::thread_rng();
    let prefix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(prefix_len)
        .map(char::from)
        .collect();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(suffix_len)
        .map(char::from)
        .collect();

    format!("{prefix}{DEACTIVATION_MARKER}{suffix}")
}
