//! Structured audit logging for the deactivation workflow
//!
//! Every workflow step emits one immutable [`AuditLogEvent`] drawn from the
//! closed [`UserMgmtEvent`] enumeration. All events of one workflow run share
//! a correlation id so external verification tooling can reconstruct the full
//! sequence. The sink is an injected append-only interface; losing an event
//! is an operational fault that is reported and counted but never rolls back
//! or blocks the workflow step that produced it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::errors::AuditError;

/// Platform components that appear as audit source/destination identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlatformComponent {
    MobileApps,
    ParticipantDatastore,
    ScimAuthServer,
    ResponseDatastore,
}

impl PlatformComponent {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformComponent::MobileApps => "MOBILE_APPS",
            PlatformComponent::ParticipantDatastore => "PARTICIPANT_DATASTORE",
            PlatformComponent::ScimAuthServer => "SCIM_AUTH_SERVER",
            PlatformComponent::ResponseDatastore => "RESPONSE_DATASTORE",
        }
    }
}

/// Closed enumeration of user-management audit events.
///
/// Each event carries a stable code and a description template. Templates use
/// `{placeholder}` tokens; rendering must resolve every token before the
/// event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserMgmtEvent {
    DeactivationRequestReceived,
    ReadOperationFailedForUserProfile,
    CredentialsDeleted,
    CredentialsDeletionFailed,
    DataRetentionSettingCapturedOnWithdrawal,
    WithdrawalIntimatedToResponseDatastore,
    WithdrawalIntimationToResponseDatastoreFailed,
    ParticipantDataDeleted,
    UserDeleted,
    UserDeletionFailed,
}

impl UserMgmtEvent {
    /// Stable event code as recorded in the audit trail.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            UserMgmtEvent::DeactivationRequestReceived => "DEACTIVATION_REQUEST_RECEIVED",
            UserMgmtEvent::ReadOperationFailedForUserProfile => {
                "READ_OPERATION_FAILED_FOR_USER_PROFILE"
            }
            UserMgmtEvent::CredentialsDeleted => "CREDENTIALS_DELETED",
            UserMgmtEvent::CredentialsDeletionFailed => "CREDENTIALS_DELETION_FAILED",
            UserMgmtEvent::DataRetentionSettingCapturedOnWithdrawal => {
                "DATA_RETENTION_SETTING_CAPTURED_ON_WITHDRAWAL"
            }
            UserMgmtEvent::WithdrawalIntimatedToResponseDatastore => {
                "WITHDRAWAL_INTIMATED_TO_RESPONSE_DATASTORE"
            }
            UserMgmtEvent::WithdrawalIntimationToResponseDatastoreFailed => {
                "WITHDRAWAL_INTIMATION_TO_RESPONSE_DATASTORE_FAILED"
            }
            UserMgmtEvent::ParticipantDataDeleted => "PARTICIPANT_DATA_DELETED",
            UserMgmtEvent::UserDeleted => "USER_DELETED",
            UserMgmtEvent::UserDeletionFailed => "USER_DELETION_FAILED",
        }
    }

    fn description_template(&self) -> &'static str {
        match self {
            UserMgmtEvent::DeactivationRequestReceived => {
                "Account deactivation request received for user {user_id}."
            }
            UserMgmtEvent::ReadOperationFailedForUserProfile => {
                "Read operation failed for user profile: no record for user {user_id}."
            }
            UserMgmtEvent::CredentialsDeleted => {
                "Credentials deleted on the auth server for user {user_id}."
            }
            UserMgmtEvent::CredentialsDeletionFailed => {
                "Credential deletion on the auth server failed for user {user_id}: {reason}."
            }
            UserMgmtEvent::DataRetentionSettingCapturedOnWithdrawal => {
                "Data retention setting '{retention_setting}' captured on withdrawal from study {study_id}."
            }
            UserMgmtEvent::WithdrawalIntimatedToResponseDatastore => {
                "Withdrawal from study {study_id} intimated to the response datastore."
            }
            UserMgmtEvent::WithdrawalIntimationToResponseDatastoreFailed => {
                "Withdrawal intimation to the response datastore failed for study {study_id}: {reason}."
            }
            UserMgmtEvent::ParticipantDataDeleted => {
                "Participant data for study {study_id} deleted from the participant datastore."
            }
            UserMgmtEvent::UserDeleted => "User account deleted for user {user_id}.",
            UserMgmtEvent::UserDeletionFailed => {
                "User account deletion failed for user {user_id}: {reason}."
            }
        }
    }

    /// Render this event's description, substituting every `{placeholder}`
    /// from `values`. Fails if any delimiter pair survives substitution.
    pub fn description(&self, values: &[(&str, &str)]) -> Result<String, AuditError> {
        render_template(self.description_template(), values)
    }
}

/// Substitute `{key}` tokens in `template` and verify nothing unresolved
/// remains. Delimiters inside substituted values (a transport error quoting a
/// JSON body, say) are stripped so a value can never masquerade as an
/// unresolved placeholder and get the event dropped.
fn render_template(template: &str, values: &[(&str, &str)]) -> Result<String, AuditError> {
    let mut rendered = template.to_string();
    for (key, value) in values {
        let value = value.replace(['{', '}'], "");
        rendered = rendered.replace(&format!("{{{key}}}"), &value);
    }
    if rendered.contains('{') && rendered.contains('}') {
        return Err(AuditError::UnresolvedPlaceholder {
            description: rendered,
        });
    }
    Ok(rendered)
}

/// One immutable audit record. Created once per workflow step; never mutated
/// or deleted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Stable code from the closed [`UserMgmtEvent`] enumeration.
    pub event_code: String,
    /// Shared by every event of one workflow run.
    pub correlation_id: Uuid,
    /// When the step occurred, UTC.
    pub occurred: DateTime<Utc>,
    pub source: PlatformComponent,
    pub destination: PlatformComponent,
    pub resource_server: PlatformComponent,
    pub user_id: Option<String>,
    pub study_id: Option<String>,
    pub participant_id: Option<String>,
    pub app_id: Option<String>,
    /// Fully rendered description; contains no placeholder delimiters.
    pub description: String,
}

impl AuditLogEvent {
    /// Create an event for one workflow step. Source defaults to the mobile
    /// apps (the actor initiating deactivation); destination and resource
    /// server default to the participant datastore.
    #[must_use]
    pub fn new(event: UserMgmtEvent, correlation_id: Uuid, description: String) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_code: event.code().to_string(),
            correlation_id,
            occurred: Utc::now(),
            source: PlatformComponent::MobileApps,
            destination: PlatformComponent::ParticipantDatastore,
            resource_server: PlatformComponent::ParticipantDatastore,
            user_id: None,
            study_id: None,
            participant_id: None,
            app_id: None,
            description,
        }
    }

    #[must_use]
    pub fn with_destination(mut self, destination: PlatformComponent) -> Self {
        self.destination = destination;
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_study_id(mut self, study_id: impl Into<String>) -> Self {
        self.study_id = Some(study_id.into());
        self
    }

    #[must_use]
    pub fn with_participant_id(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }

    #[must_use]
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }
}

/// Append-only audit event sink.
///
/// Injected into the orchestrator rather than held as a global, so tests can
/// substitute a capturing double and assert on the emitted sequence.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditLogEvent) -> Result<(), AuditError>;
}

/// Best-effort audit emitter wrapping the injected sink.
///
/// `emit` bounds the sink call with a timeout; a slow or failing sink is
/// reported through tracing and the lost-event counter and never blocks the
/// workflow beyond the bound.
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    emit_timeout: Duration,
    lost_events: AtomicU64,
}

impl AuditLogger {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>, emit_timeout: Duration) -> Self {
        Self {
            sink,
            emit_timeout,
            lost_events: AtomicU64::new(0),
        }
    }

    /// Emit one event, best-effort within the configured bound.
    ///
    /// An event whose description still carries placeholder delimiters is
    /// refused outright: it counts as lost and is reported, since emitting it
    /// would violate the audit schema.
    pub async fn emit(&self, event: AuditLogEvent) {
        if event.description.contains('{') && event.description.contains('}') {
            self.record_loss(&event, "unresolved placeholder in description");
            return;
        }

        let correlation_id = event.correlation_id;
        let event_code = event.event_code.clone();
        match tokio::time::timeout(self.emit_timeout, self.sink.append(event.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.record_loss(&event, &err.to_string());
            }
            Err(_) => {
                error!(
                    %correlation_id,
                    event_code = %event_code,
                    timeout_ms = self.emit_timeout.as_millis() as u64,
                    "audit emission timed out; event lost"
                );
                self.lost_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of events lost to sink faults since construction. Nonzero is a
    /// reportable operational fault: the trail is the only externally
    /// verifiable record of the workflow.
    #[must_use]
    pub fn lost_events(&self) -> u64 {
        self.lost_events.load(Ordering::Relaxed)
    }

    fn record_loss(&self, event: &AuditLogEvent, reason: &str) {
        error!(
            correlation_id = %event.correlation_id,
            event_code = %event.event_code,
            reason,
            "audit event lost"
        );
        self.lost_events.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory append-only sink. Backs tests and single-node deployments;
/// exposes a snapshot for verification but no removal or mutation.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: RwLock<Vec<AuditLogEvent>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all appended events, in emission order.
    pub async fn snapshot(&self) -> Vec<AuditLogEvent> {
        self.events.read().await.clone()
    }

    /// Events filtered by code, in emission order.
    pub async fn events_with_code(&self, code: &str) -> Vec<AuditLogEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_code == code)
            .cloned()
            .collect()
    }

    /// Count of appended events per code.
    pub async fn counts_by_code(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in self.events.read().await.iter() {
            *counts.entry(event.event_code.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: AuditLogEvent) -> Result<(), AuditError> {
        self.events.write().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_all_placeholders() {
        let description = UserMgmtEvent::DataRetentionSettingCapturedOnWithdrawal
            .description(&[("retention_setting", "Delete"), ("study_id", "studyId1")])
            .unwrap();
        assert_eq!(
            description,
            "Data retention setting 'Delete' captured on withdrawal from study studyId1."
        );
        assert!(!description.contains('{'));
    }

    #[test]
    fn render_strips_delimiters_inside_values() {
        let description = UserMgmtEvent::CredentialsDeletionFailed
            .description(&[
                ("user_id", "u1"),
                ("reason", r#"remote returned {"error":"unavailable"}"#),
            ])
            .unwrap();
        assert!(description.contains(r#"remote returned "error":"unavailable""#));
        assert!(!(description.contains('{') && description.contains('}')));
    }

    #[test]
    fn render_rejects_unresolved_placeholder() {
        let result = UserMgmtEvent::CredentialsDeletionFailed.description(&[("user_id", "u1")]);
        assert!(matches!(
            result,
            Err(AuditError::UnresolvedPlaceholder { .. })
        ));
    }

    #[test]
    fn event_codes_match_trail_format() {
        assert_eq!(
            UserMgmtEvent::DataRetentionSettingCapturedOnWithdrawal.code(),
            "DATA_RETENTION_SETTING_CAPTURED_ON_WITHDRAWAL"
        );
        assert_eq!(UserMgmtEvent::UserDeleted.code(), "USER_DELETED");
    }

    #[tokio::test]
    async fn logger_appends_to_sink() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let logger = AuditLogger::new(sink.clone(), Duration::from_millis(100));
        let correlation_id = Uuid::new_v4();

        let description = UserMgmtEvent::UserDeleted
            .description(&[("user_id", "u1")])
            .unwrap();
        logger
            .emit(
                AuditLogEvent::new(UserMgmtEvent::UserDeleted, correlation_id, description)
                    .with_user_id("u1"),
            )
            .await;

        let events = sink.snapshot().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_code, "USER_DELETED");
        assert_eq!(events[0].correlation_id, correlation_id);
        assert_eq!(logger.lost_events(), 0);
    }

    #[tokio::test]
    async fn logger_refuses_unrendered_description() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let logger = AuditLogger::new(sink.clone(), Duration::from_millis(100));

        logger
            .emit(AuditLogEvent::new(
                UserMgmtEvent::UserDeleted,
                Uuid::new_v4(),
                "User account deleted for user {user_id}.".to_string(),
            ))
            .await;

        assert!(sink.snapshot().await.is_empty());
        assert_eq!(logger.lost_events(), 1);
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append(&self, _event: AuditLogEvent) -> Result<(), AuditError> {
            Err(AuditError::SinkRejected {
                reason: "sink unavailable".into(),
            })
        }
    }

    #[tokio::test]
    async fn sink_failure_is_counted_not_propagated() {
        let logger = AuditLogger::new(Arc::new(FailingSink), Duration::from_millis(100));
        logger
            .emit(AuditLogEvent::new(
                UserMgmtEvent::CredentialsDeleted,
                Uuid::new_v4(),
                "Credentials deleted on the auth server for user u1.".to_string(),
            ))
            .await;
        assert_eq!(logger.lost_events(), 1);
    }

    struct SlowSink;

    #[async_trait]
    impl AuditSink for SlowSink {
        async fn append(&self, _event: AuditLogEvent) -> Result<(), AuditError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_is_bounded_by_timeout() {
        let logger = AuditLogger::new(Arc::new(SlowSink), Duration::from_millis(50));
        logger
            .emit(AuditLogEvent::new(
                UserMgmtEvent::CredentialsDeleted,
                Uuid::new_v4(),
                "Credentials deleted on the auth server for user u1.".to_string(),
            ))
            .await;
        assert_eq!(logger.lost_events(), 1);
    }
}
