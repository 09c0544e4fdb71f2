//! Outbound client for the per-study response-data service
//!
//! One withdrawal notification per enrolled study. The `delete_responses`
//! flag is the user's recorded choice and is passed through unchanged; the
//! remote side treats repeat notifications as idempotent.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::RemoteError;

/// Seam for intimating a participant's withdrawal to the response datastore.
#[async_trait]
pub trait WithdrawalNotifier: Send + Sync {
    async fn notify_withdrawal(
        &self,
        study_id: &str,
        participant_id: &str,
        delete_responses: bool,
    ) -> Result<(), RemoteError>;
}

/// HTTP implementation talking to the response datastore's withdraw endpoint.
pub struct ResponseDatastoreClient {
    client: reqwest::Client,
    base_url: String,
}

impl ResponseDatastoreClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn withdraw_url(&self) -> String {
        format!(
            "{}/participant/withdraw",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl WithdrawalNotifier for ResponseDatastoreClient {
    async fn notify_withdrawal(
        &self,
        study_id: &str,
        participant_id: &str,
        delete_responses: bool,
    ) -> Result<(), RemoteError> {
        debug!(study_id, participant_id, delete_responses, "intimating withdrawal");

        let response = self
            .client
            .post(self.withdraw_url())
            .query(&[
                ("studyId", study_id),
                ("participantId", participant_id),
                ("deleteResponses", if delete_responses { "true" } else { "false" }),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteError::Timeout {
                        operation: "response datastore withdrawal".to_string(),
                    }
                } else {
                    RemoteError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(RemoteError::NotFound)
        } else {
            Err(RemoteError::Status(status.as_u16()))
        }
    }
}
