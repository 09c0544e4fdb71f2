//! Outbound client for the identity (auth) service
//!
//! Credential revocation is a single DELETE keyed by user id. No retries live
//! here: retry policy, if any, belongs to the transport layer. Failures are
//! mapped into [`RemoteError`] verbatim and never swallowed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::errors::RemoteError;

/// Seam for deleting/disabling a user's credentials in the identity service.
#[async_trait]
pub trait CredentialRevoker: Send + Sync {
    async fn revoke_credentials(&self, user_id: &str) -> Result<(), RemoteError>;
}

/// HTTP implementation talking to the auth server's user resource.
pub struct AuthServerClient {
    client: reqwest::Client,
    base_url: String,
}

impl AuthServerClient {
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

    fn user_url(&self, user_id: &str) -> String {
        format!("{}/users/{}", self.base_url.trim_end_matches('/'), user_id)
    }
}

#[async_trait]
impl CredentialRevoker for AuthServerClient {
    async fn revoke_credentials(&self, user_id: &str) -> Result<(), RemoteError> {
        let url = self.user_url(user_id);
        debug!(user_id, "deleting credentials on auth server");

        let response = self.client.delete(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout {
                    operation: "auth server credential deletion".to_string(),
                }
            } else {
                RemoteError::Transport(e.to_string())
            }
        })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
            status => Err(RemoteError::Status(status.as_u16())),
        }
    }
}
