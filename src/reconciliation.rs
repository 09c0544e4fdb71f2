//! Reconciliation queue for failed local mutations
//!
//! A `LocalMutationFailed` run has already revoked the user's credentials, so
//! the local record must eventually catch up. Instead of guessing at a hidden
//! background-retry mechanism, failed runs land on this explicit queue where
//! an operator or supervisor task drives [`ReconciliationQueue::retry_all`].
//! Every retry goes back through the store's idempotent mutations, so a
//! partially applied run is safe to replay.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::participant_store::ParticipantStore;

/// One deactivation run whose local mutation must be replayed.
#[derive(Debug, Clone)]
pub struct PendingLocalMutation {
    pub user_id: String,
    pub correlation_id: Uuid,
    pub queued_at: DateTime<Utc>,
    pub reason: String,
}

/// FIFO queue of runs awaiting local-state reconciliation.
#[derive(Default)]
pub struct ReconciliationQueue {
    pending: Mutex<VecDeque<PendingLocalMutation>>,
}

impl ReconciliationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, entry: PendingLocalMutation) {
        warn!(
            user_id = %entry.user_id,
            correlation_id = %entry.correlation_id,
            reason = %entry.reason,
            "local mutation queued for reconciliation"
        );
        self.pending.lock().await.push_back(entry);
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Copy of the queue contents, oldest first.
    pub async fn snapshot(&self) -> Vec<PendingLocalMutation> {
        self.pending.lock().await.iter().cloned().collect()
    }

    /// Replay the local mutation for every queued run. Entries that fail
    /// again are re-queued at the back. Returns the number of runs that
    /// completed.
    pub async fn retry_all(&self, store: &dyn ParticipantStore) -> usize {
        let drained: Vec<PendingLocalMutation> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };

        let mut completed = 0;
        for entry in drained {
            match replay_local_mutation(store, &entry.user_id).await {
                Ok(()) => {
                    info!(
                        user_id = %entry.user_id,
                        correlation_id = %entry.correlation_id,
                        "reconciliation completed"
                    );
                    completed += 1;
                }
                Err(err) => {
                    warn!(
                        user_id = %entry.user_id,
                        correlation_id = %entry.correlation_id,
                        error = %err,
                        "reconciliation attempt failed; re-queued"
                    );
                    self.pending.lock().await.push_back(entry);
                }
            }
        }
        completed
    }
}

async fn replay_local_mutation(
    store: &dyn ParticipantStore,
    user_id: &str,
) -> Result<(), StoreError> {
    store.anonymize_profile(user_id).await?;
    for enrollment in store.enrollments_for_user(user_id).await? {
        store
            .close_enrollment(&enrollment.participant_id, &enrollment.study_id)
            .await?;
    }
    store.complete_deactivation(user_id).await
}
