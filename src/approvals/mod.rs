//! Approval gate for destructive operations.
//!
//! An agent session that detects a destructive command pauses on
//! [`ApprovalGate::request_approval`] until the user answers over the
//! control plane or the deadline passes. Resolution is at-most-once: the
//! pending entry's responder leaves the table exactly when it fires.

use crate::{
    bus::UpdateBus,
    constants::APPROVAL_TIMEOUT_SECS,
    guard::DetectedCommand,
    models::{AgentKind, ApprovalDetails, Update},
    Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PendingApproval {
    user_id: String,
    action: String,
    responder: oneshot::Sender<bool>,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct ApprovalGate {
    pending: Arc<Mutex<HashMap<String, PendingApproval>>>,
    bus: UpdateBus,
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(bus: UpdateBus) -> Self {
        Self::with_timeout(bus, Duration::from_secs(APPROVAL_TIMEOUT_SECS))
    }

    /// Construct with an explicit deadline. A zero deadline resolves every
    /// request as an immediate denial.
    pub fn with_timeout(bus: UpdateBus, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            bus,
            timeout,
        }
    }

    /// Register a pending approval, notify subscribers, and block until the
    /// user answers or the deadline passes. Timeout and a dropped responder
    /// both resolve as denial.
    pub async fn request_approval(
        &self,
        user_id: &str,
        detection: &DetectedCommand,
        repo_context: &str,
        agent_kind: AgentKind,
        task_id: Option<String>,
    ) -> Result<bool> {
        let approval_id = Uuid::new_v4().to_string();
        let (responder, receiver) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                approval_id.clone(),
                PendingApproval {
                    user_id: user_id.to_string(),
                    action: detection.action.clone(),
                    responder,
                    created_at: chrono::Utc::now(),
                },
            );
        }

        self.bus.publish(Update::ApprovalRequired {
            user_id: user_id.to_string(),
            message: format!(
                "Approval required: {} ({})",
                detection.action, detection.command
            ),
            approval_id: approval_id.clone(),
            approval_details: ApprovalDetails {
                action: detection.action.clone(),
                repo: repo_context.to_string(),
                details: detection.command.clone(),
            },
            task_id,
            repo_key: Some(repo_context.to_string()),
            agent: Some(agent_kind),
        });

        info!(
            approval_id = %approval_id,
            user_id = %user_id,
            action = %detection.action,
            "Approval requested"
        );

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(approved)) => {
                debug!(approval_id = %approval_id, approved, "Approval resolved");
                Ok(approved)
            }
            Ok(Err(_)) => {
                // Responder dropped without firing (user cancel path).
                self.pending.lock().await.remove(&approval_id);
                Ok(false)
            }
            Err(_) => {
                // Deadline passed; the entry may already be gone if a
                // response raced the timer, in which case the race winner
                // already resolved it.
                let expired = self.pending.lock().await.remove(&approval_id).is_some();
                if expired {
                    warn!(approval_id = %approval_id, "Approval timed out");
                    self.bus.publish(Update::status(
                        user_id,
                        format!(
                            "Approval request for \"{}\" expired and was denied",
                            detection.action
                        ),
                    ));
                }
                Ok(false)
            }
        }
    }

    /// Resolve an outstanding approval. Returns false for an unknown id or
    /// a user mismatch. Removing the entry before firing the responder makes
    /// a second resolution impossible.
    pub async fn handle_response(&self, approval_id: &str, approved: bool, user_id: &str) -> bool {
        let entry = {
            let mut pending = self.pending.lock().await;
            let owner_matches = match pending.get(approval_id) {
                Some(p) => p.user_id == user_id,
                None => return false,
            };
            if !owner_matches {
                warn!(
                    approval_id = %approval_id,
                    user_id = %user_id,
                    "Approval response from wrong user rejected"
                );
                return false;
            }
            pending.remove(approval_id)
        };

        match entry {
            Some(p) => {
                info!(
                    approval_id = %approval_id,
                    approved,
                    action = %p.action,
                    "Approval response received"
                );
                // A dropped receiver means the requester timed out first;
                // either way this entry is resolved.
                let _ = p.responder.send(approved);
                true
            }
            None => false,
        }
    }

    /// Deny every pending approval belonging to a user. Used when the user
    /// cancels all of their tasks.
    pub async fn cancel_all_for_user(&self, user_id: &str) -> usize {
        let drained: Vec<(String, PendingApproval)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.user_id == user_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            debug!(approval_id = %id, "Denying approval on user cancel");
            let _ = entry.responder.send(false);
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Age of the oldest pending approval, for status reporting.
    pub async fn oldest_pending_age(&self) -> Option<chrono::Duration> {
        let pending = self.pending.lock().await;
        pending
            .values()
            .map(|p| chrono::Utc::now() - p.created_at)
            .max()
    }
}
