use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Which coding-agent CLI a session drives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::ClaudeCode => "claude-code",
            AgentKind::Codex => "codex",
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" | "claude-code" => Ok(AgentKind::ClaudeCode),
            "codex" => Ok(AgentKind::Codex),
            _ => Err(format!("Unknown agent kind: {s}")),
        }
    }
}

/// Lifecycle of a queued task.
///
/// `Queued` → `Processing` (at most one per repo) → terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A unit of work owned by the parallel task queue.
///
/// `position` is the 1-based rank among `Queued` tasks within this task's
/// repo shard; it is renumbered whenever earlier tasks leave the shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub id: String,
    pub user_id: String,
    pub instruction: String,
    pub repo_key: String,
    pub agent_kind: AgentKind,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub status: TaskStatus,
    pub position: usize,
}

impl QueuedTask {
    pub fn new(
        user_id: String,
        instruction: String,
        repo_key: String,
        agent_kind: AgentKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            instruction,
            repo_key,
            agent_kind,
            created_at: chrono::Utc::now(),
            status: TaskStatus::Queued,
            position: 0,
        }
    }
}

/// An outstanding request for out-of-band user input, keyed by input id.
/// Created when an agent asks a question mid-task; consumed by the matching
/// `/input-response`. At most one exists per task.
#[derive(Debug, Clone)]
pub struct PendingInput {
    pub user_id: String,
    pub repo_key: String,
    pub agent_kind: AgentKind,
}

/// Shared registry of pending inputs: the session registers entries as
/// agents ask questions, the control plane resolves them by id.
pub type PendingInputRegistry =
    std::sync::Arc<tokio::sync::Mutex<std::collections::HashMap<String, PendingInput>>>;

/// Payload attached to an `APPROVAL_REQUIRED` update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalDetails {
    pub action: String,
    pub repo: String,
    pub details: String,
}

/// Everything the orchestrator broadcasts to streaming subscribers.
///
/// Wire shape: one JSON object per update with a `type` discriminator and
/// camelCase fields. Subscribers filter on `userId` themselves; the bus
/// does no per-user routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Update {
    #[serde(rename = "STATUS_UPDATE")]
    #[serde(rename_all = "camelCase")]
    Status {
        user_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<AgentKind>,
    },

    #[serde(rename = "INPUT_NEEDED")]
    #[serde(rename_all = "camelCase")]
    InputNeeded {
        user_id: String,
        message: String,
        input_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<AgentKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected_input_format: Option<String>,
    },

    #[serde(rename = "APPROVAL_REQUIRED")]
    #[serde(rename_all = "camelCase")]
    ApprovalRequired {
        user_id: String,
        message: String,
        approval_id: String,
        approval_details: ApprovalDetails,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<AgentKind>,
    },

    #[serde(rename = "TASK_COMPLETE")]
    #[serde(rename_all = "camelCase")]
    TaskComplete {
        user_id: String,
        message: String,
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<AgentKind>,
    },

    #[serde(rename = "ERROR")]
    #[serde(rename_all = "camelCase")]
    Error {
        user_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<AgentKind>,
    },
}

impl Update {
    /// The user this update belongs to. Used by subscribers for filtering.
    pub fn user_id(&self) -> &str {
        match self {
            Update::Status { user_id, .. }
            | Update::InputNeeded { user_id, .. }
            | Update::ApprovalRequired { user_id, .. }
            | Update::TaskComplete { user_id, .. }
            | Update::Error { user_id, .. } => user_id,
        }
    }

    /// Shorthand for a plain status update carrying only a message.
    pub fn status(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Update::Status {
            user_id: user_id.into(),
            message: message.into(),
            task_id: None,
            task_title: None,
            repo_key: None,
            agent: None,
        }
    }

    /// Shorthand for a plain error update.
    pub fn error(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Update::Error {
            user_id: user_id.into(),
            message: message.into(),
            task_id: None,
            repo_key: None,
            agent: None,
        }
    }
}
