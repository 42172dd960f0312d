use thiserror::Error;

/// Convenience type alias for Results with ConductorError
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Main error type for the orchestrator core.
///
/// Each variant maps to a row of the error-handling table: intake
/// rejections, queue limits, subprocess failures, and control-plane
/// lookup/auth failures all surface through here.
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Operation blocked: {reason}")]
    BlockedOperation { reason: String },

    #[error("Task queue is full")]
    QueueFull,

    #[error("User {user_id} has reached the queued-task limit")]
    UserQuotaExceeded { user_id: String },

    #[error("Failed to spawn agent process: {message}")]
    SpawnFailure { message: String },

    #[error("Agent process exited with code {code}: {message}")]
    AgentExit { code: i32, message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
