//! System-wide configuration values.
//!
//! Anything user-tunable at runtime lives in [`crate::config`]; the values
//! here are deployment invariants.

// Queue admission control
/// Upper bound on tasks held across all repo queues (queued + processing).
/// Protects process memory on small deployments; one task is ~1KB.
pub const MAX_QUEUE_SIZE: usize = 50;

/// Upper bound on queued tasks per user. Keeps one chatty user from
/// monopolizing the queue without a fair-share scheduler.
pub const MAX_TASKS_PER_USER: usize = 10;

/// Default number of repos allowed to execute simultaneously.
/// Overridable via `MAX_CONCURRENT_REPOS`.
pub const DEFAULT_MAX_CONCURRENT_REPOS: usize = 3;

/// Capacity of the session pool (distinct repo workspaces kept warm).
pub const MAX_CONCURRENT_SESSIONS: usize = 8;

// Approval gate
/// How long an approval request stays open before resolving as denial.
pub const APPROVAL_TIMEOUT_SECS: u64 = 300;

// Agent session
/// Task titles are the first sentence of the instruction, truncated here.
pub const TASK_TITLE_MAX_LENGTH: usize = 100;

/// Assistant output longer than this gets a truncated streaming preview.
pub const STATUS_PREVIEW_LENGTH: usize = 200;

/// Number of lines kept when summarizing a finished response.
pub const SUMMARY_MAX_LINES: usize = 3;

/// Keywords that mark a line as summary-worthy in the agent's final output.
pub const SUMMARY_KEYWORDS: &[&str] = &[
    "done", "complete", "created", "updated", "fixed", "pushed", "merged",
    "success", "finished",
];

// Conversation history
/// Maximum turns retained per user before the oldest are evicted.
pub const HISTORY_MAX_TURNS: usize = 20;

/// Default token budget for a user's history. Overridable via
/// `CLAUDE_TOKEN_LIMIT`. The estimate is a whitespace split, not a real
/// tokenizer; it only needs to stay under the agent's context window.
pub const DEFAULT_TOKEN_LIMIT: usize = 100_000;

/// Default fraction of the token budget at which a warning is logged.
/// Overridable via `CLAUDE_TOKEN_WARNING_RATIO`.
pub const DEFAULT_TOKEN_WARNING_RATIO: f64 = 0.8;

// Update bus
/// Broadcast channel depth. Subscribers slower than this lag and skip.
pub const UPDATE_BUS_CAPACITY: usize = 256;

// Control plane
/// Minimum accepted length for `ORCHESTRATOR_SECRET`.
pub const MIN_SECRET_LENGTH: usize = 32;

/// Instruction bodies above this length are rejected at intake.
pub const MAX_INSTRUCTION_LENGTH: usize = 10_000;

// Agent CLI defaults
/// Binary invoked when `CODEX_CLI_COMMAND` is unset.
pub const DEFAULT_AGENT_COMMAND: &str = "claude";

/// Default base directory for per-repo workspaces when
/// `WORKING_DIRECTORY` is unset.
pub const DEFAULT_WORKING_DIRECTORY: &str = "./workspaces";

/// Queue partition used when no repo can be detected in an instruction.
pub const DEFAULT_REPO_KEY: &str = "__default__";
