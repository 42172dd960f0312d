use crate::{constants, Result, ConductorError};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub agent: AgentConfig,
    pub api: ApiConfig,
}

/// Scheduling and workspace knobs for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub working_directory: String,
    pub max_concurrent_repos: usize,
    pub max_concurrent_sessions: usize,
    pub max_queue_size: usize,
    pub max_tasks_per_user: usize,
    pub github_org: Option<String>,
}

/// How to invoke the coding-agent CLI and bound its conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub command: String,
    pub extra_args: Vec<String>,
    pub anthropic_api_key: Option<String>,
    pub token_limit: usize,
    pub token_warning_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub secret: String,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("No .env file loaded: {}", e),
        }

        // SECURITY: the bearer secret is the only authentication layer;
        // refuse to start without a real one.
        let secret = env::var("ORCHESTRATOR_SECRET").map_err(|_| {
            ConductorError::ConfigurationError(
                "ORCHESTRATOR_SECRET environment variable is required".to_string(),
            )
        })?;

        if secret.trim().is_empty() {
            return Err(ConductorError::ConfigurationError(
                "ORCHESTRATOR_SECRET cannot be empty".to_string(),
            ));
        }

        if secret.len() < constants::MIN_SECRET_LENGTH {
            return Err(ConductorError::ConfigurationError(format!(
                "ORCHESTRATOR_SECRET must be at least {} characters (generate one with: openssl rand -hex 32)",
                constants::MIN_SECRET_LENGTH
            )));
        }

        let api = ApiConfig {
            // SECURITY: default to localhost only
            host: env::var("ORCHESTRATOR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("ORCHESTRATOR_PORT")
                .unwrap_or_else(|_| "8200".to_string())
                .parse()
                .unwrap_or(8200),
            secret,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let agent = AgentConfig {
            command: env::var("CODEX_CLI_COMMAND")
                .unwrap_or_else(|_| constants::DEFAULT_AGENT_COMMAND.to_string()),
            extra_args: env::var("CODEX_CLI_ARGS")
                .map(|args| {
                    args.split_whitespace()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            token_limit: env::var("CLAUDE_TOKEN_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(constants::DEFAULT_TOKEN_LIMIT),
            token_warning_ratio: env::var("CLAUDE_TOKEN_WARNING_RATIO")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|r| (0.0..=1.0).contains(r))
                .unwrap_or(constants::DEFAULT_TOKEN_WARNING_RATIO),
        };

        let orchestrator = OrchestratorConfig {
            working_directory: env::var("WORKING_DIRECTORY")
                .unwrap_or_else(|_| constants::DEFAULT_WORKING_DIRECTORY.to_string()),
            max_concurrent_repos: env::var("MAX_CONCURRENT_REPOS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(constants::DEFAULT_MAX_CONCURRENT_REPOS),
            max_concurrent_sessions: constants::MAX_CONCURRENT_SESSIONS,
            max_queue_size: constants::MAX_QUEUE_SIZE,
            max_tasks_per_user: constants::MAX_TASKS_PER_USER,
            github_org: env::var("GITHUB_ORG").ok().filter(|o| !o.trim().is_empty()),
        };

        Ok(Config {
            orchestrator,
            agent,
            api,
        })
    }
}
