use crate::{
    approvals::ApprovalGate,
    bus::UpdateBus,
    config::{AgentConfig, ApiConfig, Config, OrchestratorConfig},
    orchestrator::Orchestrator,
};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_SECRET: &str = "scenario-secret-0123456789abcdef0123456789abcdef";

/// A config whose "agent" is `sh -c <script>`; the orchestrator's appended
/// protocol arguments land as harmless shell positionals.
pub fn scenario_config(working_dir: &std::path::Path, agent_script: &str) -> Config {
    Config {
        orchestrator: OrchestratorConfig {
            working_directory: working_dir.to_string_lossy().to_string(),
            max_concurrent_repos: 3,
            max_concurrent_sessions: 4,
            max_queue_size: 20,
            max_tasks_per_user: 10,
            github_org: None,
        },
        agent: AgentConfig {
            command: "sh".to_string(),
            extra_args: vec!["-c".to_string(), agent_script.to_string()],
            anthropic_api_key: None,
            token_limit: 10_000,
            token_warning_ratio: 0.8,
        },
        api: ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            secret: TEST_SECRET.to_string(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
    }
}

pub async fn scenario_orchestrator(
    working_dir: &std::path::Path,
    agent_script: &str,
    approval_timeout: Duration,
) -> Arc<Orchestrator> {
    let bus = UpdateBus::new();
    let approvals = ApprovalGate::with_timeout(bus.clone(), approval_timeout);
    Orchestrator::with_parts(scenario_config(working_dir, agent_script), bus, approvals)
        .await
        .expect("orchestrator assembly")
}

/// Poll `predicate` until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
