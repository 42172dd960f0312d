//! The process-wide orchestrator: owns every shared structure and wires
//! the queue to the session pool.
//!
//! Data flow: control plane → permission guard → repo detector → task
//! queue → (when a repo slot frees) session pool → agent session →
//! update bus → streaming subscribers.

use crate::{
    agent::SessionActivity,
    approvals::ApprovalGate,
    bus::UpdateBus,
    config::Config,
    constants::MAX_INSTRUCTION_LENGTH,
    guard::PermissionGuard,
    models::{AgentKind, PendingInputRegistry, QueuedTask, Update},
    pool::SessionPool,
    queue::{
        BulkCancelOutcome, CancelOutcome, ParallelTaskQueue, QueueLimits, QueueStatus,
        TaskProcessor,
    },
    repo::{RepoDetection, RepoDetector},
    ConductorError, Result,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What intake hands back to the control plane for the HTTP response.
#[derive(Debug, Clone)]
pub struct InstructionOutcome {
    pub task: QueuedTask,
    pub detection: RepoDetection,
    pub total_queued: usize,
    pub active_repos: usize,
}

/// Summary of a bulk cancel, for the HTTP response.
#[derive(Debug, Clone)]
pub struct CancelAllSummary {
    pub cancelled_running: usize,
    pub cancelled_queued: usize,
    pub cancelled_sub_agents: usize,
    pub processing_repos: Vec<String>,
}

/// Runs one task end-to-end: reserve the repo's session, execute the
/// instruction, release. The session's own busy flag backs this up if the
/// queue's one-per-repo guarantee is ever violated.
struct InstructionProcessor {
    pool: Arc<SessionPool>,
}

#[async_trait]
impl TaskProcessor for InstructionProcessor {
    async fn process(&self, task: &QueuedTask) -> Result<()> {
        let session = self
            .pool
            .get_or_create_session(&task.repo_key, task.agent_kind, &task.user_id)
            .await?;

        // The session may be the default-workspace fallback; reserve the
        // workspace actually used, not the requested key.
        let session_key = session.repo_key().to_string();
        self.pool.set_repo_processing(&session_key, true).await;

        let result = session
            .process_instruction(&task.instruction, &task.user_id, &task.id)
            .await;

        self.pool.set_repo_processing(&session_key, false).await;
        result
    }
}

pub struct Orchestrator {
    config: Config,
    guard: Arc<PermissionGuard>,
    detector: RepoDetector,
    approvals: ApprovalGate,
    pool: Arc<SessionPool>,
    queue: ParallelTaskQueue,
    bus: UpdateBus,
    pending_inputs: PendingInputRegistry,
    started_at: std::time::Instant,
}

impl Orchestrator {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let bus = UpdateBus::new();
        let approvals = ApprovalGate::new(bus.clone());
        Self::with_parts(config, bus, approvals).await
    }

    /// Assembly with injectable bus and gate, used by tests to shorten the
    /// approval deadline.
    pub async fn with_parts(
        config: Config,
        bus: UpdateBus,
        approvals: ApprovalGate,
    ) -> Result<Arc<Self>> {
        info!("Initializing orchestrator core");

        let guard = Arc::new(PermissionGuard::new()?);
        let pending_inputs: PendingInputRegistry = Arc::new(Mutex::new(HashMap::new()));

        let pool = Arc::new(SessionPool::new(
            PathBuf::from(&config.orchestrator.working_directory),
            config.orchestrator.max_concurrent_sessions,
            config.agent.clone(),
            guard.clone(),
            approvals.clone(),
            bus.clone(),
            pending_inputs.clone(),
        ));

        let queue = ParallelTaskQueue::new(
            QueueLimits {
                max_queue_size: config.orchestrator.max_queue_size,
                max_tasks_per_user: config.orchestrator.max_tasks_per_user,
                max_concurrent_repos: config.orchestrator.max_concurrent_repos,
            },
            bus.clone(),
        );
        queue
            .set_processor(Arc::new(InstructionProcessor { pool: pool.clone() }))
            .await;

        let detector = RepoDetector::new(config.orchestrator.github_org.clone())?;

        Ok(Arc::new(Self {
            config,
            guard,
            detector,
            approvals,
            pool,
            queue,
            bus,
            pending_inputs,
            started_at: std::time::Instant::now(),
        }))
    }

    pub fn bus(&self) -> &UpdateBus {
        &self.bus
    }

    /// Which agent CLI this deployment drives, inferred from the configured
    /// command.
    pub fn agent_kind(&self) -> AgentKind {
        if self.config.agent.command.contains("codex") {
            AgentKind::Codex
        } else {
            AgentKind::ClaudeCode
        }
    }

    /// Instruction intake: guard, detect, enqueue. A hard-blocked
    /// instruction is rejected before any task exists and surfaced both on
    /// the bus and in the returned error.
    pub async fn submit_instruction(
        &self,
        user_id: &str,
        message_id: &str,
        instruction: &str,
    ) -> Result<InstructionOutcome> {
        if instruction.len() > MAX_INSTRUCTION_LENGTH {
            return Err(ConductorError::Validation(format!(
                "Instruction exceeds {MAX_INSTRUCTION_LENGTH} characters"
            )));
        }

        let check = self.guard.check_multiple(instruction);
        if !check.allowed {
            let reason = check
                .blocked_reason
                .unwrap_or_else(|| "operation not permitted".to_string());
            warn!(user_id, message_id, %reason, "Instruction blocked at intake");
            self.bus
                .publish(Update::error(user_id, format!("Instruction rejected: {reason}")));
            return Err(ConductorError::BlockedOperation { reason });
        }
        if let Some(warning) = check.warning {
            self.bus
                .publish(Update::status(user_id, format!("Warning: {warning}")));
        }

        let detection = self.detector.detect(instruction);
        info!(
            user_id,
            message_id,
            repo = %detection.repo_key,
            confidence = ?detection.confidence,
            "Instruction accepted"
        );

        let task = self
            .queue
            .enqueue(user_id, instruction, self.agent_kind(), &detection.repo_key)
            .await?;

        let status = self.queue.status().await;
        Ok(InstructionOutcome {
            task,
            detection,
            total_queued: status.total_queued,
            active_repos: status.active_repos,
        })
    }

    pub async fn handle_approval_response(
        &self,
        approval_id: &str,
        approved: bool,
        user_id: &str,
    ) -> bool {
        self.approvals
            .handle_response(approval_id, approved, user_id)
            .await
    }

    /// Route a user's answer to the session holding the matching pending
    /// input request.
    pub async fn handle_input_response(
        &self,
        input_id: &str,
        user_id: &str,
        response: &str,
    ) -> Result<()> {
        let entry = {
            let mut pending = self.pending_inputs.lock().await;
            let matches = pending
                .get(input_id)
                .map(|p| p.user_id == user_id)
                .unwrap_or(false);
            if !matches {
                return Err(ConductorError::NotFound(format!(
                    "No pending input {input_id} for this user"
                )));
            }
            pending.remove(input_id)
        };

        let Some(entry) = entry else {
            return Err(ConductorError::NotFound(format!(
                "No pending input {input_id} for this user"
            )));
        };

        let session = self
            .pool
            .get_or_create_session(&entry.repo_key, entry.agent_kind, user_id)
            .await?;
        session.submit_input_response(user_id, response).await;
        Ok(())
    }

    /// Cancel one task; when it was in flight, also signal its agent.
    pub async fn cancel_task(&self, task_id: &str, user_id: &str) -> Result<CancelOutcome> {
        let outcome = self.queue.cancel_task(task_id, user_id).await;
        if !outcome.cancelled {
            return Err(ConductorError::NotFound(format!(
                "No cancellable task {task_id} for this user"
            )));
        }
        if outcome.was_processing {
            if let Some(repo_key) = &outcome.repo_key {
                self.pool.cancel_repo_task(repo_key).await;
            }
        }
        Ok(outcome)
    }

    /// Cancel everything a user owns: queued tasks, in-flight agents, and
    /// pending approvals.
    pub async fn cancel_all(&self, user_id: &str) -> CancelAllSummary {
        let outcome: BulkCancelOutcome = self.queue.cancel_all_for_user(user_id).await;
        for repo_key in &outcome.processing_repos {
            self.pool.cancel_repo_task(repo_key).await;
        }
        let denied = self.approvals.cancel_all_for_user(user_id).await;
        if denied > 0 {
            info!(user_id, denied, "Denied pending approvals on bulk cancel");
        }

        CancelAllSummary {
            cancelled_running: outcome.cancelled_running,
            cancelled_queued: outcome.cancelled_queued,
            cancelled_sub_agents: outcome.processing_repos.len(),
            processing_repos: outcome.processing_repos,
        }
    }

    /// Drop a user's conversation history across every pooled session.
    pub async fn reset_user(&self, user_id: &str) {
        self.pool.clear_user_history(user_id).await;
        info!(user_id, "Reset conversation history");
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    pub async fn session_activity(&self) -> Vec<SessionActivity> {
        self.pool.activity_snapshot().await
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Terminate every in-flight agent. Called on shutdown.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator; cancelling all sessions");
        self.pool.cancel_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ApiConfig, OrchestratorConfig};
    use std::time::Duration;

    pub(crate) fn test_config(working_dir: &std::path::Path) -> Config {
        Config {
            orchestrator: OrchestratorConfig {
                working_directory: working_dir.to_string_lossy().to_string(),
                max_concurrent_repos: 3,
                max_concurrent_sessions: 4,
                max_queue_size: 10,
                max_tasks_per_user: 5,
                github_org: None,
            },
            agent: AgentConfig {
                command: "sh".to_string(),
                extra_args: vec![
                    "-c".to_string(),
                    r#"printf '{"type":"result","result":"All done."}\n'"#.to_string(),
                ],
                anthropic_api_key: None,
                token_limit: 10_000,
                token_warning_ratio: 0.8,
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                secret: "test-secret-0123456789abcdef0123456789abcdef".to_string(),
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
        }
    }

    async fn orchestrator(tmp: &tempfile::TempDir) -> Arc<Orchestrator> {
        let bus = UpdateBus::new();
        let approvals = ApprovalGate::with_timeout(bus.clone(), Duration::from_millis(10));
        Orchestrator::with_parts(test_config(tmp.path()), bus, approvals)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn blocked_instruction_is_rejected_before_queueing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&tmp).await;
        let mut updates = orchestrator.bus().subscribe();

        let result = orchestrator
            .submit_instruction("u1", "m1", "run git push --force origin main")
            .await;
        assert!(matches!(
            result,
            Err(ConductorError::BlockedOperation { .. })
        ));

        match updates.recv().await.unwrap() {
            Update::Error { message, .. } => assert!(message.contains("Force push")),
            other => panic!("expected rejection error, got {other:?}"),
        }
        assert_eq!(orchestrator.queue_status().await.total_queued, 0);
    }

    #[tokio::test]
    async fn oversized_instruction_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&tmp).await;
        let result = orchestrator
            .submit_instruction("u1", "m1", &"x".repeat(MAX_INSTRUCTION_LENGTH + 1))
            .await;
        assert!(matches!(result, Err(ConductorError::Validation(_))));
    }

    #[tokio::test]
    async fn empty_instruction_queues_to_default_repo() {
        let tmp = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&tmp).await;

        let outcome = orchestrator.submit_instruction("u1", "m1", "").await.unwrap();
        assert_eq!(outcome.task.repo_key, crate::constants::DEFAULT_REPO_KEY);
        assert_eq!(outcome.detection.confidence, crate::repo::Confidence::Low);
    }

    #[tokio::test]
    async fn accepted_instruction_runs_to_completion() {
        let tmp = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&tmp).await;
        let mut updates = orchestrator.bus().subscribe();

        let outcome = orchestrator
            .submit_instruction("u1", "m1", "tidy the docs in acmezz/webappzz")
            .await
            .unwrap();
        assert_eq!(outcome.task.repo_key, "acmezz/webappzz");

        // Wait for the TASK_COMPLETE frame for this task.
        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Update::TaskComplete { task_id, .. } = updates.recv().await.unwrap() {
                    if task_id == outcome.task.id {
                        break true;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert!(completed);
        assert_eq!(orchestrator.queue_status().await.active_repos, 0);
    }

    #[tokio::test]
    async fn unknown_cancel_target_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&tmp).await;
        let result = orchestrator.cancel_task("no-such-task", "u1").await;
        assert!(matches!(result, Err(ConductorError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_input_id_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&tmp).await;
        let result = orchestrator
            .handle_input_response("no-such-input", "u1", "my answer")
            .await;
        assert!(matches!(result, Err(ConductorError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_all_reports_counts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&tmp).await;

        let summary = orchestrator.cancel_all("u1").await;
        assert_eq!(summary.cancelled_running + summary.cancelled_queued, 0);
        assert!(summary.processing_repos.is_empty());
    }
}
