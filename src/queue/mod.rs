//! Sharded FIFO task queue: one shard per repo, many repos in parallel.
//!
//! Ordering guarantees: strict FIFO within a repo (at most one in-flight
//! task per shard), none across repos. Admission is bounded globally and
//! per user. Dispatch is fire-and-forget — promoting a task never awaits
//! its execution, so slow repos cannot stall the others.

use crate::{
    bus::UpdateBus,
    models::{AgentKind, QueuedTask, TaskStatus, Update},
    ConductorError, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// The seam between the queue and whatever executes tasks. Installed once
/// by the orchestrator wiring; tests install mocks.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &QueuedTask) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub max_queue_size: usize,
    pub max_tasks_per_user: usize,
    pub max_concurrent_repos: usize,
}

/// Result of a single-task cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub cancelled: bool,
    pub was_processing: bool,
    pub repo_key: Option<String>,
}

/// Result of a bulk per-user cancellation.
#[derive(Debug, Clone, Default)]
pub struct BulkCancelOutcome {
    pub cancelled_running: usize,
    pub cancelled_queued: usize,
    /// Repos whose in-flight task was cancelled; the caller signals each
    /// repo's agent subprocess.
    pub processing_repos: Vec<String>,
}

/// Snapshot of queue state for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub total_queued: usize,
    pub active_repos: usize,
    pub max_concurrent_repos: usize,
    pub processing_repos: Vec<String>,
    pub repo_queues: Vec<RepoQueueStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoQueueStatus {
    pub repo_key: String,
    pub queued: usize,
    pub processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<QueuedTask>>,
    processing: HashSet<String>,
}

#[derive(Clone)]
pub struct ParallelTaskQueue {
    state: Arc<Mutex<QueueState>>,
    limits: QueueLimits,
    bus: UpdateBus,
    processor: Arc<Mutex<Option<Arc<dyn TaskProcessor>>>>,
}

impl ParallelTaskQueue {
    pub fn new(limits: QueueLimits, bus: UpdateBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            limits,
            bus,
            processor: Arc::new(Mutex::new(None)),
        }
    }

    /// Install the processor callback. Tasks enqueued before this is called
    /// stay queued until the next scheduling pass.
    pub async fn set_processor(&self, processor: Arc<dyn TaskProcessor>) {
        *self.processor.lock().await = Some(processor);
    }

    /// Admit a task. Rejections are distinct errors: global bound first,
    /// then the per-user bound.
    pub async fn enqueue(
        &self,
        user_id: &str,
        instruction: &str,
        agent_kind: AgentKind,
        repo_key: &str,
    ) -> Result<QueuedTask> {
        let (task, repo_busy, parallel_count) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;

            let total_active: usize = state
                .queues
                .values()
                .flat_map(|q| q.iter())
                .filter(|t| !t.status.is_terminal())
                .count();
            if total_active >= self.limits.max_queue_size {
                return Err(ConductorError::QueueFull);
            }

            let user_queued = state
                .queues
                .values()
                .flat_map(|q| q.iter())
                .filter(|t| t.status == TaskStatus::Queued && t.user_id == user_id)
                .count();
            if user_queued >= self.limits.max_tasks_per_user {
                return Err(ConductorError::UserQuotaExceeded {
                    user_id: user_id.to_string(),
                });
            }

            let queue = state.queues.entry(repo_key.to_string()).or_default();
            let prior_queued = queue.iter().filter(|t| t.status == TaskStatus::Queued).count();
            let repo_busy = state.processing.contains(repo_key) || prior_queued > 0;

            let mut task = QueuedTask::new(
                user_id.to_string(),
                instruction.to_string(),
                repo_key.to_string(),
                agent_kind,
            );
            task.position = prior_queued + 1;
            queue.push_back(task.clone());

            (task, repo_busy, state.processing.len())
        };

        info!(
            task_id = %task.id,
            repo = %repo_key,
            position = task.position,
            "Task enqueued"
        );

        let message = if repo_busy {
            format!(
                "Task queued for {} at position {}",
                task.repo_key, task.position
            )
        } else if parallel_count > 0 {
            format!(
                "Task for {} starting (running in parallel with {} other {})",
                task.repo_key,
                parallel_count,
                if parallel_count == 1 { "repo" } else { "repos" }
            )
        } else {
            format!("Task for {} starting", task.repo_key)
        };
        self.bus.publish(Update::Status {
            user_id: user_id.to_string(),
            message,
            task_id: Some(task.id.clone()),
            task_title: None,
            repo_key: Some(task.repo_key.clone()),
            agent: Some(agent_kind),
        });

        self.try_process_next().await;
        Ok(task)
    }

    /// One scheduling pass: promote at most one queued task per idle repo
    /// while the concurrency budget allows, dispatching each without
    /// awaiting it.
    pub fn try_process_next(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let processor = { self.processor.lock().await.clone() };
        let Some(processor) = processor else {
            debug!("No processor installed; leaving tasks queued");
            return;
        };

        let promoted: Vec<QueuedTask> = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let mut promoted = Vec::new();

            let repo_keys: Vec<String> = state.queues.keys().cloned().collect();
            for repo_key in repo_keys {
                if state.processing.len() >= self.limits.max_concurrent_repos {
                    break;
                }
                if state.processing.contains(&repo_key) {
                    continue;
                }
                let Some(queue) = state.queues.get_mut(&repo_key) else {
                    continue;
                };
                // VecDeque order is enqueue order, so the first queued
                // entry is the oldest.
                let Some(task) = queue.iter_mut().find(|t| t.status == TaskStatus::Queued)
                else {
                    continue;
                };
                task.status = TaskStatus::Processing;
                task.position = 0;
                let claimed = task.clone();
                state.processing.insert(repo_key.clone());
                renumber(queue);
                promoted.push(claimed);
            }
            promoted
        };

        for task in promoted {
            debug!(task_id = %task.id, repo = %task.repo_key, "Promoting task");
            let queue = self.clone();
            let processor = processor.clone();
            tokio::spawn(async move {
                queue.run_task(processor, task).await;
            });
        }
        })
    }

    async fn run_task(&self, processor: Arc<dyn TaskProcessor>, task: QueuedTask) {
        let result = processor.process(&task).await;
        if let Err(e) = &result {
            error!(task_id = %task.id, repo = %task.repo_key, "Task failed: {e}");
        }

        let notifications = {
            let mut state = self.state.lock().await;
            let state = &mut *state;

            // A concurrent cancellation may already have flipped the task
            // to Cancelled and released the repo slot; only a task still
            // marked Processing finishes normally here.
            let still_processing = state
                .queues
                .get(&task.repo_key)
                .and_then(|q| q.iter().find(|t| t.id == task.id))
                .map(|t| t.status == TaskStatus::Processing)
                .unwrap_or(false);

            if still_processing {
                state.processing.remove(&task.repo_key);
                if let Some(stored) = state
                    .queues
                    .get_mut(&task.repo_key)
                    .and_then(|q| q.iter_mut().find(|t| t.id == task.id))
                {
                    stored.status = if result.is_ok() {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                }
            }

            collect_garbage(state, &task.repo_key)
        };

        for (user_id, task_id, repo_key, position) in notifications {
            self.bus.publish(Update::Status {
                user_id,
                message: format!("Your task for {repo_key} is now at position {position}"),
                task_id: Some(task_id),
                task_title: None,
                repo_key: Some(repo_key),
                agent: None,
            });
        }

        // Next scheduling pass on a fresh tick, never under the lock.
        let queue = self.clone();
        tokio::spawn(async move {
            queue.try_process_next().await;
        });
    }

    /// Cancel one task. Queued tasks leave the shard immediately; for an
    /// in-flight task the repo slot is released and `was_processing` tells
    /// the caller to signal the agent subprocess. Tasks owned by another
    /// user are untouched.
    pub async fn cancel_task(&self, task_id: &str, user_id: &str) -> CancelOutcome {
        let no_op = CancelOutcome {
            cancelled: false,
            was_processing: false,
            repo_key: None,
        };

        let (outcome, notifications) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;

            let found = state.queues.iter().find_map(|(repo_key, queue)| {
                queue
                    .iter()
                    .find(|t| t.id == task_id)
                    .map(|t| (repo_key.clone(), t.user_id.clone(), t.status))
            });

            let Some((repo_key, owner, status)) = found else {
                return no_op;
            };
            if owner != user_id {
                return no_op;
            }

            match status {
                TaskStatus::Queued => {
                    if let Some(stored) = state
                        .queues
                        .get_mut(&repo_key)
                        .and_then(|q| q.iter_mut().find(|t| t.id == task_id))
                    {
                        stored.status = TaskStatus::Cancelled;
                    }
                    let notifications = collect_garbage(state, &repo_key);
                    (
                        CancelOutcome {
                            cancelled: true,
                            was_processing: false,
                            repo_key: Some(repo_key),
                        },
                        notifications,
                    )
                }
                TaskStatus::Processing => {
                    if let Some(stored) = state
                        .queues
                        .get_mut(&repo_key)
                        .and_then(|q| q.iter_mut().find(|t| t.id == task_id))
                    {
                        stored.status = TaskStatus::Cancelled;
                    }
                    state.processing.remove(&repo_key);
                    let notifications = collect_garbage(state, &repo_key);
                    (
                        CancelOutcome {
                            cancelled: true,
                            was_processing: true,
                            repo_key: Some(repo_key),
                        },
                        notifications,
                    )
                }
                _ => return no_op,
            }
        };

        if outcome.cancelled {
            info!(task_id, was_processing = outcome.was_processing, "Task cancelled");
            self.bus.publish(Update::Status {
                user_id: user_id.to_string(),
                message: "Task cancelled".to_string(),
                task_id: Some(task_id.to_string()),
                task_title: None,
                repo_key: outcome.repo_key.clone(),
                agent: None,
            });
            for (user_id, task_id, repo_key, position) in notifications {
                self.bus.publish(Update::Status {
                    user_id,
                    message: format!("Your task for {repo_key} is now at position {position}"),
                    task_id: Some(task_id),
                    task_title: None,
                    repo_key: Some(repo_key),
                    agent: None,
                });
            }
            self.try_process_next().await;
        }

        outcome
    }

    /// Cancel everything a user owns. Other users' tasks in the same repos
    /// are untouched. Idempotent: a second call finds nothing.
    pub async fn cancel_all_for_user(&self, user_id: &str) -> BulkCancelOutcome {
        let (outcome, touched_repos) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let mut outcome = BulkCancelOutcome::default();
            let mut touched_repos = Vec::new();

            for (repo_key, queue) in state.queues.iter_mut() {
                let mut touched = false;
                for task in queue.iter_mut() {
                    if task.user_id != user_id || task.status.is_terminal() {
                        continue;
                    }
                    match task.status {
                        TaskStatus::Queued => {
                            task.status = TaskStatus::Cancelled;
                            outcome.cancelled_queued += 1;
                            touched = true;
                        }
                        TaskStatus::Processing => {
                            task.status = TaskStatus::Cancelled;
                            outcome.cancelled_running += 1;
                            outcome.processing_repos.push(repo_key.clone());
                            touched = true;
                        }
                        _ => {}
                    }
                }
                if touched {
                    touched_repos.push(repo_key.clone());
                }
            }

            for repo_key in &outcome.processing_repos {
                state.processing.remove(repo_key);
            }
            for repo_key in &touched_repos {
                collect_garbage(state, repo_key);
            }

            (outcome, touched_repos)
        };

        let total = outcome.cancelled_running + outcome.cancelled_queued;
        if total > 0 {
            info!(user_id, total, "Cancelled all tasks for user");
            self.bus.publish(Update::status(
                user_id,
                format!(
                    "Cancelled {total} task{} across {} repo{}",
                    if total == 1 { "" } else { "s" },
                    touched_repos.len(),
                    if touched_repos.len() == 1 { "" } else { "s" }
                ),
            ));
            self.try_process_next().await;
        }

        outcome
    }

    pub async fn get_task(&self, task_id: &str) -> Option<QueuedTask> {
        let state = self.state.lock().await;
        state
            .queues
            .values()
            .flat_map(|q| q.iter())
            .find(|t| t.id == task_id)
            .cloned()
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;

        let mut processing_repos: Vec<String> = state.processing.iter().cloned().collect();
        processing_repos.sort();

        let mut repo_queues: Vec<RepoQueueStatus> = state
            .queues
            .iter()
            .map(|(repo_key, queue)| RepoQueueStatus {
                repo_key: repo_key.clone(),
                queued: queue.iter().filter(|t| t.status == TaskStatus::Queued).count(),
                processing: state.processing.contains(repo_key),
                current_task_id: queue
                    .iter()
                    .find(|t| t.status == TaskStatus::Processing)
                    .map(|t| t.id.clone()),
            })
            .collect();
        repo_queues.sort_by(|a, b| a.repo_key.cmp(&b.repo_key));

        QueueStatus {
            total_queued: state
                .queues
                .values()
                .flat_map(|q| q.iter())
                .filter(|t| t.status == TaskStatus::Queued)
                .count(),
            active_repos: state.processing.len(),
            max_concurrent_repos: self.limits.max_concurrent_repos,
            processing_repos,
            repo_queues,
        }
    }
}

/// Renumber surviving queued tasks to 1-based positions in shard order.
fn renumber(queue: &mut VecDeque<QueuedTask>) {
    let mut position = 0;
    for task in queue.iter_mut() {
        if task.status == TaskStatus::Queued {
            position += 1;
            task.position = position;
        }
    }
}

/// Drop terminal tasks from a shard, renumber the rest, and return
/// position notifications for tasks now at position ≤ 3. Empty shards
/// leave the map entirely.
fn collect_garbage(
    state: &mut QueueState,
    repo_key: &str,
) -> Vec<(String, String, String, usize)> {
    let mut notifications = Vec::new();

    if let Some(queue) = state.queues.get_mut(repo_key) {
        let before = queue.len();
        queue.retain(|t| !t.status.is_terminal());
        let removed = before - queue.len();
        renumber(queue);

        if removed > 0 {
            for task in queue.iter() {
                if task.status == TaskStatus::Queued && task.position <= 3 {
                    notifications.push((
                        task.user_id.clone(),
                        task.id.clone(),
                        task.repo_key.clone(),
                        task.position,
                    ));
                }
            }
        }

        if queue.is_empty() {
            state.queues.remove(repo_key);
        }
    }

    notifications
}
