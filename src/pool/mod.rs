//! Bounded pool of per-repo agent sessions.
//!
//! One session per repo key, LRU-evicted when idle. The default workspace
//! is never evicted; when the pool is full of busy sessions, new repos fall
//! back to the default session — isolation traded for liveness, and the
//! fallback is announced on the bus so the user knows which workspace ran
//! their task.

use crate::{
    agent::{AgentSession, SessionActivity},
    approvals::ApprovalGate,
    bus::UpdateBus,
    config::AgentConfig,
    constants::DEFAULT_REPO_KEY,
    guard::PermissionGuard,
    models::{AgentKind, PendingInputRegistry, Update},
    repo,
    ConductorError, Result,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct PoolEntry {
    session: Arc<AgentSession>,
    last_used: Instant,
    is_processing: bool,
}

pub struct SessionPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
    base_dir: PathBuf,
    capacity: usize,
    agent_config: AgentConfig,
    guard: Arc<PermissionGuard>,
    approvals: ApprovalGate,
    bus: UpdateBus,
    pending_inputs: PendingInputRegistry,
}

impl SessionPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_dir: PathBuf,
        capacity: usize,
        agent_config: AgentConfig,
        guard: Arc<PermissionGuard>,
        approvals: ApprovalGate,
        bus: UpdateBus,
        pending_inputs: PendingInputRegistry,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            base_dir,
            capacity,
            agent_config,
            guard,
            approvals,
            bus,
            pending_inputs,
        }
    }

    /// Fetch the session for a repo, materialising its workspace on first
    /// use. At capacity, the oldest idle non-default session is evicted;
    /// when nothing is evictable the default session is returned instead.
    pub async fn get_or_create_session(
        &self,
        repo_key: &str,
        agent_kind: AgentKind,
        user_id: &str,
    ) -> Result<Arc<AgentSession>> {
        let repo_key = normalize_key(repo_key);

        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&repo_key) {
            entry.last_used = Instant::now();
            return Ok(entry.session.clone());
        }

        if entries.len() >= self.capacity && !self.evict_one(&mut entries) {
            // Nothing evictable: every pooled session is busy. Fall back to
            // the shared default workspace rather than blocking.
            warn!(
                repo = %repo_key,
                "Session pool exhausted; falling back to the default workspace"
            );
            self.bus.publish(Update::status(
                user_id,
                format!(
                    "All {} workspaces are busy; running this task in the default workspace instead of {repo_key}",
                    self.capacity
                ),
            ));
            return self
                .entry_for(&mut entries, DEFAULT_REPO_KEY, agent_kind)
                .await;
        }

        self.entry_for(&mut entries, &repo_key, agent_kind).await
    }

    async fn entry_for(
        &self,
        entries: &mut HashMap<String, PoolEntry>,
        repo_key: &str,
        agent_kind: AgentKind,
    ) -> Result<Arc<AgentSession>> {
        if let Some(entry) = entries.get_mut(repo_key) {
            entry.last_used = Instant::now();
            return Ok(entry.session.clone());
        }

        let working_dir = self.setup_repo_directory(repo_key).await?;
        let session = Arc::new(AgentSession::new(
            repo_key.to_string(),
            agent_kind,
            working_dir,
            self.agent_config.clone(),
            self.guard.clone(),
            self.approvals.clone(),
            self.bus.clone(),
            self.pending_inputs.clone(),
        ));

        info!(repo = %repo_key, "Created pooled session");
        entries.insert(
            repo_key.to_string(),
            PoolEntry {
                session: session.clone(),
                last_used: Instant::now(),
                is_processing: false,
            },
        );

        Ok(session)
    }

    /// Evict the least-recently-used idle session, never the default one.
    /// Returns false when every candidate is busy.
    fn evict_one(&self, entries: &mut HashMap<String, PoolEntry>) -> bool {
        let victim = entries
            .iter()
            .filter(|(key, entry)| *key != DEFAULT_REPO_KEY && !entry.is_processing)
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                debug!(repo = %key, "Evicting idle session");
                entries.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Materialise the working directory for a repo key. Existing
    /// directories are reused as-is; new ones are cloned from GitHub when
    /// the repo exists there, else initialised empty.
    async fn setup_repo_directory(&self, repo_key: &str) -> Result<PathBuf> {
        if repo_key == DEFAULT_REPO_KEY {
            tokio::fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| ConductorError::Session {
                    message: format!("Failed to create base working directory: {e}"),
                })?;
            return Ok(self.base_dir.clone());
        }

        let dir = self.base_dir.join(repo_key.replace('/', "_"));
        if dir.exists() {
            return Ok(dir);
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ConductorError::Session {
                message: format!("Failed to create workspace for {repo_key}: {e}"),
            })?;

        if self.github_repo_exists(repo_key).await {
            let url = format!("https://github.com/{repo_key}.git");
            info!(repo = %repo_key, "Cloning repository into workspace");
            let cloned = Command::new("git")
                .arg("clone")
                .arg(&url)
                .arg(".")
                .current_dir(&dir)
                .output()
                .await
                .map(|out| out.status.success())
                .unwrap_or(false);
            if cloned {
                return Ok(dir);
            }
            warn!(repo = %repo_key, "Clone failed; initialising an empty repository");
        }

        // No matching GitHub repo (or clone failed): start empty. A missing
        // git binary leaves a bare directory, which is still usable.
        let initialised = Command::new("git")
            .arg("init")
            .current_dir(&dir)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !initialised {
            warn!(repo = %repo_key, "git init failed; using a plain directory");
        }

        Ok(dir)
    }

    async fn github_repo_exists(&self, repo_key: &str) -> bool {
        if !repo_key.contains('/') {
            return false;
        }
        Command::new("gh")
            .args(["repo", "view", repo_key])
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    pub async fn is_repo_processing(&self, repo_key: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(&normalize_key(repo_key))
            .map_or(false, |e| e.is_processing)
    }

    /// Flip the reservation flag. A reserved session is never evicted.
    pub async fn set_repo_processing(&self, repo_key: &str, processing: bool) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&normalize_key(repo_key)) {
            entry.is_processing = processing;
            entry.last_used = Instant::now();
        }
    }

    pub async fn cancel_repo_task(&self, repo_key: &str) {
        let session = {
            let entries = self.entries.lock().await;
            entries.get(&normalize_key(repo_key)).map(|e| e.session.clone())
        };
        if let Some(session) = session {
            session.cancel_current_task().await;
        }
    }

    pub async fn cancel_all(&self) {
        let sessions: Vec<Arc<AgentSession>> = {
            let entries = self.entries.lock().await;
            entries.values().map(|e| e.session.clone()).collect()
        };
        for session in sessions {
            session.cancel_current_task().await;
        }
    }

    pub async fn clear_user_history(&self, user_id: &str) {
        let sessions: Vec<Arc<AgentSession>> = {
            let entries = self.entries.lock().await;
            entries.values().map(|e| e.session.clone()).collect()
        };
        for session in sessions {
            session.clear_user_history(user_id).await;
        }
    }

    /// Activity of every pooled session, for the status endpoint.
    pub async fn activity_snapshot(&self) -> Vec<SessionActivity> {
        let sessions: Vec<Arc<AgentSession>> = {
            let entries = self.entries.lock().await;
            entries.values().map(|e| e.session.clone()).collect()
        };
        let mut snapshot = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshot.push(session.activity().await);
        }
        snapshot
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn normalize_key(repo_key: &str) -> String {
    if repo_key == DEFAULT_REPO_KEY {
        repo_key.to_string()
    } else {
        repo::normalize(repo_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn test_pool(capacity: usize) -> (Arc<SessionPool>, UpdateBus, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let bus = UpdateBus::new();
        let registry: PendingInputRegistry = Arc::new(Mutex::new(StdHashMap::new()));
        let pool = Arc::new(SessionPool::new(
            tmp.path().to_path_buf(),
            capacity,
            AgentConfig {
                command: "sh".to_string(),
                extra_args: vec![],
                anthropic_api_key: None,
                token_limit: 10_000,
                token_warning_ratio: 0.8,
            },
            Arc::new(PermissionGuard::new().unwrap()),
            ApprovalGate::with_timeout(bus.clone(), Duration::from_millis(10)),
            bus.clone(),
            registry,
        ));
        (pool, bus, tmp)
    }

    #[tokio::test]
    async fn creates_and_reuses_sessions() {
        let (pool, _bus, _tmp) = test_pool(4);

        let first = pool
            .get_or_create_session("org/app", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        let second = pool
            .get_or_create_session("Org/App", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();

        // Keys normalize to the same session.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn workspace_directory_uses_underscore_naming() {
        let (pool, _bus, tmp) = test_pool(4);
        let session = pool
            .get_or_create_session("org/app", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        assert_eq!(session.working_dir(), &tmp.path().join("org_app"));
        assert!(session.working_dir().exists());
    }

    #[tokio::test]
    async fn default_key_maps_to_base_directory() {
        let (pool, _bus, tmp) = test_pool(4);
        let session = pool
            .get_or_create_session(DEFAULT_REPO_KEY, AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        assert_eq!(session.working_dir(), &tmp.path().to_path_buf());
    }

    #[tokio::test]
    async fn evicts_least_recently_used_idle_session() {
        let (pool, _bus, _tmp) = test_pool(2);

        pool.get_or_create_session("org/a", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        pool.get_or_create_session("org/b", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        // Touch org/a so org/b is the LRU candidate.
        pool.get_or_create_session("org/a", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();

        let c = pool
            .get_or_create_session("org/c", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        assert_eq!(c.repo_key(), "org/c");
        assert_eq!(pool.len().await, 2);
        assert!(!pool.is_repo_processing("org/b").await);

        // org/a survived the eviction.
        let entries = pool.entries.lock().await;
        assert!(entries.contains_key("org/a"));
        assert!(!entries.contains_key("org/b"));
    }

    #[tokio::test]
    async fn busy_sessions_are_not_evicted_and_fallback_is_announced() {
        let (pool, bus, _tmp) = test_pool(2);
        let mut updates = bus.subscribe();

        pool.get_or_create_session("org/a", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        pool.get_or_create_session("org/b", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        pool.set_repo_processing("org/a", true).await;
        pool.set_repo_processing("org/b", true).await;

        let fallback = pool
            .get_or_create_session("org/c", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        assert_eq!(fallback.repo_key(), DEFAULT_REPO_KEY);

        match updates.recv().await.unwrap() {
            Update::Status { message, .. } => {
                assert!(message.contains("default workspace"));
                assert!(message.contains("org/c"));
            }
            other => panic!("expected fallback status, got {other:?}"),
        }

        // Both busy sessions survived.
        assert!(pool.is_repo_processing("org/a").await);
        assert!(pool.is_repo_processing("org/b").await);
    }

    #[tokio::test]
    async fn processing_flag_round_trips() {
        let (pool, _bus, _tmp) = test_pool(4);
        pool.get_or_create_session("org/a", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();

        assert!(!pool.is_repo_processing("org/a").await);
        pool.set_repo_processing("org/a", true).await;
        assert!(pool.is_repo_processing("org/a").await);
        pool.set_repo_processing("org/a", false).await;
        assert!(!pool.is_repo_processing("org/a").await);
    }

    #[tokio::test]
    async fn activity_snapshot_reports_all_sessions() {
        let (pool, _bus, _tmp) = test_pool(4);
        pool.get_or_create_session("org/a", AgentKind::ClaudeCode, "u1")
            .await
            .unwrap();
        pool.get_or_create_session("org/b", AgentKind::Codex, "u1")
            .await
            .unwrap();

        let snapshot = pool.activity_snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|a| !a.is_processing));
    }
}
