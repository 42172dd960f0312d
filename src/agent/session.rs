//! One agent-CLI session per (repo, agent kind).
//!
//! The session owns the child process for its workspace: it builds the
//! prompt, spawns the CLI with streaming-JSON output, dispatches stdout
//! records as they arrive, enforces the permission guard on tool use, runs
//! the post-hoc approval detector over the full response, and reports
//! progress on the update bus. At most one instruction runs at a time; the
//! queue guarantees callers respect that, and the session refuses overlap
//! defensively anyway.

use crate::{
    agent::history::{ChatRole, ConversationHistory},
    agent::stream::{classify_line, StreamEvent},
    approvals::ApprovalGate,
    bus::UpdateBus,
    config::AgentConfig,
    constants::{
        DEFAULT_REPO_KEY, STATUS_PREVIEW_LENGTH, SUMMARY_KEYWORDS, SUMMARY_MAX_LINES,
        TASK_TITLE_MAX_LENGTH,
    },
    guard::PermissionGuard,
    models::{AgentKind, PendingInput, PendingInputRegistry, Update},
    ConductorError, Result,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Snapshot of a session's activity for status reporting.
#[derive(Debug, Clone)]
pub struct SessionActivity {
    pub repo_key: String,
    pub agent_kind: AgentKind,
    pub is_processing: bool,
    pub current_task_id: Option<String>,
    pub current_task_title: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_update: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct AgentSession {
    repo_key: String,
    agent_kind: AgentKind,
    working_dir: PathBuf,
    config: AgentConfig,
    guard: Arc<PermissionGuard>,
    approvals: ApprovalGate,
    bus: UpdateBus,
    pending_inputs: PendingInputRegistry,
    histories: Mutex<HashMap<String, ConversationHistory>>,
    child: Mutex<Option<Child>>,
    is_processing: AtomicBool,
    cancelled: AtomicBool,
    current_task_id: Mutex<Option<String>>,
    current_task_title: Mutex<Option<String>>,
    started_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    last_update: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    stashed_input: Mutex<Option<String>>,
}

impl AgentSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_key: String,
        agent_kind: AgentKind,
        working_dir: PathBuf,
        config: AgentConfig,
        guard: Arc<PermissionGuard>,
        approvals: ApprovalGate,
        bus: UpdateBus,
        pending_inputs: PendingInputRegistry,
    ) -> Self {
        Self {
            repo_key,
            agent_kind,
            working_dir,
            config,
            guard,
            approvals,
            bus,
            pending_inputs,
            histories: Mutex::new(HashMap::new()),
            child: Mutex::new(None),
            is_processing: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            current_task_id: Mutex::new(None),
            current_task_title: Mutex::new(None),
            started_at: Mutex::new(None),
            last_update: Mutex::new(None),
            stashed_input: Mutex::new(None),
        }
    }

    pub fn repo_key(&self) -> &str {
        &self.repo_key
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    pub async fn activity(&self) -> SessionActivity {
        SessionActivity {
            repo_key: self.repo_key.clone(),
            agent_kind: self.agent_kind,
            is_processing: self.is_processing(),
            current_task_id: self.current_task_id.lock().await.clone(),
            current_task_title: self.current_task_title.lock().await.clone(),
            started_at: *self.started_at.lock().await,
            last_update: *self.last_update.lock().await,
        }
    }

    /// Run one instruction to completion. Refuses (with an Error update)
    /// when a task is already in flight for this session.
    pub async fn process_instruction(
        &self,
        instruction: &str,
        user_id: &str,
        task_id: &str,
    ) -> Result<()> {
        if self.is_processing.swap(true, Ordering::SeqCst) {
            let message = format!(
                "A task is already running in the {} workspace",
                self.display_name()
            );
            self.publish_error(user_id, &message, Some(task_id));
            return Err(ConductorError::Session { message });
        }

        self.cancelled.store(false, Ordering::SeqCst);
        let title = derive_task_title(instruction);
        *self.current_task_id.lock().await = Some(task_id.to_string());
        *self.current_task_title.lock().await = Some(title.clone());
        *self.started_at.lock().await = Some(chrono::Utc::now());

        let result = self.run_task(instruction, user_id, task_id, &title).await;

        *self.child.lock().await = None;
        *self.current_task_id.lock().await = None;
        *self.current_task_title.lock().await = None;
        *self.started_at.lock().await = None;
        self.is_processing.store(false, Ordering::SeqCst);

        result
    }

    async fn run_task(
        &self,
        instruction: &str,
        user_id: &str,
        task_id: &str,
        title: &str,
    ) -> Result<()> {
        let prompt = self.build_prompt(user_id, instruction).await;

        {
            let mut histories = self.histories.lock().await;
            self.history_entry(&mut histories, user_id)
                .push(ChatRole::User, instruction);
        }

        self.publish_status(
            user_id,
            format!("Starting: {title}"),
            Some(task_id),
            Some(title.to_string()),
        );

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.extra_args)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg(&prompt)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &self.config.anthropic_api_key {
            command.env("ANTHROPIC_API_KEY", key);
        }

        debug!(
            repo = %self.repo_key,
            agent = %self.agent_kind.as_str(),
            command = %self.config.command,
            "Spawning agent process"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to spawn agent \"{}\": {e}", self.config.command);
                self.publish_error(user_id, &message, Some(task_id));
                return Err(ConductorError::SpawnFailure { message });
            }
        };

        let stdout = child.stdout.take().ok_or_else(|| ConductorError::SpawnFailure {
            message: "agent stdout was not captured".to_string(),
        })?;
        // Drain stderr concurrently so a chatty agent cannot fill the pipe.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
                buf
            })
        });

        *self.child.lock().await = Some(child);

        let mut lines = BufReader::new(stdout).lines();
        let mut response = String::new();
        let mut blocked_reason: Option<String> = None;
        let mut input_requested = false;

        while let Ok(Some(line)) = lines.next_line().await {
            self.touch().await;
            match classify_line(&line) {
                StreamEvent::Assistant(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    if text.chars().count() > STATUS_PREVIEW_LENGTH {
                        let preview: String =
                            text.chars().take(STATUS_PREVIEW_LENGTH).collect();
                        self.publish_status(
                            user_id,
                            format!("{preview}…"),
                            Some(task_id),
                            None,
                        );
                    }
                    push_response(&mut response, &text);
                }
                StreamEvent::ToolUse { name, input } => {
                    let check = self.guard.check(&input);
                    if !check.allowed {
                        let reason = check
                            .blocked_reason
                            .unwrap_or_else(|| "operation not permitted".to_string());
                        warn!(
                            repo = %self.repo_key,
                            tool = %name,
                            "Blocked tool use from agent stream"
                        );
                        self.publish_error(
                            user_id,
                            &format!("Refused tool use \"{name}\": {reason}"),
                            Some(task_id),
                        );
                        blocked_reason = Some(reason);
                        break;
                    }
                    if let Some(warning) = check.warning {
                        self.publish_status(
                            user_id,
                            format!("Warning: {warning}"),
                            Some(task_id),
                            None,
                        );
                    }
                    self.publish_status(
                        user_id,
                        format!("Executing: {name}"),
                        Some(task_id),
                        None,
                    );
                }
                StreamEvent::ResultChunk(text) => push_response(&mut response, &text),
                StreamEvent::InputRequest(question) => {
                    // At most one pending input per task.
                    if !input_requested {
                        input_requested = true;
                        self.register_input_request(user_id, &question).await;
                    }
                }
                StreamEvent::Other(raw) | StreamEvent::Plain(raw) => {
                    push_response(&mut response, &raw)
                }
            }
        }

        let child = self.child.lock().await.take();

        if let Some(reason) = blocked_reason {
            if let Some(mut child) = child {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            return Err(ConductorError::BlockedOperation { reason });
        }

        let status = match child {
            Some(mut child) => child.wait().await.map_err(|e| ConductorError::Session {
                message: format!("Failed waiting for agent process: {e}"),
            })?,
            // The child can only be gone if cancellation reaped it.
            None => {
                self.publish_error(user_id, "Task cancelled", Some(task_id));
                return Err(ConductorError::Session {
                    message: "task cancelled".to_string(),
                });
            }
        };

        if self.cancelled.load(Ordering::SeqCst) {
            info!(repo = %self.repo_key, task_id, "Task cancelled; agent terminated");
            self.publish_error(
                user_id,
                "Task cancelled; the agent process was stopped",
                Some(task_id),
            );
            return Err(ConductorError::Session {
                message: "task cancelled".to_string(),
            });
        }

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let stderr_text = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let message = if stderr_text.trim().is_empty() {
                format!("Agent exited with code {code}")
            } else {
                format!("Agent exited with code {code}: {}", stderr_text.trim())
            };
            self.publish_error(user_id, &message, Some(task_id));
            return Err(ConductorError::AgentExit { code, message });
        }

        // The agent may narrate destructive commands without piping them
        // through the tool channel; every such claim goes to the gate,
        // strictly one at a time.
        for detection in self.guard.detect_destructive(&response) {
            let approved = self
                .approvals
                .request_approval(
                    user_id,
                    &detection,
                    &self.repo_key,
                    self.agent_kind,
                    Some(task_id.to_string()),
                )
                .await?;
            let verdict = if approved { "approved" } else { "denied" };
            self.publish_status(
                user_id,
                format!("Destructive action \"{}\" {verdict}", detection.action),
                Some(task_id),
                None,
            );
        }

        {
            let mut histories = self.histories.lock().await;
            self.history_entry(&mut histories, user_id)
                .push(ChatRole::Assistant, response.clone());
        }

        let summary = summarize_response(&response);
        self.touch().await;
        self.bus.publish(Update::TaskComplete {
            user_id: user_id.to_string(),
            message: summary,
            task_id: task_id.to_string(),
            task_title: Some(title.to_string()),
            repo_key: Some(self.repo_key.clone()),
            agent: Some(self.agent_kind),
        });

        Ok(())
    }

    /// Deliver a user's answer to an outstanding input request. Writes to
    /// the live child's stdin when one is running; otherwise the text is
    /// stashed and prepended to the next prompt.
    pub async fn submit_input_response(&self, _user_id: &str, text: &str) -> bool {
        {
            let mut child_guard = self.child.lock().await;
            if let Some(child) = child_guard.as_mut() {
                if let Some(stdin) = child.stdin.as_mut() {
                    let payload = format!("{text}\n");
                    if stdin.write_all(payload.as_bytes()).await.is_ok() {
                        let _ = stdin.flush().await;
                        debug!(repo = %self.repo_key, "Input response written to agent stdin");
                        return true;
                    }
                }
            }
        }

        *self.stashed_input.lock().await = Some(text.to_string());
        debug!(repo = %self.repo_key, "Input response stashed for the next turn");
        true
    }

    /// Signal the running child, if any. The processing loop observes the
    /// cancelled flag and emits the Error update; TASK_COMPLETE is never
    /// emitted for a cancelled task.
    pub async fn cancel_current_task(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut child_guard = self.child.lock().await;
        if let Some(child) = child_guard.as_mut() {
            info!(repo = %self.repo_key, "Cancelling in-flight agent process");
            let _ = child.start_kill();
        }
    }

    pub async fn clear_user_history(&self, user_id: &str) {
        let mut histories = self.histories.lock().await;
        if histories.remove(user_id).is_some() {
            debug!(repo = %self.repo_key, user_id, "Cleared conversation history");
        }
    }

    pub async fn history_turns(&self, user_id: &str) -> usize {
        let histories = self.histories.lock().await;
        histories.get(user_id).map_or(0, |h| h.turn_count())
    }

    async fn register_input_request(&self, user_id: &str, question: &str) {
        let input_id = Uuid::new_v4().to_string();
        self.pending_inputs.lock().await.insert(
            input_id.clone(),
            PendingInput {
                user_id: user_id.to_string(),
                repo_key: self.repo_key.clone(),
                agent_kind: self.agent_kind,
            },
        );
        let message = if question.is_empty() {
            "The agent needs more input to continue".to_string()
        } else {
            question.to_string()
        };
        self.bus.publish(Update::InputNeeded {
            user_id: user_id.to_string(),
            message,
            input_id,
            repo_key: Some(self.repo_key.clone()),
            agent: Some(self.agent_kind),
            expected_input_format: Some("free text".to_string()),
        });
    }

    async fn build_prompt(&self, user_id: &str, instruction: &str) -> String {
        let mut prompt = String::new();
        if self.repo_key == DEFAULT_REPO_KEY {
            prompt.push_str("You are working in the default workspace.\n");
        } else {
            prompt.push_str(&format!(
                "You are working in the workspace for repository {}.\n",
                self.repo_key
            ));
        }

        {
            let histories = self.histories.lock().await;
            if let Some(history) = histories.get(user_id) {
                if !history.is_empty() {
                    prompt.push_str(&format!(
                        "This continues a conversation with {} earlier turns in this workspace.\n",
                        history.turn_count()
                    ));
                }
            }
        }

        if let Some(stashed) = self.stashed_input.lock().await.take() {
            prompt.push_str(&format!(
                "The user answered your earlier question: {stashed}\n"
            ));
        }

        prompt.push('\n');
        prompt.push_str(instruction);
        prompt
    }

    fn history_entry<'a>(
        &self,
        histories: &'a mut HashMap<String, ConversationHistory>,
        user_id: &str,
    ) -> &'a mut ConversationHistory {
        histories.entry(user_id.to_string()).or_insert_with(|| {
            ConversationHistory::new(
                crate::constants::HISTORY_MAX_TURNS,
                self.config.token_limit,
                self.config.token_warning_ratio,
            )
        })
    }

    fn display_name(&self) -> String {
        if self.repo_key == DEFAULT_REPO_KEY {
            "default".to_string()
        } else {
            self.repo_key.clone()
        }
    }

    async fn touch(&self) {
        *self.last_update.lock().await = Some(chrono::Utc::now());
    }

    fn publish_status(
        &self,
        user_id: &str,
        message: String,
        task_id: Option<&str>,
        task_title: Option<String>,
    ) {
        self.bus.publish(Update::Status {
            user_id: user_id.to_string(),
            message,
            task_id: task_id.map(|t| t.to_string()),
            task_title,
            repo_key: Some(self.repo_key.clone()),
            agent: Some(self.agent_kind),
        });
    }

    fn publish_error(&self, user_id: &str, message: &str, task_id: Option<&str>) {
        self.bus.publish(Update::Error {
            user_id: user_id.to_string(),
            message: message.to_string(),
            task_id: task_id.map(|t| t.to_string()),
            repo_key: Some(self.repo_key.clone()),
            agent: Some(self.agent_kind),
        });
    }
}

/// First sentence of the instruction, truncated to a display length.
pub fn derive_task_title(instruction: &str) -> String {
    let first_sentence = instruction
        .split(['.', '!', '?', '\n'])
        .next()
        .unwrap_or(instruction)
        .trim();

    let base = if first_sentence.is_empty() {
        instruction.trim()
    } else {
        first_sentence
    };

    if base.chars().count() <= TASK_TITLE_MAX_LENGTH {
        base.to_string()
    } else {
        let truncated: String = base.chars().take(TASK_TITLE_MAX_LENGTH).collect();
        format!("{truncated}…")
    }
}

/// Condense a finished response: up to three lines containing success
/// keywords, else the last three non-empty lines.
pub fn summarize_response(response: &str) -> String {
    let lines: Vec<&str> = response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        return "Task finished with no output.".to_string();
    }

    let keyword_lines: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| {
            let lower = line.to_lowercase();
            SUMMARY_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .take(SUMMARY_MAX_LINES)
        .collect();

    if !keyword_lines.is_empty() {
        return keyword_lines.join("\n");
    }

    let tail_start = lines.len().saturating_sub(SUMMARY_MAX_LINES);
    lines[tail_start..].join("\n")
}

fn push_response(buffer: &mut String, text: &str) {
    if !buffer.is_empty() {
        buffer.push('\n');
    }
    buffer.push_str(text);
}
