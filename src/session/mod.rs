pub mod pty;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use portable_pty::CommandBuilder;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};

use crate::config::Config;
use crate::error::Error;
use crate::events::translator::EventTranslator;
use crate::events::{ActivityState, AgentEvent};
use crate::ide::IdeSupervisor;
use crate::metrics::MetricsCollector;
use crate::sandbox::{SandboxUser, SandboxUserManager};
use crate::workspace::WorkspaceStore;
use pty::{PTY_COLS, PTY_ROWS, PtyHandle};

/// Lines of raw agent output retained per session for admin inspection.
const OUTPUT_BUFFER_LINES: usize = 100;

/// How often the idle reaper scans.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Ollama,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// The session record. Transitions are one-way within a lifetime; restart
/// creates a new id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub workspace_path: PathBuf,
    pub cloud_prefix: String,
    pub mode: SessionMode,
    pub model: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub sandbox_username: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(skip)]
    pub storage_limit_mb: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub workspace_path: Option<PathBuf>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub storage_limit_mb: Option<u64>,
}

/// Top-level coordinator: owns the session table, each session's PTY, and
/// the bindings to sandbox users, workspaces, IDE instances, and metrics
/// baselines. Every resource allocated here has exactly one teardown path,
/// reachable from `cleanup`.
pub struct SessionManager {
    config: Config,
    workspaces: Arc<WorkspaceStore>,
    sandbox: Arc<SandboxUserManager>,
    ide: Arc<IdeSupervisor>,
    metrics: Arc<MetricsCollector>,
    sessions: RwLock<HashMap<String, Session>>,
    ptys: Mutex<HashMap<String, Arc<PtyHandle>>>,
    sandbox_users: Mutex<HashMap<String, SandboxUser>>,
    translators: Mutex<HashMap<String, Arc<StdMutex<EventTranslator>>>>,
    event_channels: Mutex<HashMap<String, broadcast::Sender<AgentEvent>>>,
    output_buffers: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    activities: Arc<Mutex<HashMap<String, String>>>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        workspaces: Arc<WorkspaceStore>,
        sandbox: Arc<SandboxUserManager>,
        ide: Arc<IdeSupervisor>,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            workspaces,
            sandbox,
            ide,
            metrics,
            sessions: RwLock::new(HashMap::new()),
            ptys: Mutex::new(HashMap::new()),
            sandbox_users: Mutex::new(HashMap::new()),
            translators: Mutex::new(HashMap::new()),
            event_channels: Mutex::new(HashMap::new()),
            output_buffers: Arc::new(Mutex::new(HashMap::new())),
            activities: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn ide(&self) -> &IdeSupervisor {
        &self.ide
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn running_session_for_user(&self, user_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| {
                s.user_id == user_id
                    && matches!(s.status, SessionStatus::Starting | SessionStatus::Running)
            })
            .cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| matches!(s.status, SessionStatus::Starting | SessionStatus::Running))
            .count()
    }

    pub async fn output_buffer(&self, session_id: &str) -> Vec<String> {
        self.output_buffers
            .lock()
            .await
            .get(session_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn activity(&self, session_id: &str) -> Option<String> {
        self.activities.lock().await.get(session_id).cloned()
    }

    pub async fn translator_activity(&self, session_id: &str) -> Option<ActivityState> {
        let translators = self.translators.lock().await;
        let translator = translators.get(session_id)?;
        let guard = translator.lock().unwrap_or_else(|e| e.into_inner());
        Some(guard.activity())
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub async fn create(self: &Arc<Self>, request: CreateSessionRequest) -> Result<Session, Error> {
        let user_id = request.user_id.clone();

        let running = self
            .list_for_user(&user_id)
            .await
            .into_iter()
            .filter(|s| matches!(s.status, SessionStatus::Starting | SessionStatus::Running))
            .count();
        if running >= self.config.max_sessions_per_user {
            return Err(Error::QuotaExceeded {
                user_id,
                running,
                max: self.config.max_sessions_per_user,
            });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.agent.default_model.clone());
        let mode = if request.api_key.is_some() {
            SessionMode::Api
        } else {
            SessionMode::Ollama
        };

        if let Some(requested) = &request.workspace_path {
            tracing::debug!(
                user_id = %user_id,
                requested = %requested.display(),
                "workspace path in request is advisory; workspaces are user-scoped"
            );
        }

        // Cloud must succeed: the manager may be replicated and local
        // filesystems are not authoritative.
        let init = self
            .workspaces
            .initialize(&user_id, &session_id, Some(&model))
            .await?;
        tracing::debug!(
            user_id = %user_id,
            is_new = init.is_new,
            files_downloaded = init.files_downloaded,
            "workspace ready for session"
        );
        let workspace_path = init.local_path.clone();

        match self
            .provision(&session_id, &user_id, &request, mode, &model, workspace_path.clone())
            .await
        {
            Ok(session) => Ok(session),
            Err(err) => {
                // Unwind partial provisioning before surfacing the error.
                self.workspaces.stop(&session_id).await;
                let user = self.sandbox_users.lock().await.remove(&session_id);
                if let Some(user) = user {
                    self.sandbox.delete(&user, true).await;
                }
                self.forget(&session_id).await;

                // Leave an error-state tombstone so the id resolves.
                let now = chrono::Utc::now();
                self.sessions.write().await.insert(
                    session_id.clone(),
                    Session {
                        id: session_id.clone(),
                        user_id: user_id.clone(),
                        workspace_path,
                        cloud_prefix: format!("workspaces/{user_id}/"),
                        mode,
                        model,
                        status: SessionStatus::Error,
                        pid: None,
                        sandbox_username: None,
                        created_at: now,
                        last_activity: now,
                        api_key: None,
                        storage_limit_mb: None,
                    },
                );
                Err(err)
            }
        }
    }

    async fn provision(
        self: &Arc<Self>,
        session_id: &str,
        user_id: &str,
        request: &CreateSessionRequest,
        mode: SessionMode,
        model: &str,
        workspace_path: PathBuf,
    ) -> Result<Session, Error> {
        let limit_mb = request
            .storage_limit_mb
            .unwrap_or(self.config.max_workspace_size_mb);
        let usage = crate::metrics::workspace_usage(&workspace_path);
        let measured_mb = usage.total_bytes / (1024 * 1024);
        if measured_mb > limit_mb {
            return Err(Error::StorageLimitExceeded {
                measured_mb,
                allowed_mb: limit_mb,
            });
        }

        match crate::workspace::ensure_context_file(&workspace_path).await {
            Ok(true) => tracing::info!(session_id, "created default AGENTICODE.md"),
            Ok(false) => {}
            Err(e) => tracing::warn!(session_id, error = %e, "context file creation failed"),
        }

        let sandbox_user = if self.sandbox.is_enabled() {
            Some(self.sandbox.allocate(session_id, &workspace_path).await?)
        } else {
            None
        };

        let cmd = self.compose_agent_command(
            session_id,
            user_id,
            mode,
            model,
            request.api_key.as_deref(),
            &workspace_path,
            sandbox_user.as_ref(),
        );

        let pty = match PtyHandle::spawn(cmd, PTY_COLS, PTY_ROWS) {
            Ok(pty) => Arc::new(pty),
            Err(e) => {
                if let Some(user) = sandbox_user {
                    self.sandbox.delete(&user, true).await;
                }
                return Err(Error::UpstreamFailure(format!("agent spawn failed: {e}")));
            }
        };

        let session = Session {
            id: session_id.to_string(),
            user_id: user_id.to_string(),
            workspace_path: workspace_path.clone(),
            cloud_prefix: format!("workspaces/{user_id}/"),
            mode,
            model: model.to_string(),
            status: SessionStatus::Starting,
            pid: pty.pid(),
            sandbox_username: sandbox_user.as_ref().map(|u| u.username.clone()),
            created_at: chrono::Utc::now(),
            last_activity: chrono::Utc::now(),
            api_key: request.api_key.clone(),
            storage_limit_mb: request.storage_limit_mb,
        };

        let translator = Arc::new(StdMutex::new(EventTranslator::new()));
        let (events_tx, _) = broadcast::channel::<AgentEvent>(512);

        self.attach_fanout(session_id, &pty, translator.clone(), events_tx.clone());

        {
            self.sessions
                .write()
                .await
                .insert(session_id.to_string(), session.clone());
            self.ptys
                .lock()
                .await
                .insert(session_id.to_string(), pty.clone());
            if let Some(user) = sandbox_user {
                self.sandbox_users
                    .lock()
                    .await
                    .insert(session_id.to_string(), user);
            }
            self.translators
                .lock()
                .await
                .insert(session_id.to_string(), translator);
            self.event_channels
                .lock()
                .await
                .insert(session_id.to_string(), events_tx);
            self.output_buffers
                .lock()
                .await
                .insert(session_id.to_string(), VecDeque::new());
        }

        // Exit handler: when the PTY closes, drive the cleanup path.
        {
            let manager = self.clone();
            let session_key = session_id.to_string();
            let pty = pty.clone();
            tokio::spawn(async move {
                pty.wait_exit().await;
                tracing::info!(session_id = %session_key, "agent process exited");
                manager.cleanup(&session_key).await;
            });
        }

        // The PTY is live; promote starting → running unless the agent
        // already exited and cleanup won the race.
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(record) => {
                    if record.status == SessionStatus::Starting {
                        record.status = SessionStatus::Running;
                    }
                    record.clone()
                }
                None => session,
            }
        };

        self.persist_session_blob(&session).await;

        tracing::info!(
            session_id,
            user_id,
            ?mode,
            model,
            pid = ?session.pid,
            sandboxed = session.sandbox_username.is_some(),
            "session created"
        );

        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    fn compose_agent_command(
        &self,
        session_id: &str,
        user_id: &str,
        mode: SessionMode,
        model: &str,
        api_key: Option<&str>,
        workspace_path: &std::path::Path,
        sandbox_user: Option<&SandboxUser>,
    ) -> CommandBuilder {
        let mut agent_args: Vec<String> = vec![
            "--output-format".into(),
            "stream-json".into(),
            "--dangerously-skip-permissions".into(),
            "--non-interactive".into(),
        ];
        match mode {
            SessionMode::Api => {
                agent_args.push("--provider".into());
                agent_args.push("api".into());
                agent_args.push("--api-endpoint".into());
                agent_args.push(self.config.agent.api_endpoint.clone());
                if let Some(key) = api_key {
                    agent_args.push("--api-key".into());
                    agent_args.push(key.to_string());
                }
                // Model is supplied by the remote config service in api mode.
            }
            SessionMode::Ollama => {
                agent_args.push("--model".into());
                agent_args.push(model.to_string());
            }
        }

        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.remove("NO_COLOR");
        env.insert("TERM".into(), "xterm-256color".into());
        env.insert("COLORTERM".into(), "truecolor".into());
        env.insert("FORCE_COLOR".into(), "3".into());
        env.insert("AGENTICODE_SESSION_ID".into(), session_id.to_string());
        env.insert("AGENTICODE_USER_ID".into(), user_id.to_string());
        match mode {
            SessionMode::Api => {
                env.insert(
                    "AGENTICWORK_API_ENDPOINT".into(),
                    self.config.agent.api_endpoint.clone(),
                );
            }
            SessionMode::Ollama => {
                env.insert("OLLAMA_HOST".into(), self.config.agent.ollama_host.clone());
            }
        }

        let mut cmd = match sandbox_user {
            Some(user) => {
                let (shell, args) = self.sandbox.build_sandboxed_command(
                    user,
                    &self.config.agent.binary_path,
                    &agent_args,
                    true,
                );
                env = self.sandbox.sandbox_env(user, &env);
                let mut cmd = CommandBuilder::new(shell);
                for arg in args {
                    cmd.arg(arg);
                }
                cmd
            }
            None => {
                let mut cmd = CommandBuilder::new(&self.config.agent.binary_path);
                for arg in &agent_args {
                    cmd.arg(arg);
                }
                cmd
            }
        };

        cmd.cwd(workspace_path);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Single fan-out task per PTY: rolling admin buffer, activity
    /// heuristic, and the NDJSON translator all consume the one ordered
    /// stream. Raw-terminal subscribers attach to the PTY broadcast
    /// directly.
    fn attach_fanout(
        &self,
        session_id: &str,
        pty: &Arc<PtyHandle>,
        translator: Arc<StdMutex<EventTranslator>>,
        events_tx: broadcast::Sender<AgentEvent>,
    ) {
        let mut rx = pty.subscribe();
        let buffers = self.output_buffers.clone();
        let activities = self.activities.clone();
        let session_key = session_id.to_string();

        tokio::spawn(async move {
            let mut partial_line = String::new();
            loop {
                let chunk = match rx.recv().await {
                    Ok(chunk) => chunk,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            session_id = %session_key,
                            skipped,
                            "fan-out lagged behind PTY reader"
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let text = String::from_utf8_lossy(&chunk).into_owned();

                // Rolling buffer of recent non-empty lines.
                partial_line.push_str(&text);
                if partial_line.contains('\n') {
                    let mut buffers = buffers.lock().await;
                    if let Some(buffer) = buffers.get_mut(&session_key) {
                        while let Some(pos) = partial_line.find('\n') {
                            let line: String = partial_line.drain(..=pos).collect();
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                if buffer.len() >= OUTPUT_BUFFER_LINES {
                                    buffer.pop_front();
                                }
                                buffer.push_back(trimmed.to_string());
                            }
                        }
                    }
                }

                // Activity heuristic from raw keywords.
                if let Some(label) = keyword_activity(&text) {
                    activities
                        .lock()
                        .await
                        .insert(session_key.clone(), label.to_string());
                }

                // NDJSON translation.
                let events = {
                    let mut guard = translator.lock().unwrap_or_else(|e| e.into_inner());
                    guard.feed(&chunk)
                };
                for event in events {
                    // No subscribers is fine.
                    let _ = events_tx.send(event);
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // I/O
    // ------------------------------------------------------------------

    pub async fn write(&self, session_id: &str, bytes: &[u8]) -> Result<(), Error> {
        let pty = self.pty(session_id).await?;
        pty.write(bytes)
            .map_err(|e| Error::StateInvalid(format!("PTY write failed: {e}")))?;
        self.touch(session_id).await;
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), Error> {
        let pty = self.pty(session_id).await?;
        pty.resize(cols, rows);
        Ok(())
    }

    /// Write a human message as an NDJSON line on the agent's stdin and
    /// start a new narration turn.
    pub async fn send_user_message(&self, session_id: &str, content: &str) -> Result<(), Error> {
        let line = serde_json::to_string(&serde_json::json!({
            "type": "human",
            "content": content,
        }))?;
        {
            let translators = self.translators.lock().await;
            if let Some(translator) = translators.get(session_id) {
                translator
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .note_user_input();
            }
        }
        self.write(session_id, format!("{line}\n").as_bytes()).await
    }

    /// 0x03 — interrupt whatever the agent is doing.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), Error> {
        self.write(session_id, &[0x03]).await
    }

    pub async fn subscribe_raw(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<Vec<u8>>, Error> {
        Ok(self.pty(session_id).await?.subscribe())
    }

    pub async fn subscribe_events(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<AgentEvent>, Error> {
        self.event_channels
            .lock()
            .await
            .get(session_id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Legacy REST path: write a line, then collect raw output until the
    /// agent has been quiet for 2 s (bounded at 30 s overall).
    pub async fn collect_response(&self, session_id: &str, message: &str) -> Result<String, Error> {
        let mut rx = self.subscribe_raw(session_id).await?;
        self.write(session_id, format!("{message}\n").as_bytes())
            .await?;

        let mut collected = Vec::new();
        let overall_deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let quiet = if collected.is_empty() {
                Duration::from_secs(30)
            } else {
                Duration::from_secs(2)
            };
            let wait = quiet.min(overall_deadline - tokio::time::Instant::now());
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Ok(chunk)) => collected.extend_from_slice(&chunk),
                Ok(Err(_)) => break,
                Err(_) => break,
            }
            if tokio::time::Instant::now() >= overall_deadline {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Start (or return) the session's web IDE, bound to the session's
    /// sandbox user when one exists.
    pub async fn start_ide(&self, session_id: &str) -> Result<crate::ide::IdeInstance, Error> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let sandbox_user = self.sandbox_users.lock().await.get(session_id).cloned();
        self.ide
            .start(
                &session.user_id,
                session_id,
                &session.workspace_path,
                sandbox_user.as_ref(),
            )
            .await
    }

    // ------------------------------------------------------------------
    // Stop / restart / cleanup
    // ------------------------------------------------------------------

    /// Signal the agent; the exit handler drives the rest of the cleanup.
    pub async fn stop(&self, session_id: &str) -> Result<(), Error> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            if matches!(session.status, SessionStatus::Stopped | SessionStatus::Stopping) {
                return Ok(());
            }
            session.status = SessionStatus::Stopping;
        }

        self.ide.stop(session_id).await;

        let pty = self.ptys.lock().await.get(session_id).cloned();
        match pty {
            Some(pty) => {
                // Graceful first; hard kill after the grace window. The
                // exit handler fires either way.
                match pty.pid() {
                    Some(pid) => {
                        let _ = nix::sys::signal::kill(
                            nix::unistd::Pid::from_raw(pid as i32),
                            nix::sys::signal::Signal::SIGTERM,
                        );
                        tokio::spawn(async move {
                            let grace = tokio::time::timeout(
                                Duration::from_secs(5),
                                pty.wait_exit(),
                            );
                            if grace.await.is_err() {
                                tracing::warn!("agent ignored SIGTERM, killing");
                                pty.kill();
                            }
                        });
                    }
                    None => pty.kill(),
                }
            }
            // No live PTY (spawn failed mid-create); clean up directly.
            None => self.cleanup(session_id).await,
        }
        Ok(())
    }

    /// Stop, then create a fresh session with the same user, workspace,
    /// and model. Yields a new session id.
    pub async fn restart(self: &Arc<Self>, session_id: &str) -> Result<Session, Error> {
        let prior = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        self.stop(session_id).await?;
        // Wait for the exit handler to finish tearing down; the workspace
        // flush must complete before the new session re-downloads.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            match self.get(session_id).await {
                Some(s) if s.status == SessionStatus::Stopped => break,
                None => break,
                _ if tokio::time::Instant::now() >= deadline => break,
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }

        self.create(CreateSessionRequest {
            user_id: prior.user_id,
            workspace_path: Some(prior.workspace_path),
            model: Some(prior.model),
            api_key: prior.api_key,
            storage_limit_mb: prior.storage_limit_mb,
        })
        .await
    }

    /// Release everything a session holds, in reverse provisioning order.
    /// Idempotent: concurrent exit-handler and stop calls collapse.
    pub async fn cleanup(&self, session_id: &str) {
        // Flip the record to stopped first; a second caller sees the
        // terminal state and returns, making cleanup idempotent. The
        // record itself stays in the table so GET /sessions/:id keeps
        // reporting `stopped`.
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(session) if session.status != SessionStatus::Stopped => {
                    let reaped_pid = session.pid.take();
                    session.status = SessionStatus::Stopped;
                    let mut done = session.clone();
                    done.pid = reaped_pid;
                    done
                }
                _ => return,
            }
        };

        self.ide.stop(session_id).await;

        if let Some(pid) = session.pid {
            self.metrics.clear_pid(pid as i32);
        }
        self.metrics.clear_session(session_id);

        // Final cloud flush; barrier against further watcher writes.
        self.workspaces.stop(session_id).await;

        let sandbox_user = self.sandbox_users.lock().await.remove(session_id);
        if let Some(user) = sandbox_user {
            // Files already flushed to the cloud; keep the local tree to
            // speed up resumption.
            self.sandbox.delete(&user, true).await;
        }

        let mut blob = session;
        blob.pid = None;
        self.persist_session_blob(&blob).await;

        self.forget(session_id).await;

        tracing::info!(session_id, "session cleanup complete");
    }

    async fn forget(&self, session_id: &str) {
        self.ptys.lock().await.remove(session_id);
        self.translators.lock().await.remove(session_id);
        self.event_channels.lock().await.remove(session_id);
        self.output_buffers.lock().await.remove(session_id);
        self.activities.lock().await.remove(session_id);
    }

    /// Best-effort session metadata blob for the legacy listing surface.
    async fn persist_session_blob(&self, session: &Session) {
        let key = format!(
            "agenticode/{}/sessions/{}/metadata.json",
            session.user_id, session.id
        );
        let bytes = match serde_json::to_vec_pretty(session) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "session blob encode failed");
                return;
            }
        };
        if let Err(e) = self
            .workspaces
            .object_store()
            .put_object(&key, bytes, "application/json")
            .await
        {
            tracing::warn!(session_id = %session.id, error = %e, "session blob write failed");
        }
    }

    async fn pty(&self, session_id: &str) -> Result<Arc<PtyHandle>, Error> {
        self.ptys
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    async fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_activity = chrono::Utc::now();
        }
    }

    // ------------------------------------------------------------------
    // Reaping / shutdown
    // ------------------------------------------------------------------

    /// Stop sessions idle past the timeout or older than the lifetime cap.
    pub async fn reap_idle_once(&self) {
        let now = chrono::Utc::now();
        let idle_cutoff =
            chrono::Duration::from_std(self.config.session_idle_timeout).unwrap_or_default();
        let lifetime_cutoff =
            chrono::Duration::from_std(self.config.session_max_lifetime).unwrap_or_default();

        let expired: Vec<(String, &'static str)> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| matches!(s.status, SessionStatus::Running | SessionStatus::Starting))
            .filter_map(|s| {
                if now - s.last_activity > idle_cutoff {
                    Some((s.id.clone(), "idle"))
                } else if now - s.created_at > lifetime_cutoff {
                    Some((s.id.clone(), "lifetime"))
                } else {
                    None
                }
            })
            .collect();

        for (session_id, reason) in expired {
            tracing::info!(session_id = %session_id, reason, "reaping session");
            if let Err(e) = self.stop(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "reap stop failed");
            }
        }
    }

    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap_idle_once().await;
            }
        })
    }

    /// Graceful shutdown: stop every live session and wait for cleanups.
    pub async fn shutdown(&self) {
        let live: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| !matches!(s.status, SessionStatus::Stopped))
            .map(|s| s.id.clone())
            .collect();
        for session_id in &live {
            let _ = self.stop(session_id).await;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let pending = self
                .sessions
                .read()
                .await
                .values()
                .any(|s| !matches!(s.status, SessionStatus::Stopped));
            if !pending || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.ide.stop_all().await;
    }
}

/// Keyword heuristic over raw output for the admin "current activity"
/// field. Coarse by design; the structured stream is the precise source.
fn keyword_activity(chunk: &str) -> Option<&'static str> {
    let lower = chunk.to_ascii_lowercase();
    if lower.contains("\"thinking\"") || lower.contains("thinking…") {
        Some("thinking")
    } else if lower.contains("tool_use") {
        Some("using tools")
    } else if lower.contains("\"result\"") {
        Some("finishing turn")
    } else if lower.contains("error") {
        Some("reporting an error")
    } else if lower.contains("\"text\"") {
        Some("responding")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StorageProvider};
    use crate::storage::memory::MemoryStore;
    use std::os::unix::fs::PermissionsExt;

    /// Agent stand-in: ignores its CLI arguments and behaves like `cat`,
    /// so the PTY stays open until killed and echoes stdin.
    fn fake_agent(dir: &std::path::Path) -> String {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, "#!/bin/sh\nexec cat\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn test_config(dir: &std::path::Path, agent: String) -> Config {
        let get = move |key: &str| -> Option<String> {
            match key {
                "STORAGE_PROVIDER" => Some("memory".into()),
                _ => None,
            }
        };
        let mut config = Config::from_raw_values(&get).unwrap();
        config.workspaces_path = dir.join("workspaces");
        config.agent.binary_path = agent;
        config.ide.data_root = dir.join("ide");
        config.ide.extensions_root = dir.join("ide-ext");
        config
    }

    async fn manager(dir: &std::path::Path) -> Arc<SessionManager> {
        let agent = fake_agent(dir);
        let config = test_config(dir, agent);
        assert_eq!(config.storage.provider, StorageProvider::Memory);

        let store: Arc<dyn crate::storage::ObjectStore> =
            Arc::new(MemoryStore::new(&config.storage.bucket));
        let workspaces = Arc::new(WorkspaceStore::new(
            store,
            config.workspaces_path.clone(),
        ));
        let sandbox = Arc::new(SandboxUserManager::new(
            config.workspaces_path.clone(),
            dir.join("homes"),
        ));
        let ide = Arc::new(IdeSupervisor::new(config.ide.clone(), sandbox.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        SessionManager::new(config, workspaces, sandbox, ide, metrics)
    }

    #[tokio::test]
    async fn create_spawns_running_session_with_context_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        let session = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                model: Some("m".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.mode, SessionMode::Ollama);
        assert_eq!(session.model, "m");
        assert!(session.pid.is_some());
        assert!(session.workspace_path.join("AGENTICODE.md").exists());

        // Fresh metadata document exists in the cloud.
        let meta = mgr.workspaces().list_user_workspaces("u1").await.unwrap().unwrap();
        assert_eq!(meta.file_count, 0);
        assert_eq!(meta.status, crate::workspace::WorkspaceStatus::Active);

        mgr.stop(&session.id).await.unwrap();
        wait_stopped(&mgr, &session.id).await;
    }

    #[tokio::test]
    async fn api_key_selects_api_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                api_key: Some("sk-test".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.mode, SessionMode::Api);
        mgr.stop(&session.id).await.unwrap();
        wait_stopped(&mgr, &session.id).await;
    }

    #[tokio::test]
    async fn quota_rejects_excess_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        let mut ids = Vec::new();
        for i in 0..3 {
            let session = mgr
                .create(CreateSessionRequest {
                    user_id: "u1".into(),
                    model: Some(format!("m{i}")),
                    ..Default::default()
                })
                .await
                .unwrap();
            ids.push(session.id);
        }

        let err = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        for id in ids {
            mgr.stop(&id).await.unwrap();
            wait_stopped(&mgr, &id).await;
        }
    }

    #[tokio::test]
    async fn write_updates_last_activity_and_echoes() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let before = mgr.get(&session.id).await.unwrap().last_activity;
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.write(&session.id, b"ping\n").await.unwrap();
        let after = mgr.get(&session.id).await.unwrap().last_activity;
        assert!(after > before);

        mgr.stop(&session.id).await.unwrap();
        wait_stopped(&mgr, &session.id).await;
    }

    #[tokio::test]
    async fn stop_releases_resources_and_marks_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        mgr.stop(&session.id).await.unwrap();
        wait_stopped(&mgr, &session.id).await;

        let stopped = mgr.get(&session.id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(mgr.subscribe_raw(&session.id).await.is_err());
        assert!(mgr.subscribe_events(&session.id).await.is_err());

        // Cloud metadata flipped to stopped by the workspace flush.
        let meta = mgr.workspaces().list_user_workspaces("u1").await.unwrap().unwrap();
        assert_eq!(meta.status, crate::workspace::WorkspaceStatus::Stopped);
    }

    #[tokio::test]
    async fn restart_yields_new_id_same_user_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                model: Some("m1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let replacement = mgr.restart(&session.id).await.unwrap();
        assert_ne!(replacement.id, session.id);
        assert_eq!(replacement.user_id, "u1");
        assert_eq!(replacement.model, "m1");
        assert_eq!(replacement.status, SessionStatus::Running);

        mgr.stop(&replacement.id).await.unwrap();
        wait_stopped(&mgr, &replacement.id).await;
    }

    #[tokio::test]
    async fn idle_reaper_stops_stale_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let agent = fake_agent(dir.path());
        let mut config = test_config(dir.path(), agent);
        config.session_idle_timeout = Duration::from_secs(1);

        let store: Arc<dyn crate::storage::ObjectStore> =
            Arc::new(MemoryStore::new(&config.storage.bucket));
        let workspaces = Arc::new(WorkspaceStore::new(store, config.workspaces_path.clone()));
        let sandbox = Arc::new(SandboxUserManager::new(
            config.workspaces_path.clone(),
            dir.path().join("homes"),
        ));
        let ide = Arc::new(IdeSupervisor::new(config.ide.clone(), sandbox.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let mgr = SessionManager::new(config, workspaces, sandbox, ide, metrics);

        let session = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        mgr.reap_idle_once().await;
        wait_stopped(&mgr, &session.id).await;
        assert_eq!(
            mgr.get(&session.id).await.unwrap().status,
            SessionStatus::Stopped
        );
    }

    #[tokio::test]
    async fn rolling_buffer_captures_recent_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        // cat echoes the line back through the PTY.
        mgr.write(&session.id, b"buffered-line\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let buffer = mgr.output_buffer(&session.id).await;
        assert!(buffer.iter().any(|l| l.contains("buffered-line")));
        assert!(buffer.len() <= OUTPUT_BUFFER_LINES);

        mgr.stop(&session.id).await.unwrap();
        wait_stopped(&mgr, &session.id).await;
    }

    #[tokio::test]
    async fn translator_events_flow_from_pty_output() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create(CreateSessionRequest {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut events = mgr.subscribe_events(&session.id).await.unwrap();
        // cat echoes the NDJSON line; the echo reaches the translator.
        mgr.write(
            &session.id,
            b"{\"type\":\"assistant\",\"subtype\":\"text\",\"text\":\"hello\"}\n",
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(AgentEvent::TextBlock { text }) if text == "hello" => break true,
                    Ok(_) => continue,
                    Err(_) => break false,
                }
            }
        })
        .await
        .unwrap();
        assert!(event);

        mgr.stop(&session.id).await.unwrap();
        wait_stopped(&mgr, &session.id).await;
    }

    async fn wait_stopped(mgr: &Arc<SessionManager>, session_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match mgr.get(session_id).await {
                Some(s) if s.status == SessionStatus::Stopped => return,
                None => return,
                _ => {}
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {session_id} did not stop in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
