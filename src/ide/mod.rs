use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot};

use crate::config::IdeConfig;
use crate::error::Error;
use crate::ports::PortPool;
use crate::sandbox::{SandboxUser, SandboxUserManager, chown_recursive};

const STOP_GRACE: Duration = Duration::from_secs(5);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Log line code-server prints once its HTTP server is up.
const READY_SENTINEL: &str = "HTTP server listening";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeStatus {
    Starting,
    Running,
    Stopped,
}

/// One web-IDE child bound to a session.
#[derive(Debug, Clone, Serialize)]
pub struct IdeInstance {
    pub session_id: String,
    pub user_id: String,
    pub port: u16,
    pub url: String,
    pub status: IdeStatus,
    pub pid: Option<u32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

struct IdeHandle {
    stop_tx: oneshot::Sender<oneshot::Sender<()>>,
}

/// Runs one code-server child per requesting session on a pooled port,
/// as the session's sandbox user when one is bound.
pub struct IdeSupervisor {
    config: IdeConfig,
    ports: Arc<PortPool>,
    sandbox: Arc<SandboxUserManager>,
    instances: Arc<Mutex<HashMap<String, IdeInstance>>>,
    handles: Mutex<HashMap<String, IdeHandle>>,
    http: reqwest::Client,
}

impl IdeSupervisor {
    pub fn new(config: IdeConfig, sandbox: Arc<SandboxUserManager>) -> Self {
        let ports = Arc::new(PortPool::new(config.base_port, config.max_instances));
        Self {
            config,
            ports,
            sandbox,
            instances: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<IdeInstance> {
        self.instances.lock().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<IdeInstance> {
        self.instances.lock().await.values().cloned().collect()
    }

    /// Start an IDE for the session, or return the existing running one.
    pub async fn start(
        &self,
        user_id: &str,
        session_id: &str,
        workspace_path: &Path,
        sandbox_user: Option<&SandboxUser>,
    ) -> Result<IdeInstance, Error> {
        if let Some(existing) = self.get(session_id).await {
            if existing.status != IdeStatus::Stopped {
                return Ok(existing);
            }
        }

        let port = self.ports.allocate()?;
        match self
            .spawn_instance(user_id, session_id, workspace_path, sandbox_user, port)
            .await
        {
            Ok(instance) => Ok(instance),
            Err(err) => {
                self.ports.release(port);
                self.instances.lock().await.remove(session_id);
                self.handles.lock().await.remove(session_id);
                Err(err)
            }
        }
    }

    async fn spawn_instance(
        &self,
        user_id: &str,
        session_id: &str,
        workspace_path: &Path,
        sandbox_user: Option<&SandboxUser>,
        port: u16,
    ) -> Result<IdeInstance, Error> {
        let data_dir = self.config.data_root.join(session_id);
        let extensions_dir = self.config.extensions_root.join(session_id);
        tokio::fs::create_dir_all(data_dir.join("User")).await?;
        tokio::fs::create_dir_all(&extensions_dir).await?;

        if !self.config.lockdown_disabled {
            write_lockdown_config(&data_dir).await?;
        }

        if let Some(user) = sandbox_user {
            chown_recursive(&data_dir, user.uid, user.gid)?;
            chown_recursive(&extensions_dir, user.uid, user.gid)?;
            chown_recursive(workspace_path, user.uid, user.gid)?;
        }

        let bind_addr = format!("127.0.0.1:{port}");
        let ide_args: Vec<String> = vec![
            "--bind-addr".into(),
            bind_addr,
            "--auth".into(),
            "none".into(),
            "--disable-telemetry".into(),
            "--disable-update-check".into(),
            "--disable-workspace-trust".into(),
            "--log".into(),
            "error".into(),
            "--user-data-dir".into(),
            data_dir.to_string_lossy().into_owned(),
            "--extensions-dir".into(),
            extensions_dir.to_string_lossy().into_owned(),
            workspace_path.to_string_lossy().into_owned(),
        ];

        let mut command = match sandbox_user {
            Some(user) => {
                let (shell, args) = self.sandbox.build_sandboxed_command(
                    user,
                    &self.config.binary_path,
                    &ide_args,
                    true,
                );
                let mut cmd = Command::new(shell);
                cmd.args(args);
                let env = self.sandbox.sandbox_env(user, &HashMap::new());
                for (key, value) in env {
                    cmd.env(key, value);
                }
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.config.binary_path);
                cmd.args(&ide_args);
                cmd
            }
        };

        // Defence-in-depth: the IDE's own terminal surface is useless even
        // if the settings lockdown is bypassed.
        command
            .env("SHELL", "/bin/false")
            .env("TERM", "dumb")
            .env("COLORTERM", "")
            .env("TERM_PROGRAM", "")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::UpstreamFailure(format!("failed to spawn {}: {e}", self.config.binary_path))
        })?;
        let pid = child.id();

        let instance = IdeInstance {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            port,
            url: format!("{}:{}", self.config.external_url, port),
            status: IdeStatus::Starting,
            pid,
            started_at: chrono::Utc::now(),
        };
        self.instances
            .lock()
            .await
            .insert(session_id.to_string(), instance.clone());

        // Sentinel watcher on stdout; readiness is sentinel OR healthz.
        let sentinel_seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        if let Some(stdout) = child.stdout.take() {
            let sentinel_seen = sentinel_seen.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains(READY_SENTINEL) {
                        sentinel_seen.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                }
            });
        }

        self.await_ready(&mut child, port, &sentinel_seen).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        self.handles
            .lock()
            .await
            .insert(session_id.to_string(), IdeHandle { stop_tx });

        // Monitor owns the child: drives graceful stop, and treats a
        // spontaneous exit as a stop.
        let instances = self.instances.clone();
        let ports = self.ports.clone();
        let session_key = session_id.to_string();
        tokio::spawn(monitor_child(child, stop_rx, instances, ports, session_key, port));

        let mut instances_guard = self.instances.lock().await;
        let entry = instances_guard
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("IDE instance for {session_id}")))?;
        entry.status = IdeStatus::Running;
        Ok(entry.clone())
    }

    async fn await_ready(
        &self,
        child: &mut tokio::process::Child,
        port: u16,
        sentinel_seen: &std::sync::atomic::AtomicBool,
    ) -> Result<(), Error> {
        let health_url = format!("http://127.0.0.1:{port}/healthz");
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;

        loop {
            if sentinel_seen.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::UpstreamFailure(format!(
                    "IDE exited during startup with {status}"
                )));
            }
            if let Ok(response) = self.http.get(&health_url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(Error::UpstreamFailure(format!(
                    "IDE did not become ready within {:?}",
                    self.config.startup_timeout
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Gracefully stop a session's IDE. Missing instances are a no-op so
    /// cleanup paths can call this unconditionally.
    pub async fn stop(&self, session_id: &str) {
        let handle = self.handles.lock().await.remove(session_id);
        if let Some(handle) = handle {
            let (ack_tx, ack_rx) = oneshot::channel();
            if handle.stop_tx.send(ack_tx).is_ok() {
                // Grace period + kill happens in the monitor.
                let _ = tokio::time::timeout(STOP_GRACE + Duration::from_secs(2), ack_rx).await;
            }
        }
        self.instances.lock().await.remove(session_id);
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<String> = self.instances.lock().await.keys().cloned().collect();
        for session_id in sessions {
            self.stop(&session_id).await;
        }
    }
}

async fn monitor_child(
    mut child: tokio::process::Child,
    stop_rx: oneshot::Receiver<oneshot::Sender<()>>,
    instances: Arc<Mutex<HashMap<String, IdeInstance>>>,
    ports: Arc<PortPool>,
    session_id: String,
    port: u16,
) {
    tokio::select! {
        exit = child.wait() => {
            tracing::info!(session_id = %session_id, ?exit, "IDE child exited");
        }
        ack = stop_rx => {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
                tracing::warn!(session_id = %session_id, "IDE ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
            if let Ok(ack_tx) = ack {
                let _ = ack_tx.send(());
            }
        }
    }

    ports.release(port);
    if let Some(instance) = instances.lock().await.get_mut(&session_id) {
        instance.status = IdeStatus::Stopped;
        instance.pid = None;
    }
}

/// Materialise locked-down editor settings and key bindings so the IDE's
/// own terminal panel cannot be opened.
async fn write_lockdown_config(data_dir: &Path) -> std::io::Result<()> {
    let settings = json!({
        "security.workspace.trust.enabled": false,
        "telemetry.telemetryLevel": "off",
        "update.mode": "none",
        "extensions.autoUpdate": false,
        "terminal.integrated.profiles.linux": {},
        "terminal.integrated.defaultProfile.linux": null,
        "terminal.integrated.allowChords": false,
        "workbench.startupEditor": "none",
    });
    let keybindings = json!([
        { "key": "ctrl+`", "command": "-workbench.action.terminal.toggleTerminal" },
        { "key": "ctrl+shift+`", "command": "-workbench.action.terminal.new" },
        { "key": "ctrl+shift+y", "command": "-workbench.debug.action.toggleRepl" },
        { "key": "ctrl+j", "command": "-workbench.action.togglePanel" },
    ]);

    let user_dir = data_dir.join("User");
    tokio::fs::write(
        user_dir.join("settings.json"),
        serde_json::to_vec_pretty(&settings)?,
    )
    .await?;
    tokio::fs::write(
        user_dir.join("keybindings.json"),
        serde_json::to_vec_pretty(&keybindings)?,
    )
    .await?;
    Ok(())
}
