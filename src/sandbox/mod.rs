use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;

use crate::error::Error;

pub const MIN_UID: u32 = 10_000;
pub const MAX_UID: u32 = 60_000;
const PROBE_BUDGET: u32 = 1_000;
const USERNAME_TAG: &str = "cpod";

/// A short-lived OS account bound to a single session.
#[derive(Debug, Clone)]
pub struct SandboxUser {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    /// Private home, always under the manager's homes base — never inside
    /// the workspace.
    pub home_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Allocates and tears down per-session OS users on Linux.
///
/// The manager must run with enough privilege to create users and chown
/// paths. When it does not, `initialize` reports false and sessions run
/// unsandboxed (degraded mode).
pub struct SandboxUserManager {
    workspaces_base: PathBuf,
    homes_base: PathBuf,
    allocated_uids: Mutex<HashSet<u32>>,
    enabled: AtomicBool,
}

impl SandboxUserManager {
    pub fn new(workspaces_base: PathBuf, homes_base: PathBuf) -> Self {
        Self {
            workspaces_base,
            homes_base,
            allocated_uids: Mutex::new(HashSet::new()),
            enabled: AtomicBool::new(false),
        }
    }

    /// Detect whether this process can create users. Called once at boot;
    /// the result gates all allocation.
    pub fn initialize(&self) -> bool {
        let is_root = nix::unistd::geteuid().is_root();
        self.enabled.store(is_root, Ordering::SeqCst);
        if is_root {
            tracing::info!("sandbox user manager enabled (running as root)");
        } else {
            tracing::warn!(
                "not running as root; OS-level sandboxing DISABLED, sessions run as the manager user"
            );
        }
        is_root
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Derive the sandbox username from a session id: fixed tag plus the
    /// first 8 hex characters.
    pub fn username_for(session_id: &str) -> String {
        let hex: String = session_id
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .take(8)
            .collect();
        format!("{USERNAME_TAG}-{hex}")
    }

    fn reserve_uid(&self) -> Result<u32, Error> {
        let range = MAX_UID - MIN_UID;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let start = MIN_UID + (now % u64::from(range)) as u32;

        let mut allocated = self
            .allocated_uids
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for probe in 0..PROBE_BUDGET {
            let uid = MIN_UID + (start - MIN_UID + probe) % range;
            if allocated.insert(uid) {
                return Ok(uid);
            }
        }
        Err(Error::CapacityExhausted("no free sandbox UIDs"))
    }

    fn release_uid(&self, uid: u32) {
        self.allocated_uids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&uid);
    }

    /// Create an OS user owning `workspace_path` for the given session.
    ///
    /// On any failure the reserved UID is released and partially created
    /// resources are rolled back before the error is returned.
    pub async fn allocate(
        &self,
        session_id: &str,
        workspace_path: &Path,
    ) -> Result<SandboxUser, Error> {
        if !self.is_enabled() {
            return Err(Error::PrivilegeDenied(
                "sandboxing is disabled on this manager".into(),
            ));
        }

        let uid = self.reserve_uid()?;
        let username = Self::username_for(session_id);
        let home_dir = self.homes_base.join(&username);

        match self
            .create_os_user(uid, &username, &home_dir, workspace_path)
            .await
        {
            Ok(()) => Ok(SandboxUser {
                uid,
                gid: uid,
                username,
                home_dir,
                workspace_dir: workspace_path.to_path_buf(),
                created_at: chrono::Utc::now(),
            }),
            Err(err) => {
                self.rollback_os_user(uid, &username, &home_dir).await;
                self.release_uid(uid);
                Err(err)
            }
        }
    }

    async fn create_os_user(
        &self,
        uid: u32,
        username: &str,
        home_dir: &Path,
        workspace_path: &Path,
    ) -> Result<(), Error> {
        run_admin_command(
            "groupadd",
            &["-g".into(), uid.to_string(), username.to_string()],
        )
        .await?;

        tokio::fs::create_dir_all(home_dir).await?;

        run_admin_command(
            "useradd",
            &[
                "-u".into(),
                uid.to_string(),
                "-g".into(),
                uid.to_string(),
                "-d".into(),
                home_dir.to_string_lossy().into_owned(),
                "-M".into(),
                "-s".into(),
                "/bin/bash".into(),
                username.to_string(),
            ],
        )
        .await?;

        chown_recursive(workspace_path, uid, uid)?;
        chown_recursive(home_dir, uid, uid)?;
        set_mode(workspace_path, 0o750)?;
        set_mode(home_dir, 0o750)?;
        Ok(())
    }

    async fn rollback_os_user(&self, _uid: u32, username: &str, home_dir: &Path) {
        if let Err(e) = run_admin_command("userdel", &[username.to_string()]).await {
            tracing::debug!(username, error = %e, "rollback userdel");
        }
        if let Err(e) = run_admin_command("groupdel", &[username.to_string()]).await {
            tracing::debug!(username, error = %e, "rollback groupdel");
        }
        if let Err(e) = tokio::fs::remove_dir_all(home_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(home = %home_dir.display(), error = %e, "rollback home removal");
            }
        }
    }

    /// Tear down a sandbox user: kill everything it owns, delete the OS
    /// account and group, remove the private home, and optionally the
    /// workspace. Best-effort; sub-failures are logged, never propagated.
    pub async fn delete(&self, user: &SandboxUser, keep_workspace: bool) {
        kill_processes_owned_by(user.uid).await;

        if let Err(e) = run_admin_command("userdel", &[user.username.clone()]).await {
            tracing::warn!(username = %user.username, error = %e, "userdel failed");
        }
        if let Err(e) = run_admin_command("groupdel", &[user.username.clone()]).await {
            // groupdel commonly fails when userdel already removed the
            // primary group; only worth a debug line.
            tracing::debug!(username = %user.username, error = %e, "groupdel failed");
        }

        self.release_uid(user.uid);

        if let Err(e) = tokio::fs::remove_dir_all(&user.home_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(home = %user.home_dir.display(), error = %e, "home removal failed");
            }
        }

        if !keep_workspace {
            if path_is_contained(&user.workspace_dir, &self.workspaces_base) {
                if let Err(e) = tokio::fs::remove_dir_all(&user.workspace_dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(
                            workspace = %user.workspace_dir.display(),
                            error = %e,
                            "workspace removal failed"
                        );
                    }
                }
            } else {
                tracing::error!(
                    workspace = %user.workspace_dir.display(),
                    base = %self.workspaces_base.display(),
                    "refusing to remove workspace outside the workspaces base"
                );
            }
        }

        let lifetime_secs = (chrono::Utc::now() - user.created_at).num_seconds();
        tracing::info!(
            username = %user.username,
            uid = user.uid,
            lifetime_secs,
            "sandbox user deleted"
        );
    }

    /// Wrap `cmd args…` so it executes as the sandbox user, optionally with
    /// a shell-level resource-limit preamble.
    pub fn build_sandboxed_command(
        &self,
        user: &SandboxUser,
        cmd: &str,
        args: &[String],
        apply_limits: bool,
    ) -> (String, Vec<String>) {
        let mut line = String::new();
        if apply_limits {
            line.push_str(resource_limit_preamble());
        }
        line.push_str("exec ");
        line.push_str(&shell_escape::escape(cmd.into()));
        for arg in args {
            line.push(' ');
            line.push_str(&shell_escape::escape(arg.as_str().into()));
        }

        (
            "su".to_string(),
            vec![
                "-s".to_string(),
                "/bin/bash".to_string(),
                "-c".to_string(),
                line,
                user.username.clone(),
            ],
        )
    }

    /// Environment overlay for processes running as the sandbox user.
    /// XDG dirs are rooted in the private home so caches and configuration
    /// never pollute the workspace.
    pub fn sandbox_env(
        &self,
        user: &SandboxUser,
        base_env: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env = base_env.clone();
        let home = user.home_dir.to_string_lossy().into_owned();
        env.insert("HOME".into(), home.clone());
        env.insert("USER".into(), user.username.clone());
        env.insert("LOGNAME".into(), user.username.clone());
        env.insert(
            "PWD".into(),
            user.workspace_dir.to_string_lossy().into_owned(),
        );
        env.insert("PATH".into(), "/usr/local/bin:/usr/bin:/bin".into());
        env.insert("XDG_CONFIG_HOME".into(), format!("{home}/.config"));
        env.insert("XDG_CACHE_HOME".into(), format!("{home}/.cache"));
        env.insert("XDG_DATA_HOME".into(), format!("{home}/.local/share"));
        env.insert("XDG_STATE_HOME".into(), format!("{home}/.local/state"));
        env.insert("XDG_RUNTIME_DIR".into(), format!("{home}/.runtime"));
        env
    }
}

/// Shell preamble restricting processes, open files, file size, CPU time,
/// stack, and core dumps. Address-space and data-segment limits stay
/// unlimited: agent runtimes reserve large virtual mappings at startup.
fn resource_limit_preamble() -> &'static str {
    "ulimit -u 256; ulimit -n 1024; ulimit -f 10485760; ulimit -t 3600; ulimit -s 8192; ulimit -c 0; "
}

async fn run_admin_command(program: &str, args: &[String]) -> Result<(), Error> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(Error::Io)?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.to_ascii_lowercase().contains("permission denied")
        || output.status.code() == Some(1) && program == "useradd"
    {
        return Err(Error::PrivilegeDenied(format!("{program}: {stderr}")));
    }
    Err(Error::Io(std::io::Error::other(format!(
        "{program} exited {:?}: {stderr}",
        output.status.code()
    ))))
}

/// SIGTERM every process owned by `uid`, wait a short grace period, then
/// SIGKILL stragglers.
async fn kill_processes_owned_by(uid: u32) {
    signal_uid_processes(uid, Signal::SIGTERM);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    signal_uid_processes(uid, Signal::SIGKILL);
}

fn signal_uid_processes(uid: u32, signal: Signal) {
    let processes = match procfs::process::all_processes() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "failed to scan /proc for sandbox teardown");
            return;
        }
    };
    for process in processes.flatten() {
        if process.uid().map(|owner| owner == uid).unwrap_or(false) {
            let pid = Pid::from_raw(process.pid());
            if let Err(e) = kill(pid, signal) {
                tracing::debug!(pid = process.pid(), ?signal, error = %e, "signal failed");
            }
        }
    }
}

pub(crate) fn chown_recursive(path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
    let owner = Some(nix::unistd::Uid::from_raw(uid));
    let group = Some(nix::unistd::Gid::from_raw(gid));
    nix::unistd::chown(path, owner, group).map_err(|e| Error::Io(e.into()))?;
    if path.is_dir() {
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let child = entry.path();
                nix::unistd::chown(&child, owner, group).map_err(|e| Error::Io(e.into()))?;
                if entry.file_type()?.is_dir() {
                    pending.push(child);
                }
            }
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// True when `path` normalises to somewhere inside `base`. Guards the
/// workspace-removal branch against traversal via `..` components.
fn path_is_contained(path: &Path, base: &Path) -> bool {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let candidate = match path.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            // Path may already be gone; fall back to component normalisation.
            let mut normalized = PathBuf::new();
            for component in path.components() {
                match component {
                    std::path::Component::ParentDir => {
                        if !normalized.pop() {
                            return false;
                        }
                    }
                    std::path::Component::CurDir => {}
                    other => normalized.push(other),
                }
            }
            normalized
        }
    };
    candidate.starts_with(&canonical_base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SandboxUserManager {
        SandboxUserManager::new(PathBuf::from("/workspaces"), PathBuf::from("/var/lib/codepod/homes"))
    }

    fn fake_user() -> SandboxUser {
        SandboxUser {
            uid: 10042,
            gid: 10042,
            username: "cpod-deadbeef".into(),
            home_dir: PathBuf::from("/var/lib/codepod/homes/cpod-deadbeef"),
            workspace_dir: PathBuf::from("/workspaces/u1"),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn username_uses_first_eight_hex_chars() {
        let name = SandboxUserManager::username_for("deadbeef-1234-5678-9abc-def012345678");
        assert_eq!(name, "cpod-deadbeef");
    }

    #[test]
    fn username_skips_non_hex_characters() {
        let name = SandboxUserManager::username_for("zz12ab34-cd56");
        assert_eq!(name, "cpod-12ab34cd");
    }

    #[test]
    fn uid_reservation_stays_in_range_and_is_unique() {
        let mgr = manager();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let uid = mgr.reserve_uid().unwrap();
            assert!((MIN_UID..MAX_UID).contains(&uid));
            assert!(seen.insert(uid));
        }
    }

    #[test]
    fn released_uid_can_be_reallocated() {
        let mgr = manager();
        let uid = mgr.reserve_uid().unwrap();
        mgr.release_uid(uid);
        // With the whole range free again the probe must succeed.
        assert!(mgr.reserve_uid().is_ok());
    }

    #[test]
    fn probe_budget_bounds_allocation() {
        let mgr = manager();
        {
            let mut allocated = mgr.allocated_uids.lock().unwrap();
            for uid in MIN_UID..MAX_UID {
                allocated.insert(uid);
            }
        }
        assert!(matches!(
            mgr.reserve_uid(),
            Err(Error::CapacityExhausted(_))
        ));
    }

    #[test]
    fn sandboxed_command_wraps_with_su_and_limits() {
        let mgr = manager();
        let user = fake_user();
        let (shell, args) = mgr.build_sandboxed_command(
            &user,
            "/usr/bin/agenticode",
            &["--model".into(), "m".into()],
            true,
        );
        assert_eq!(shell, "su");
        assert_eq!(args[0], "-s");
        assert_eq!(args[1], "/bin/bash");
        assert_eq!(args[2], "-c");
        assert!(args[3].starts_with("ulimit -u 256;"));
        assert!(args[3].contains("exec /usr/bin/agenticode --model m"));
        assert!(!args[3].contains("ulimit -v"));
        assert_eq!(args[4], "cpod-deadbeef");
    }

    #[test]
    fn sandboxed_command_escapes_arguments() {
        let mgr = manager();
        let user = fake_user();
        let (_, args) =
            mgr.build_sandboxed_command(&user, "echo", &["a b; rm -rf /".into()], false);
        assert!(args[3].contains("'a b; rm -rf /'"));
        assert!(!args[3].starts_with("ulimit"));
    }

    #[test]
    fn sandbox_env_roots_xdg_in_private_home() {
        let mgr = manager();
        let user = fake_user();
        let mut base = HashMap::new();
        base.insert("TERM".to_string(), "xterm-256color".to_string());
        base.insert("HOME".to_string(), "/root".to_string());

        let env = mgr.sandbox_env(&user, &base);
        assert_eq!(env["HOME"], "/var/lib/codepod/homes/cpod-deadbeef");
        assert_eq!(env["USER"], "cpod-deadbeef");
        assert_eq!(env["PWD"], "/workspaces/u1");
        assert_eq!(env["PATH"], "/usr/local/bin:/usr/bin:/bin");
        assert!(env["XDG_CACHE_HOME"].starts_with("/var/lib/codepod/homes/"));
        assert_eq!(env["TERM"], "xterm-256color");
    }

    #[test]
    fn containment_rejects_traversal() {
        let base = Path::new("/workspaces");
        assert!(path_is_contained(Path::new("/workspaces/u1"), base));
        assert!(!path_is_contained(Path::new("/workspaces/../etc"), base));
        assert!(!path_is_contained(Path::new("/etc/passwd"), base));
    }

    #[test]
    fn allocate_requires_privilege() {
        let mgr = manager();
        // initialize() was never called with root, so allocation is refused.
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(mgr.allocate("abcd1234", Path::new("/workspaces/u1")))
            .unwrap_err();
        assert!(matches!(err, Error::PrivilegeDenied(_)));
    }
}
