use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::broadcast;

use crate::storage::{self, ObjectStore};

/// Debounce window for file events; a new event for the same path resets
/// the timer inside the debouncer.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Directories never mirrored to the cloud.
pub const IGNORE_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".svn",
    "target",
    "dist",
    "build",
    ".next",
    ".venv",
    "venv",
    "__pycache__",
    ".cache",
    ".npm",
];

/// File names and suffixes treated as cruft.
const IGNORE_FILES: &[&str] = &[".DS_Store", "Thumbs.db"];
const IGNORE_SUFFIXES: &[&str] = &[".swp", ".swo", ".tmp", "~", ".pyc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Change,
    Remove,
}

/// Published to subscribers after each per-path sync completes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileChangeEvent {
    pub session_id: String,
    pub user_id: String,
    /// Path relative to the workspace root, `/`-separated.
    pub path: String,
    pub change_type: ChangeType,
    pub size: u64,
    pub synced_to_cloud: bool,
}

/// True when a workspace-relative path must not be mirrored.
pub fn is_ignored(relative: &Path) -> bool {
    for component in relative.components() {
        let name = component.as_os_str().to_string_lossy();
        if IGNORE_DIRS.iter().any(|d| name == *d) {
            return true;
        }
    }
    if let Some(file_name) = relative.file_name().map(|f| f.to_string_lossy()) {
        if IGNORE_FILES.iter().any(|f| file_name == *f) {
            return true;
        }
        if IGNORE_SUFFIXES.iter().any(|s| file_name.ends_with(s)) {
            return true;
        }
    }
    false
}

/// Watches one workspace tree and streams debounced changes to the object
/// store.
///
/// `close()` is a barrier: after it returns, no further cloud writes happen
/// from this watcher. In-flight syncs hold a read lock on the gate; close
/// flips the `closed` flag and then takes the write lock, draining them.
pub struct WorkspaceWatcher {
    // Dropping the debouncer stops the watcher thread.
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    closed: Arc<AtomicBool>,
    gate: Arc<tokio::sync::RwLock<()>>,
}

impl WorkspaceWatcher {
    pub fn start(
        session_id: String,
        user_id: String,
        local_path: PathBuf,
        files_prefix: String,
        store: Arc<dyn ObjectStore>,
        max_file_size: u64,
        events_tx: broadcast::Sender<FileChangeEvent>,
    ) -> anyhow::Result<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(tokio::sync::RwLock::new(()));
        let rt = tokio::runtime::Handle::current();

        let watch_root = local_path.clone();
        let closed_for_cb = closed.clone();
        let gate_for_cb = gate.clone();

        let mut debouncer = new_debouncer(
            DEBOUNCE_WINDOW,
            move |events: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(error = %e, "workspace watcher error");
                        return;
                    }
                };

                for event in events {
                    if event.kind != DebouncedEventKind::Any {
                        continue;
                    }
                    if closed_for_cb.load(Ordering::SeqCst) {
                        return;
                    }

                    let relative = match event.path.strip_prefix(&local_path) {
                        Ok(r) => r.to_path_buf(),
                        Err(_) => continue,
                    };
                    if relative.as_os_str().is_empty() || is_ignored(&relative) {
                        continue;
                    }

                    let task = SyncTask {
                        session_id: session_id.clone(),
                        user_id: user_id.clone(),
                        absolute: event.path.clone(),
                        relative,
                        files_prefix: files_prefix.clone(),
                        store: store.clone(),
                        max_file_size,
                        events_tx: events_tx.clone(),
                        closed: closed_for_cb.clone(),
                        gate: gate_for_cb.clone(),
                    };
                    rt.spawn(task.run());
                }
            },
        )?;

        use notify::RecursiveMode;
        debouncer
            .watcher()
            .watch(&watch_root, RecursiveMode::Recursive)?;

        tracing::info!(path = %watch_root.display(), "workspace watcher started");

        Ok(Self {
            _debouncer: debouncer,
            closed,
            gate,
        })
    }

    /// Stop emitting cloud writes. Returns once in-flight syncs drained.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _barrier = self.gate.write().await;
    }
}

struct SyncTask {
    session_id: String,
    user_id: String,
    absolute: PathBuf,
    relative: PathBuf,
    files_prefix: String,
    store: Arc<dyn ObjectStore>,
    max_file_size: u64,
    events_tx: broadcast::Sender<FileChangeEvent>,
    closed: Arc<AtomicBool>,
    gate: Arc<tokio::sync::RwLock<()>>,
}

impl SyncTask {
    async fn run(self) {
        let _in_flight = self.gate.read().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let rel_key: Vec<String> = self
            .relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let key = format!("{}/{}", self.files_prefix, rel_key.join("/"));

        if !self.absolute.exists() {
            // File delete or directory remove: drop the key and anything
            // nested under it.
            if let Err(e) = self.store.delete_object(&key).await {
                tracing::warn!(key = %key, error = %e, "delete sync failed");
                return;
            }
            if let Err(e) = storage::delete_prefix(self.store.as_ref(), &format!("{key}/")).await {
                tracing::warn!(key = %key, error = %e, "prefix delete sync failed");
            }
            self.publish(ChangeType::Remove, 0, true);
            return;
        }

        let Ok(meta) = tokio::fs::metadata(&self.absolute).await else {
            return;
        };
        if meta.is_dir() {
            // Directories materialise implicitly through their files.
            return;
        }

        let Some(size) = self.stabilised_size().await else {
            return;
        };
        if size > self.max_file_size {
            tracing::warn!(
                path = %self.absolute.display(),
                size,
                limit = self.max_file_size,
                "file exceeds sync limit, skipping"
            );
            return;
        }

        let existed = match self.store.head_object(&key).await {
            Ok(head) => head.is_some(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "head before sync failed");
                false
            }
        };

        let bytes = match tokio::fs::read(&self.absolute).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %self.absolute.display(), error = %e, "read for sync failed");
                return;
            }
        };

        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .store
            .put_object(&key, bytes, "application/octet-stream")
            .await
        {
            tracing::warn!(key = %key, error = %e, "upload sync failed");
            return;
        }

        tracing::debug!(key = %key, size, "workspace file synced");
        self.publish(
            if existed {
                ChangeType::Change
            } else {
                ChangeType::Add
            },
            size,
            true,
        );
    }

    /// Wait until the file size has been stable across one check interval,
    /// so half-written files are not mirrored.
    async fn stabilised_size(&self) -> Option<u64> {
        let mut last = tokio::fs::metadata(&self.absolute).await.ok()?.len();
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let current = match tokio::fs::metadata(&self.absolute).await {
                Ok(m) => m.len(),
                Err(_) => return None,
            };
            if current == last {
                return Some(current);
            }
            last = current;
        }
        Some(last)
    }

    fn publish(&self, change_type: ChangeType, size: u64, synced: bool) {
        let _ = self.events_tx.send(FileChangeEvent {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            path: self
                .relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
            change_type,
            size,
            synced_to_cloud: synced,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_list_catches_directories_and_cruft() {
        assert!(is_ignored(Path::new("node_modules/pkg/x.js")));
        assert!(is_ignored(Path::new("a/b/.git/HEAD")));
        assert!(is_ignored(Path::new("src/.main.rs.swp")));
        assert!(is_ignored(Path::new(".DS_Store")));
        assert!(is_ignored(Path::new("__pycache__/m.pyc")));
        assert!(!is_ignored(Path::new("src/main.rs")));
        assert!(!is_ignored(Path::new("uploads/image.png")));
    }
}
