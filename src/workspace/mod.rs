pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use crate::error::Error;
use crate::storage::{self, ObjectStore, StorageError};
use watcher::{FileChangeEvent, WorkspaceWatcher, is_ignored};

/// Files above this size are never mirrored in either direction.
pub const MAX_SYNC_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// The `workspaces/{userId}/metadata.json` document. Cloud is the source
/// of truth for workspace existence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMeta {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_modified: chrono::DateTime<chrono::Utc>,
    pub file_count: u64,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: WorkspaceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Stopped,
    Archived,
}

/// Result of `initialize`.
#[derive(Debug, Clone)]
pub struct InitializedWorkspace {
    pub local_path: PathBuf,
    pub is_new: bool,
    pub files_downloaded: usize,
}

struct ActiveWorkspace {
    user_id: String,
    local_path: PathBuf,
    watcher: Arc<WorkspaceWatcher>,
}

/// User-scoped, cloud-primary workspaces with a local working cache.
///
/// One handle per live session, registered by session id; at most one
/// session per user may hold its workspace active at a time.
pub struct WorkspaceStore {
    store: Arc<dyn ObjectStore>,
    workspaces_base: PathBuf,
    download_on_start: bool,
    remove_local_on_stop: bool,
    active: Mutex<HashMap<String, ActiveWorkspace>>,
    file_events_tx: broadcast::Sender<FileChangeEvent>,
}

impl WorkspaceStore {
    pub fn new(store: Arc<dyn ObjectStore>, workspaces_base: PathBuf) -> Self {
        let (file_events_tx, _) = broadcast::channel(256);
        Self {
            store,
            workspaces_base,
            download_on_start: true,
            remove_local_on_stop: false,
            active: Mutex::new(HashMap::new()),
            file_events_tx,
        }
    }

    pub fn subscribe_file_events(&self) -> broadcast::Receiver<FileChangeEvent> {
        self.file_events_tx.subscribe()
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    fn metadata_key(user_id: &str) -> String {
        format!("workspaces/{user_id}/metadata.json")
    }

    fn files_prefix(user_id: &str) -> String {
        format!("workspaces/{user_id}/files")
    }

    fn local_path(&self, user_id: &str) -> PathBuf {
        self.workspaces_base.join(user_id)
    }

    /// Materialise the user's workspace for a new session and start the
    /// watcher. Existing cloud state wins; a brand-new user gets an empty
    /// tree and a fresh metadata document.
    pub async fn initialize(
        &self,
        user_id: &str,
        session_id: &str,
        model: Option<&str>,
    ) -> Result<InitializedWorkspace, Error> {
        // One active handle per user: stop any prior session's handle first.
        let prior: Vec<String> = {
            let active = self.active.lock().await;
            active
                .iter()
                .filter(|(_, w)| w.user_id == user_id)
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        for stale_session in prior {
            tracing::info!(
                user_id,
                session_id = %stale_session,
                "stopping prior active workspace handle for user"
            );
            self.stop(&stale_session).await;
        }

        let local_path = self.local_path(user_id);
        let metadata_key = Self::metadata_key(user_id);

        let existing = self
            .store
            .head_object(&metadata_key)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        tokio::fs::create_dir_all(&local_path).await?;

        let (is_new, files_downloaded) = if existing.is_some() {
            let downloaded = if self.download_on_start {
                storage::download_dir(
                    self.store.as_ref(),
                    &Self::files_prefix(user_id),
                    &local_path,
                )
                .await
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?
            } else {
                0
            };
            (false, downloaded)
        } else {
            let meta = WorkspaceMeta {
                user_id: user_id.to_string(),
                session_id: Some(session_id.to_string()),
                created_at: chrono::Utc::now(),
                last_modified: chrono::Utc::now(),
                file_count: 0,
                total_size: 0,
                model: model.map(String::from),
                status: WorkspaceStatus::Active,
            };
            self.put_metadata(&meta)
                .await
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            (true, 0)
        };

        let watcher = WorkspaceWatcher::start(
            session_id.to_string(),
            user_id.to_string(),
            local_path.clone(),
            Self::files_prefix(user_id),
            self.store.clone(),
            MAX_SYNC_FILE_SIZE,
            self.file_events_tx.clone(),
        )
        .map_err(|e| Error::StorageUnavailable(format!("watcher start: {e}")))?;

        self.active.lock().await.insert(
            session_id.to_string(),
            ActiveWorkspace {
                user_id: user_id.to_string(),
                local_path: local_path.clone(),
                watcher: Arc::new(watcher),
            },
        );

        tracing::info!(
            user_id,
            session_id,
            is_new,
            files_downloaded,
            path = %local_path.display(),
            "workspace initialised"
        );

        Ok(InitializedWorkspace {
            local_path,
            is_new,
            files_downloaded,
        })
    }

    /// Stop a session's workspace handle: close the watcher (cancelling
    /// pending syncs), flush the local tree to the cloud, and mark the
    /// metadata stopped. A barrier: after return, no further cloud writes
    /// happen for this session.
    pub async fn stop(&self, session_id: &str) {
        let handle = self.active.lock().await.remove(session_id);
        let Some(handle) = handle else {
            return;
        };

        handle.watcher.close().await;

        match storage::upload_dir(
            self.store.as_ref(),
            &handle.local_path,
            &Self::files_prefix(&handle.user_id),
            MAX_SYNC_FILE_SIZE,
            &|rel| is_ignored(rel),
        )
        .await
        {
            Ok(count) => {
                tracing::info!(session_id, files = count, "final workspace flush complete")
            }
            Err(e) => tracing::error!(session_id, error = %e, "final workspace flush failed"),
        }

        let usage = crate::metrics::workspace_usage(&handle.local_path);
        let meta = WorkspaceMeta {
            user_id: handle.user_id.clone(),
            session_id: Some(session_id.to_string()),
            created_at: self
                .fetch_metadata(&handle.user_id)
                .await
                .ok()
                .flatten()
                .map(|m| m.created_at)
                .unwrap_or_else(chrono::Utc::now),
            last_modified: chrono::Utc::now(),
            file_count: usage.file_count,
            total_size: usage.total_bytes,
            model: None,
            status: WorkspaceStatus::Stopped,
        };
        if let Err(e) = self.put_metadata(&meta).await {
            tracing::warn!(session_id, error = %e, "stopped metadata write failed");
        }

        if self.remove_local_on_stop {
            if let Err(e) = tokio::fs::remove_dir_all(&handle.local_path).await {
                tracing::warn!(session_id, error = %e, "local cache removal failed");
            }
        }
    }

    /// Remove the user's workspace everywhere: cloud prefix and local cache.
    pub async fn delete(&self, user_id: &str) -> Result<(), Error> {
        let sessions: Vec<String> = {
            let active = self.active.lock().await;
            active
                .iter()
                .filter(|(_, w)| w.user_id == user_id)
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        for session_id in sessions {
            self.stop(&session_id).await;
        }

        storage::delete_prefix(self.store.as_ref(), &format!("workspaces/{user_id}/"))
            .await
            .map_err(|e| Error::UpstreamFailure(e.to_string()))?;

        let local = self.local_path(user_id);
        if let Err(e) = tokio::fs::remove_dir_all(&local).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }

    /// Explicit full sync local → cloud.
    pub async fn force_sync_to_cloud(&self, session_id: &str) -> Result<usize, Error> {
        let (local_path, user_id) = self.handle_paths(session_id).await?;
        let count = storage::upload_dir(
            self.store.as_ref(),
            &local_path,
            &Self::files_prefix(&user_id),
            MAX_SYNC_FILE_SIZE,
            &|rel| is_ignored(rel),
        )
        .await
        .map_err(|e| Error::UpstreamFailure(e.to_string()))?;

        if let Ok(Some(mut meta)) = self.fetch_metadata(&user_id).await {
            let usage = crate::metrics::workspace_usage(&local_path);
            meta.last_modified = chrono::Utc::now();
            meta.file_count = usage.file_count;
            meta.total_size = usage.total_bytes;
            if let Err(e) = self.put_metadata(&meta).await {
                tracing::warn!(user_id = %user_id, error = %e, "metadata refresh failed");
            }
        }
        Ok(count)
    }

    /// Explicit full sync cloud → local.
    pub async fn force_sync_from_cloud(&self, session_id: &str) -> Result<usize, Error> {
        let (local_path, user_id) = self.handle_paths(session_id).await?;
        storage::download_dir(self.store.as_ref(), &Self::files_prefix(&user_id), &local_path)
            .await
            .map_err(|e| Error::UpstreamFailure(e.to_string()))
    }

    /// Workspaces are singleton per user: zero or one metadata records.
    pub async fn list_user_workspaces(&self, user_id: &str) -> Result<Option<WorkspaceMeta>, Error> {
        self.fetch_metadata(user_id)
            .await
            .map_err(|e| Error::UpstreamFailure(e.to_string()))
    }

    /// Number of currently active workspace handles.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn local_path_for_session(&self, session_id: &str) -> Option<PathBuf> {
        self.active
            .lock()
            .await
            .get(session_id)
            .map(|w| w.local_path.clone())
    }

    async fn handle_paths(&self, session_id: &str) -> Result<(PathBuf, String), Error> {
        let active = self.active.lock().await;
        let handle = active
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("no active workspace for session {session_id}")))?;
        Ok((handle.local_path.clone(), handle.user_id.clone()))
    }

    async fn fetch_metadata(&self, user_id: &str) -> Result<Option<WorkspaceMeta>, StorageError> {
        match self.store.get_object(&Self::metadata_key(user_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Backend(format!("metadata parse: {e}")))?),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_metadata(&self, meta: &WorkspaceMeta) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| StorageError::Backend(format!("metadata encode: {e}")))?;
        self.store
            .put_object(
                &Self::metadata_key(&meta.user_id),
                bytes,
                "application/json",
            )
            .await
    }
}

/// Ensure the workspace-context file exists, creating a templated default
/// when absent. Non-fatal by contract; callers log and continue.
pub async fn ensure_context_file(workspace: &Path) -> std::io::Result<bool> {
    let path = workspace.join("AGENTICODE.md");
    if tokio::fs::try_exists(&path).await? {
        return Ok(false);
    }
    let template = "\
# Workspace Context

Describe this project for the agent: goals, conventions, commands worth
knowing. The agent reads this file at the start of every session.

## Project

(what is being built)

## Conventions

(style, layout, test commands)
";
    tokio::fs::write(&path, template).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn test_store() -> (WorkspaceStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(
            Arc::new(MemoryStore::new("test")),
            dir.path().to_path_buf(),
        );
        (store, dir)
    }

    #[tokio::test]
    async fn fresh_user_gets_new_workspace_with_metadata() {
        let (ws, _dir) = test_store();
        let init = ws.initialize("u1", "s1", Some("m")).await.unwrap();
        assert!(init.is_new);
        assert_eq!(init.files_downloaded, 0);
        assert!(init.local_path.exists());

        let meta = ws.list_user_workspaces("u1").await.unwrap().unwrap();
        assert_eq!(meta.user_id, "u1");
        assert_eq!(meta.file_count, 0);
        assert_eq!(meta.status, WorkspaceStatus::Active);
        assert_eq!(meta.model.as_deref(), Some("m"));

        ws.stop("s1").await;
    }

    #[tokio::test]
    async fn stop_flushes_and_marks_stopped() {
        let (ws, _dir) = test_store();
        let init = ws.initialize("u1", "s1", None).await.unwrap();
        tokio::fs::write(init.local_path.join("hello.txt"), b"hi")
            .await
            .unwrap();

        ws.stop("s1").await;

        let store = ws.object_store();
        let bytes = store
            .get_object("workspaces/u1/files/hello.txt")
            .await
            .unwrap();
        assert_eq!(bytes, b"hi");

        let meta = ws.list_user_workspaces("u1").await.unwrap().unwrap();
        assert_eq!(meta.status, WorkspaceStatus::Stopped);
        assert_eq!(meta.file_count, 1);
        assert_eq!(meta.total_size, 2);
    }

    #[tokio::test]
    async fn resume_downloads_prior_files() {
        let (ws, _dir) = test_store();
        let init = ws.initialize("u1", "s1", None).await.unwrap();
        ensure_context_file(&init.local_path).await.unwrap();
        tokio::fs::write(init.local_path.join("keep.txt"), b"data")
            .await
            .unwrap();
        ws.stop("s1").await;

        // Simulate a fresh node: wipe the local cache.
        tokio::fs::remove_dir_all(&init.local_path).await.unwrap();

        let resumed = ws.initialize("u1", "s2", None).await.unwrap();
        assert!(!resumed.is_new);
        assert!(resumed.files_downloaded >= 1);
        assert!(resumed.local_path.join("AGENTICODE.md").exists());
        assert!(resumed.local_path.join("keep.txt").exists());
        ws.stop("s2").await;
    }

    #[tokio::test]
    async fn second_session_for_user_displaces_first_handle() {
        let (ws, _dir) = test_store();
        ws.initialize("u1", "s1", None).await.unwrap();
        ws.initialize("u1", "s2", None).await.unwrap();
        // s1's handle was stopped when s2 took over.
        assert!(ws.local_path_for_session("s1").await.is_none());
        assert!(ws.local_path_for_session("s2").await.is_some());
        ws.stop("s2").await;
    }

    #[tokio::test]
    async fn delete_removes_cloud_prefix_and_local_cache() {
        let (ws, _dir) = test_store();
        let init = ws.initialize("u1", "s1", None).await.unwrap();
        tokio::fs::write(init.local_path.join("f.txt"), b"x")
            .await
            .unwrap();
        ws.stop("s1").await;

        ws.delete("u1").await.unwrap();
        assert!(ws.list_user_workspaces("u1").await.unwrap().is_none());
        assert!(!init.local_path.exists());
    }

    #[tokio::test]
    async fn context_file_created_once() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_context_file(dir.path()).await.unwrap());
        assert!(!ensure_context_file(dir.path()).await.unwrap());
        let contents = tokio::fs::read_to_string(dir.path().join("AGENTICODE.md"))
            .await
            .unwrap();
        assert!(contents.contains("Workspace Context"));
    }

    #[tokio::test]
    async fn watcher_propagates_writes_to_cloud() {
        let (ws, _dir) = test_store();
        let init = ws.initialize("u1", "s1", None).await.unwrap();
        let mut events = ws.subscribe_file_events();

        tokio::fs::write(init.local_path.join("hello.txt"), b"hi")
            .await
            .unwrap();

        // Debounce window + stabilisation, with slack for slow CI.
        let event = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(e) if e.path == "hello.txt" => break e,
                    Ok(_) => continue,
                    Err(_) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no sync event for hello.txt");

        assert_eq!(event.change_type, watcher::ChangeType::Add);
        assert_eq!(event.size, 2);
        assert!(event.synced_to_cloud);

        let bytes = ws
            .object_store()
            .get_object("workspaces/u1/files/hello.txt")
            .await
            .unwrap();
        assert_eq!(bytes, b"hi");
        ws.stop("s1").await;
    }

    #[tokio::test]
    async fn watcher_skips_ignored_directories() {
        let (ws, _dir) = test_store();
        let init = ws.initialize("u1", "s1", None).await.unwrap();

        tokio::fs::create_dir_all(init.local_path.join("node_modules/pkg"))
            .await
            .unwrap();
        tokio::fs::write(init.local_path.join("node_modules/pkg/x.js"), b"junk")
            .await
            .unwrap();

        // Twice the debounce window; the ignored path must never appear.
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(
            ws.object_store()
                .head_object("workspaces/u1/files/node_modules/pkg/x.js")
                .await
                .unwrap()
                .is_none()
        );
        ws.stop("s1").await;

        // The final flush must skip it too.
        assert!(
            ws.object_store()
                .head_object("workspaces/u1/files/node_modules/pkg/x.js")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn watcher_removes_deleted_files_from_cloud() {
        let (ws, _dir) = test_store();
        let init = ws.initialize("u1", "s1", None).await.unwrap();
        let mut events = ws.subscribe_file_events();

        let path = init.local_path.join("gone.txt");
        tokio::fs::write(&path, b"data").await.unwrap();
        wait_for_event(&mut events, "gone.txt", watcher::ChangeType::Add).await;

        tokio::fs::remove_file(&path).await.unwrap();
        wait_for_event(&mut events, "gone.txt", watcher::ChangeType::Remove).await;

        assert!(
            ws.object_store()
                .head_object("workspaces/u1/files/gone.txt")
                .await
                .unwrap()
                .is_none()
        );
        ws.stop("s1").await;
    }

    async fn wait_for_event(
        events: &mut tokio::sync::broadcast::Receiver<FileChangeEvent>,
        path: &str,
        change_type: watcher::ChangeType,
    ) -> FileChangeEvent {
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(e) if e.path == path && e.change_type == change_type => break e,
                    Ok(_) => continue,
                    Err(_) => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {change_type:?} event for {path}"))
    }

    #[tokio::test]
    async fn force_sync_to_cloud_uploads_tree() {
        let (ws, _dir) = test_store();
        let init = ws.initialize("u1", "s1", None).await.unwrap();
        tokio::fs::create_dir_all(init.local_path.join("src")).await.unwrap();
        tokio::fs::write(init.local_path.join("src/lib.rs"), b"pub fn x() {}")
            .await
            .unwrap();

        let count = ws.force_sync_to_cloud("s1").await.unwrap();
        assert_eq!(count, 1);
        assert!(
            ws.object_store()
                .head_object("workspaces/u1/files/src/lib.rs")
                .await
                .unwrap()
                .is_some()
        );
        ws.stop("s1").await;
    }
}
