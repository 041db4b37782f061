pub mod memory;
pub mod s3;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageConfig, StorageProvider};

/// Errors from object-store operations.
///
/// Adapters map vendor SDK errors into these variants. Absence is modelled
/// explicitly (`head_object` returns `Option`, `get_object` returns
/// `NotFound`) so callers can distinguish "no such key" from an outage.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("bucket unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata returned by `head_object`.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    pub content_type: Option<String>,
}

/// One key in a listing page.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// A single page of a listing. `continuation` is `Some` when more pages
/// follow; pass it back to `list_objects` to continue.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub continuation: Option<String>,
}

/// Uniform, vendor-neutral object-store capability. Keys use `/` as the
/// hierarchical separator.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist. Idempotent across
    /// concurrent managers.
    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// `None` when the key does not exist; `Err` only on real failures.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListPage, StorageError>;
}

/// List every object under `prefix`, paginating to completion.
pub async fn list_all(
    store: &dyn ObjectStore,
    prefix: &str,
) -> Result<Vec<ObjectEntry>, StorageError> {
    let mut entries = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = store
            .list_objects(prefix, None, continuation.as_deref())
            .await?;
        entries.extend(page.objects);
        match page.continuation {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }
    Ok(entries)
}

/// Delete every object under `prefix`. Returns the number of keys removed.
pub async fn delete_prefix(store: &dyn ObjectStore, prefix: &str) -> Result<usize, StorageError> {
    let entries = list_all(store, prefix).await?;
    let count = entries.len();
    for entry in entries {
        store.delete_object(&entry.key).await?;
    }
    Ok(count)
}

/// Recursively upload a local directory to `prefix`. Files larger than
/// `max_file_size` are skipped and logged; `ignore` receives each path
/// relative to `local_dir` and suppresses matching entries.
pub async fn upload_dir(
    store: &dyn ObjectStore,
    local_dir: &Path,
    prefix: &str,
    max_file_size: u64,
    ignore: &(dyn Fn(&Path) -> bool + Send + Sync),
) -> Result<usize, StorageError> {
    let mut uploaded = 0usize;
    let mut pending: Vec<PathBuf> = vec![local_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(local_dir)
                .map_err(|e| StorageError::Backend(format!("path outside upload root: {e}")))?;
            if ignore(relative) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            if meta.len() > max_file_size {
                tracing::warn!(
                    path = %path.display(),
                    size = meta.len(),
                    "skipping oversized file during upload"
                );
                continue;
            }
            let key = join_key(prefix, relative);
            let bytes = tokio::fs::read(&path).await?;
            store.put_object(&key, bytes, "application/octet-stream").await?;
            uploaded += 1;
        }
    }
    Ok(uploaded)
}

/// Recursively download everything under `prefix` into `local_dir`.
/// Returns the number of files written.
pub async fn download_dir(
    store: &dyn ObjectStore,
    prefix: &str,
    local_dir: &Path,
) -> Result<usize, StorageError> {
    let normalized = prefix.trim_end_matches('/');
    let entries = list_all(store, &format!("{normalized}/")).await?;
    let mut downloaded = 0usize;
    for entry in entries {
        let relative = entry
            .key
            .strip_prefix(normalized)
            .and_then(|s| s.strip_prefix('/'))
            .unwrap_or(&entry.key);
        if relative.is_empty() {
            continue;
        }
        let target = local_dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = store.get_object(&entry.key).await?;
        tokio::fs::write(&target, bytes).await?;
        downloaded += 1;
    }
    Ok(downloaded)
}

fn join_key(prefix: &str, relative: &Path) -> String {
    let rel: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    format!("{}/{}", prefix.trim_end_matches('/'), rel.join("/"))
}

/// Build the configured object store. Fails fast when the backend cannot
/// be constructed; session creation depends on cloud availability.
pub async fn build_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    let store: Arc<dyn ObjectStore> = match config.provider {
        StorageProvider::Minio | StorageProvider::S3 => {
            Arc::new(s3::S3Store::connect(config).await?)
        }
        StorageProvider::Memory => Arc::new(memory::MemoryStore::new(&config.bucket)),
    };
    store.ensure_bucket().await?;
    Ok(store)
}
