use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ListPage, ObjectEntry, ObjectMeta, ObjectStore, StorageError};

#[derive(Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-process object store backed by a `BTreeMap`. Used by tests and
/// single-node dev setups; listing is paginated like a real backend so
/// pagination bugs surface here too.
pub struct MemoryStore {
    bucket: String,
    page_size: usize,
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self::with_page_size(bucket, 1000)
    }

    pub fn with_page_size(bucket: &str, page_size: usize) -> Self {
        Self {
            bucket: bucket.to_string(),
            page_size: page_size.max(1),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        tracing::debug!(bucket = %self.bucket, "memory store bucket ready");
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.lock().insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        Ok(self.lock().get(key).map(|o| ObjectMeta {
            size: o.bytes.len() as u64,
            content_type: Some(o.content_type.clone()),
        }))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut objects = self.lock();
        let source = objects
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), source);
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let objects = self.lock();
        let mut page = ListPage::default();
        let mut seen_prefixes = std::collections::BTreeSet::new();
        let mut emitted = 0usize;

        for (key, object) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            // Continuation token is the last key of the previous page.
            if let Some(after) = continuation {
                if key.as_str() <= after {
                    continue;
                }
            }

            if let Some(delim) = delimiter {
                let remainder = &key[prefix.len()..];
                if let Some(pos) = remainder.find(delim) {
                    let common = format!("{}{}{}", prefix, &remainder[..pos], delim);
                    if seen_prefixes.insert(common.clone()) {
                        page.common_prefixes.push(common);
                    }
                    continue;
                }
            }

            page.objects.push(ObjectEntry {
                key: key.clone(),
                size: object.bytes.len() as u64,
            });
            emitted += 1;
            if emitted >= self.page_size {
                page.continuation = Some(key.clone());
                break;
            }
        }

        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_duplicates_contents() {
        let store = MemoryStore::new("b");
        store
            .put_object("src", b"data".to_vec(), "text/plain")
            .await
            .unwrap();
        store.copy_object("src", "dst").await.unwrap();
        assert_eq!(store.get_object("dst").await.unwrap(), b"data");
        assert_eq!(store.get_object("src").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn copy_missing_source_is_not_found() {
        let store = MemoryStore::new("b");
        assert!(matches!(
            store.copy_object("nope", "dst").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delimiter_listing_groups_prefixes() {
        let store = MemoryStore::new("b");
        for key in [
            "workspaces/u1/metadata.json",
            "workspaces/u1/files/a.txt",
            "workspaces/u2/metadata.json",
        ] {
            store.put_object(key, vec![1], "text/plain").await.unwrap();
        }
        let page = store
            .list_objects("workspaces/", Some("/"), None)
            .await
            .unwrap();
        assert!(page.objects.is_empty());
        assert_eq!(
            page.common_prefixes,
            vec!["workspaces/u1/".to_string(), "workspaces/u2/".to_string()]
        );
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let store = MemoryStore::new("b");
        assert!(matches!(
            store.get_object("ghost").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
