//! Persistence backends for governor state
//!
//! [`FileStateStore`] keeps one JSON document per record under
//! `<root>/<namespace>/<key>.json` and replaces documents by atomic rename.
//! [`MemoryStateStore`] keeps everything in process, for standalone runs
//! without a state directory and for tests.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::domain::partition::StateStore;
use crate::domain::partition::StoreError;
use crate::domain::partition::StoredRecord;

const EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u64,
    value: serde_json::Value,
}

pub struct FileStateStore {
    root: PathBuf,
    /// Serializes read-compare-write of documents
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn document_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{key}.{EXTENSION}"))
    }

    async fn read_document(path: &Path) -> io::Result<Option<Document>> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_all(&self, namespace: &str) -> Result<Vec<StoredRecord>, Report<StoreError>> {
        let dir = self.namespace_dir(namespace);
        let read_error = || StoreError::Read {
            namespace: namespace.to_string(),
            key: "*".to_string(),
        };
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(read_error())
                    .attach_printable(format!("directory: {}", dir.display())))
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.change_context_lazy(read_error)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match Self::read_document(&path).await {
                Ok(Some(document)) => records.push(StoredRecord {
                    key,
                    version: document.version,
                    value: document.value,
                }),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable state document"),
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(namespace, records = records.len(), "State documents loaded");
        Ok(records)
    }

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
        value: serde_json::Value,
    ) -> Result<(), Report<StoreError>> {
        let write_error = || StoreError::Write {
            namespace: namespace.to_string(),
            key: key.to_string(),
        };
        let path = self.document_path(namespace, key);
        let _guard = self.write_lock.lock().await;

        let stored = Self::read_document(&path)
            .await
            .change_context(StoreError::Read {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })?
            .map(|document| document.version)
            .unwrap_or(0);
        if version <= stored {
            return Err(Report::new(StoreError::StaleVersion {
                namespace: namespace.to_string(),
                key: key.to_string(),
                version,
                stored,
            }));
        }

        fs::create_dir_all(self.namespace_dir(namespace))
            .await
            .change_context_lazy(write_error)?;
        let bytes = serde_json::to_vec_pretty(&Document { version, value })
            .change_context_lazy(write_error)?;
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&tmp, bytes)
            .await
            .change_context_lazy(write_error)
            .attach_printable_lazy(|| format!("path: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .change_context_lazy(write_error)
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), Report<StoreError>> {
        let path = self.document_path(namespace, key);
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e).change_context(StoreError::Write {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })),
        }
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    namespaces: DashMap<String, BTreeMap<String, (u64, serde_json::Value)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored version of a record, 0 when absent.
    pub fn version(&self, namespace: &str, key: &str) -> u64 {
        self.namespaces
            .get(namespace)
            .and_then(|records| records.get(key).map(|(version, _)| *version))
            .unwrap_or(0)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_all(&self, namespace: &str) -> Result<Vec<StoredRecord>, Report<StoreError>> {
        Ok(self
            .namespaces
            .get(namespace)
            .map(|records| {
                records
                    .iter()
                    .map(|(key, (version, value))| StoredRecord {
                        key: key.clone(),
                        version: *version,
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
        value: serde_json::Value,
    ) -> Result<(), Report<StoreError>> {
        let mut records = self.namespaces.entry(namespace.to_string()).or_default();
        let stored = records.get(key).map(|(v, _)| *v).unwrap_or(0);
        if version <= stored {
            return Err(Report::new(StoreError::StaleVersion {
                namespace: namespace.to_string(),
                key: key.to_string(),
                version,
                stored,
            }));
        }
        records.insert(key.to_string(), (version, value));
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), Report<StoreError>> {
        if let Some(mut records) = self.namespaces.get_mut(namespace) {
            records.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn file_store_round_trips_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        store.put("devices", "node-a_0", 1, json!({"phase": "active"})).await.unwrap();
        store.put("devices", "node-a_1", 4, json!({"phase": "draining"})).await.unwrap();

        let records = store.load_all("devices").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "node-a_0");
        assert_eq!(records[1].version, 4);
        assert_eq!(records[1].value, json!({"phase": "draining"}));
        assert!(store.load_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_refuses_stale_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.put("devices", "node-a_0", 2, json!(2)).await.unwrap();

        let err = store.put("devices", "node-a_0", 2, json!("old")).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StoreError::StaleVersion { stored: 2, .. }
        ));
        store.put("devices", "node-a_0", 3, json!(3)).await.unwrap();
        assert_eq!(store.load_all("devices").await.unwrap()[0].value, json!(3));
    }

    #[tokio::test]
    async fn file_store_survives_reopen_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStateStore::new(dir.path());
            store.put("devices", "node-a_0", 7, json!({"ok": true})).await.unwrap();
        }
        std::fs::write(dir.path().join("devices/broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("devices/notes.txt"), b"ignored").unwrap();

        let store = FileStateStore::new(dir.path());
        let records = store.load_all("devices").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, 7);

        store.delete("devices", "node-a_0").await.unwrap();
        store.delete("devices", "node-a_0").await.unwrap();
        assert!(store.load_all("devices").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_tracks_versions() {
        let store = MemoryStateStore::new();
        store.put("devices", "a", 1, json!(1)).await.unwrap();
        assert!(store.put("devices", "a", 1, json!(1)).await.is_err());
        assert_eq!(store.version("devices", "a"), 1);

        store.delete("devices", "a").await.unwrap();
        assert_eq!(store.version("devices", "a"), 0);
        assert!(store.load_all("devices").await.unwrap().is_empty());
    }
}
