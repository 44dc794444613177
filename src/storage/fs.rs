//! File-Backed Stores
//!
//! Persists records and objects beneath a data directory so that
//! short-lived invocations (the CLI, a run's instance process) share
//! state.
//!
//! Layout:
//!
//! ```text
//! {root}/tables/{table}/{key}.json
//! {root}/locks/{table}/{key}.lock
//! {root}/objects/{path}
//! {root}/tmp/
//! ```
//!
//! Records and objects are written into `tmp/` and renamed into place, so
//! readers never observe a partial file and listings never see one in
//! flight. Writers of a record hold an exclusive lock on its lock file
//! for the whole read-modify-write, which serializes them across
//! processes as well as within one.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde_json::{Map, Value};
use tokio::fs;

use super::{check_path, KeyValueStore, ObjectStore};
use crate::error::{PortabilityError, Result};

const TMP_DIR: &str = "tmp";

/// Runs blocking file work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PortabilityError::System(format!("file task failed: {}", e)))?
}

fn write_atomically(tmp_dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(tmp_dir)?;
    let tmp = tmp_dir.join(uuid::Uuid::new_v4().to_string());
    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Runs `work` holding an exclusive lock on `lock_path`. The lock is
/// released when the file handle drops.
fn locked<T>(lock_path: &Path, work: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)?;
    fs2::FileExt::lock_exclusive(&lock_file)?;
    work()
}

fn read_record(path: &Path) -> Result<Option<Value>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Where one record lives and who guards it.
struct RecordFiles {
    record: PathBuf,
    lock: PathBuf,
    tmp_dir: PathBuf,
}

/// JSON records stored one file per key.
pub struct FsKeyValueStore {
    root: PathBuf,
}

impl FsKeyValueStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().to_path_buf(),
        }
    }

    fn tables(&self) -> PathBuf {
        self.root.join("tables")
    }

    fn record_files(&self, table: &str, key: &str) -> Result<RecordFiles> {
        check_path(table)?;
        if key.contains('/') {
            return Err(PortabilityError::Invalid(format!("invalid key '{}'", key)));
        }
        check_path(key)?;
        Ok(RecordFiles {
            record: self.tables().join(table).join(format!("{}.json", key)),
            lock: self
                .root
                .join("locks")
                .join(table)
                .join(format!("{}.lock", key)),
            tmp_dir: self.root.join(TMP_DIR),
        })
    }
}

#[async_trait]
impl KeyValueStore for FsKeyValueStore {
    async fn put(&self, table: &str, key: &str, record: Value) -> Result<()> {
        let files = self.record_files(table, key)?;
        let data = serde_json::to_vec_pretty(&record)?;
        blocking(move || {
            locked(&files.lock, || {
                write_atomically(&files.tmp_dir, &files.record, &data)
            })?;
            debug!("Wrote record {}", files.record.display());
            Ok(())
        })
        .await
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let files = self.record_files(table, key)?;
        match read_optional(&files.record).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, table: &str, key: &str, field: &str, value: Value) -> Result<()> {
        let files = self.record_files(table, key)?;
        let (table, key, field) = (table.to_string(), key.to_string(), field.to_string());

        blocking(move || {
            locked(&files.lock, || {
                let mut record =
                    read_record(&files.record)?.unwrap_or_else(|| Value::Object(Map::new()));
                match &mut record {
                    Value::Object(fields) => {
                        fields.insert(field.clone(), value);
                    }
                    _ => {
                        return Err(PortabilityError::System(format!(
                            "record {}/{} is not an object",
                            table, key
                        )))
                    }
                }
                write_atomically(
                    &files.tmp_dir,
                    &files.record,
                    &serde_json::to_vec_pretty(&record)?,
                )
            })?;
            debug!("Updated {} of record {}", field, files.record.display());
            Ok(())
        })
        .await
    }

    async fn scan(&self, table: &str) -> Result<Vec<Value>> {
        check_path(table)?;
        let dir = self.tables().join(table);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(bytes) = read_optional(&path).await? {
                records.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(records)
    }
}

/// Objects stored as plain files.
pub struct FsObjectStore {
    root: PathBuf,
    tmp_dir: PathBuf,
}

impl FsObjectStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("objects"),
            tmp_dir: data_dir.as_ref().join(TMP_DIR),
        }
    }

    async fn collect(&self, dir: PathBuf, out: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    out.push(key.join("/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        check_path(path)?;
        let (tmp_dir, target) = (self.tmp_dir.clone(), self.root.join(path));
        blocking(move || write_atomically(&tmp_dir, &target, &data)).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        check_path(path)?;
        read_optional(&self.root.join(path))
            .await?
            .ok_or_else(|| PortabilityError::not_found("object", path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        self.collect(self.root.clone(), &mut paths).await?;
        paths.retain(|p| p.starts_with(prefix));
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_fs_kv_roundtrip_and_update() {
        let dir = tempdir().unwrap();
        let store = FsKeyValueStore::new(dir.path());

        store
            .put("state", "run-1", json!({"state": "PROVISIONING"}))
            .await
            .unwrap();
        store
            .update("state", "run-1", "state", json!("RUNNING"))
            .await
            .unwrap();

        let record = store.get("state", "run-1").await.unwrap().unwrap();
        assert_eq!(record["state"], "RUNNING");
        assert!(dir.path().join("tables/state/run-1.json").exists());
    }

    #[tokio::test]
    async fn test_fs_kv_shared_between_handles() {
        let dir = tempdir().unwrap();
        FsKeyValueStore::new(dir.path())
            .put("tests", "t1", json!({"test_id": "t1"}))
            .await
            .unwrap();

        let other = FsKeyValueStore::new(dir.path());
        assert!(other.get("tests", "t1").await.unwrap().is_some());
        assert_eq!(other.scan("tests").await.unwrap().len(), 1);
        assert!(other.scan("missing").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fs_kv_concurrent_updates_from_separate_handles() {
        let dir = tempdir().unwrap();
        let adapter_side = FsKeyValueStore::new(dir.path());
        let instance_side = FsKeyValueStore::new(dir.path());

        let mut lost = 0;
        for i in 0..200 {
            let key = format!("run-{}", i);
            adapter_side
                .put("state", &key, json!({"state": "PROVISIONING"}))
                .await
                .unwrap();

            let (a, b) = tokio::join!(
                adapter_side.update("state", &key, "instance_id", json!(format!("i-{}", i))),
                instance_side.update("state", &key, "state", json!("RUNNING")),
            );
            a.unwrap();
            b.unwrap();

            let record = adapter_side.get("state", &key).await.unwrap().unwrap();
            if record.get("instance_id").is_none() || record["state"] != "RUNNING" {
                lost += 1;
            }
        }
        assert_eq!(lost, 0);
        assert_eq!(adapter_side.scan("state").await.unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_fs_kv_update_rejects_non_object_record() {
        let dir = tempdir().unwrap();
        let store = FsKeyValueStore::new(dir.path());
        store.put("t", "k", json!([1, 2])).await.unwrap();
        assert!(store.update("t", "k", "f", json!(1)).await.is_err());

        store.update("t", "fresh", "f", json!(1)).await.unwrap();
        assert_eq!(store.get("t", "fresh").await.unwrap().unwrap(), json!({"f": 1}));
    }

    #[tokio::test]
    async fn test_fs_kv_rejects_bad_keys() {
        let dir = tempdir().unwrap();
        let store = FsKeyValueStore::new(dir.path());
        assert!(store.put("t", "a/b", json!(1)).await.is_err());
        assert!(store.get("..", "k").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_objects_nested_listing() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("r1/logs/a/stdout", b"1".to_vec()).await.unwrap();
        store.put("r1/logs/a/rc", b"0".to_vec()).await.unwrap();
        store.put("r1/workflow_params.json", b"{}".to_vec()).await.unwrap();
        store.put("r2/logs/x", b"2".to_vec()).await.unwrap();

        assert_eq!(
            store.list("r1/logs/").await.unwrap(),
            vec!["r1/logs/a/rc", "r1/logs/a/stdout"]
        );
        assert_eq!(store.get("r1/logs/a/rc").await.unwrap(), b"0");
        assert!(store.get("r1/nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fs_objects_listing_never_shows_partial_writes() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(FsObjectStore::new(dir.path()));
        let expected: Vec<String> = (0..50).map(|i| format!("r1/logs/t{}/stdout", i)).collect();

        let writer = {
            let store = store.clone();
            let expected = expected.clone();
            tokio::spawn(async move {
                for path in expected {
                    store.put(&path, vec![b'x'; 4096]).await.unwrap();
                }
            })
        };
        while !writer.is_finished() {
            for path in store.list("r1/").await.unwrap() {
                assert!(expected.contains(&path), "unexpected path {}", path);
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        assert_eq!(store.list("").await.unwrap().len(), expected.len());
        assert!(!dir.path().join("tmp").starts_with(dir.path().join("objects")));
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fs_objects_empty_store_lists_nothing() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("never-created"));
        assert!(store.list("").await.unwrap().is_empty());
    }
}
