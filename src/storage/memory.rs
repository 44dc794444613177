//! In-Memory Stores
//!
//! Process-local implementations of the storage interfaces. Each call
//! takes a single lock, so every write is atomic per key.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{check_path, KeyValueStore, ObjectStore};
use crate::error::{PortabilityError, Result};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| PortabilityError::System("store lock poisoned".to_string()))
}

/// Tables of JSON records held in memory.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    tables: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, table: &str, key: &str, record: Value) -> Result<()> {
        lock(&self.tables)?
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.tables)?
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn update(&self, table: &str, key: &str, field: &str, value: Value) -> Result<()> {
        let mut tables = lock(&self.tables)?;
        let record = tables
            .entry(table.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        match record {
            Value::Object(fields) => {
                fields.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(PortabilityError::System(format!(
                "record {}/{} is not an object",
                table, key
            ))),
        }
    }

    async fn scan(&self, table: &str) -> Result<Vec<Value>> {
        Ok(lock(&self.tables)?
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Objects held in memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        check_path(path)?;
        lock(&self.objects)?.insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        lock(&self.objects)?
            .get(path)
            .cloned()
            .ok_or_else(|| PortabilityError::not_found("object", path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(lock(&self.objects)?
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}
