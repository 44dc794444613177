//! Storage Collaborators
//!
//! Interfaces to the services the orchestration layer writes through:
//! a key-value store with per-key atomic writes, an object store, and
//! the environment registry built on top of the key-value store.
//!
//! - [`memory`]: In-process implementations
//! - [`fs`]: JSON files under a data directory

pub mod fs;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PortabilityError, Result};
use crate::model::Environment;

pub use fs::{FsKeyValueStore, FsObjectStore};
pub use memory::{MemoryKeyValueStore, MemoryObjectStore};

/// Table holding registered environments.
pub const ENVIRONMENTS_TABLE: &str = "environments";

/// Durable key-value records, grouped into tables.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Replaces the record stored under `key`.
    async fn put(&self, table: &str, key: &str, record: Value) -> Result<()>;

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;

    /// Sets one field of a record, creating the record if needed.
    async fn update(&self, table: &str, key: &str, field: &str, value: Value) -> Result<()>;

    /// Every record of a table, in key order.
    async fn scan(&self, table: &str) -> Result<Vec<Value>>;
}

/// Passive blob storage addressed by slash-separated paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Fails with `NotFound` for a missing object.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Paths starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Reads a typed record.
pub async fn get_record<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    table: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get(table, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Writes a typed record.
pub async fn put_record<T: Serialize>(
    store: &dyn KeyValueStore,
    table: &str,
    key: &str,
    record: &T,
) -> Result<()> {
    store.put(table, key, serde_json::to_value(record)?).await
}

/// Reads an object as UTF-8 text, replacing invalid sequences.
pub async fn get_text(store: &dyn ObjectStore, path: &str) -> Result<String> {
    let bytes = store.get(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Rejects keys and paths that could escape their table or prefix.
pub(crate) fn check_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|part| part == ".." || part.is_empty())
    {
        return Err(PortabilityError::Invalid(format!(
            "invalid storage path '{}'",
            path
        )));
    }
    Ok(())
}

/// Fields supplied when registering a new environment.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NewEnvironment {
    pub name: String,

    #[serde(default)]
    pub base_url: String,

    pub schema: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub key_values: HashMap<String, String>,
}

/// Registry of target environments, keyed by environment id.
#[async_trait]
pub trait EnvironmentRegistry: Send + Sync {
    async fn get(&self, environment_id: &str) -> Result<Environment>;

    async fn list(&self) -> Result<Vec<Environment>>;

    async fn register(&self, environment: NewEnvironment) -> Result<Environment>;
}

/// Environment registry stored in a key-value table.
pub struct TableEnvironmentRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl TableEnvironmentRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EnvironmentRegistry for TableEnvironmentRegistry {
    async fn get(&self, environment_id: &str) -> Result<Environment> {
        get_record(self.store.as_ref(), ENVIRONMENTS_TABLE, environment_id)
            .await?
            .ok_or_else(|| PortabilityError::not_found("environment", environment_id))
    }

    async fn list(&self) -> Result<Vec<Environment>> {
        self.store
            .scan(ENVIRONMENTS_TABLE)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(PortabilityError::from))
            .collect()
    }

    async fn register(&self, environment: NewEnvironment) -> Result<Environment> {
        if environment.name.trim().is_empty() {
            return Err(PortabilityError::Invalid(
                "environment name must not be empty".to_string(),
            ));
        }

        let registered = Environment {
            environment_id: uuid::Uuid::new_v4().to_string(),
            name: environment.name,
            base_url: environment.base_url,
            schema: environment.schema,
            headers: environment.headers,
            key_values: environment.key_values,
        };
        put_record(
            self.store.as_ref(),
            ENVIRONMENTS_TABLE,
            &registered.environment_id,
            &registered,
        )
        .await?;

        info!(
            "Registered environment '{}' ({}) as {}",
            registered.name, registered.schema, registered.environment_id
        );
        Ok(registered)
    }
}
