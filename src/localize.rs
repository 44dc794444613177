//! Input Localization
//!
//! Finds remote content references in a workflow parameter document and
//! swaps them for backend-local handles. The walk is structure
//! preserving: lists stay lists, maps keep their keys, and only string
//! leaves that look like remote references are replaced. Everything else
//! passes through unchanged.
//!
//! Resolution is split in two so callers can do the slow part however
//! they like (download to disk, launch a platform job):
//!
//! 1. [`collect_remote_references`] lists the references in document order
//! 2. [`substitute_references`] rewrites the document from a lookup table

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::{PortabilityError, Result};

/// URL schemes treated as remote content references.
pub const REMOTE_SCHEMES: &[&str] = &["http://", "https://", "gs://"];

/// Public HTTP endpoint serving `gs://` objects.
const GCS_PUBLIC_ENDPOINT: &str = "https://storage.googleapis.com";

/// Returns true if a string value refers to remote content.
pub fn is_remote_reference(value: &str) -> bool {
    REMOTE_SCHEMES
        .iter()
        .any(|scheme| value.starts_with(scheme) && value.len() > scheme.len())
}

/// Lists every distinct remote reference, in order of first appearance.
pub fn collect_remote_references(document: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    visit_strings(document, &mut |s| {
        if is_remote_reference(s) && seen.insert(s.to_string()) {
            found.push(s.to_string());
        }
    });
    found
}

fn visit_strings<F: FnMut(&str)>(value: &Value, visit: &mut F) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|item| visit_strings(item, visit)),
        Value::Object(fields) => fields.values().for_each(|v| visit_strings(v, visit)),
        _ => {}
    }
}

/// Rewrites remote references through `resolve`.
///
/// `resolve` is only consulted for string leaves matching
/// [`is_remote_reference`]; returning `None` keeps the original value.
pub fn resolve_references<F>(document: &Value, resolve: &mut F) -> Value
where
    F: FnMut(&str) -> Option<String>,
{
    match document {
        Value::String(s) if is_remote_reference(s) => {
            Value::String(resolve(s).unwrap_or_else(|| s.clone()))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_references(item, resolve))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), resolve_references(v, resolve)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Rewrites remote references from a lookup table.
pub fn substitute_references(document: &Value, replacements: &HashMap<String, String>) -> Value {
    resolve_references(document, &mut |s| replacements.get(s).cloned())
}

/// HTTP URL serving a reference's content.
pub fn public_url(reference: &str) -> String {
    match reference.strip_prefix("gs://") {
        Some(path) => format!("{}/{}", GCS_PUBLIC_ENDPOINT, path),
        None => reference.to_string(),
    }
}

/// File name a reference is materialized under.
pub fn local_file_name(reference: &str) -> String {
    let without_query = reference.split(['?', '#']).next().unwrap_or(reference);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);

    match after_scheme.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        _ => "input".to_string(),
    }
}

/// Retrieves remote content.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `reference` to `dest`.
    async fn fetch(&self, reference: &str, dest: &Path) -> Result<()>;

    /// Downloads `reference` as text.
    async fn fetch_text(&self, reference: &str) -> Result<String>;
}

/// Fetcher over plain HTTP(S); `gs://` objects go through the public
/// storage endpoint.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, reference: &str, dest: &Path) -> Result<()> {
        let url = public_url(reference);
        debug!("Downloading {} to {}", url, dest.display());

        let mut response = self.client.get(&url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn fetch_text(&self, reference: &str) -> Result<String> {
        let url = public_url(reference);
        Ok(self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

/// Downloads every remote reference of a document into `dir` and returns
/// the document with local paths in their place.
///
/// Each reference gets its own subdirectory so equal file names from
/// different hosts cannot collide.
pub async fn localize_document(
    document: &Value,
    fetcher: &dyn Fetcher,
    dir: &Path,
) -> Result<Value> {
    let references = collect_remote_references(document);
    if references.is_empty() {
        return Ok(document.clone());
    }

    info!("Localizing {} remote inputs", references.len());

    let mut replacements = HashMap::new();
    for (index, reference) in references.iter().enumerate() {
        let target_dir: PathBuf = dir.join(format!("input-{}", index));
        tokio::fs::create_dir_all(&target_dir).await?;
        let target = target_dir.join(local_file_name(reference));

        fetcher.fetch(reference, &target).await.map_err(|e| {
            PortabilityError::Executor(format!("failed to localize {}: {}", reference, e))
        })?;

        replacements.insert(reference.clone(), target.to_string_lossy().into_owned());
    }

    Ok(substitute_references(document, &replacements))
}
