//! WES Adapter
//!
//! Talks to environments exposing a workflow execution service over
//! HTTP:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | submit | `POST {base_url}/workflows` |
//! | status | `GET {base_url}/workflows/{id}/status` |
//! | log | `GET {base_url}/workflows/{id}` |
//!
//! Dependencies are sent as a JSON-encoded list of `{name, code}`.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};

use super::job_graph::http::header_map;
use super::BackendAdapter;
use crate::aggregate::{map_state, wes_record, NativeVocabulary};
use crate::error::{PortabilityError, Result};
use crate::model::{CanonicalState, RunRecord, WorkflowRequest};

#[derive(Deserialize)]
struct SubmitResponse {
    workflow_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    state: String,
}

/// Adapter for one WES endpoint.
pub struct WesAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl WesAdapter {
    pub fn new(base_url: &str, headers: &HashMap<String, String>) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(PortabilityError::Invalid(
                "WES environments need a base_url".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .default_headers(header_map(headers)?)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// Body of a WES submission.
pub fn submission_body(request: &WorkflowRequest) -> Result<Value> {
    let mut body = json!({
        "workflow_descriptor": request.workflow_descriptor,
        "workflow_params": request.workflow_params,
    });
    if let Some(archive) = request.dependencies_archive()? {
        body["workflow_dependencies"] = Value::String(archive);
    }
    Ok(body)
}

#[async_trait]
impl BackendAdapter for WesAdapter {
    async fn submit(&self, request: &WorkflowRequest) -> Result<String> {
        let url = self.url("workflows");
        debug!("POST {}", url);
        let response: SubmitResponse = self
            .client
            .post(&url)
            .json(&submission_body(request)?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.workflow_id)
    }

    async fn get_status(&self, workflow_id: &str) -> Result<CanonicalState> {
        let url = self.url(&format!("workflows/{}/status", workflow_id));
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PortabilityError::not_found("workflow", workflow_id));
        }
        let status: StatusResponse = response.error_for_status()?.json().await?;
        Ok(map_state(NativeVocabulary::Wes, &status.state))
    }

    async fn get_log(&self, workflow_id: &str) -> Result<RunRecord> {
        let url = self.url(&format!("workflows/{}", workflow_id));
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PortabilityError::not_found("workflow", workflow_id));
        }
        let body: Value = response.error_for_status()?.json().await?;
        Ok(wes_record(workflow_id, &body))
    }
}
