//! Portability Data Model
//!
//! Records exchanged between the coordinator, the backend adapters and
//! callers.
//!
//! # Example submission
//!
//! ```json
//! {
//!   "workflow_descriptor": "workflow hello { ... }",
//!   "workflow_params": "{\"hello.input\": \"https://host/file\"}",
//!   "workflow_dependencies": [{"name": "tasks.wdl", "code": "task t { ... }"}],
//!   "target_environments": ["env-a", "env-b"]
//! }
//! ```

use std::collections::HashMap;
use std::io::{Cursor, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::{aggregate_state, CanonicalState};
use crate::error::{PortabilityError, Result};

/// A registered target execution backend.
///
/// Owned by the environment registry and immutable once registered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Environment {
    pub environment_id: String,

    /// Display name used in reports
    pub name: String,

    /// Base URL of the backend's execution API (may be empty for
    /// backends reached through local collaborators)
    #[serde(default)]
    pub base_url: String,

    /// Execution API dialect, selects the backend adapter
    pub schema: String,

    /// Headers sent with every request to the backend
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Backend specific settings (e.g. `project_id` for the job graph)
    #[serde(default)]
    pub key_values: HashMap<String, String>,
}

/// One additional workflow file shipped alongside the main descriptor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDependency {
    pub name: String,
    pub code: String,
}

/// The workflow half of a submission: what to run, with which inputs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    pub workflow_descriptor: String,

    /// JSON-encoded key/value document; values may be URLs or nested
    /// structures
    #[serde(default)]
    pub workflow_params: String,

    #[serde(default)]
    pub workflow_dependencies: Vec<WorkflowDependency>,
}

impl WorkflowRequest {
    pub fn new(descriptor: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            workflow_descriptor: descriptor.into(),
            workflow_params: params.into(),
            workflow_dependencies: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, name: impl Into<String>, code: impl Into<String>) -> Self {
        self.workflow_dependencies.push(WorkflowDependency {
            name: name.into(),
            code: code.into(),
        });
        self
    }

    /// Dependencies packed for the wire: a zip archive holding one entry
    /// per dependency, base64-encoded. `None` when there are none.
    ///
    /// Receivers run `base64 -d > dependencies.zip && unzip dependencies.zip`.
    pub fn dependencies_archive(&self) -> Result<Option<String>> {
        if self.workflow_dependencies.is_empty() {
            return Ok(None);
        }

        let mut archive = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for dependency in &self.workflow_dependencies {
            archive.start_file(dependency.name.as_str(), options)?;
            archive.write_all(dependency.code.as_bytes())?;
        }
        let bytes = archive.finish()?.into_inner();
        Ok(Some(BASE64.encode(bytes)))
    }

    /// Parses the parameter document. An empty document is an empty object.
    pub fn params_document(&self) -> Result<Value> {
        if self.workflow_params.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.workflow_params).map_err(|e| {
            PortabilityError::Invalid(format!("workflow_params is not valid JSON: {}", e))
        })
    }
}

/// Canonical submission request accepted by the coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmissionRequest {
    #[serde(flatten)]
    pub workflow: WorkflowRequest,

    pub target_environments: Vec<String>,
}

/// The outcome of a test in one environment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentResult {
    pub environment_id: String,

    /// Run reference assigned by the backend; absent if submission failed
    pub workflow_id: Option<String>,

    pub state: CanonicalState,

    /// Why the submission failed, if it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EnvironmentResult {
    /// A submission the backend durably accepted.
    pub fn accepted(environment_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            workflow_id: Some(workflow_id.into()),
            state: CanonicalState::Queued,
            message: None,
        }
    }

    /// A submission that never reached the backend.
    pub fn rejected(environment_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            workflow_id: None,
            state: CanonicalState::ExecutorError,
            message: Some(message.into()),
        }
    }
}

/// One workflow portability check fanned out across environments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Test {
    pub test_id: String,

    #[serde(flatten)]
    pub workflow: WorkflowRequest,

    pub environment_results: Vec<EnvironmentResult>,

    pub created_at: DateTime<Utc>,
}

impl Test {
    pub fn aggregate_state(&self) -> CanonicalState {
        let states: Vec<CanonicalState> =
            self.environment_results.iter().map(|r| r.state).collect();
        aggregate_state(&states)
    }
}

/// Canonical status response for a test.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestStatus {
    pub state: CanonicalState,
    pub environment_states: Vec<EnvironmentResult>,
}

/// Log shape shared by the workflow-level record and every task record.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LogEntry {
    /// Task name; absent on the workflow-level record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub start_time: String,

    #[serde(default)]
    pub end_time: String,

    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl LogEntry {
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Canonical run record, recomputed on every query and never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub workflow_id: String,
    pub state: CanonicalState,
    pub workflow_log: LogEntry,
    pub task_logs: Vec<LogEntry>,
}

impl RunRecord {
    pub fn new(workflow_id: impl Into<String>, state: CanonicalState) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            state,
            workflow_log: LogEntry::default(),
            task_logs: Vec::new(),
        }
    }
}

/// Log response for one environment of a test.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentLog {
    pub environment_id: String,

    #[serde(flatten)]
    pub record: RunRecord,
}

/// Reverses [`WorkflowRequest::dependencies_archive`] into name -> code.
#[cfg(test)]
pub(crate) fn unpack_dependencies(encoded: &str) -> HashMap<String, String> {
    use std::io::Read;

    let bytes = BASE64.decode(encoded).unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut files = HashMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut code = String::new();
        file.read_to_string(&mut code).unwrap();
        files.insert(file.name().to_string(), code);
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_document_parsing() {
        let request = WorkflowRequest::new("wdl", r#"{"a": 1}"#);
        assert_eq!(request.params_document().unwrap(), json!({"a": 1}));

        let empty = WorkflowRequest::new("wdl", "  ");
        assert_eq!(empty.params_document().unwrap(), json!({}));

        let broken = WorkflowRequest::new("wdl", "{not json");
        assert!(matches!(
            broken.params_document(),
            Err(PortabilityError::Invalid(_))
        ));
    }

    #[test]
    fn test_dependencies_archive() {
        assert_eq!(
            WorkflowRequest::new("wdl", "{}").dependencies_archive().unwrap(),
            None
        );

        let request = WorkflowRequest::new("wdl", "{}")
            .with_dependency("t.wdl", "task t {}")
            .with_dependency("lib/u.wdl", "task u {}");
        let encoded = request.dependencies_archive().unwrap().unwrap();
        assert!(encoded.starts_with("UEsD"));

        let files = unpack_dependencies(&encoded);
        assert_eq!(files["t.wdl"], "task t {}");
        assert_eq!(files["lib/u.wdl"], "task u {}");
    }

    #[test]
    fn test_submission_request_is_flat() {
        let raw = json!({
            "workflow_descriptor": "workflow w {}",
            "workflow_params": "{}",
            "workflow_dependencies": [{"name": "sub.wdl", "code": "task t {}"}],
            "target_environments": ["envA", "envB"]
        });
        let request: SubmissionRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.target_environments, vec!["envA", "envB"]);
        assert_eq!(request.workflow.workflow_dependencies[0].name, "sub.wdl");
    }

    #[test]
    fn test_environment_result_constructors() {
        let ok = EnvironmentResult::accepted("envA", "w1");
        assert_eq!(ok.state, CanonicalState::Queued);
        assert_eq!(ok.workflow_id.as_deref(), Some("w1"));

        let failed = EnvironmentResult::rejected("envB", "connection refused");
        assert_eq!(failed.state, CanonicalState::ExecutorError);
        assert!(failed.workflow_id.is_none());

        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["workflow_id"], Value::Null);
    }

    #[test]
    fn test_environment_defaults() {
        let env: Environment = serde_json::from_value(json!({
            "environment_id": "e1",
            "name": "local",
            "schema": "single-node"
        }))
        .unwrap();
        assert!(env.headers.is_empty());
        assert!(env.base_url.is_empty());
    }

    #[test]
    fn test_log_entry_task_name_serialization() {
        let workflow = serde_json::to_value(LogEntry::default()).unwrap();
        assert!(workflow.get("name").is_none());

        let task = serde_json::to_value(LogEntry::task("call-hello")).unwrap();
        assert_eq!(task["name"], "call-hello");
    }
}
