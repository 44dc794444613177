//! Remote Execution Platform
//!
//! The slice of a job-execution platform the orchestrator depends on:
//! folders, applets found by name and version, asynchronous job launch
//! with declared dependencies and properties, property search, and job
//! logs.
//!
//! Field names follow the platform's JSON (`executableName`,
//! `startedRunning`, ...) so descriptions deserialize straight from API
//! responses.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Properties attached to platform objects; used as search tags.
pub type Properties = BTreeMap<String, String>;

/// One declared input or output of an applet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IoSpec {
    pub name: String,
    pub class: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl IoSpec {
    pub fn required(name: &str, class: &str) -> Self {
        Self {
            name: name.to_string(),
            class: class.to_string(),
            optional: false,
        }
    }

    pub fn optional(name: &str, class: &str) -> Self {
        Self {
            optional: true,
            ..Self::required(name, class)
        }
    }
}

/// Everything needed to build an applet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppletSpec {
    pub name: String,
    pub title: String,

    /// Stored as the `version` property and used for lookups
    pub version: String,

    pub input_spec: Vec<IoSpec>,
    pub output_spec: Vec<IoSpec>,
    pub interpreter: String,
    pub code: String,
    pub instance_type: String,
}

/// An asynchronous job launch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub applet_id: String,
    pub name: String,
    pub project: String,
    pub folder: String,
    pub input: Value,

    /// Jobs that must be done before this one may start
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub properties: Properties,
}

/// Search over launched jobs. Every given criterion must match.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct JobQuery {
    #[serde(default)]
    pub properties: Properties,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Every job launched, directly or not, under this root job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_execution: Option<String>,
}

impl JobQuery {
    pub fn tagged(key: &str, value: &str) -> Self {
        Self {
            properties: Properties::from([(key.to_string(), value.to_string())]),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &JobDescription) -> bool {
        self.properties
            .iter()
            .all(|(k, v)| job.properties.get(k) == Some(v))
            && self.name.as_ref().map_or(true, |n| *n == job.name)
            && self.project.as_ref().map_or(true, |p| *p == job.project)
            && self
                .root_execution
                .as_ref()
                .map_or(true, |r| *r == job.root_execution)
    }

    pub fn under(root_job: &str) -> Self {
        Self {
            root_execution: Some(root_job.to_string()),
            ..Default::default()
        }
    }
}

/// A job as the platform describes it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JobDescription {
    pub id: String,
    pub name: String,
    pub executable_name: String,
    pub project: String,

    /// Native job state (`idle`, `runnable`, `running`, `done`, ...)
    pub state: String,

    pub properties: Properties,
    pub depends_on: Vec<String>,

    /// Top-level job this one was launched under; its own id when launched
    /// directly
    pub root_execution: String,

    /// Milliseconds since the epoch
    pub started_running: Option<i64>,
    pub stopped_running: Option<i64>,

    pub input: Value,
    pub output: Value,
    pub failure_reason: Option<String>,
}

/// Operations the orchestrator performs on the platform.
#[async_trait]
pub trait ExecutionPlatform: Send + Sync {
    async fn create_folder(&self, project: &str, folder: &str) -> Result<()>;

    /// Id of a built applet with this name and version, if any.
    async fn find_applet(&self, project: &str, name: &str, version: &str) -> Result<Option<String>>;

    async fn build_applet(&self, project: &str, spec: &AppletSpec) -> Result<String>;

    /// Launches a job and returns its id without waiting for it to start.
    async fn run_job(&self, request: &JobRequest) -> Result<String>;

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobDescription>>;

    async fn job_log(&self, job_id: &str) -> Result<String>;
}
