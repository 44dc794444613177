//! Single-Node Executor
//!
//! Runs a workflow engine on one dedicated, self-terminating instance.
//!
//! # Life cycle
//!
//! ```text
//! PROVISIONING ──► RUNNING ──► COMPLETE
//!                          └─► EXECUTOR_ERROR
//! ```
//!
//! `submit` writes the initial state and timing records, archives the
//! request under `{run_id}/` in object storage and asks the compute
//! provider for an instance. Everything after that happens on the
//! instance ([`runner`]), which records its own progress. Queries only
//! read those records.
//!
//! # Storage layout
//!
//! | Where | Key | Content |
//! |-------|-----|---------|
//! | `single_node_state` table | run id | state, exit code, instance id |
//! | `single_node_timing` table | run id | start, end and deadline times |
//! | objects | `{run_id}/workflow.wdl` | workflow descriptor |
//! | objects | `{run_id}/workflow_attachments/{name}` | dependencies |
//! | objects | `{run_id}/workflow_params.json` | resolved parameters |
//! | objects | `{run_id}/logs/...` | engine and task logs |

pub mod cleanup;
pub mod compute;
pub mod runner;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BackendAdapter;
use crate::aggregate::{map_state, single_node_record, NativeVocabulary};
use crate::config::SingleNodeConfig;
use crate::error::{PortabilityError, Result};
use crate::localize::{is_remote_reference, Fetcher};
use crate::model::{CanonicalState, RunRecord, WorkflowRequest};
use crate::storage::{get_record, get_text, put_record, KeyValueStore, ObjectStore};

pub use cleanup::{ExitCause, ExitHandler};
pub use compute::{ComputeProvider, InstanceRequest, LocalCompute, ProcessCompute};
pub use runner::{InstanceContext, InstanceRunner};

pub const STATE_TABLE: &str = "single_node_state";
pub const TIMING_TABLE: &str = "single_node_timing";

/// Native state names written to the state table.
pub const PROVISIONING: &str = "PROVISIONING";
pub const RUNNING: &str = "RUNNING";

pub(crate) fn descriptor_path(run_id: &str) -> String {
    format!("{}/workflow.wdl", run_id)
}

pub(crate) fn params_path(run_id: &str) -> String {
    format!("{}/workflow_params.json", run_id)
}

pub(crate) fn attachments_prefix(run_id: &str) -> String {
    format!("{}/workflow_attachments/", run_id)
}

pub(crate) fn logs_prefix(run_id: &str) -> String {
    format!("{}/logs/", run_id)
}

/// Current state of a run as recorded by the adapter and the instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunStateRecord {
    pub run_id: String,

    /// Native state name (`PROVISIONING`, `RUNNING`, ...)
    pub state: String,

    #[serde(default)]
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Wall-clock bookkeeping of a run. Times are RFC 3339; an empty
/// `end_time` means the run has not finished.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunTiming {
    #[serde(default)]
    pub start_time: String,

    #[serde(default)]
    pub end_time: String,

    #[serde(default)]
    pub deadline: String,
}

impl RunTiming {
    pub fn starting_now(timeout: std::time::Duration) -> Self {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::zero());
        Self {
            start_time: timestamp(now),
            end_time: String::new(),
            deadline: timestamp(now + timeout),
        }
    }

    /// Returns true once the deadline plus `grace` lies before `now`.
    ///
    /// A record without a parseable deadline never expires.
    pub fn expired(&self, now: DateTime<Utc>, grace: std::time::Duration) -> bool {
        let Ok(deadline) = DateTime::parse_from_rfc3339(&self.deadline) else {
            return false;
        };
        let grace = ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::zero());
        deadline.with_timezone(&Utc) + grace < now
    }
}

pub(crate) fn timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Backend adapter for single-node runs.
pub struct SingleNodeAdapter {
    config: SingleNodeConfig,
    store: Arc<dyn KeyValueStore>,
    objects: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn Fetcher>,
    compute: Arc<dyn ComputeProvider>,
}

impl SingleNodeAdapter {
    pub fn new(
        config: SingleNodeConfig,
        store: Arc<dyn KeyValueStore>,
        objects: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn Fetcher>,
        compute: Arc<dyn ComputeProvider>,
    ) -> Self {
        Self {
            config,
            store,
            objects,
            fetcher,
            compute,
        }
    }

    /// Parameters as the instance will see them. A parameter document
    /// given as a URL is fetched first.
    async fn resolve_params(&self, request: &WorkflowRequest) -> Result<Value> {
        let raw = request.workflow_params.trim();
        if !is_remote_reference(raw) {
            return request.params_document();
        }

        let text = self
            .fetcher
            .fetch_text(raw)
            .await
            .map_err(|e| PortabilityError::Submission(format!("cannot fetch {}: {}", raw, e)))?;
        WorkflowRequest::new("", text).params_document()
    }

    async fn archive_request(&self, run_id: &str, request: &WorkflowRequest, params: &Value) -> Result<()> {
        self.objects
            .put(
                &descriptor_path(run_id),
                request.workflow_descriptor.clone().into_bytes(),
            )
            .await?;
        for dependency in &request.workflow_dependencies {
            self.objects
                .put(
                    &format!("{}{}", attachments_prefix(run_id), dependency.name),
                    dependency.code.clone().into_bytes(),
                )
                .await?;
        }
        self.objects
            .put(&params_path(run_id), serde_json::to_vec_pretty(params)?)
            .await
    }

    async fn load_state(&self, run_id: &str) -> Result<RunStateRecord> {
        get_record(self.store.as_ref(), STATE_TABLE, run_id)
            .await?
            .ok_or_else(|| PortabilityError::not_found("run", run_id))
    }

    async fn current_state(&self, record: &RunStateRecord) -> Result<(CanonicalState, Option<RunTiming>)> {
        let timing: Option<RunTiming> =
            get_record(self.store.as_ref(), TIMING_TABLE, &record.run_id).await?;
        let state = map_state(NativeVocabulary::SingleNode, &record.state);

        if state.is_terminal() {
            return Ok((state, timing));
        }

        let expired = timing
            .as_ref()
            .map(|t| t.expired(Utc::now(), self.config.grace()))
            .unwrap_or(false);
        if expired {
            warn!(
                "Run {} passed its deadline without a terminal record",
                record.run_id
            );
            return Ok((CanonicalState::ExecutorError, timing));
        }
        Ok((state, timing))
    }
}

#[async_trait]
impl BackendAdapter for SingleNodeAdapter {
    async fn submit(&self, request: &WorkflowRequest) -> Result<String> {
        let params = self.resolve_params(request).await?;
        let run_id = uuid::Uuid::new_v4().to_string();

        put_record(
            self.store.as_ref(),
            STATE_TABLE,
            &run_id,
            &RunStateRecord {
                run_id: run_id.clone(),
                state: PROVISIONING.to_string(),
                exit_code: None,
                instance_id: None,
            },
        )
        .await?;
        put_record(
            self.store.as_ref(),
            TIMING_TABLE,
            &run_id,
            &RunTiming::starting_now(self.config.timeout()),
        )
        .await?;

        self.archive_request(&run_id, request, &params).await?;

        let instance = InstanceRequest {
            run_id: run_id.clone(),
            instance_type: self.config.instance_type.clone(),
            volume_size_gb: self.config.volume_size_gb,
            timeout: self.config.timeout(),
        };

        match self.compute.launch(&instance).await {
            Ok(instance_id) => {
                self.store
                    .update(STATE_TABLE, &run_id, "instance_id", Value::String(instance_id.clone()))
                    .await?;
                info!("Run {} launched on instance {}", run_id, instance_id);
                Ok(run_id)
            }
            Err(e) => {
                self.store
                    .update(
                        STATE_TABLE,
                        &run_id,
                        "state",
                        Value::String(CanonicalState::ExecutorError.to_string()),
                    )
                    .await?;
                self.store
                    .update(TIMING_TABLE, &run_id, "end_time", Value::String(timestamp(Utc::now())))
                    .await?;
                Err(PortabilityError::Submission(format!(
                    "no instance for run {}: {}",
                    run_id, e
                )))
            }
        }
    }

    async fn get_status(&self, workflow_id: &str) -> Result<CanonicalState> {
        let record = self.load_state(workflow_id).await?;
        let (state, _) = self.current_state(&record).await?;
        Ok(state)
    }

    async fn get_log(&self, workflow_id: &str) -> Result<RunRecord> {
        let record = self.load_state(workflow_id).await?;
        let (state, timing) = self.current_state(&record).await?;

        let prefix = logs_prefix(workflow_id);
        let mut artifacts = BTreeMap::new();
        for path in self.objects.list(&prefix).await? {
            match get_text(self.objects.as_ref(), &path).await {
                Ok(content) => {
                    let relative = path[prefix.len()..].to_string();
                    artifacts.insert(relative, content);
                }
                Err(e) => warn!("Skipping log object {}: {}", path, e),
            }
        }

        Ok(single_node_record(
            workflow_id,
            state,
            timing.as_ref(),
            record.exit_code,
            &artifacts,
        ))
    }
}
