//! Job-Graph Orchestrator
//!
//! Runs a workflow as a small dependency graph on a remote execution
//! platform:
//!
//! ```text
//! localizer(url 1) ─┐
//! localizer(url 2) ─┼──► coordination job (translate + run workflow)
//! localizer(url n) ─┘
//! ```
//!
//! `submit` only emits the nodes and edges; ordering is left to the
//! platform's scheduler, so it returns before any job starts. Every job
//! carries the run's correlation id as a property, and queries rebuild
//! the run from a property search. No run table exists on this side.

pub mod applets;
pub mod http;
pub mod memory;
pub mod platform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde_json::{json, Value};

use super::BackendAdapter;
use crate::aggregate::{job_graph_record, job_graph_state};
use crate::config::JobGraphConfig;
use crate::error::{PortabilityError, Result};
use crate::localize::{collect_remote_references, substitute_references};
use crate::model::{CanonicalState, RunRecord, WorkflowRequest};

pub use applets::{
    localizer_spec, runner_spec, AppletCatalog, LOCALIZER_HANDLE_PREFIX, LOCALIZER_JOB_NAME,
    RUNNER_JOB_NAME,
};
pub use http::HttpPlatform;
pub use memory::MemoryPlatform;
pub use platform::{
    AppletSpec, ExecutionPlatform, IoSpec, JobDescription, JobQuery, JobRequest, Properties,
};

/// Property holding the correlation id on every launched job.
pub const CORRELATION_PROPERTY: &str = "wes_id";

/// Backend adapter for job-graph runs.
pub struct JobGraphAdapter {
    config: JobGraphConfig,
    platform: Arc<dyn ExecutionPlatform>,
    applets: Arc<AppletCatalog>,
    project: String,
}

impl JobGraphAdapter {
    pub fn new(
        config: JobGraphConfig,
        platform: Arc<dyn ExecutionPlatform>,
        applets: Arc<AppletCatalog>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            config,
            platform,
            applets,
            project: project.into(),
        }
    }

    fn tags(workflow_id: &str) -> Properties {
        Properties::from([(CORRELATION_PROPERTY.to_string(), workflow_id.to_string())])
    }

    fn job(&self, workflow_id: &str, applet_id: String, name: &str, input: Value, depends_on: Vec<String>) -> JobRequest {
        JobRequest {
            applet_id,
            name: name.to_string(),
            project: self.project.clone(),
            folder: format!("/{}", workflow_id),
            input,
            depends_on,
            properties: Self::tags(workflow_id),
        }
    }

    /// Launches one localization job per distinct remote reference and
    /// returns the handles to substitute plus the launched job ids.
    async fn launch_localizers(
        &self,
        workflow_id: &str,
        references: &[String],
    ) -> Result<(HashMap<String, String>, Vec<String>)> {
        let mut handles = HashMap::new();
        let mut job_ids = Vec::new();
        if references.is_empty() {
            return Ok((handles, job_ids));
        }

        let applet = self
            .applets
            .ensure(
                self.platform.as_ref(),
                &self.project,
                &localizer_spec(&self.config.localizer_applet_version),
            )
            .await?;

        for url in references {
            let request = self.job(
                workflow_id,
                applet.clone(),
                LOCALIZER_JOB_NAME,
                json!({"url": url, "project": self.project, "wes_id": workflow_id}),
                Vec::new(),
            );
            let job_id = self.platform.run_job(&request).await?;
            handles.insert(url.clone(), format!("{}{}", LOCALIZER_HANDLE_PREFIX, job_id));
            job_ids.push(job_id);
        }
        Ok((handles, job_ids))
    }

    async fn tagged_jobs(&self, workflow_id: &str) -> Result<Vec<JobDescription>> {
        let jobs = self
            .platform
            .find_jobs(&JobQuery::tagged(CORRELATION_PROPERTY, workflow_id))
            .await?;
        if jobs.is_empty() {
            return Err(PortabilityError::not_found("workflow", workflow_id));
        }
        Ok(jobs)
    }

    /// Jobs launched under the coordination job, excluding the tagged ones.
    async fn task_jobs(&self, tagged: &[JobDescription]) -> Result<Vec<JobDescription>> {
        let Some(runner) = tagged.iter().find(|job| job.name == RUNNER_JOB_NAME) else {
            return Ok(Vec::new());
        };
        let jobs = self.platform.find_jobs(&JobQuery::under(&runner.id)).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| tagged.iter().all(|t| t.id != job.id))
            .collect())
    }

    /// Fetches every job's log, a bounded number at a time. A missing log
    /// is an empty one.
    async fn with_logs(&self, jobs: Vec<JobDescription>) -> Vec<(JobDescription, String)> {
        let platform = self.platform.clone();
        stream::iter(jobs)
            .map(|job| {
                let platform = platform.clone();
                async move {
                    let log = match platform.job_log(&job.id).await {
                        Ok(log) => log,
                        Err(e) => {
                            warn!("No log for job {}: {}", job.id, e);
                            String::new()
                        }
                    };
                    (job, log)
                }
            })
            .buffered(self.config.log_concurrency())
            .collect()
            .await
    }
}

#[async_trait]
impl BackendAdapter for JobGraphAdapter {
    async fn submit(&self, request: &WorkflowRequest) -> Result<String> {
        let params = request.params_document()?;
        let workflow_id = uuid::Uuid::new_v4().to_string();

        self.platform
            .create_folder(&self.project, &format!("/{}", workflow_id))
            .await?;

        let references = collect_remote_references(&params);
        let (handles, localizers) = self.launch_localizers(&workflow_id, &references).await?;
        let localized = substitute_references(&params, &handles);

        let runner = self
            .applets
            .ensure(
                self.platform.as_ref(),
                &self.project,
                &runner_spec(&self.config.runner_applet_version),
            )
            .await?;

        let mut input = json!({
            "workflow_descriptor": request.workflow_descriptor,
            "workflow_params": localized.to_string(),
            "wes_id": workflow_id,
            "project": self.project,
        });
        if let Some(archive) = request.dependencies_archive()? {
            input["workflow_dependencies"] = Value::String(archive);
        }

        let coordinator = self
            .platform
            .run_job(&self.job(&workflow_id, runner, RUNNER_JOB_NAME, input, localizers.clone()))
            .await?;

        info!(
            "Workflow {} launched: {} localization jobs feeding {}",
            workflow_id,
            localizers.len(),
            coordinator
        );
        Ok(workflow_id)
    }

    async fn get_status(&self, workflow_id: &str) -> Result<CanonicalState> {
        let jobs = self.tagged_jobs(workflow_id).await?;
        Ok(job_graph_state(&jobs))
    }

    async fn get_log(&self, workflow_id: &str) -> Result<RunRecord> {
        let jobs = self.tagged_jobs(workflow_id).await?;
        let children = self.task_jobs(&jobs).await?;

        let logs = self.with_logs(jobs).await;
        let child_logs = self.with_logs(children).await;
        Ok(job_graph_record(workflow_id, &logs, &child_logs))
    }
}
