//! In-Memory Execution Platform
//!
//! A platform simulation that honors declared dependencies the way the
//! real scheduler does: a job stays `idle` until every dependency is
//! `done`, and fails when any dependency fails. Time only moves when the
//! owner calls [`MemoryPlatform::step`], which makes interleavings
//! reproducible.
//!
//! Localization jobs "fetch" their URL by producing a file handle; URLs
//! registered with [`MemoryPlatform::fail_url`] fail instead. When a
//! coordination job starts, every `localizer-{job}` handle in its
//! `workflow_params` is replaced with the localized file, as the real
//! runner applet does. When it finishes, one task job per `call` in its
//! descriptor is launched under it, untagged, the way the compiled
//! workflow's stages appear on the platform.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::applets::{LOCALIZER_APPLET, LOCALIZER_HANDLE_PREFIX, RUNNER_APPLET};
use super::platform::{AppletSpec, ExecutionPlatform, JobDescription, JobQuery, JobRequest};
use crate::error::{PortabilityError, Result};

struct StoredApplet {
    id: String,
    project: String,
    spec: AppletSpec,
}

#[derive(Default)]
struct PlatformState {
    folders: BTreeSet<(String, String)>,
    applets: Vec<StoredApplet>,
    builds: usize,
    /// Job ids in launch order
    order: Vec<String>,
    jobs: BTreeMap<String, JobDescription>,
    logs: BTreeMap<String, Vec<String>>,
    failing_urls: HashSet<String>,
}

fn platform_id(class: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", class, &id[..24])
}

/// Platform held entirely in memory.
#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<PlatformState>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, PlatformState>> {
        self.state
            .lock()
            .map_err(|_| PortabilityError::System("platform lock poisoned".to_string()))
    }

    /// Makes every localization of `url` fail.
    pub fn fail_url(&self, url: &str) {
        if let Ok(mut state) = self.lock() {
            state.failing_urls.insert(url.to_string());
        }
    }

    /// Number of applets built so far.
    pub fn applet_builds(&self) -> usize {
        self.lock().map(|s| s.builds).unwrap_or(0)
    }

    pub fn has_folder(&self, project: &str, folder: &str) -> bool {
        self.lock()
            .map(|s| s.folders.contains(&(project.to_string(), folder.to_string())))
            .unwrap_or(false)
    }

    /// Every job, in launch order.
    pub fn jobs(&self) -> Vec<JobDescription> {
        self.lock()
            .map(|s| s.order.iter().filter_map(|id| s.jobs.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Advances every job by at most one transition. Returns true if
    /// anything changed.
    pub fn step(&self) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        let order = state.order.clone();
        let mut changed = false;
        for id in order {
            changed |= advance(&mut state, &id);
        }
        changed
    }

    /// Steps until no job can move.
    pub fn run_to_completion(&self) {
        while self.step() {}
    }
}

fn now_millis() -> Option<i64> {
    Some(Utc::now().timestamp_millis())
}

fn log_line(state: &mut PlatformState, job_id: &str, line: String) {
    state.logs.entry(job_id.to_string()).or_default().push(line);
}

fn advance(state: &mut PlatformState, id: &str) -> bool {
    let Some(job) = state.jobs.get(id).cloned() else {
        return false;
    };

    match job.state.as_str() {
        "idle" => {
            let dependency_states: Vec<String> = job
                .depends_on
                .iter()
                .filter_map(|dep| state.jobs.get(dep).map(|d| d.state.clone()))
                .collect();
            if dependency_states.iter().any(|s| s == "failed") {
                set_state(state, id, "failed", Some("A job dependency failed".to_string()));
                log_line(state, id, "dependency failed, job not started".to_string());
                true
            } else if dependency_states.iter().all(|s| s == "done") {
                set_state(state, id, "runnable", None);
                true
            } else {
                false
            }
        }
        "runnable" => {
            start(state, id, &job);
            true
        }
        "running" => {
            finish(state, id, &job);
            true
        }
        _ => false,
    }
}

/// Names following each `call` keyword, in order.
fn called_tasks(descriptor: &str) -> Vec<String> {
    let mut tokens = descriptor.split_whitespace();
    let mut tasks = Vec::new();
    while let Some(token) = tokens.next() {
        if token != "call" {
            continue;
        }
        if let Some(next) = tokens.next() {
            let name: String = next
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
                .collect();
            if !name.is_empty() {
                tasks.push(name);
            }
        }
    }
    tasks
}

fn set_state(state: &mut PlatformState, id: &str, native: &str, failure: Option<String>) {
    if let Some(job) = state.jobs.get_mut(id) {
        job.state = native.to_string();
        if failure.is_some() {
            job.failure_reason = failure;
            job.stopped_running = now_millis();
        }
    }
}

fn start(state: &mut PlatformState, id: &str, job: &JobDescription) {
    let mut input = job.input.clone();

    if job.executable_name == RUNNER_APPLET {
        if let Some(params) = input.get("workflow_params").and_then(Value::as_str) {
            let mut resolved = params.to_string();
            for dep in &job.depends_on {
                let handle = format!("{}{}", LOCALIZER_HANDLE_PREFIX, dep);
                let file = state
                    .jobs
                    .get(dep)
                    .and_then(|d| d.output.pointer("/localized_file/$dnanexus_link"))
                    .and_then(Value::as_str)
                    .map(|f| format!("dx://{}", f));
                if let Some(file) = file {
                    resolved = resolved.replace(&handle, &file);
                }
            }
            input["workflow_params"] = Value::String(resolved.clone());
            log_line(state, id, format!("inputs: {}", resolved));
        }
    }

    if let Some(running) = state.jobs.get_mut(id) {
        running.state = "running".to_string();
        running.started_running = now_millis();
        running.input = input;
    }
}

fn finish(state: &mut PlatformState, id: &str, job: &JobDescription) {
    if job.executable_name == LOCALIZER_APPLET {
        let url = job.input.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
        if state.failing_urls.contains(&url) {
            log_line(state, id, format!("curl: (22) failed to fetch {}", url));
            set_state(state, id, "failed", Some(format!("cannot fetch {}", url)));
            return;
        }
        let file_id = platform_id("file");
        log_line(state, id, format!("localized {} as {}", url, file_id));
        if let Some(done) = state.jobs.get_mut(id) {
            done.output = json!({"localized_file": {"$dnanexus_link": file_id}});
        }
    } else if job.executable_name == RUNNER_APPLET {
        log_line(state, id, "workflow compiled and launched".to_string());
        let descriptor = job
            .input
            .get("workflow_descriptor")
            .and_then(Value::as_str)
            .unwrap_or_default();
        for task in called_tasks(descriptor) {
            let child = platform_id("job");
            state.jobs.insert(
                child.clone(),
                JobDescription {
                    id: child.clone(),
                    name: task.clone(),
                    executable_name: task.clone(),
                    project: job.project.clone(),
                    state: "runnable".to_string(),
                    root_execution: job.root_execution.clone(),
                    output: Value::Null,
                    ..Default::default()
                },
            );
            state.order.push(child.clone());
            log_line(state, &child, format!("task {} scheduled by {}", task, id));
        }
    } else {
        log_line(state, id, format!("task {} finished", job.executable_name));
    }

    if let Some(done) = state.jobs.get_mut(id) {
        done.state = "done".to_string();
        done.stopped_running = now_millis();
    }
}

#[async_trait]
impl ExecutionPlatform for MemoryPlatform {
    async fn create_folder(&self, project: &str, folder: &str) -> Result<()> {
        self.lock()?
            .folders
            .insert((project.to_string(), folder.to_string()));
        Ok(())
    }

    async fn find_applet(&self, project: &str, name: &str, version: &str) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .applets
            .iter()
            .find(|a| a.project == project && a.spec.name == name && a.spec.version == version)
            .map(|a| a.id.clone()))
    }

    async fn build_applet(&self, project: &str, spec: &AppletSpec) -> Result<String> {
        let mut state = self.lock()?;
        let id = platform_id("applet");
        state.applets.push(StoredApplet {
            id: id.clone(),
            project: project.to_string(),
            spec: spec.clone(),
        });
        state.builds += 1;
        Ok(id)
    }

    async fn run_job(&self, request: &JobRequest) -> Result<String> {
        let mut state = self.lock()?;

        let applet_name = state
            .applets
            .iter()
            .find(|a| a.id == request.applet_id)
            .map(|a| a.spec.name.clone())
            .ok_or_else(|| {
                PortabilityError::Submission(format!("unknown applet {}", request.applet_id))
            })?;
        if let Some(missing) = request.depends_on.iter().find(|d| !state.jobs.contains_key(*d)) {
            return Err(PortabilityError::Submission(format!(
                "unknown dependency {}",
                missing
            )));
        }

        let id = platform_id("job");
        let initial = if request.depends_on.is_empty() {
            "runnable"
        } else {
            "idle"
        };
        state.jobs.insert(
            id.clone(),
            JobDescription {
                id: id.clone(),
                name: request.name.clone(),
                executable_name: applet_name,
                project: request.project.clone(),
                state: initial.to_string(),
                properties: request.properties.clone(),
                depends_on: request.depends_on.clone(),
                root_execution: id.clone(),
                input: request.input.clone(),
                output: Value::Null,
                ..Default::default()
            },
        );
        state.order.push(id.clone());
        Ok(id)
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobDescription>> {
        let state = self.lock()?;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| query.matches(job))
            .cloned()
            .collect())
    }

    async fn job_log(&self, job_id: &str) -> Result<String> {
        let state = self.lock()?;
        if !state.jobs.contains_key(job_id) {
            return Err(PortabilityError::not_found("job", job_id));
        }
        Ok(state
            .logs
            .get(job_id)
            .map(|lines| lines.join("\n"))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::job_graph::applets::{localizer_spec, runner_spec};

    async fn launch(
        platform: &MemoryPlatform,
        spec: AppletSpec,
        input: Value,
        depends_on: Vec<String>,
    ) -> String {
        let applet = platform.build_applet("p", &spec).await.unwrap();
        platform
            .run_job(&JobRequest {
                applet_id: applet,
                name: spec.title.clone(),
                project: "p".to_string(),
                folder: "/w".to_string(),
                input,
                depends_on,
                properties: Default::default(),
            })
            .await
            .unwrap()
    }

    fn state_of(platform: &MemoryPlatform, id: &str) -> String {
        platform
            .jobs()
            .into_iter()
            .find(|j| j.id == id)
            .map(|j| j.state)
            .unwrap()
    }

    #[tokio::test]
    async fn test_dependent_waits_for_dependencies() {
        let platform = MemoryPlatform::new();
        let loc = launch(&platform, localizer_spec("1"), json!({"url": "https://h/a"}), vec![]).await;
        let params = format!(r#"{{"in": "localizer-{}"}}"#, loc);
        let run = launch(
            &platform,
            runner_spec("1"),
            json!({"workflow_params": params}),
            vec![loc.clone()],
        )
        .await;

        assert_eq!(state_of(&platform, &run), "idle");
        platform.step();
        assert_eq!(state_of(&platform, &loc), "running");
        assert_eq!(state_of(&platform, &run), "idle");

        platform.run_to_completion();
        assert_eq!(state_of(&platform, &run), "done");

        let log = platform.job_log(&run).await.unwrap();
        assert!(log.contains("dx://file-"));
        assert!(!log.contains("localizer-"));
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_dependent() {
        let platform = MemoryPlatform::new();
        platform.fail_url("https://h/missing");
        let loc = launch(
            &platform,
            localizer_spec("1"),
            json!({"url": "https://h/missing"}),
            vec![],
        )
        .await;
        let run = launch(&platform, runner_spec("1"), json!({}), vec![loc.clone()]).await;

        platform.run_to_completion();
        assert_eq!(state_of(&platform, &loc), "failed");
        assert_eq!(state_of(&platform, &run), "failed");
    }

    #[test]
    fn test_called_tasks() {
        assert_eq!(
            called_tasks("workflow w { call align { input: x = 1 } call lib.sort}"),
            vec!["align", "lib.sort"]
        );
        assert!(called_tasks("workflow w {}").is_empty());
    }

    #[tokio::test]
    async fn test_runner_launches_tasks_under_itself() {
        let platform = MemoryPlatform::new();
        let run = launch(
            &platform,
            runner_spec("1"),
            json!({"workflow_descriptor": "workflow w { call align call sort }"}),
            vec![],
        )
        .await;
        platform.run_to_completion();

        let children = platform.find_jobs(&JobQuery::under(&run)).await.unwrap();
        let title = runner_spec("1").title;
        let names: Vec<&str> = children.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec![title.as_str(), "align", "sort"]);
        assert!(children.iter().all(|j| j.state == "done"));
        assert!(children[1].properties.is_empty());

        let log = platform.job_log(&children[1].id).await.unwrap();
        assert!(log.contains("task align finished"));
    }

    #[tokio::test]
    async fn test_rejects_unknown_applet_and_dependency() {
        let platform = MemoryPlatform::new();
        let mut request = JobRequest {
            applet_id: "applet-missing".to_string(),
            name: "x".to_string(),
            project: "p".to_string(),
            folder: "/".to_string(),
            input: json!({}),
            depends_on: vec![],
            properties: Default::default(),
        };
        assert!(platform.run_job(&request).await.is_err());

        request.applet_id = platform.build_applet("p", &runner_spec("1")).await.unwrap();
        request.depends_on = vec!["job-missing".to_string()];
        assert!(platform.run_job(&request).await.is_err());
        assert!(platform.job_log("job-missing").await.unwrap_err().is_not_found());
    }
}
