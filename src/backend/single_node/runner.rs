//! Instance Life Cycle
//!
//! What a single-node instance does between boot and self-termination:
//!
//! 1. Arm the watchdog and register the exit handler
//! 2. Mark the run `RUNNING`
//! 3. Materialize the archived request in a work directory
//! 4. Localize every remote input
//! 5. Run the engine, capturing its output and exit code
//! 6. Upload the engine logs and every task's `stdout`, `stderr` and `rc`
//! 7. Exit through the handler
//!
//! Uploads in step 6 are best effort; a failed artifact is logged and
//! skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::fs;
use tokio::process::Command;

use super::cleanup::{ExitCause, ExitHandler};
use super::compute::{ComputeProvider, InstanceRequest};
use super::{
    attachments_prefix, descriptor_path, logs_prefix, params_path, RUNNING, STATE_TABLE,
};
use crate::aggregate::{ENGINE_STDERR, ENGINE_STDOUT};
use crate::config::SingleNodeConfig;
use crate::error::{PortabilityError, Result};
use crate::localize::{localize_document, Fetcher};
use crate::model::CanonicalState;
use crate::storage::{get_text, KeyValueStore, ObjectStore};

/// Task artifacts harvested from each engine execution directory.
const TASK_ARTIFACTS: &[&str] = &["stdout", "stderr", "rc"];

/// Services an instance talks to.
#[derive(Clone)]
pub struct InstanceContext {
    pub config: SingleNodeConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub fetcher: Arc<dyn Fetcher>,
}

/// Drives one run on its instance.
pub struct InstanceRunner {
    context: InstanceContext,
    request: InstanceRequest,
    instance_id: String,
    compute: Arc<dyn ComputeProvider>,
}

impl InstanceRunner {
    pub fn new(
        context: InstanceContext,
        request: InstanceRequest,
        instance_id: String,
        compute: Arc<dyn ComputeProvider>,
    ) -> Self {
        Self {
            context,
            request,
            instance_id,
            compute,
        }
    }

    /// Runs the life cycle to its end and returns the recorded terminal
    /// state.
    pub async fn run(self) -> Result<CanonicalState> {
        let run_id = self.request.run_id.clone();
        let handler = ExitHandler::new(
            self.context.store.clone(),
            self.compute.clone(),
            run_id.clone(),
            self.instance_id.clone(),
        );
        handler.arm_watchdog(self.request.timeout);

        if let Err(e) = self
            .context
            .store
            .update(STATE_TABLE, &run_id, "state", Value::String(RUNNING.to_string()))
            .await
        {
            error!("Failed to mark run {} running: {}", run_id, e);
        }

        // Spawned so that a panic surfaces as a join error instead of
        // skipping the handler.
        let work = tokio::spawn(execute(self.context.clone(), run_id.clone()));
        handler.guard_work(work.abort_handle());

        let cause = match work.await {
            Ok(Ok(code)) => ExitCause::Finished(code),
            Ok(Err(e)) => {
                error!("Run {} failed: {}", run_id, e);
                ExitCause::Failed(e.to_string())
            }
            Err(e) if e.is_cancelled() => ExitCause::TimedOut,
            Err(e) => {
                error!("Run {} panicked: {}", run_id, e);
                ExitCause::Failed(e.to_string())
            }
        };

        Ok(handler.fire(cause).await)
    }
}

/// Fills in `{workflow}`, `{inputs}` and `{work_dir}` in the engine argv.
pub fn engine_argv(template: &[String], workflow: &Path, inputs: &Path, work_dir: &Path) -> Vec<String> {
    let workflow = workflow.to_string_lossy();
    let inputs = inputs.to_string_lossy();
    let work_dir = work_dir.to_string_lossy();
    template
        .iter()
        .map(|arg| {
            arg.replace("{workflow}", &workflow)
                .replace("{inputs}", &inputs)
                .replace("{work_dir}", &work_dir)
        })
        .collect()
}

async fn execute(context: InstanceContext, run_id: String) -> Result<i32> {
    let work_dir = context.config.work_root.join(&run_id);
    fs::create_dir_all(&work_dir).await?;
    info!("Run {} working in {}", run_id, work_dir.display());

    let (workflow_path, inputs_path) = materialize_request(&context, &run_id, &work_dir).await?;
    let argv = engine_argv(
        &context.config.engine_command,
        &workflow_path,
        &inputs_path,
        &work_dir,
    );
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| PortabilityError::Invalid("empty engine command".to_string()))?;

    info!("Run {} starting engine: {}", run_id, argv.join(" "));
    let output = Command::new(program)
        .args(args)
        .current_dir(&work_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PortabilityError::Executor(format!("cannot start engine {}: {}", program, e)))?;

    let exit_code = output.status.code().unwrap_or(-1);
    if output.status.success() {
        info!("Run {} engine finished", run_id);
    } else {
        error!("Run {} engine failed with exit code {}", run_id, exit_code);
    }

    let prefix = logs_prefix(&run_id);
    upload(&context, &format!("{}{}", prefix, ENGINE_STDOUT), output.stdout).await;
    upload(&context, &format!("{}{}", prefix, ENGINE_STDERR), output.stderr).await;

    harvest_task_logs(&context, &run_id, &work_dir.join(&context.config.executions_dir)).await;

    Ok(exit_code)
}

/// Writes the archived descriptor, dependencies and localized parameters
/// into the work directory.
async fn materialize_request(
    context: &InstanceContext,
    run_id: &str,
    work_dir: &Path,
) -> Result<(PathBuf, PathBuf)> {
    let objects = context.objects.as_ref();

    let workflow_path = work_dir.join("workflow.wdl");
    fs::write(&workflow_path, objects.get(&descriptor_path(run_id)).await?).await?;

    let prefix = attachments_prefix(run_id);
    for path in objects.list(&prefix).await? {
        let target = work_dir.join(&path[prefix.len()..]);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, objects.get(&path).await?).await?;
    }

    let params: Value = serde_json::from_str(&get_text(objects, &params_path(run_id)).await?)?;
    let localized = localize_document(&params, context.fetcher.as_ref(), &work_dir.join("inputs")).await?;

    let inputs_path = work_dir.join("inputs.json");
    fs::write(&inputs_path, serde_json::to_vec_pretty(&localized)?).await?;
    Ok((workflow_path, inputs_path))
}

async fn upload(context: &InstanceContext, path: &str, data: Vec<u8>) {
    match context.objects.put(path, data).await {
        Ok(()) => debug!("Uploaded {}", path),
        Err(e) => warn!("Failed to upload {}: {}", path, e),
    }
}

/// Every `execution` directory below `root`, relative to `root`.
async fn execution_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            if entry.file_name() == "execution" {
                if let Ok(relative) = path.strip_prefix(root) {
                    found.push(relative.to_path_buf());
                }
            }
            pending.push(path);
        }
    }

    found.sort();
    Ok(found)
}

async fn harvest_task_logs(context: &InstanceContext, run_id: &str, root: &Path) {
    let dirs = match execution_dirs(root).await {
        Ok(dirs) => dirs,
        Err(e) => {
            warn!("Cannot walk {}: {}", root.display(), e);
            return;
        }
    };

    let prefix = logs_prefix(run_id);
    for dir in dirs {
        let task: Vec<String> = dir
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let task = task.join("/");

        for artifact in TASK_ARTIFACTS {
            let source = root.join(&dir).join(artifact);
            match fs::read(&source).await {
                Ok(data) => upload(context, &format!("{}{}/{}", prefix, task, artifact), data).await,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot read {}: {}", source.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::single_node::{RunStateRecord, LocalCompute};
    use crate::storage::{get_record, MemoryKeyValueStore, MemoryObjectStore};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    struct FileFetcher;

    #[async_trait]
    impl Fetcher for FileFetcher {
        async fn fetch(&self, reference: &str, dest: &Path) -> Result<()> {
            tokio::fs::write(dest, format!("content of {}", reference)).await?;
            Ok(())
        }

        async fn fetch_text(&self, _reference: &str) -> Result<String> {
            Ok("{}".to_string())
        }
    }

    async fn context_with_request(work_root: &Path, script: &str, params: &str) -> InstanceContext {
        let objects = Arc::new(MemoryObjectStore::new());
        objects
            .put(&descriptor_path("run-1"), b"workflow wf {}".to_vec())
            .await
            .unwrap();
        objects
            .put(&params_path("run-1"), params.as_bytes().to_vec())
            .await
            .unwrap();
        objects
            .put(&format!("{}lib/tasks.wdl", attachments_prefix("run-1")), b"task t {}".to_vec())
            .await
            .unwrap();

        InstanceContext {
            config: SingleNodeConfig {
                engine_command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                work_root: work_root.to_path_buf(),
                ..Default::default()
            },
            store: Arc::new(MemoryKeyValueStore::new()),
            objects,
            fetcher: Arc::new(FileFetcher),
        }
    }

    fn request(timeout: Duration) -> InstanceRequest {
        InstanceRequest {
            run_id: "run-1".to_string(),
            instance_type: "local".to_string(),
            volume_size_gb: 1,
            timeout,
        }
    }

    #[test]
    fn test_engine_argv_substitution() {
        let template: Vec<String> = ["run", "{workflow}", "--inputs", "{inputs}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let argv = engine_argv(
            &template,
            Path::new("/w/workflow.wdl"),
            Path::new("/w/inputs.json"),
            Path::new("/w"),
        );
        assert_eq!(argv, vec!["run", "/w/workflow.wdl", "--inputs", "/w/inputs.json"]);
    }

    #[tokio::test]
    async fn test_inputs_are_localized_before_the_engine_runs() {
        let dir = tempdir().unwrap();
        let context = context_with_request(
            dir.path(),
            "cat inputs.json && test -f lib/tasks.wdl",
            r#"{"wf.files": ["https://host/a.txt"], "wf.n": 2}"#,
        )
        .await;
        let compute = LocalCompute::new(context.clone());

        let state = InstanceRunner::new(context.clone(), request(Duration::from_secs(30)), "i-1".to_string(), Arc::new(compute))
            .run()
            .await
            .unwrap();
        assert_eq!(state, CanonicalState::Complete);

        let inputs: Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("run-1/inputs.json")).unwrap(),
        )
        .unwrap();
        let localized = inputs["wf.files"][0].as_str().unwrap();
        assert!(localized.ends_with("a.txt"));
        assert!(!localized.starts_with("https://"));
        assert_eq!(inputs["wf.n"], 2);

        let stdout = get_text(context.objects.as_ref(), "run-1/logs/engine-stdout.log")
            .await
            .unwrap();
        assert!(stdout.contains("wf.files"));
    }

    #[tokio::test]
    async fn test_timeout_records_executor_error() {
        let dir = tempdir().unwrap();
        let context = context_with_request(dir.path(), "sleep 30", "{}").await;
        let compute = LocalCompute::new(context.clone());

        let started = std::time::Instant::now();
        let state = InstanceRunner::new(
            context.clone(),
            request(Duration::from_millis(200)),
            "i-1".to_string(),
            Arc::new(compute),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(state, CanonicalState::ExecutorError);
        assert!(started.elapsed() < Duration::from_secs(10));
        let record: RunStateRecord = get_record(context.store.as_ref(), STATE_TABLE, "run-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, "EXECUTOR_ERROR");
        assert_eq!(record.exit_code, None);
    }

    #[tokio::test]
    async fn test_missing_engine_is_executor_error() {
        let dir = tempdir().unwrap();
        let mut context = context_with_request(dir.path(), "", "{}").await;
        context.config.engine_command = vec!["/nonexistent/engine".to_string()];
        let compute = LocalCompute::new(context.clone());

        let state = InstanceRunner::new(context, request(Duration::from_secs(30)), "i-1".to_string(), Arc::new(compute))
            .run()
            .await
            .unwrap();
        assert_eq!(state, CanonicalState::ExecutorError);
    }

    #[tokio::test]
    async fn test_execution_dirs_found_recursively() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("wf/1/call-a/execution")).unwrap();
        std::fs::create_dir_all(dir.path().join("wf/1/call-b/shard-0/execution")).unwrap();
        std::fs::create_dir_all(dir.path().join("wf/1/call-c/inputs")).unwrap();

        let found = execution_dirs(dir.path()).await.unwrap();
        assert_eq!(
            found,
            vec![
                PathBuf::from("wf/1/call-a/execution"),
                PathBuf::from("wf/1/call-b/shard-0/execution"),
            ]
        );
        assert!(execution_dirs(&dir.path().join("absent")).await.unwrap().is_empty());
    }
}
