//! Compute Providers
//!
//! Allocate the dedicated instance a single-node run lives on, and
//! release it again. Two providers ship with the crate:
//!
//! - [`LocalCompute`]: the instance is a task inside the current process
//! - [`ProcessCompute`]: the instance is a detached `run-instance` child
//!   process of this binary

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::runner::{InstanceContext, InstanceRunner};
use crate::error::{PortabilityError, Result};
use crate::model::CanonicalState;

/// What a run needs from its instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequest {
    pub run_id: String,
    pub instance_type: String,
    pub volume_size_gb: u32,

    /// Hard wall-clock bound armed on the instance
    pub timeout: Duration,
}

/// Allocates and releases single-node instances.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Starts an instance for the run and returns its id. Must not wait
    /// for the run itself.
    async fn launch(&self, request: &InstanceRequest) -> Result<String>;

    async fn terminate(&self, instance_id: &str) -> Result<()>;
}

pub(crate) fn new_instance_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("i-{}", &id[..17])
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| PortabilityError::System("instance table lock poisoned".to_string()))
}

struct LocalInstance {
    handle: Option<JoinHandle<CanonicalState>>,
    terminated: bool,
}

/// Runs each instance as a tokio task of the current process.
#[derive(Clone)]
pub struct LocalCompute {
    context: InstanceContext,
    instances: Arc<Mutex<HashMap<String, LocalInstance>>>,
}

impl LocalCompute {
    pub fn new(context: InstanceContext) -> Self {
        Self {
            context,
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits for an instance's life cycle to end and returns the terminal
    /// state it recorded.
    pub async fn wait(&self, instance_id: &str) -> Result<CanonicalState> {
        let handle = lock(&self.instances)?
            .get_mut(instance_id)
            .and_then(|instance| instance.handle.take())
            .ok_or_else(|| PortabilityError::not_found("instance", instance_id))?;

        handle
            .await
            .map_err(|e| PortabilityError::System(format!("instance {} aborted: {}", instance_id, e)))
    }

    pub fn is_terminated(&self, instance_id: &str) -> bool {
        lock(&self.instances)
            .map(|instances| {
                instances
                    .get(instance_id)
                    .map(|i| i.terminated)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl ComputeProvider for LocalCompute {
    async fn launch(&self, request: &InstanceRequest) -> Result<String> {
        let instance_id = new_instance_id();
        let runner = InstanceRunner::new(
            self.context.clone(),
            request.clone(),
            instance_id.clone(),
            Arc::new(self.clone()),
        );

        // Registered under the lock so a fast instance cannot terminate
        // itself before it is known.
        let mut instances = lock(&self.instances)?;
        let handle = tokio::spawn(async move {
            match runner.run().await {
                Ok(state) => state,
                Err(e) => {
                    warn!("Instance life cycle failed: {}", e);
                    CanonicalState::ExecutorError
                }
            }
        });
        instances.insert(
            instance_id.clone(),
            LocalInstance {
                handle: Some(handle),
                terminated: false,
            },
        );

        debug!(
            "Started local instance {} ({}) for run {}",
            instance_id, request.instance_type, request.run_id
        );
        Ok(instance_id)
    }

    async fn terminate(&self, instance_id: &str) -> Result<()> {
        let mut instances = lock(&self.instances)?;
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| PortabilityError::not_found("instance", instance_id))?;
        instance.terminated = true;
        debug!("Local instance {} terminated", instance_id);
        Ok(())
    }
}

/// Runs each instance as a detached child process executing
/// `run-instance`.
///
/// The child's pid is kept in `{state_dir}/{instance_id}.pid`; its output
/// goes to `{state_dir}/{instance_id}.log`.
pub struct ProcessCompute {
    program: PathBuf,
    base_args: Vec<String>,
    state_dir: PathBuf,
}

impl ProcessCompute {
    pub fn new(program: PathBuf, base_args: Vec<String>, state_dir: PathBuf) -> Self {
        Self {
            program,
            base_args,
            state_dir,
        }
    }

    /// Provider re-invoking the running binary with the given global
    /// arguments (config file, data directory).
    pub fn current(base_args: Vec<String>, state_dir: PathBuf) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, base_args, state_dir))
    }

    fn pid_path(&self, instance_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.pid", instance_id))
    }

    fn log_file(&self, instance_id: &str) -> Result<File> {
        fs::create_dir_all(&self.state_dir)?;
        Ok(File::create(self.state_dir.join(format!("{}.log", instance_id)))?)
    }
}

fn read_pid(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|_| PortabilityError::System(format!("corrupt pid file {}", path.display())))
}

#[async_trait]
impl ComputeProvider for ProcessCompute {
    async fn launch(&self, request: &InstanceRequest) -> Result<String> {
        let instance_id = new_instance_id();
        let log = self.log_file(&instance_id)?;

        let child = Command::new(&self.program)
            .args(&self.base_args)
            .arg("run-instance")
            .arg(&request.run_id)
            .arg("--instance-id")
            .arg(&instance_id)
            .arg("--timeout-secs")
            .arg(request.timeout.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|e| {
                PortabilityError::System(format!(
                    "cannot start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| PortabilityError::System("instance exited immediately".to_string()))?;
        fs::write(self.pid_path(&instance_id), pid.to_string())?;

        info!(
            "Started instance {} (pid {}) for run {}",
            instance_id, pid, request.run_id
        );
        Ok(instance_id)
    }

    async fn terminate(&self, instance_id: &str) -> Result<()> {
        let pid_path = self.pid_path(instance_id);
        let pid = match read_pid(&pid_path) {
            Ok(pid) => pid,
            Err(_) => return Err(PortabilityError::not_found("instance", instance_id)),
        };

        if pid == std::process::id() {
            // The instance is this process; it exits once its handler returns.
            info!("Instance {} shutting down", instance_id);
        } else {
            let status = Command::new("kill").arg(pid.to_string()).status().await?;
            if !status.success() {
                warn!("kill {} exited with {}", pid, status);
            }
        }

        if let Err(e) = fs::remove_file(&pid_path) {
            warn!("Failed to remove {}: {}", pid_path.display(), e);
        }
        Ok(())
    }
}
