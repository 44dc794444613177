//! Backend Adapters
//!
//! One capability, `submit` / `get_status` / `get_log`, implemented once
//! per execution technology. The adapter for an environment is chosen
//! from its declared schema:
//!
//! | Schema | Adapter |
//! |--------|---------|
//! | `wes` | [`wes::WesAdapter`] |
//! | `single-node` | [`single_node::SingleNodeAdapter`] |
//! | `job-graph` | [`job_graph::JobGraphAdapter`] |

pub mod job_graph;
pub mod single_node;
pub mod wes;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServiceConfig;
use crate::error::{PortabilityError, Result};
use crate::localize::Fetcher;
use crate::model::{CanonicalState, Environment, RunRecord, WorkflowRequest};
use crate::storage::{KeyValueStore, ObjectStore};

use job_graph::{AppletCatalog, ExecutionPlatform, HttpPlatform, JobGraphAdapter};
use single_node::{ComputeProvider, SingleNodeAdapter};
use wes::WesAdapter;

/// Execution capability every backend provides.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Hands the workflow to the backend and returns its run reference
    /// once the backend has durably accepted it. Does not wait for the
    /// run to start.
    async fn submit(&self, request: &WorkflowRequest) -> Result<String>;

    /// Current state of a run. A pure query, safe to repeat.
    async fn get_status(&self, workflow_id: &str) -> Result<CanonicalState>;

    /// Best-effort logs; partial while the run is outstanding.
    async fn get_log(&self, workflow_id: &str) -> Result<RunRecord>;
}

/// Execution API dialect declared by an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Wes,
    SingleNode,
    JobGraph,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wes => "wes",
            Self::SingleNode => "single-node",
            Self::JobGraph => "job-graph",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = PortabilityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "wes" => Ok(Self::Wes),
            "single-node" | "local-cromwell" => Ok(Self::SingleNode),
            "job-graph" | "dnanexus" => Ok(Self::JobGraph),
            other => Err(PortabilityError::Invalid(format!(
                "unsupported environment schema '{}'",
                other
            ))),
        }
    }
}

/// Key of the platform project in a job-graph environment's key values.
pub const PROJECT_KEY: &str = "project_id";

/// Builds the adapter for an environment from shared collaborators.
pub struct Backends {
    config: ServiceConfig,
    store: Arc<dyn KeyValueStore>,
    objects: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn Fetcher>,
    compute: Arc<dyn ComputeProvider>,
    platform: Option<Arc<dyn ExecutionPlatform>>,
    applets: Arc<AppletCatalog>,
}

impl Backends {
    pub fn new(
        config: ServiceConfig,
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
            platform: None,
            applets: Arc::new(AppletCatalog::new()),
        }
    }

    /// Uses `platform` for every job-graph environment instead of an HTTP
    /// client built from the environment.
    pub fn with_platform(mut self, platform: Arc<dyn ExecutionPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn adapter_for(&self, environment: &Environment) -> Result<Arc<dyn BackendAdapter>> {
        let dialect: Dialect = environment.schema.parse()?;

        let adapter: Arc<dyn BackendAdapter> = match dialect {
            Dialect::Wes => Arc::new(WesAdapter::new(&environment.base_url, &environment.headers)?),
            Dialect::SingleNode => Arc::new(SingleNodeAdapter::new(
                self.config.single_node.clone(),
                self.store.clone(),
                self.objects.clone(),
                self.fetcher.clone(),
                self.compute.clone(),
            )),
            Dialect::JobGraph => {
                let project = environment
                    .key_values
                    .get(PROJECT_KEY)
                    .or_else(|| environment.key_values.get("dx_project_id"))
                    .ok_or_else(|| {
                        PortabilityError::Invalid(format!(
                            "environment {} has no {}",
                            environment.environment_id, PROJECT_KEY
                        ))
                    })?;
                let platform = match &self.platform {
                    Some(platform) => platform.clone(),
                    None => {
                        let api_url = if environment.base_url.is_empty() {
                            self.config.job_graph.api_url.as_str()
                        } else {
                            environment.base_url.as_str()
                        };
                        Arc::new(HttpPlatform::new(api_url, &environment.headers)?)
                    }
                };
                Arc::new(JobGraphAdapter::new(
                    self.config.job_graph.clone(),
                    platform,
                    self.applets.clone(),
                    project.clone(),
                ))
            }
        };
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localize::HttpFetcher;
    use crate::storage::{MemoryKeyValueStore, MemoryObjectStore};
    use job_graph::MemoryPlatform;
    use single_node::{InstanceContext, LocalCompute};
    use std::collections::HashMap;

    fn backends() -> Backends {
        let config = ServiceConfig::default();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new());
        let compute = Arc::new(LocalCompute::new(InstanceContext {
            config: config.single_node.clone(),
            store: store.clone(),
            objects: objects.clone(),
            fetcher: fetcher.clone(),
        }));
        Backends::new(config, store, objects, fetcher, compute)
            .with_platform(Arc::new(MemoryPlatform::new()))
    }

    fn environment(schema: &str) -> Environment {
        Environment {
            environment_id: "env-1".to_string(),
            name: "test".to_string(),
            base_url: String::new(),
            schema: schema.to_string(),
            headers: HashMap::new(),
            key_values: HashMap::new(),
        }
    }

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("wes".parse::<Dialect>().unwrap(), Dialect::Wes);
        assert_eq!("WES".parse::<Dialect>().unwrap(), Dialect::Wes);
        assert_eq!("single_node".parse::<Dialect>().unwrap(), Dialect::SingleNode);
        assert_eq!("dnanexus".parse::<Dialect>().unwrap(), Dialect::JobGraph);
        assert!("slurm".parse::<Dialect>().is_err());
        assert_eq!(Dialect::JobGraph.to_string(), "job-graph");
    }

    #[test]
    fn test_adapter_selection() {
        let backends = backends();
        assert!(backends.adapter_for(&environment("single-node")).is_ok());

        // WES needs somewhere to send requests
        assert!(backends.adapter_for(&environment("wes")).is_err());

        let mut env = environment("job-graph");
        assert!(backends.adapter_for(&env).is_err());
        env.key_values
            .insert(PROJECT_KEY.to_string(), "project-1".to_string());
        assert!(backends.adapter_for(&env).is_ok());

        assert!(backends.adapter_for(&environment("unknown")).is_err());
    }
}
